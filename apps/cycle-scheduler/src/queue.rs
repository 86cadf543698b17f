use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    error::SchedulerErrorCode,
    metrics::SchedulerMetrics,
    store::{CoordinationStore, EnqueueOutcome, QueueDepth, RequeueReport, StoreError},
    types::{ExecutionTask, RecordError},
};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("execution queue is full ({depth}/{max_depth})")]
    Full { depth: usize, max_depth: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("execution task could not be encoded: {0}")]
    Encode(RecordError),
}

impl QueueError {
    #[must_use]
    pub fn code(&self) -> SchedulerErrorCode {
        match self {
            Self::Full { .. } => SchedulerErrorCode::QueueFull,
            Self::Store(_) => SchedulerErrorCode::BackingStoreUnavailable,
            Self::Encode(_) => SchedulerErrorCode::InvalidExecutionTask,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Task(ExecutionTask),
    /// Claimed id whose payload is missing or malformed; must still be acked.
    Invalid { task_id: String, reason: String },
}

#[derive(Default)]
struct LocalQueue {
    ready: VecDeque<ExecutionTask>,
    inflight: HashSet<String>,
}

enum Backend {
    Local(Mutex<LocalQueue>),
    Shared {
        store: Arc<dyn CoordinationStore>,
        lease_ttl_ms: u64,
    },
}

/// Enqueue/claim/ack contract over either an in-process list or the shared
/// store's ready/processing/payloads/inflight structures.
pub struct ExecutionQueue {
    backend: Backend,
    clock: Arc<dyn Clock>,
    metrics: SchedulerMetrics,
    worker_id: String,
    max_depth: usize,
}

impl ExecutionQueue {
    #[must_use]
    pub fn local(
        clock: Arc<dyn Clock>,
        metrics: SchedulerMetrics,
        worker_id: String,
        max_depth: usize,
    ) -> Self {
        Self {
            backend: Backend::Local(Mutex::new(LocalQueue::default())),
            clock,
            metrics,
            worker_id,
            max_depth,
        }
    }

    #[must_use]
    pub fn shared(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        metrics: SchedulerMetrics,
        worker_id: String,
        max_depth: usize,
        lease_ttl_ms: u64,
    ) -> Self {
        Self {
            backend: Backend::Shared {
                store,
                lease_ttl_ms,
            },
            clock,
            metrics,
            worker_id,
            max_depth,
        }
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self.backend, Backend::Shared { .. })
    }

    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub async fn enqueue(&self, task: &ExecutionTask) -> Result<usize, QueueError> {
        let outcome = match &self.backend {
            Backend::Local(queue) => {
                let Ok(mut queue) = queue.lock() else {
                    return Err(QueueError::Store(StoreError::Unavailable(
                        "local queue poisoned".to_string(),
                    )));
                };
                let depth = queue.ready.len() + queue.inflight.len();
                if depth >= self.max_depth {
                    EnqueueOutcome::Full { depth }
                } else {
                    queue.ready.push_back(task.clone());
                    EnqueueOutcome::Enqueued { depth: depth + 1 }
                }
            }
            Backend::Shared { store, .. } => {
                let payload = task.encode().map_err(QueueError::Encode)?;
                store
                    .queue_enqueue(&task.id, &payload, self.max_depth)
                    .await
                    .inspect_err(|_| self.metrics.record_store_error("queue_enqueue"))?
            }
        };

        match outcome {
            EnqueueOutcome::Enqueued { depth } => {
                self.metrics.record_enqueued();
                debug!(
                    task_id = %task.id,
                    agent_key = %task.queue_key,
                    fence_token = task.leader_fence_token,
                    depth,
                    "execution task enqueued"
                );
                Ok(depth)
            }
            EnqueueOutcome::Full { depth } => {
                self.metrics.record_queue_full();
                warn!(
                    agent_key = %task.queue_key,
                    depth,
                    max_depth = self.max_depth,
                    "execution queue full; enqueue refused"
                );
                Err(QueueError::Full {
                    depth,
                    max_depth: self.max_depth,
                })
            }
        }
    }

    pub async fn claim(&self) -> Result<Option<ClaimOutcome>, QueueError> {
        match &self.backend {
            Backend::Local(queue) => {
                let Ok(mut queue) = queue.lock() else {
                    return Ok(None);
                };
                let Some(task) = queue.ready.pop_front() else {
                    return Ok(None);
                };
                queue.inflight.insert(task.id.clone());
                Ok(Some(ClaimOutcome::Task(task)))
            }
            Backend::Shared {
                store,
                lease_ttl_ms,
            } => {
                let now = self.clock.now_ms();
                let claimed = store
                    .queue_claim(&self.worker_id, *lease_ttl_ms, now)
                    .await
                    .inspect_err(|_| self.metrics.record_store_error("queue_claim"))?;
                let Some(claimed) = claimed else {
                    return Ok(None);
                };
                let outcome = match claimed.payload.as_deref().map(ExecutionTask::decode) {
                    Some(Ok(task)) => ClaimOutcome::Task(task),
                    Some(Err(error)) => ClaimOutcome::Invalid {
                        task_id: claimed.task_id,
                        reason: error.to_string(),
                    },
                    None => ClaimOutcome::Invalid {
                        task_id: claimed.task_id,
                        reason: "payload missing".to_string(),
                    },
                };
                Ok(Some(outcome))
            }
        }
    }

    pub async fn ack(&self, task_id: &str) -> Result<(), QueueError> {
        match &self.backend {
            Backend::Local(queue) => {
                if let Ok(mut queue) = queue.lock() {
                    queue.inflight.remove(task_id);
                }
                Ok(())
            }
            Backend::Shared { store, .. } => {
                store
                    .queue_ack(task_id)
                    .await
                    .inspect_err(|_| self.metrics.record_store_error("queue_ack"))?;
                Ok(())
            }
        }
    }

    /// Moves expired, lease-less in-flight tasks back to ready. The local
    /// queue never redelivers, so it always reports nothing.
    pub async fn requeue_expired(&self, limit: usize) -> Result<RequeueReport, QueueError> {
        let Backend::Shared { store, .. } = &self.backend else {
            return Ok(RequeueReport::default());
        };
        let report = store
            .queue_requeue_expired(self.clock.now_ms(), limit)
            .await
            .inspect_err(|_| self.metrics.record_store_error("queue_requeue_expired"))?;
        if !report.requeued.is_empty() || !report.dropped.is_empty() {
            self.metrics
                .record_requeue(report.requeued.len(), report.dropped.len());
            info!(
                requeued = report.requeued.len(),
                dropped = report.dropped.len(),
                "expired in-flight tasks recovered"
            );
        }
        Ok(report)
    }

    /// Removes ready tasks for one agent; returns the purged task ids.
    pub async fn purge_agent(&self, agent_key: &str) -> Result<Vec<String>, QueueError> {
        match &self.backend {
            Backend::Local(queue) => {
                let Ok(mut queue) = queue.lock() else {
                    return Ok(Vec::new());
                };
                let mut purged = Vec::new();
                queue.ready.retain(|task| {
                    if task.queue_key == agent_key {
                        purged.push(task.id.clone());
                        false
                    } else {
                        true
                    }
                });
                Ok(purged)
            }
            Backend::Shared { store, .. } => Ok(store
                .queue_purge_agent(agent_key)
                .await
                .inspect_err(|_| self.metrics.record_store_error("queue_purge_agent"))?),
        }
    }

    pub async fn depth(&self) -> Result<QueueDepth, QueueError> {
        match &self.backend {
            Backend::Local(queue) => Ok(queue
                .lock()
                .map(|queue| QueueDepth {
                    ready: queue.ready.len(),
                    processing: queue.inflight.len(),
                    inflight: queue.inflight.len(),
                })
                .unwrap_or_default()),
            Backend::Shared { store, .. } => Ok(store
                .queue_depth()
                .await
                .inspect_err(|_| self.metrics.record_store_error("queue_depth"))?),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;

    use super::{ClaimOutcome, ExecutionQueue, QueueError};
    use crate::{
        clock::ManualClock,
        error::SchedulerErrorCode,
        metrics::SchedulerMetrics,
        store::{CoordinationStore, MemoryCoordinationStore, StoreKeys},
        types::ExecutionTask,
    };

    fn task(agent_key: &str) -> ExecutionTask {
        ExecutionTask::agent_cycle(agent_key.to_string(), 1_000, 1, "i".to_string())
    }

    #[tokio::test]
    async fn local_queue_counts_inflight_toward_capacity() -> Result<()> {
        let clock = Arc::new(ManualClock::new(1_000));
        let metrics = SchedulerMetrics::new();
        let queue = ExecutionQueue::local(clock, metrics.clone(), "w".to_string(), 2);

        let first = task("u:a");
        queue.enqueue(&first).await?;
        queue.enqueue(&task("u:b")).await?;
        let error = queue.enqueue(&task("u:c")).await.expect_err("full");
        assert_eq!(error.code(), SchedulerErrorCode::QueueFull);
        assert!(matches!(error, QueueError::Full { depth: 2, max_depth: 2 }));

        assert_eq!(queue.claim().await?, Some(ClaimOutcome::Task(first.clone())));
        assert!(queue.enqueue(&task("u:c")).await.is_err());
        queue.ack(&first.id).await?;
        queue.enqueue(&task("u:c")).await?;
        assert_eq!(metrics.snapshot().queue_full_total, 2);
        Ok(())
    }

    #[tokio::test]
    async fn local_purge_only_touches_ready_tasks_of_that_agent() -> Result<()> {
        let queue = ExecutionQueue::local(
            Arc::new(ManualClock::new(0)),
            SchedulerMetrics::new(),
            "w".to_string(),
            10,
        );
        let removed = task("u:a");
        queue.enqueue(&removed).await?;
        queue.enqueue(&task("u:b")).await?;
        assert_eq!(queue.purge_agent("u:a").await?, vec![removed.id]);
        assert_eq!(queue.depth().await?.ready, 1);
        Ok(())
    }

    #[tokio::test]
    async fn shared_claim_flags_malformed_payloads() -> Result<()> {
        let clock = ManualClock::new(1_000);
        let store = MemoryCoordinationStore::new(StoreKeys::new("t:"), Arc::new(clock.clone()));
        store.queue_enqueue("bogus", "{\"kind\":\"other\"}", 10).await?;
        let queue = ExecutionQueue::shared(
            Arc::new(store.clone()),
            Arc::new(clock),
            SchedulerMetrics::new(),
            "w".to_string(),
            10,
            500,
        );
        let claimed = queue.claim().await?;
        assert!(matches!(
            claimed,
            Some(ClaimOutcome::Invalid { ref task_id, .. }) if task_id == "bogus"
        ));
        queue.ack("bogus").await?;
        assert_eq!(queue.depth().await?.total(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn shared_requeue_redelivers_unacked_work() -> Result<()> {
        let clock = ManualClock::new(1_000);
        let store = MemoryCoordinationStore::new(StoreKeys::new("t:"), Arc::new(clock.clone()));
        let metrics = SchedulerMetrics::new();
        let queue = ExecutionQueue::shared(
            Arc::new(store),
            Arc::new(clock.clone()),
            metrics.clone(),
            "w".to_string(),
            10,
            500,
        );
        let pending = task("u:a");
        queue.enqueue(&pending).await?;
        assert!(matches!(queue.claim().await?, Some(ClaimOutcome::Task(_))));

        clock.advance(501);
        let report = queue.requeue_expired(10).await?;
        assert_eq!(report.requeued, vec![pending.id.clone()]);
        assert_eq!(metrics.snapshot().tasks_requeued_total, 1);
        assert_eq!(queue.claim().await?, Some(ClaimOutcome::Task(pending)));
        Ok(())
    }
}
