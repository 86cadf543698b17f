use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    callback::{CallbackDispatcher, idempotency_key},
    clock::Clock,
    market::MarketCache,
    metrics::SchedulerMetrics,
    registry::AgentRegistry,
    store::CoordinationStore,
    types::{
        Agent, AgentEnvelope, CallbackHeaders, CyclePayload, LastDispatch, SchedulerEnvelope,
    },
};

pub const CYCLE_EVENT: &str = "agent_cycle";

/// Check-and-set over callback idempotency records. Uses the shared store
/// when present and an instance-local TTL map otherwise, or when the store
/// is failing.
pub struct IdempotencyGuard {
    store: Option<Arc<dyn CoordinationStore>>,
    local: Mutex<HashMap<String, u64>>,
    clock: Arc<dyn Clock>,
    metrics: SchedulerMetrics,
    ttl_ms: u64,
}

impl IdempotencyGuard {
    #[must_use]
    pub fn new(
        store: Option<Arc<dyn CoordinationStore>>,
        clock: Arc<dyn Clock>,
        metrics: SchedulerMetrics,
        ttl_ms: u64,
    ) -> Self {
        Self {
            store,
            local: Mutex::new(HashMap::new()),
            clock,
            metrics,
            ttl_ms,
        }
    }

    /// `true` when this caller set the record and should send.
    pub async fn check_and_set(&self, key: &str) -> bool {
        if let Some(store) = &self.store {
            match store.dedupe_check_and_set(key, self.ttl_ms).await {
                Ok(first) => return first,
                Err(error) => {
                    self.metrics.record_store_error("dedupe_check_and_set");
                    warn!(error = %error, "idempotency store unavailable; using local records");
                }
            }
        }
        let now = self.clock.now_ms();
        let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        local.retain(|_, expires_at| *expires_at > now);
        if local.contains_key(key) {
            return false;
        }
        local.insert(key.to_string(), now.saturating_add(self.ttl_ms));
        true
    }

    pub async fn release(&self, key: &str) {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if let Some(store) = &self.store {
            if let Err(error) = store.dedupe_release(key).await {
                self.metrics.record_store_error("dedupe_release");
                warn!(error = %error, "idempotency record release failed");
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Delivered { status: u16 },
    Deduped,
    NoCallback,
    Failed { error: String },
}

impl DispatchOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Where a dispatch came from: the claimed task and the fence it carries.
#[derive(Clone, Copy, Debug)]
pub struct DispatchContext<'a> {
    pub fence_token: u64,
    pub queue_task_id: Option<&'a str>,
}

/// Runs one cycle for one agent: market read, payload build, guarded
/// callback delivery, and the resulting agent bookkeeping.
pub struct CycleDispatcher {
    registry: AgentRegistry,
    market: Arc<MarketCache>,
    callbacks: CallbackDispatcher,
    idempotency: IdempotencyGuard,
    clock: Arc<dyn Clock>,
    metrics: SchedulerMetrics,
    scheduler_id: String,
    instance_id: String,
    retry_delay_ms: u64,
}

impl CycleDispatcher {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        registry: AgentRegistry,
        market: Arc<MarketCache>,
        callbacks: CallbackDispatcher,
        idempotency: IdempotencyGuard,
        clock: Arc<dyn Clock>,
        metrics: SchedulerMetrics,
        scheduler_id: String,
        instance_id: String,
        retry_delay_ms: u64,
    ) -> Self {
        Self {
            registry,
            market,
            callbacks,
            idempotency,
            clock,
            metrics,
            scheduler_id,
            instance_id,
            retry_delay_ms,
        }
    }

    pub async fn dispatch(&self, agent: &Agent, context: DispatchContext<'_>) -> DispatchOutcome {
        let now = self.clock.now_ms();
        let agent_key = agent.key();

        let market = match self.market.snapshot(&agent.wallet_address).await {
            Ok(market) => market,
            Err(error) => {
                let outcome = DispatchOutcome::Failed {
                    error: error.to_string(),
                };
                self.record_failure(&agent_key, now, context, &outcome).await;
                return outcome;
            }
        };

        let key = idempotency_key(
            &self.scheduler_id,
            &agent_key,
            context.fence_token,
            context.queue_task_id,
            now,
            agent.cycle_interval_ms,
        );
        let headers = CallbackHeaders {
            idempotency_key: key.clone(),
            fence_token: context.fence_token.to_string(),
            queue_task_id: context.queue_task_id.unwrap_or_default().to_string(),
            agent_key: agent_key.clone(),
        };
        let payload = CyclePayload {
            event: CYCLE_EVENT.to_string(),
            ts: now,
            scheduler: SchedulerEnvelope {
                instance_id: self.instance_id.clone(),
                leader_fence_token: context.fence_token,
                queue_task_id: context.queue_task_id.map(ToOwned::to_owned),
                callback_idempotency_key: key.clone(),
                callback_headers: headers.clone(),
            },
            agent: AgentEnvelope::from(agent),
            market,
        };

        let outcome = match agent.callback_url.as_deref() {
            None => {
                self.metrics.record_callback("skipped");
                DispatchOutcome::NoCallback
            }
            Some(url) => {
                if !self.idempotency.check_and_set(&key).await {
                    self.metrics.record_callback("deduped");
                    info!(
                        agent_key = %agent_key,
                        idempotency_key = %key,
                        "callback already delivered; skipping"
                    );
                    DispatchOutcome::Deduped
                } else {
                    match self.callbacks.send(url, &headers, &payload).await {
                        Ok(status) => {
                            self.metrics.record_callback("delivered");
                            DispatchOutcome::Delivered { status }
                        }
                        Err(error) => {
                            self.metrics.record_callback("failed");
                            self.idempotency.release(&key).await;
                            DispatchOutcome::Failed {
                                error: error.label(),
                            }
                        }
                    }
                }
            }
        };

        if outcome.is_success() {
            self.record_success(&agent_key, now, context, &outcome).await;
        } else {
            self.record_failure(&agent_key, now, context, &outcome).await;
        }
        outcome
    }

    async fn record_success(
        &self,
        agent_key: &str,
        now: u64,
        context: DispatchContext<'_>,
        outcome: &DispatchOutcome,
    ) {
        self.metrics.record_dispatch(match outcome {
            DispatchOutcome::Deduped => "deduped",
            _ => "ok",
        });
        let (callback_status, deduped) = match outcome {
            DispatchOutcome::Delivered { status } => (Some(*status), false),
            DispatchOutcome::Deduped => (None, true),
            _ => (None, false),
        };
        let updated = self
            .registry
            .update(agent_key, |agent| {
                agent.last_cycle_at = Some(now);
                agent.next_run_at = agent
                    .next_run_at
                    .max(now.saturating_add(agent.cycle_interval_ms));
                agent.failure_count = 0;
                agent.last_dispatch = Some(LastDispatch {
                    ok: true,
                    at: now,
                    error: None,
                    task_id: context.queue_task_id.map(ToOwned::to_owned),
                    callback_status,
                    deduped,
                });
            })
            .await;
        if let Some(agent) = updated {
            info!(
                agent_key,
                fence_token = context.fence_token,
                task_id = context.queue_task_id.unwrap_or_default(),
                next_run_at = agent.next_run_at,
                deduped,
                "cycle dispatched"
            );
        }
    }

    async fn record_failure(
        &self,
        agent_key: &str,
        now: u64,
        context: DispatchContext<'_>,
        outcome: &DispatchOutcome,
    ) {
        self.metrics.record_dispatch("failed");
        let error = match outcome {
            DispatchOutcome::Failed { error } => error.clone(),
            _ => String::new(),
        };
        let retry_delay_ms = self.retry_delay_ms;
        let updated = self
            .registry
            .update(agent_key, |agent| {
                agent.failure_count += 1;
                let delay = agent.cycle_interval_ms.min(retry_delay_ms);
                agent.next_run_at = agent.next_run_at.max(now.saturating_add(delay));
                agent.last_dispatch = Some(LastDispatch {
                    ok: false,
                    at: now,
                    error: Some(error.clone()),
                    task_id: context.queue_task_id.map(ToOwned::to_owned),
                    callback_status: None,
                    deduped: false,
                });
            })
            .await;
        if let Some(agent) = updated {
            warn!(
                agent_key,
                fence_token = context.fence_token,
                task_id = context.queue_task_id.unwrap_or_default(),
                failure_count = agent.failure_count,
                next_run_at = agent.next_run_at,
                error = %error,
                "cycle dispatch failed"
            );
        }
    }
}
