use std::sync::Arc;

use tracing::{debug, warn};

use crate::{metrics::SchedulerMetrics, store::CoordinationStore};

/// Timestamp-ordered index of agent keys in the shared store.
///
/// Entries are written together with the agent record by the registry;
/// this side only scans, leases and unindexes.
///
/// Store failures are logged and counted; callers see an empty scan or a
/// skipped write rather than an error.
pub struct ScheduleIndex {
    store: Arc<dyn CoordinationStore>,
    metrics: SchedulerMetrics,
}

impl ScheduleIndex {
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, metrics: SchedulerMetrics) -> Self {
        Self { store, metrics }
    }

    pub async fn remove(&self, agent_key: &str) {
        if let Err(error) = self.store.schedule_remove(agent_key).await {
            self.metrics.record_store_error("schedule_remove");
            warn!(agent_key, error = %error, "schedule index remove failed");
        }
    }

    /// Pulls up to `limit` due keys and keeps the ones whose job lease this
    /// owner managed to set.
    pub async fn claim_due(
        &self,
        now_ms: u64,
        limit: usize,
        owner: &str,
        lease_ttl_ms: u64,
    ) -> Vec<String> {
        let due = match self.store.schedule_due(now_ms, limit).await {
            Ok(due) => due,
            Err(error) => {
                self.metrics.record_store_error("schedule_due");
                warn!(error = %error, "schedule index scan failed");
                return Vec::new();
            }
        };

        let mut claimed = Vec::with_capacity(due.len());
        for agent_key in due {
            match self
                .store
                .claim_due_slot(&agent_key, owner, lease_ttl_ms, now_ms)
                .await
            {
                Ok(true) => claimed.push(agent_key),
                Ok(false) => debug!(agent_key, "due slot already leased"),
                Err(error) => {
                    self.metrics.record_store_error("claim_due_slot");
                    warn!(agent_key, error = %error, "due slot claim failed");
                }
            }
        }
        claimed
    }

    pub async fn release(&self, agent_key: &str) {
        if let Err(error) = self.store.release_due_slot(agent_key).await {
            self.metrics.record_store_error("release_due_slot");
            warn!(agent_key, error = %error, "due slot release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;

    use super::ScheduleIndex;
    use crate::{
        clock::ManualClock,
        metrics::SchedulerMetrics,
        store::{CoordinationStore, IndexWrite, MemoryCoordinationStore, StoreKeys},
    };

    #[tokio::test]
    async fn claimed_keys_are_rescored_past_the_lease() -> Result<()> {
        let clock = ManualClock::new(1_000);
        let store = MemoryCoordinationStore::new(StoreKeys::new("t:"), Arc::new(clock.clone()));
        let index = ScheduleIndex::new(Arc::new(store.clone()), SchedulerMetrics::new());

        for (agent_key, next_run_at) in [("u:a", 900), ("u:b", 1_000), ("u:later", 5_000)] {
            store
                .swap_agent(agent_key, None, "{}", IndexWrite::Upsert(next_run_at))
                .await?;
        }

        let claimed = index.claim_due(1_000, 10, "leader-1", 300).await;
        assert_eq!(claimed, vec!["u:a".to_string(), "u:b".to_string()]);
        assert!(index.claim_due(1_000, 10, "leader-1", 300).await.is_empty());
        assert_eq!(store.schedule_score("u:a").await, Some(1_300));

        index.release("u:a").await;
        index.remove("u:b").await;
        assert_eq!(store.schedule_score("u:b").await, None);
        assert_eq!(
            index.claim_due(1_300, 10, "leader-1", 300).await,
            vec!["u:a".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn scan_failure_yields_no_work() {
        let clock = ManualClock::new(1_000);
        let store = MemoryCoordinationStore::new(StoreKeys::new("t:"), Arc::new(clock));
        let metrics = SchedulerMetrics::new();
        let index = ScheduleIndex::new(Arc::new(store.clone()), metrics.clone());
        store.set_available(false);
        assert!(index.claim_due(1_000, 10, "leader", 300).await.is_empty());
        assert_eq!(
            metrics.snapshot().store_errors.get("schedule_due").copied(),
            Some(1)
        );
    }
}
