use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{clock::Clock, config::LeaderConfig, metrics::SchedulerMetrics, store::CoordinationStore};

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderSnapshot {
    pub instance_id: String,
    pub is_leader: bool,
    pub fence_token: u64,
    pub consecutive_failures: u32,
    pub backoff_until_ms: u64,
    pub lock_ttl_ms: u64,
    pub renew_interval_ms: u64,
}

#[derive(Default)]
struct LeaderState {
    owner_token: Option<String>,
    last_renewed_at: u64,
    consecutive_failures: u32,
    backoff_until_ms: u64,
}

/// Follower/Leader state machine over the shared leader lock.
pub struct LeaderElection {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    metrics: SchedulerMetrics,
    instance_id: String,
    config: LeaderConfig,
    fence_token: AtomicU64,
    state: Mutex<LeaderState>,
}

impl LeaderElection {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        metrics: SchedulerMetrics,
        instance_id: String,
        config: LeaderConfig,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            instance_id,
            config,
            fence_token: AtomicU64::new(0),
            state: Mutex::new(LeaderState::default()),
        }
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.fence_token() > 0
    }

    /// Fence token of the current term, 0 while follower.
    #[must_use]
    pub fn fence_token(&self) -> u64 {
        self.fence_token.load(Ordering::SeqCst)
    }

    /// Returns whether this instance may act as leader for the current tick.
    ///
    /// A leader renews at most once per renew interval. A follower inside its
    /// backoff window does not touch the store.
    pub async fn acquire_or_renew(&self) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;

        if let Some(owner_token) = state.owner_token.clone() {
            if now.saturating_sub(state.last_renewed_at) < self.config.renew_interval_ms {
                return true;
            }
            match self
                .store
                .leader_renew(&owner_token, self.config.lock_ttl_ms)
                .await
            {
                Ok(true) => {
                    state.last_renewed_at = now;
                    return true;
                }
                Ok(false) => {
                    warn!(
                        instance_id = %self.instance_id,
                        fence_token = self.fence_token(),
                        "leader lock lost to another owner"
                    );
                }
                Err(error) => {
                    self.metrics.record_store_error("leader_renew");
                    warn!(
                        instance_id = %self.instance_id,
                        fence_token = self.fence_token(),
                        error = %error,
                        "leader renew failed"
                    );
                }
            }
            self.demote(&mut state, now);
            return false;
        }

        if now < state.backoff_until_ms {
            return false;
        }

        let owner_token = Uuid::new_v4().to_string();
        match self
            .store
            .leader_acquire(&owner_token, &self.instance_id, self.config.lock_ttl_ms)
            .await
        {
            Ok(Some(fence_token)) => {
                state.owner_token = Some(owner_token);
                state.last_renewed_at = now;
                state.consecutive_failures = 0;
                state.backoff_until_ms = 0;
                self.fence_token.store(fence_token, Ordering::SeqCst);
                self.metrics.record_leader_transition("acquired");
                info!(
                    instance_id = %self.instance_id,
                    fence_token,
                    "leadership acquired"
                );
                true
            }
            Ok(None) => false,
            Err(error) => {
                self.metrics.record_store_error("leader_acquire");
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.backoff_until_ms = now + self.backoff_delay_ms(state.consecutive_failures);
                warn!(
                    instance_id = %self.instance_id,
                    error = %error,
                    backoff_until_ms = state.backoff_until_ms,
                    "leader acquire failed"
                );
                false
            }
        }
    }

    /// Compare-and-delete of the lock; a no-op while follower.
    pub async fn release(&self) -> bool {
        let mut state = self.state.lock().await;
        let Some(owner_token) = state.owner_token.take() else {
            return false;
        };
        let fence_token = self.fence_token.swap(0, Ordering::SeqCst);
        match self.store.leader_release(&owner_token).await {
            Ok(released) => {
                self.metrics.record_leader_transition("released");
                info!(
                    instance_id = %self.instance_id,
                    fence_token,
                    released,
                    "leadership released"
                );
                released
            }
            Err(error) => {
                self.metrics.record_store_error("leader_release");
                warn!(instance_id = %self.instance_id, error = %error, "leader release failed");
                false
            }
        }
    }

    pub async fn snapshot(&self) -> LeaderSnapshot {
        let state = self.state.lock().await;
        LeaderSnapshot {
            instance_id: self.instance_id.clone(),
            is_leader: self.is_leader(),
            fence_token: self.fence_token(),
            consecutive_failures: state.consecutive_failures,
            backoff_until_ms: state.backoff_until_ms,
            lock_ttl_ms: self.config.lock_ttl_ms,
            renew_interval_ms: self.config.renew_interval_ms,
        }
    }

    fn demote(&self, state: &mut LeaderState, now: u64) {
        state.owner_token = None;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.backoff_until_ms = now + self.backoff_delay_ms(state.consecutive_failures);
        self.fence_token.store(0, Ordering::SeqCst);
        self.metrics.record_leader_transition("lost");
    }

    /// `min(max, base * 2^(failures-1))` plus up to a quarter of that as jitter.
    fn backoff_delay_ms(&self, failures: u32) -> u64 {
        let exponent = failures.saturating_sub(1).min(20);
        let delay = self
            .config
            .backoff_base_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.config.backoff_max_ms);
        let jitter = delay / 4;
        if jitter == 0 {
            return delay;
        }
        delay + rand::rng().random_range(0..=jitter)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::LeaderElection;
    use crate::{
        clock::ManualClock,
        config::LeaderConfig,
        metrics::SchedulerMetrics,
        store::{MemoryCoordinationStore, StoreKeys},
    };

    fn config() -> LeaderConfig {
        LeaderConfig {
            lock_ttl_ms: 100,
            renew_interval_ms: 40,
            backoff_base_ms: 200,
            backoff_max_ms: 1_000,
        }
    }

    fn election(
        store: &MemoryCoordinationStore,
        clock: &ManualClock,
        instance: &str,
    ) -> (LeaderElection, SchedulerMetrics) {
        let metrics = SchedulerMetrics::new();
        let election = LeaderElection::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            metrics.clone(),
            instance.to_string(),
            config(),
        );
        (election, metrics)
    }

    #[tokio::test]
    async fn renewal_keeps_leadership_and_excludes_followers() {
        let clock = ManualClock::new(1_000);
        let store = MemoryCoordinationStore::new(StoreKeys::new("t:"), Arc::new(clock.clone()));
        let (a, _) = election(&store, &clock, "a");
        let (b, _) = election(&store, &clock, "b");

        assert!(a.acquire_or_renew().await);
        assert!(!b.acquire_or_renew().await);
        for _ in 0..5 {
            clock.advance(60);
            assert!(a.acquire_or_renew().await);
            assert!(!b.acquire_or_renew().await);
        }
        assert_eq!(a.fence_token(), 1);
        assert_eq!(b.fence_token(), 0);
    }

    #[tokio::test]
    async fn lost_lock_demotes_and_backs_off() {
        let clock = ManualClock::new(1_000);
        let store = MemoryCoordinationStore::new(StoreKeys::new("t:"), Arc::new(clock.clone()));
        let (a, a_metrics) = election(&store, &clock, "a");
        let (b, _) = election(&store, &clock, "b");

        assert!(a.acquire_or_renew().await);
        clock.advance(150);
        assert!(b.acquire_or_renew().await);
        assert_eq!(b.fence_token(), 2);

        assert!(!a.acquire_or_renew().await);
        assert!(!a.is_leader());
        assert_eq!(a_metrics.snapshot().leader_transitions("lost"), 1);

        let snapshot = a.snapshot().await;
        assert_eq!(snapshot.consecutive_failures, 1);
        assert!(snapshot.backoff_until_ms >= 1_150 + 200);
        assert!(snapshot.backoff_until_ms <= 1_150 + 250);
    }

    #[tokio::test]
    async fn release_lets_the_next_instance_in_with_a_higher_fence() {
        let clock = ManualClock::new(1_000);
        let store = MemoryCoordinationStore::new(StoreKeys::new("t:"), Arc::new(clock.clone()));
        let (a, _) = election(&store, &clock, "a");
        let (b, _) = election(&store, &clock, "b");

        assert!(a.acquire_or_renew().await);
        assert!(a.release().await);
        assert!(!a.is_leader());
        assert!(b.acquire_or_renew().await);
        assert_eq!(b.fence_token(), 2);
        assert!(!a.release().await);
    }

    #[tokio::test]
    async fn store_outage_blocks_acquisition_without_panicking() {
        let clock = ManualClock::new(1_000);
        let store = MemoryCoordinationStore::new(StoreKeys::new("t:"), Arc::new(clock.clone()));
        let (a, metrics) = election(&store, &clock, "a");
        store.set_available(false);
        assert!(!a.acquire_or_renew().await);
        assert_eq!(
            metrics.snapshot().store_errors.get("leader_acquire").copied(),
            Some(1)
        );

        store.set_available(true);
        assert!(!a.acquire_or_renew().await);
        clock.advance(1_000);
        assert!(a.acquire_or_renew().await);
    }
}
