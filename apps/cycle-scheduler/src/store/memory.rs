use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    ClaimedTask, CoordinationStore, EnqueueOutcome, IndexWrite, LeaderLockRecord, QueueDepth,
    RequeueReport, StoreError, StoreKeys,
};
use crate::{clock::Clock, types::ExecutionTask};

/// Shared in-process coordination store.
///
/// Cloned handles share state, which lets several scheduler instances in
/// one process coordinate exactly as they would through Redis. Each trait
/// method holds the state lock for its whole body, giving the same
/// all-or-nothing behaviour as a server-side script.
#[derive(Clone)]
pub struct MemoryCoordinationStore {
    inner: Arc<Mutex<MemoryState>>,
    available: Arc<AtomicBool>,
    keys: StoreKeys,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, Expiring>,
    counters: HashMap<String, u64>,
    agents: BTreeMap<String, String>,
    schedule: HashMap<String, u64>,
    ready: VecDeque<String>,
    processing: VecDeque<String>,
    payloads: HashMap<String, String>,
    inflight: HashMap<String, u64>,
}

struct Expiring {
    value: String,
    expires_at_ms: Option<u64>,
}

impl MemoryState {
    fn live(&mut self, key: &str, now_ms: u64) -> Option<&str> {
        let expired = self
            .strings
            .get(key)
            .is_some_and(|entry| entry.expires_at_ms.is_some_and(|at| at <= now_ms));
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|entry| entry.value.as_str())
    }

    fn set_px(&mut self, key: &str, value: String, ttl_ms: u64, now_ms: u64) {
        self.strings.insert(
            key.to_string(),
            Expiring {
                value,
                expires_at_ms: Some(now_ms.saturating_add(ttl_ms)),
            },
        );
    }

    fn set_nx_px(&mut self, key: &str, value: String, ttl_ms: u64, now_ms: u64) -> bool {
        if self.live(key, now_ms).is_some() {
            return false;
        }
        self.set_px(key, value, ttl_ms, now_ms);
        true
    }
}

impl MemoryCoordinationStore {
    #[must_use]
    pub fn new(keys: StoreKeys, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState::default())),
            available: Arc::new(AtomicBool::new(true)),
            keys,
            clock,
        }
    }

    /// Simulates an outage: every operation fails until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    async fn state(&self) -> Result<tokio::sync::MutexGuard<'_, MemoryState>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store disabled".to_string()));
        }
        Ok(self.inner.lock().await)
    }

    /// Whether a live execution lease exists for the task.
    pub async fn exec_lease_owner(&self, task_id: &str) -> Option<String> {
        let now = self.clock.now_ms();
        let key = self.keys.exec_lease(task_id);
        let mut state = self.inner.lock().await;
        state.live(&key, now).map(ToOwned::to_owned)
    }

    pub async fn schedule_score(&self, agent_key: &str) -> Option<u64> {
        self.inner.lock().await.schedule.get(agent_key).copied()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.state().await.map(|_| ())
    }

    async fn swap_agent(
        &self,
        agent_key: &str,
        expected: Option<&str>,
        record: &str,
        index: IndexWrite,
    ) -> Result<bool, StoreError> {
        let mut state = self.state().await?;
        if state.agents.get(agent_key).map(String::as_str) != expected {
            return Ok(false);
        }
        state
            .agents
            .insert(agent_key.to_string(), record.to_string());
        match index {
            IndexWrite::Keep => {}
            IndexWrite::Upsert(next_run_at) => {
                state.schedule.insert(agent_key.to_string(), next_run_at);
            }
            IndexWrite::Remove => {
                state.schedule.remove(agent_key);
            }
        }
        Ok(true)
    }

    async fn get_agent(&self, agent_key: &str) -> Result<Option<String>, StoreError> {
        let state = self.state().await?;
        Ok(state.agents.get(agent_key).cloned())
    }

    async fn delete_agent(&self, agent_key: &str) -> Result<(), StoreError> {
        let mut state = self.state().await?;
        state.agents.remove(agent_key);
        state.schedule.remove(agent_key);
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<(String, String)>, StoreError> {
        let state = self.state().await?;
        Ok(state
            .agents
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn schedule_remove(&self, agent_key: &str) -> Result<(), StoreError> {
        let mut state = self.state().await?;
        state.schedule.remove(agent_key);
        Ok(())
    }

    async fn schedule_due(&self, now_ms: u64, limit: usize) -> Result<Vec<String>, StoreError> {
        let state = self.state().await?;
        let mut due = state
            .schedule
            .iter()
            .filter(|(_, score)| **score <= now_ms)
            .map(|(key, score)| (*score, key.clone()))
            .collect::<Vec<_>>();
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, key)| key).collect())
    }

    async fn claim_due_slot(
        &self,
        agent_key: &str,
        owner: &str,
        lease_ttl_ms: u64,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let lease_key = self.keys.lease(agent_key);
        let mut state = self.state().await?;
        if !state.set_nx_px(&lease_key, owner.to_string(), lease_ttl_ms, now_ms) {
            return Ok(false);
        }
        if let Some(score) = state.schedule.get_mut(agent_key) {
            *score = now_ms.saturating_add(lease_ttl_ms);
        }
        Ok(true)
    }

    async fn release_due_slot(&self, agent_key: &str) -> Result<(), StoreError> {
        let lease_key = self.keys.lease(agent_key);
        let mut state = self.state().await?;
        state.strings.remove(&lease_key);
        Ok(())
    }

    async fn leader_acquire(
        &self,
        owner_token: &str,
        instance_id: &str,
        ttl_ms: u64,
    ) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_ms();
        let lock_key = self.keys.leader_lock();
        let fence_key = self.keys.leader_fence();
        let mut state = self.state().await?;
        if state.live(&lock_key, now).is_some() {
            return Ok(None);
        }
        let fence = {
            let counter = state.counters.entry(fence_key).or_insert(0);
            *counter += 1;
            *counter
        };
        let record = LeaderLockRecord {
            owner_token: owner_token.to_string(),
            fence_token: fence,
            instance_id: instance_id.to_string(),
        };
        let encoded =
            serde_json::to_string(&record).map_err(|error| StoreError::Protocol(error.to_string()))?;
        state.set_px(&lock_key, encoded, ttl_ms, now);
        Ok(Some(fence))
    }

    async fn leader_renew(&self, owner_token: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let lock_key = self.keys.leader_lock();
        let mut state = self.state().await?;
        let owned = state
            .live(&lock_key, now)
            .and_then(|raw| serde_json::from_str::<LeaderLockRecord>(raw).ok())
            .is_some_and(|record| record.owner_token == owner_token);
        if !owned {
            return Ok(false);
        }
        if let Some(entry) = state.strings.get_mut(&lock_key) {
            entry.expires_at_ms = Some(now.saturating_add(ttl_ms));
        }
        Ok(true)
    }

    async fn leader_release(&self, owner_token: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let lock_key = self.keys.leader_lock();
        let mut state = self.state().await?;
        let owned = state
            .live(&lock_key, now)
            .and_then(|raw| serde_json::from_str::<LeaderLockRecord>(raw).ok())
            .is_some_and(|record| record.owner_token == owner_token);
        if owned {
            state.strings.remove(&lock_key);
        }
        Ok(owned)
    }

    async fn leader_current(&self) -> Result<Option<LeaderLockRecord>, StoreError> {
        let now = self.clock.now_ms();
        let lock_key = self.keys.leader_lock();
        let mut state = self.state().await?;
        Ok(state
            .live(&lock_key, now)
            .and_then(|raw| serde_json::from_str(raw).ok()))
    }

    async fn queue_enqueue(
        &self,
        task_id: &str,
        payload: &str,
        max_depth: usize,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut state = self.state().await?;
        let depth = state.ready.len() + state.inflight.len();
        if depth >= max_depth {
            return Ok(EnqueueOutcome::Full { depth });
        }
        state
            .payloads
            .insert(task_id.to_string(), payload.to_string());
        state.ready.push_back(task_id.to_string());
        Ok(EnqueueOutcome::Enqueued { depth: depth + 1 })
    }

    async fn queue_claim(
        &self,
        worker_id: &str,
        lease_ttl_ms: u64,
        now_ms: u64,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        let mut state = self.state().await?;
        let Some(task_id) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.processing.push_back(task_id.clone());
        let payload = state.payloads.get(&task_id).cloned();
        let lease_key = self.keys.exec_lease(&task_id);
        state.set_px(&lease_key, worker_id.to_string(), lease_ttl_ms, now_ms);
        state
            .inflight
            .insert(task_id.clone(), now_ms.saturating_add(lease_ttl_ms));
        Ok(Some(ClaimedTask { task_id, payload }))
    }

    async fn queue_ack(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state().await?;
        let before = state.processing.len();
        state.processing.retain(|id| id != task_id);
        let removed = state.processing.len() != before;
        state.inflight.remove(task_id);
        state.payloads.remove(task_id);
        state.strings.remove(&self.keys.exec_lease(task_id));
        Ok(removed)
    }

    async fn queue_requeue_expired(
        &self,
        now_ms: u64,
        limit: usize,
    ) -> Result<RequeueReport, StoreError> {
        let mut state = self.state().await?;
        let mut expired = state
            .inflight
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now_ms)
            .map(|(task_id, expires_at)| (*expires_at, task_id.clone()))
            .collect::<Vec<_>>();
        expired.sort();

        let mut report = RequeueReport::default();
        for (_, task_id) in expired.into_iter().take(limit) {
            let lease_key = self.keys.exec_lease(&task_id);
            if state.live(&lease_key, now_ms).is_some() {
                continue;
            }
            state.processing.retain(|id| id != &task_id);
            state.inflight.remove(&task_id);
            if state.payloads.contains_key(&task_id) {
                state.ready.push_front(task_id.clone());
                report.requeued.push(task_id);
            } else {
                report.dropped.push(task_id);
            }
        }
        Ok(report)
    }

    async fn queue_purge_agent(&self, agent_key: &str) -> Result<Vec<String>, StoreError> {
        let mut state = self.state().await?;
        let purged = state
            .ready
            .iter()
            .filter(|task_id| {
                state
                    .payloads
                    .get(*task_id)
                    .and_then(|raw| ExecutionTask::decode(raw).ok())
                    .is_some_and(|task| task.queue_key == agent_key)
            })
            .cloned()
            .collect::<Vec<_>>();
        for task_id in &purged {
            state.ready.retain(|id| id != task_id);
            state.payloads.remove(task_id);
        }
        Ok(purged)
    }

    async fn queue_depth(&self) -> Result<QueueDepth, StoreError> {
        let state = self.state().await?;
        Ok(QueueDepth {
            ready: state.ready.len(),
            processing: state.processing.len(),
            inflight: state.inflight.len(),
        })
    }

    async fn dedupe_check_and_set(&self, key: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let dedupe_key = self.keys.callback_dedupe(key);
        let mut state = self.state().await?;
        Ok(state.set_nx_px(&dedupe_key, "1".to_string(), ttl_ms, now))
    }

    async fn dedupe_release(&self, key: &str) -> Result<(), StoreError> {
        let dedupe_key = self.keys.callback_dedupe(key);
        let mut state = self.state().await?;
        state.strings.remove(&dedupe_key);
        Ok(())
    }

    async fn quota_increment(&self, key: &str, window_ms: u64) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.state().await?;
        let current = state
            .live(key, now)
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        if current == 0 {
            state.set_px(key, next.to_string(), window_ms, now);
        } else if let Some(entry) = state.strings.get_mut(key) {
            entry.value = next.to_string();
        }
        Ok(next)
    }
}
