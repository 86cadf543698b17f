//! Cross-instance coordination state.
//!
//! Every method on [`CoordinationStore`] is a single atomic operation on the
//! backing store. Read-modify-write of an agent record goes through
//! [`CoordinationStore::swap_agent`], which refuses the write if the record
//! changed since it was read, so no in-process locking is needed even when
//! many instances share one store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryCoordinationStore;
pub use redis_store::RedisCoordinationStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("backing store operation {op} timed out")]
    Timeout { op: &'static str },
    #[error("backing store protocol error: {0}")]
    Protocol(String),
}

/// Key layout under one configurable prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.prefix)
    }

    #[must_use]
    pub fn agents(&self) -> String {
        self.key("agents")
    }

    #[must_use]
    pub fn agent_schedule(&self) -> String {
        self.key("agent_schedule")
    }

    #[must_use]
    pub fn cycle_queue(&self) -> String {
        self.key("cycle_queue")
    }

    #[must_use]
    pub fn cycle_queue_processing(&self) -> String {
        self.key("cycle_queue_processing")
    }

    #[must_use]
    pub fn cycle_queue_payloads(&self) -> String {
        self.key("cycle_queue_payloads")
    }

    #[must_use]
    pub fn cycle_queue_inflight(&self) -> String {
        self.key("cycle_queue_inflight")
    }

    #[must_use]
    pub fn leader_lock(&self) -> String {
        self.key("leader_lock")
    }

    #[must_use]
    pub fn leader_fence(&self) -> String {
        self.key("leader_fence")
    }

    #[must_use]
    pub fn lease_prefix(&self) -> String {
        self.key("lease:")
    }

    #[must_use]
    pub fn lease(&self, agent_key: &str) -> String {
        format!("{}{agent_key}", self.lease_prefix())
    }

    #[must_use]
    pub fn exec_lease_prefix(&self) -> String {
        self.key("exec_lease:")
    }

    #[must_use]
    pub fn exec_lease(&self, task_id: &str) -> String {
        format!("{}{task_id}", self.exec_lease_prefix())
    }

    #[must_use]
    pub fn callback_dedupe(&self, idempotency_key: &str) -> String {
        self.key(&format!("callback_dedupe:{idempotency_key}"))
    }

    #[must_use]
    pub fn quota(&self, bucket: &str, subject: &str, window: u64) -> String {
        self.key(&format!("quota:{bucket}:{subject}:{window}"))
    }
}

/// Value held under the leader lock key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderLockRecord {
    pub owner_token: String,
    pub fence_token: u64,
    pub instance_id: String,
}

/// What an agent write does to the key's schedule entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexWrite {
    Keep,
    Upsert(u64),
    Remove,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { depth: usize },
    Full { depth: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimedTask {
    pub task_id: String,
    /// `None` when the payload was purged between enqueue and claim.
    pub payload: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    pub ready: usize,
    pub processing: usize,
    pub inflight: usize,
}

impl QueueDepth {
    /// Depth counted against `MAX_QUEUE_DEPTH`.
    #[must_use]
    pub fn total(&self) -> usize {
        self.ready + self.inflight
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequeueReport {
    pub requeued: Vec<String>,
    pub dropped: Vec<String>,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    fn backend_name(&self) -> &'static str;
    fn keys(&self) -> &StoreKeys;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Writes `record` only while the stored record still equals `expected`
    /// (`None`: only while absent) and applies `index` in the same step.
    /// `false` means the stored record moved on and nothing was written.
    async fn swap_agent(
        &self,
        agent_key: &str,
        expected: Option<&str>,
        record: &str,
        index: IndexWrite,
    ) -> Result<bool, StoreError>;
    async fn get_agent(&self, agent_key: &str) -> Result<Option<String>, StoreError>;
    /// Drops the record and its schedule entry together.
    async fn delete_agent(&self, agent_key: &str) -> Result<(), StoreError>;
    async fn list_agents(&self) -> Result<Vec<(String, String)>, StoreError>;

    async fn schedule_remove(&self, agent_key: &str) -> Result<(), StoreError>;
    async fn schedule_due(&self, now_ms: u64, limit: usize) -> Result<Vec<String>, StoreError>;
    /// Set-if-absent on the per-agent job lease; on success re-scores the
    /// agent forward by the lease TTL in the same atomic step.
    async fn claim_due_slot(
        &self,
        agent_key: &str,
        owner: &str,
        lease_ttl_ms: u64,
        now_ms: u64,
    ) -> Result<bool, StoreError>;
    async fn release_due_slot(&self, agent_key: &str) -> Result<(), StoreError>;

    /// Returns the freshly minted fence token, or `None` if the lock is held.
    async fn leader_acquire(
        &self,
        owner_token: &str,
        instance_id: &str,
        ttl_ms: u64,
    ) -> Result<Option<u64>, StoreError>;
    async fn leader_renew(&self, owner_token: &str, ttl_ms: u64) -> Result<bool, StoreError>;
    async fn leader_release(&self, owner_token: &str) -> Result<bool, StoreError>;
    async fn leader_current(&self) -> Result<Option<LeaderLockRecord>, StoreError>;

    async fn queue_enqueue(
        &self,
        task_id: &str,
        payload: &str,
        max_depth: usize,
    ) -> Result<EnqueueOutcome, StoreError>;
    async fn queue_claim(
        &self,
        worker_id: &str,
        lease_ttl_ms: u64,
        now_ms: u64,
    ) -> Result<Option<ClaimedTask>, StoreError>;
    async fn queue_ack(&self, task_id: &str) -> Result<bool, StoreError>;
    async fn queue_requeue_expired(
        &self,
        now_ms: u64,
        limit: usize,
    ) -> Result<RequeueReport, StoreError>;
    /// Removes not-yet-claimed tasks whose `queueKey` matches.
    async fn queue_purge_agent(&self, agent_key: &str) -> Result<Vec<String>, StoreError>;
    async fn queue_depth(&self) -> Result<QueueDepth, StoreError>;

    /// `true` when the marker was absent and is now set.
    async fn dedupe_check_and_set(&self, key: &str, ttl_ms: u64) -> Result<bool, StoreError>;
    async fn dedupe_release(&self, key: &str) -> Result<(), StoreError>;

    async fn quota_increment(&self, key: &str, window_ms: u64) -> Result<u64, StoreError>;
}
