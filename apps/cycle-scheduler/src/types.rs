use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const AGENT_CYCLE_TASK_KIND: &str = "agent_cycle";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Running,
    Paused,
}

impl AgentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LastDispatch {
    pub ok: bool,
    pub at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_status: Option<u16>,
    #[serde(default)]
    pub deduped: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Agent {
    pub user_id: String,
    pub id: String,
    pub name: String,
    pub wallet_address: String,
    pub status: AgentStatus,
    pub cycle_interval_ms: u64,
    #[serde(default)]
    pub callback_url: Option<String>,
    pub strategy_label: String,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub last_cycle_at: Option<u64>,
    pub next_run_at: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub queue_pending: bool,
    /// When the pending task was enqueued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<u64>,
    #[serde(default)]
    pub last_dispatch: Option<LastDispatch>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("record field {0} is empty")]
    EmptyField(&'static str),
    #[error("record kind {0} is not supported")]
    UnsupportedKind(String),
}

impl Agent {
    #[must_use]
    pub fn key(&self) -> String {
        agent_key(&self.user_id, &self.id)
    }

    #[must_use]
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.status == AgentStatus::Running && self.next_run_at <= now_ms
    }

    /// Strict decode of a record read back from the shared Agent hash.
    pub fn from_store_json(raw: &str) -> Result<Self, RecordError> {
        let agent: Self =
            serde_json::from_str(raw).map_err(|error| RecordError::Malformed(error.to_string()))?;
        if agent.user_id.trim().is_empty() {
            return Err(RecordError::EmptyField("userId"));
        }
        if agent.id.trim().is_empty() {
            return Err(RecordError::EmptyField("id"));
        }
        if agent.wallet_address.trim().is_empty() {
            return Err(RecordError::EmptyField("walletAddress"));
        }
        Ok(agent)
    }

    pub fn to_store_json(&self) -> Result<String, RecordError> {
        serde_json::to_string(self).map_err(|error| RecordError::Malformed(error.to_string()))
    }
}

#[must_use]
pub fn agent_key(user_id: &str, agent_id: &str) -> String {
    format!("{user_id}:{agent_id}")
}

/// Registration payload accepted by `POST /v1/agents/register`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub wallet_address: String,
    #[serde(default)]
    pub cycle_interval_ms: Option<u64>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub strategy_label: Option<String>,
    #[serde(default)]
    pub status: Option<AgentStatus>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Pause,
    Resume,
    Remove,
}

impl ControlAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Remove => "remove",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecutionTask {
    pub id: String,
    pub kind: String,
    pub queue_key: String,
    pub enqueued_at: u64,
    pub leader_fence_token: u64,
    pub instance_id: String,
}

impl ExecutionTask {
    #[must_use]
    pub fn agent_cycle(
        queue_key: String,
        enqueued_at: u64,
        leader_fence_token: u64,
        instance_id: String,
    ) -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("cycle-{simple}"),
            kind: AGENT_CYCLE_TASK_KIND.to_string(),
            queue_key,
            enqueued_at,
            leader_fence_token,
            instance_id,
        }
    }

    pub fn decode(raw: &str) -> Result<Self, RecordError> {
        let task: Self =
            serde_json::from_str(raw).map_err(|error| RecordError::Malformed(error.to_string()))?;
        if task.kind != AGENT_CYCLE_TASK_KIND {
            return Err(RecordError::UnsupportedKind(task.kind));
        }
        if task.id.trim().is_empty() {
            return Err(RecordError::EmptyField("id"));
        }
        if task.queue_key.trim().is_empty() {
            return Err(RecordError::EmptyField("queueKey"));
        }
        Ok(task)
    }

    pub fn encode(&self) -> Result<String, RecordError> {
        serde_json::to_string(self).map_err(|error| RecordError::Malformed(error.to_string()))
    }
}

/// Fixed callback header set attached to every cycle delivery.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackHeaders {
    #[serde(rename = "X-Idempotency-Key")]
    pub idempotency_key: String,
    #[serde(rename = "X-Fence-Token")]
    pub fence_token: String,
    #[serde(rename = "X-Queue-Task-Id")]
    pub queue_task_id: String,
    #[serde(rename = "X-Agent-Key")]
    pub agent_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerEnvelope {
    pub instance_id: String,
    pub leader_fence_token: u64,
    pub queue_task_id: Option<String>,
    pub callback_idempotency_key: String,
    pub callback_headers: CallbackHeaders,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentEnvelope {
    pub user_id: String,
    pub id: String,
    pub name: String,
    pub wallet_address: String,
    pub strategy_label: String,
    pub cycle_interval_ms: u64,
    pub failure_count: u64,
    pub last_cycle_at: Option<u64>,
}

impl From<&Agent> for AgentEnvelope {
    fn from(agent: &Agent) -> Self {
        Self {
            user_id: agent.user_id.clone(),
            id: agent.id.clone(),
            name: agent.name.clone(),
            wallet_address: agent.wallet_address.clone(),
            strategy_label: agent.strategy_label.clone(),
            cycle_interval_ms: agent.cycle_interval_ms,
            failure_count: agent.failure_count,
            last_cycle_at: agent.last_cycle_at,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub address: String,
    pub price_usd: f64,
    pub balance_sompi: u64,
    pub blockdag: Value,
    pub fetched_at: u64,
}

/// Body POSTed to an agent's callback URL once per cycle.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CyclePayload {
    pub event: String,
    pub ts: u64,
    pub scheduler: SchedulerEnvelope,
    pub agent: AgentEnvelope,
    pub market: MarketSnapshot,
}
