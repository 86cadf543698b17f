use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    clock::Clock,
    error::SchedulerErrorCode,
    metrics::SchedulerMetrics,
    store::{CoordinationStore, IndexWrite, StoreError},
    types::{Agent, AgentDefinition, AgentStatus, agent_key},
};

const WALLET_PREFIXES: [&str; 2] = ["kaspa:", "kaspatest:"];
const MAX_AGENT_ID_LEN: usize = 128;
const DEFAULT_STRATEGY_LABEL: &str = "default";
const MAX_SWAP_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0}")]
    Validation(String),
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    #[must_use]
    pub fn code(&self) -> SchedulerErrorCode {
        match self {
            Self::Validation(_) => SchedulerErrorCode::Validation,
            Self::NotFound(_) => SchedulerErrorCode::NotFound,
            Self::Store(_) => SchedulerErrorCode::BackingStoreUnavailable,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct IntervalPolicy {
    pub min_ms: u64,
    pub default_ms: u64,
}

impl IntervalPolicy {
    #[must_use]
    pub fn clamp(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_ms)
            .max(self.min_ms)
            .max(1)
    }
}

/// Agent records. With a store attached the shared hash is authoritative and
/// every write is a compare-and-swap against it; the local map is a cache
/// that keeps the instance answering through store outages.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Agent>>>,
    store: Option<Arc<dyn CoordinationStore>>,
    clock: Arc<dyn Clock>,
    metrics: SchedulerMetrics,
    intervals: IntervalPolicy,
}

impl AgentRegistry {
    #[must_use]
    pub fn new(
        store: Option<Arc<dyn CoordinationStore>>,
        clock: Arc<dyn Clock>,
        metrics: SchedulerMetrics,
        intervals: IntervalPolicy,
    ) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            store,
            clock,
            metrics,
            intervals,
        }
    }

    /// Creates or updates `owner_id`'s agent. Updates keep `createdAt` and
    /// every scheduling field; only descriptive fields change.
    pub async fn register(
        &self,
        owner_id: &str,
        definition: AgentDefinition,
    ) -> Result<Agent, RegistryError> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(RegistryError::Validation("owner is required".to_string()));
        }
        let id = definition.id.trim().to_string();
        if id.is_empty() {
            return Err(RegistryError::Validation("id is required".to_string()));
        }
        if id.len() > MAX_AGENT_ID_LEN {
            return Err(RegistryError::Validation(format!(
                "id must be at most {MAX_AGENT_ID_LEN} characters"
            )));
        }
        let wallet_address = validated_wallet(&definition.wallet_address)?;
        let callback_url = validated_callback_url(definition.callback_url.as_deref())?;
        let cycle_interval_ms = self.intervals.clamp(definition.cycle_interval_ms);
        let name = definition
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(id.as_str())
            .to_string();
        let strategy_label = definition
            .strategy_label
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .unwrap_or(DEFAULT_STRATEGY_LABEL)
            .to_string();

        let now = self.clock.now_ms();
        let key = agent_key(owner_id, &id);
        let fresh = Agent {
            user_id: owner_id.to_string(),
            id,
            name: name.clone(),
            wallet_address: wallet_address.clone(),
            status: definition.status.unwrap_or(AgentStatus::Running),
            cycle_interval_ms,
            callback_url: callback_url.clone(),
            strategy_label: strategy_label.clone(),
            created_at: now,
            updated_at: now,
            last_cycle_at: None,
            next_run_at: now,
            failure_count: 0,
            queue_pending: false,
            queued_at: None,
            last_dispatch: None,
        };
        let agent = self
            .write(
                &key,
                Some(&fresh),
                |existing| {
                    existing.name.clone_from(&name);
                    existing.wallet_address.clone_from(&wallet_address);
                    existing.cycle_interval_ms = cycle_interval_ms;
                    existing.callback_url.clone_from(&callback_url);
                    existing.strategy_label.clone_from(&strategy_label);
                },
                WriteMode::Settle,
            )
            .await
            .ok_or_else(|| {
                RegistryError::Store(StoreError::Protocol(format!(
                    "agent record {key} could not be written"
                )))
            })?;
        info!(agent_key = %key, status = agent.status.as_str(), "agent registered");
        Ok(agent)
    }

    pub async fn get(&self, agent_key: &str) -> Option<Agent> {
        self.agents.read().await.get(agent_key).cloned()
    }

    /// Bookkeeping write against the current record. `status` and the
    /// schedule entry are left as they are.
    pub async fn update<F>(&self, agent_key: &str, mutate: F) -> Option<Agent>
    where
        F: FnMut(&mut Agent),
    {
        self.write(agent_key, None, mutate, WriteMode::Bookkeeping)
            .await
    }

    /// Like [`update`](Self::update), then re-indexes the key from the
    /// written record.
    pub async fn settle<F>(&self, agent_key: &str, mutate: F) -> Option<Agent>
    where
        F: FnMut(&mut Agent),
    {
        self.write(agent_key, None, mutate, WriteMode::Settle).await
    }

    /// Status-changing write; the schedule entry follows the new status.
    pub async fn transition<F>(&self, agent_key: &str, mutate: F) -> Option<Agent>
    where
        F: FnMut(&mut Agent),
    {
        self.write(agent_key, None, mutate, WriteMode::Transition)
            .await
    }

    /// Drops the agent and its schedule entry.
    pub async fn remove(&self, agent_key: &str) -> Option<Agent> {
        let removed = self.agents.write().await.remove(agent_key);
        if let Some(store) = &self.store {
            if let Err(error) = store.delete_agent(agent_key).await {
                self.metrics.record_store_error("delete_agent");
                warn!(agent_key, error = %error, "agent delete not mirrored");
            }
        }
        if removed.is_some() {
            info!(agent_key, "agent removed");
        }
        removed
    }

    /// Every agent for admins, otherwise only `user_id`'s. Sorted by key.
    ///
    /// Shared mode lists the shared hash so agents registered through other
    /// instances show up; the local map answers while the store is down.
    pub async fn list(&self, user_id: Option<&str>) -> Vec<Agent> {
        let mut listed = match self.shared_agents().await {
            Some(agents) => agents,
            None => self.agents.read().await.values().cloned().collect(),
        };
        listed.retain(|agent| user_id.is_none_or(|user_id| agent.user_id == user_id));
        listed.sort_by_key(Agent::key);
        listed
    }

    pub async fn count(&self) -> usize {
        match self.shared_agents().await {
            Some(agents) => agents.len(),
            None => self.agents.read().await.len(),
        }
    }

    /// Reads the shared record and refreshes the local copy. A record that is
    /// gone from the store is dropped locally; a malformed one is ignored.
    pub async fn hydrate(&self, agent_key: &str) -> Result<Option<Agent>, StoreError> {
        let Some(store) = &self.store else {
            return Ok(self.get(agent_key).await);
        };
        let raw = store
            .get_agent(agent_key)
            .await
            .inspect_err(|_| self.metrics.record_store_error("get_agent"))?;
        let mut agents = self.agents.write().await;
        let Some(raw) = raw else {
            agents.remove(agent_key);
            return Ok(None);
        };
        match Agent::from_store_json(&raw) {
            Ok(agent) => {
                agents.insert(agent_key.to_string(), agent.clone());
                Ok(Some(agent))
            }
            Err(error) => {
                warn!(agent_key, error = %error, "rejecting malformed agent record");
                Ok(None)
            }
        }
    }

    /// Loads every well-formed shared record into the local map.
    pub async fn warm_from_store(&self) -> Result<usize, StoreError> {
        let Some(records) = self.read_shared().await? else {
            return Ok(0);
        };
        let loaded = records.len();
        let mut agents = self.agents.write().await;
        for agent in records {
            agents.insert(agent.key(), agent);
        }
        Ok(loaded)
    }

    async fn shared_agents(&self) -> Option<Vec<Agent>> {
        match self.read_shared().await {
            Ok(agents) => agents,
            Err(error) => {
                warn!(error = %error, "agent hash unreadable; answering from the local map");
                None
            }
        }
    }

    /// Well-formed records of the shared hash; `None` without a store.
    async fn read_shared(&self) -> Result<Option<Vec<Agent>>, StoreError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let records = store
            .list_agents()
            .await
            .inspect_err(|_| self.metrics.record_store_error("list_agents"))?;
        let mut agents = Vec::with_capacity(records.len());
        for (key, raw) in records {
            match Agent::from_store_json(&raw) {
                Ok(agent) if agent.key() == key => agents.push(agent),
                Ok(_) => warn!(agent_key = %key, "agent record key mismatch; skipped"),
                Err(error) => {
                    warn!(agent_key = %key, error = %error, "malformed agent record skipped");
                }
            }
        }
        Ok(Some(agents))
    }

    /// Applies `mutate` to the stored record and swaps the result in only if
    /// nobody wrote in between, retrying on contention. `create` is written
    /// when no usable record exists; without it a missing record is a no-op.
    async fn write<F>(
        &self,
        agent_key: &str,
        create: Option<&Agent>,
        mut mutate: F,
        mode: WriteMode,
    ) -> Option<Agent>
    where
        F: FnMut(&mut Agent),
    {
        let now = self.clock.now_ms();
        let Some(store) = &self.store else {
            return self
                .write_local(agent_key, create, &mut mutate, mode, now)
                .await;
        };

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let stored = match store.get_agent(agent_key).await {
                Ok(stored) => stored,
                Err(error) => {
                    self.metrics.record_store_error("get_agent");
                    warn!(agent_key, error = %error, "agent record unreadable; local write");
                    return self
                        .write_local(agent_key, create, &mut mutate, mode, now)
                        .await;
                }
            };
            let current = match stored.as_deref().map(Agent::from_store_json) {
                Some(Ok(current)) => Some(current),
                Some(Err(error)) => {
                    warn!(agent_key, error = %error, "rejecting malformed agent record");
                    None
                }
                None => None,
            };
            let next = match (current, create) {
                (Some(current), _) => apply(current, &mut mutate, mode, now),
                (None, Some(fresh)) => fresh.clone(),
                (None, None) => {
                    self.agents.write().await.remove(agent_key);
                    return None;
                }
            };
            let record = match next.to_store_json() {
                Ok(record) => record,
                Err(error) => {
                    warn!(agent_key, error = %error, "agent record encode failed");
                    return None;
                }
            };

            match store
                .swap_agent(agent_key, stored.as_deref(), &record, mode.index_for(&next))
                .await
            {
                Ok(true) => {
                    self.agents
                        .write()
                        .await
                        .insert(agent_key.to_string(), next.clone());
                    return Some(next);
                }
                Ok(false) => debug!(agent_key, "agent record changed underneath; retrying"),
                Err(error) => {
                    self.metrics.record_store_error("swap_agent");
                    warn!(agent_key, error = %error, "agent record not swapped; local write");
                    return self
                        .write_local(agent_key, create, &mut mutate, mode, now)
                        .await;
                }
            }
        }

        self.metrics.record_store_error("swap_agent");
        warn!(
            agent_key,
            attempts = MAX_SWAP_ATTEMPTS,
            "agent record kept changing; write abandoned"
        );
        None
    }

    async fn write_local<F>(
        &self,
        agent_key: &str,
        create: Option<&Agent>,
        mutate: &mut F,
        mode: WriteMode,
        now: u64,
    ) -> Option<Agent>
    where
        F: FnMut(&mut Agent),
    {
        let mut agents = self.agents.write().await;
        let next = match agents.get(agent_key) {
            Some(current) => apply(current.clone(), mutate, mode, now),
            None => create?.clone(),
        };
        agents.insert(agent_key.to_string(), next.clone());
        Some(next)
    }
}

/// How a registry write treats `status` and the schedule entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteMode {
    Bookkeeping,
    Settle,
    Transition,
}

impl WriteMode {
    fn index_for(self, agent: &Agent) -> IndexWrite {
        match self {
            Self::Bookkeeping => IndexWrite::Keep,
            Self::Settle | Self::Transition if agent.status == AgentStatus::Running => {
                IndexWrite::Upsert(agent.next_run_at)
            }
            Self::Settle | Self::Transition => IndexWrite::Remove,
        }
    }
}

fn apply<F>(mut agent: Agent, mutate: &mut F, mode: WriteMode, now: u64) -> Agent
where
    F: FnMut(&mut Agent),
{
    let status = agent.status;
    mutate(&mut agent);
    if mode != WriteMode::Transition {
        agent.status = status;
    }
    agent.updated_at = now;
    agent
}

fn validated_wallet(raw: &str) -> Result<String, RegistryError> {
    let wallet = raw.trim();
    let valid = WALLET_PREFIXES.iter().any(|prefix| {
        wallet
            .strip_prefix(prefix)
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()))
    });
    if !valid {
        return Err(RegistryError::Validation(
            "walletAddress must start with kaspa: or kaspatest:".to_string(),
        ));
    }
    Ok(wallet.to_string())
}

fn validated_callback_url(raw: Option<&str>) -> Result<Option<String>, RegistryError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    let parsed = Url::parse(raw)
        .map_err(|error| RegistryError::Validation(format!("callbackUrl is invalid: {error}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RegistryError::Validation(
            "callbackUrl must use http or https".to_string(),
        ));
    }
    Ok(Some(raw.to_string()))
}
