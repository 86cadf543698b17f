use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{Semaphore, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    callback::CallbackDispatcher,
    clock::{Clock, SystemClock},
    config::Config,
    dispatch::{CycleDispatcher, DispatchContext, DispatchOutcome, IdempotencyGuard},
    error::SchedulerErrorCode,
    leader::{LeaderElection, LeaderSnapshot},
    market::{HttpMarketUpstream, MarketCache, MarketCacheStats, MarketError, MarketUpstream},
    metrics::{GaugeSample, SchedulerMetrics},
    queue::{ClaimOutcome, ExecutionQueue, QueueError},
    registry::{AgentRegistry, IntervalPolicy, RegistryError},
    schedule::ScheduleIndex,
    store::{CoordinationStore, QueueDepth, RedisCoordinationStore, StoreKeys},
    types::{
        Agent, AgentDefinition, AgentStatus, ControlAction, ExecutionTask, LastDispatch,
        MarketSnapshot, agent_key,
    },
};

const QUEUE_FULL_ERROR: &str = "queue_full";
const REQUEUE_BATCH: usize = 100;
const PUMP_IDLE_MIN_MS: u64 = 25;
const PUMP_ERROR_MAX_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Market(#[from] MarketError),
    #[error("http client could not be built: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl SchedulerError {
    #[must_use]
    pub fn code(&self) -> SchedulerErrorCode {
        match self {
            Self::Registry(error) => error.code(),
            Self::Queue(error) => error.code(),
            Self::Market(error) => error.code(),
            Self::HttpClient(_) => SchedulerErrorCode::Internal,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TickRole {
    /// No shared store: this instance schedules everything it knows about.
    Local,
    Leader,
    Follower,
}

impl TickRole {
    fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Leader => "leader",
            Self::Follower => "follower",
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub role: TickRole,
    pub fence_token: u64,
    pub due: usize,
    pub enqueued: usize,
    pub queue_full: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl TickReport {
    fn new(role: TickRole, fence_token: u64) -> Self {
        Self {
            role,
            fence_token,
            due: 0,
            enqueued: 0,
            queue_full: 0,
            skipped: 0,
            errors: 0,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub processed: usize,
    pub delivered: usize,
    pub deduped: usize,
    pub failed: usize,
    pub discarded: usize,
    pub invalid: usize,
}

impl DrainReport {
    fn absorb(&mut self, result: TaskResult) {
        self.processed += 1;
        match result {
            TaskResult::Dispatched(outcome) => match outcome {
                DispatchOutcome::Deduped => self.deduped += 1,
                DispatchOutcome::Failed { .. } => self.failed += 1,
                DispatchOutcome::Delivered { .. } | DispatchOutcome::NoCallback => {
                    self.delivered += 1;
                }
            },
            TaskResult::Discarded => self.discarded += 1,
            TaskResult::Invalid => self.invalid += 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskResult {
    Dispatched(DispatchOutcome),
    /// Agent gone or not running when the task came up.
    Discarded,
    Invalid,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlReport {
    pub agent_key: String,
    pub action: ControlAction,
    pub agent: Option<Agent>,
    pub purged_tasks: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub mode: &'static str,
    pub backend: &'static str,
    pub depth: Option<QueueDepth>,
    pub max_depth: usize,
    pub concurrency: usize,
    pub tick_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub instance_id: String,
    pub scheduler_id: String,
    pub agents: usize,
    pub queue: QueueStatus,
    pub leader: Option<LeaderSnapshot>,
    pub cache: MarketCacheStats,
    pub uptime_seconds: u64,
}

/// Owns every scheduling component of one instance.
///
/// With a shared store the instance takes part in leader election, schedules
/// through the shared index and works the shared queue. Without one it runs
/// a self-contained local queue over its own registry.
pub struct Scheduler {
    config: Config,
    clock: Arc<dyn Clock>,
    metrics: SchedulerMetrics,
    store: Option<Arc<dyn CoordinationStore>>,
    keys: StoreKeys,
    registry: AgentRegistry,
    schedule: Option<ScheduleIndex>,
    leader: Option<LeaderElection>,
    queue: ExecutionQueue,
    market: Arc<MarketCache>,
    dispatcher: CycleDispatcher,
    workers: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    started_at_ms: u64,
}

impl Scheduler {
    pub fn new(
        config: Config,
        store: Option<Arc<dyn CoordinationStore>>,
        upstream: Arc<dyn MarketUpstream>,
        clock: Arc<dyn Clock>,
        metrics: SchedulerMetrics,
    ) -> Result<Self, SchedulerError> {
        let keys = store
            .as_ref()
            .map(|store| store.keys().clone())
            .unwrap_or_else(|| StoreKeys::new(config.store.key_prefix.clone()));
        let scheduling = &config.scheduling;
        let registry = AgentRegistry::new(
            store.clone(),
            clock.clone(),
            metrics.clone(),
            IntervalPolicy {
                min_ms: scheduling.min_cycle_interval_ms,
                default_ms: scheduling.default_cycle_interval_ms,
            },
        );
        let (schedule, leader, queue) = match &store {
            Some(store) => (
                Some(ScheduleIndex::new(store.clone(), metrics.clone())),
                Some(LeaderElection::new(
                    store.clone(),
                    clock.clone(),
                    metrics.clone(),
                    config.instance_id.clone(),
                    config.leader.clone(),
                )),
                ExecutionQueue::shared(
                    store.clone(),
                    clock.clone(),
                    metrics.clone(),
                    config.instance_id.clone(),
                    scheduling.max_queue_depth,
                    scheduling.exec_lease_ttl_ms,
                ),
            ),
            None => (
                None,
                None,
                ExecutionQueue::local(
                    clock.clone(),
                    metrics.clone(),
                    config.instance_id.clone(),
                    scheduling.max_queue_depth,
                ),
            ),
        };
        let market = Arc::new(MarketCache::new(
            upstream,
            clock.clone(),
            metrics.clone(),
            config.cache.clone(),
        ));
        let dispatcher = CycleDispatcher::new(
            registry.clone(),
            market.clone(),
            CallbackDispatcher::new(config.callbacks.timeout_ms, metrics.clone())?,
            IdempotencyGuard::new(
                store.clone(),
                clock.clone(),
                metrics.clone(),
                config.callbacks.dedupe_ttl_ms,
            ),
            clock.clone(),
            metrics.clone(),
            config.scheduler_id.clone(),
            config.instance_id.clone(),
            scheduling.retry_delay_ms,
        );
        let (shutdown, _) = watch::channel(false);
        let started_at_ms = clock.now_ms();
        Ok(Self {
            workers: Arc::new(Semaphore::new(scheduling.cycle_concurrency.max(1))),
            config,
            clock,
            metrics,
            store,
            keys,
            registry,
            schedule,
            leader,
            queue,
            market,
            dispatcher,
            shutdown,
            started_at_ms,
        })
    }

    /// Production wiring: Redis when configured and reachable, otherwise the
    /// single-instance local queue.
    pub async fn connect(config: Config) -> Result<Arc<Self>, SchedulerError> {
        let keys = StoreKeys::new(config.store.key_prefix.clone());
        let store: Option<Arc<dyn CoordinationStore>> = match &config.store.redis_url {
            Some(url) => {
                match RedisCoordinationStore::connect(url, keys, config.store.op_timeout_ms).await
                {
                    Ok(store) => {
                        info!(instance_id = %config.instance_id, "connected to shared backing store");
                        Some(Arc::new(store))
                    }
                    Err(error) => {
                        warn!(
                            instance_id = %config.instance_id,
                            error = %error,
                            "backing store unavailable at boot; running with local queue"
                        );
                        None
                    }
                }
            }
            None => None,
        };
        let upstream = Arc::new(HttpMarketUpstream::new(
            &config.upstream.api_base,
            config.upstream.timeout_ms,
        )?);
        Ok(Arc::new(Self::new(
            config,
            store,
            upstream,
            SystemClock::shared(),
            SchedulerMetrics::new(),
        )?))
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    #[must_use]
    pub fn store(&self) -> Option<Arc<dyn CoordinationStore>> {
        self.store.clone()
    }

    #[must_use]
    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.store.is_some()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader.as_ref().is_some_and(LeaderElection::is_leader)
    }

    #[must_use]
    pub fn fence_token(&self) -> u64 {
        self.leader.as_ref().map_or(0, LeaderElection::fence_token)
    }

    pub async fn register(
        &self,
        owner_id: &str,
        definition: AgentDefinition,
    ) -> Result<Agent, SchedulerError> {
        Ok(self.registry.register(owner_id, definition).await?)
    }

    pub async fn control(
        &self,
        owner_id: &str,
        agent_id: &str,
        action: ControlAction,
    ) -> Result<ControlReport, SchedulerError> {
        let key = agent_key(owner_id, agent_id.trim());
        if self.lookup(&key).await.is_none() {
            return Err(RegistryError::NotFound(key).into());
        }
        let now = self.clock.now_ms();

        let report = match action {
            ControlAction::Pause => {
                let agent = self
                    .registry
                    .transition(&key, |agent| {
                        agent.status = AgentStatus::Paused;
                        agent.queue_pending = false;
                        agent.queued_at = None;
                    })
                    .await;
                ControlReport {
                    agent_key: key,
                    action,
                    agent,
                    purged_tasks: 0,
                }
            }
            ControlAction::Resume => {
                let agent = self
                    .registry
                    .transition(&key, |agent| {
                        agent.status = AgentStatus::Running;
                        agent.next_run_at = now;
                        agent.queue_pending = false;
                        agent.queued_at = None;
                    })
                    .await;
                ControlReport {
                    agent_key: key,
                    action,
                    agent,
                    purged_tasks: 0,
                }
            }
            ControlAction::Remove => {
                let purged = self.queue.purge_agent(&key).await?;
                self.registry.remove(&key).await;
                if let Some(schedule) = &self.schedule {
                    schedule.release(&key).await;
                }
                ControlReport {
                    agent_key: key,
                    action,
                    agent: None,
                    purged_tasks: purged.len(),
                }
            }
        };
        info!(
            agent_key = %report.agent_key,
            action = action.as_str(),
            purged_tasks = report.purged_tasks,
            "agent control applied"
        );
        Ok(report)
    }

    pub async fn list(&self, owner_filter: Option<&str>) -> Vec<Agent> {
        self.registry.list(owner_filter).await
    }

    pub async fn get(&self, agent_key: &str) -> Option<Agent> {
        self.registry.get(agent_key).await
    }

    pub async fn market_snapshot(&self, address: &str) -> Result<MarketSnapshot, SchedulerError> {
        Ok(self.market.snapshot(address).await?)
    }

    /// One scheduling pass. Followers do nothing; the leader (or a local
    /// instance) enqueues one task per due agent.
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now_ms();
        let report = match (&self.leader, &self.schedule) {
            (Some(leader), Some(schedule)) => {
                if !leader.acquire_or_renew().await {
                    TickReport::new(TickRole::Follower, 0)
                } else {
                    let fence = leader.fence_token();
                    let mut report = TickReport::new(TickRole::Leader, fence);
                    let due = schedule
                        .claim_due(
                            now,
                            self.config.scheduling.due_scan_limit,
                            &self.config.instance_id,
                            self.config.scheduling.job_lease_ttl_ms,
                        )
                        .await;
                    report.due = due.len();
                    for key in due {
                        self.enqueue_shared(schedule, &key, fence, now, &mut report)
                            .await;
                    }
                    report
                }
            }
            _ => self.tick_local(now).await,
        };
        self.metrics.record_tick(report.role.as_str());
        if report.due > 0 {
            debug!(
                role = report.role.as_str(),
                fence_token = report.fence_token,
                due = report.due,
                enqueued = report.enqueued,
                queue_full = report.queue_full,
                "scheduler tick"
            );
        }
        report
    }

    async fn tick_local(&self, now: u64) -> TickReport {
        let mut report = TickReport::new(TickRole::Local, 0);
        let due = self
            .registry
            .list(None)
            .await
            .into_iter()
            .filter(|agent| agent.is_due(now) && !agent.queue_pending)
            .take(self.config.scheduling.due_scan_limit)
            .collect::<Vec<_>>();
        report.due = due.len();
        for agent in due {
            let key = agent.key();
            let task =
                ExecutionTask::agent_cycle(key.clone(), now, 0, self.config.instance_id.clone());
            match self.queue.enqueue(&task).await {
                Ok(_) => {
                    self.mark_queued(&key, now).await;
                    report.enqueued += 1;
                }
                Err(QueueError::Full { .. }) => {
                    self.defer_queue_full(&key, now).await;
                    report.queue_full += 1;
                }
                Err(error) => {
                    warn!(agent_key = %key, error = %error, "enqueue failed");
                    report.errors += 1;
                }
            }
        }
        report
    }

    async fn enqueue_shared(
        &self,
        schedule: &ScheduleIndex,
        key: &str,
        fence: u64,
        now: u64,
        report: &mut TickReport,
    ) {
        let Some(agent) = self.lookup(key).await else {
            schedule.remove(key).await;
            schedule.release(key).await;
            report.skipped += 1;
            return;
        };
        if agent.status != AgentStatus::Running {
            schedule.remove(key).await;
            schedule.release(key).await;
            report.skipped += 1;
            return;
        }
        // A pending flag older than an execution lease belongs to a task that
        // was lost; schedule the agent again.
        let queued_at = agent.queued_at.unwrap_or(agent.updated_at);
        let pending_fresh =
            now.saturating_sub(queued_at) < self.config.scheduling.exec_lease_ttl_ms;
        if agent.queue_pending && pending_fresh {
            report.skipped += 1;
            return;
        }

        let task = ExecutionTask::agent_cycle(
            key.to_string(),
            now,
            fence,
            self.config.instance_id.clone(),
        );
        match self.queue.enqueue(&task).await {
            Ok(_) => {
                self.mark_queued(key, now).await;
                report.enqueued += 1;
            }
            Err(QueueError::Full { .. }) => {
                self.defer_queue_full(key, now).await;
                schedule.release(key).await;
                report.queue_full += 1;
            }
            Err(error) => {
                warn!(agent_key = key, fence_token = fence, error = %error, "enqueue failed");
                schedule.release(key).await;
                report.errors += 1;
            }
        }
    }

    async fn mark_queued(&self, key: &str, now: u64) {
        self.registry
            .update(key, |agent| {
                agent.queue_pending = true;
                agent.queued_at = Some(now);
            })
            .await;
    }

    /// Counts a refused enqueue as a failed cycle and retries after the
    /// short retry delay.
    async fn defer_queue_full(&self, key: &str, now: u64) {
        let retry_delay_ms = self.config.scheduling.retry_delay_ms;
        self.registry
            .settle(key, |agent| {
                agent.failure_count += 1;
                agent.next_run_at =
                    now.saturating_add(agent.cycle_interval_ms.min(retry_delay_ms));
                agent.queue_pending = false;
                agent.queued_at = None;
                agent.last_dispatch = Some(LastDispatch {
                    ok: false,
                    at: now,
                    error: Some(QUEUE_FULL_ERROR.to_string()),
                    task_id: None,
                    callback_status: None,
                    deduped: false,
                });
            })
            .await;
    }

    /// Shared record first; the local copy when the store cannot answer.
    async fn lookup(&self, key: &str) -> Option<Agent> {
        match self.registry.hydrate(key).await {
            Ok(agent) => agent,
            Err(error) => {
                warn!(agent_key = key, error = %error, "agent hydrate failed; using local copy");
                self.registry.get(key).await
            }
        }
    }

    pub async fn requeue_expired(&self) -> usize {
        match self.queue.requeue_expired(REQUEUE_BATCH).await {
            Ok(report) => {
                for task_id in &report.requeued {
                    info!(task_id = %task_id, "execution task requeued after lease expiry");
                }
                for task_id in &report.dropped {
                    warn!(task_id = %task_id, "expired execution task dropped; payload missing");
                }
                report.requeued.len()
            }
            Err(error) => {
                warn!(error = %error, "requeue of expired tasks failed");
                0
            }
        }
    }

    /// Claims one task and runs it. `None` when the queue is empty.
    pub async fn work_one(&self) -> Result<Option<TaskResult>, QueueError> {
        let Some(claimed) = self.queue.claim().await? else {
            return Ok(None);
        };
        Ok(Some(self.process_claim(claimed).await))
    }

    /// Works the queue until it is empty, `CYCLE_CONCURRENCY` tasks at a time.
    pub async fn drain_queue(&self) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            let mut batch = Vec::new();
            for _ in 0..self.config.scheduling.cycle_concurrency.max(1) {
                match self.queue.claim().await {
                    Ok(Some(claimed)) => batch.push(claimed),
                    Ok(None) => break,
                    Err(error) => {
                        warn!(error = %error, "queue claim failed during drain");
                        break;
                    }
                }
            }
            if batch.is_empty() {
                return report;
            }
            let results =
                join_all(batch.into_iter().map(|claimed| self.process_claim(claimed))).await;
            for result in results {
                report.absorb(result);
            }
        }
    }

    async fn process_claim(&self, claimed: ClaimOutcome) -> TaskResult {
        match claimed {
            ClaimOutcome::Task(task) => self.process_task(&task).await,
            ClaimOutcome::Invalid { task_id, reason } => {
                self.metrics.record_invalid_task();
                warn!(
                    task_id = %task_id,
                    reason = %reason,
                    code = SchedulerErrorCode::InvalidExecutionTask.as_str(),
                    "dropping invalid execution task"
                );
                self.ack(&task_id).await;
                TaskResult::Invalid
            }
        }
    }

    /// Runs one claimed task. The task is acked and the agent's due slot
    /// released whatever the dispatch outcome.
    pub async fn process_task(&self, task: &ExecutionTask) -> TaskResult {
        let key = task.queue_key.as_str();
        let agent = self.lookup(key).await;
        let result = match agent {
            Some(agent) if agent.status == AgentStatus::Running => {
                let outcome = self
                    .dispatcher
                    .dispatch(
                        &agent,
                        DispatchContext {
                            fence_token: task.leader_fence_token,
                            queue_task_id: Some(task.id.as_str()),
                        },
                    )
                    .await;
                TaskResult::Dispatched(outcome)
            }
            Some(_) | None => {
                debug!(
                    agent_key = key,
                    task_id = %task.id,
                    "agent missing or not running; task discarded"
                );
                TaskResult::Discarded
            }
        };

        self.registry
            .settle(key, |agent| {
                agent.queue_pending = false;
                agent.queued_at = None;
            })
            .await;
        if let Some(schedule) = &self.schedule {
            schedule.release(key).await;
        }
        self.ack(&task.id).await;
        result
    }

    async fn ack(&self, task_id: &str) {
        if let Err(error) = self.queue.ack(task_id).await {
            warn!(task_id, error = %error, "execution task ack failed");
        }
    }

    /// Loads shared agents and recovers tasks orphaned by a previous crash.
    pub async fn boot(&self) {
        if !self.is_shared() {
            return;
        }
        match self.registry.warm_from_store().await {
            Ok(loaded) => info!(loaded, "agent registry warmed from backing store"),
            Err(error) => warn!(error = %error, "agent registry warm-up failed"),
        }
        self.requeue_expired().await;
    }

    /// Spawns the tick loop and the worker pump.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().run_tick_loop()),
            tokio::spawn(self.clone().run_worker_pump()),
        ]
    }

    async fn run_tick_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.scheduling.tick_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.requeue_expired().await;
            self.tick().await;
        }
        debug!(instance_id = %self.config.instance_id, "tick loop stopped");
    }

    /// Claims while worker permits are free. An empty queue or a failing
    /// store backs the pump off exponentially.
    async fn run_worker_pump(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let idle_max_ms = self.config.scheduling.tick_ms.max(PUMP_IDLE_MIN_MS);
        let mut idle_ms = PUMP_IDLE_MIN_MS;
        let mut error_ms = self
            .config
            .scheduling
            .retry_delay_ms
            .clamp(PUMP_IDLE_MIN_MS, PUMP_ERROR_MAX_MS);
        let error_base_ms = error_ms;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = self.workers.clone().acquire_owned() => permit,
                _ = shutdown.changed() => break,
            };
            let Ok(permit) = permit else {
                break;
            };

            let pause_ms = match self.queue.claim().await {
                Ok(Some(claimed)) => {
                    idle_ms = PUMP_IDLE_MIN_MS;
                    error_ms = error_base_ms;
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        scheduler.process_claim(claimed).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => {
                    drop(permit);
                    let pause = idle_ms;
                    idle_ms = idle_ms.saturating_mul(2).min(idle_max_ms);
                    pause
                }
                Err(error) => {
                    drop(permit);
                    warn!(error = %error, backoff_ms = error_ms, "queue claim failed; backing off");
                    let pause = error_ms;
                    error_ms = error_ms.saturating_mul(2).min(PUMP_ERROR_MAX_MS);
                    pause
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(pause_ms)) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(instance_id = %self.config.instance_id, "worker pump stopped");
    }

    /// Stops background loops and gives up leadership.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(leader) = &self.leader {
            if leader.release().await {
                info!(instance_id = %self.config.instance_id, "leadership released on shutdown");
            }
        }
    }

    pub async fn ready(&self) -> bool {
        match &self.store {
            Some(store) => store.ping().await.is_ok(),
            None => true,
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        let depth = self.queue.depth().await.ok();
        let leader = match &self.leader {
            Some(leader) => Some(leader.snapshot().await),
            None => None,
        };
        SchedulerStatus {
            instance_id: self.config.instance_id.clone(),
            scheduler_id: self.config.scheduler_id.clone(),
            agents: self.registry.count().await,
            queue: QueueStatus {
                mode: if self.queue.is_shared() { "shared" } else { "local" },
                backend: self
                    .store
                    .as_ref()
                    .map_or("memory", |store| store.backend_name()),
                depth,
                max_depth: self.queue.max_depth(),
                concurrency: self.config.scheduling.cycle_concurrency,
                tick_ms: self.config.scheduling.tick_ms,
            },
            leader,
            cache: self.market.stats(),
            uptime_seconds: self.uptime_seconds(),
        }
    }

    pub async fn gauges(&self) -> GaugeSample {
        let depth = self.queue.depth().await.unwrap_or_default();
        GaugeSample {
            queue_ready: depth.ready,
            queue_processing: depth.processing,
            queue_inflight: depth.inflight,
            leader_active: self.is_leader(),
            fence_token: self.fence_token(),
            registered_agents: self.registry.count().await,
            uptime_seconds: self.uptime_seconds(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.started_at_ms) / 1_000
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::{Scheduler, TickRole};
    use crate::{
        clock::ManualClock,
        config::Config,
        market::{MarketError, MarketUpstream},
        metrics::SchedulerMetrics,
        store::{MemoryCoordinationStore, StoreKeys},
        types::{AgentDefinition, AgentStatus, ControlAction},
    };

    struct StaticUpstream;

    #[async_trait]
    impl MarketUpstream for StaticUpstream {
        async fn price_usd(&self) -> Result<f64, MarketError> {
            Ok(0.12)
        }

        async fn blockdag(&self) -> Result<Value, MarketError> {
            Ok(json!({"virtualDaaScore": 1}))
        }

        async fn balance_sompi(&self, _address: &str) -> Result<u64, MarketError> {
            Ok(100)
        }
    }

    fn definition(id: &str) -> AgentDefinition {
        AgentDefinition {
            id: id.to_string(),
            wallet_address: "kaspa:qpagent".to_string(),
            cycle_interval_ms: Some(2_000),
            ..AgentDefinition::default()
        }
    }

    #[tokio::test]
    async fn local_tick_enqueues_each_due_agent_once() -> Result<()> {
        let clock = ManualClock::new(1_000);
        let scheduler = Scheduler::new(
            Config::default(),
            None,
            Arc::new(StaticUpstream),
            Arc::new(clock.clone()),
            SchedulerMetrics::new(),
        )?;
        scheduler.register("u", definition("a1")).await?;

        let first = scheduler.tick().await;
        assert_eq!(first.role, TickRole::Local);
        assert_eq!(first.enqueued, 1);
        assert_eq!(scheduler.tick().await.enqueued, 0);

        let drained = scheduler.drain_queue().await;
        assert_eq!(drained.delivered, 1);
        let agent = scheduler.get("u:a1").await.expect("agent");
        assert!(!agent.queue_pending);
        assert_eq!(agent.next_run_at, 3_000);
        Ok(())
    }

    #[tokio::test]
    async fn follower_tick_does_not_scan() -> Result<()> {
        let clock = ManualClock::new(1_000);
        let store = MemoryCoordinationStore::new(StoreKeys::new("t:"), Arc::new(clock.clone()));
        let build = |instance: &str| {
            let mut config = Config::default();
            config.instance_id = instance.to_string();
            Scheduler::new(
                config,
                Some(Arc::new(store.clone())),
                Arc::new(StaticUpstream),
                Arc::new(clock.clone()),
                SchedulerMetrics::new(),
            )
        };
        let leader = build("one")?;
        let follower = build("two")?;
        leader.register("u", definition("a1")).await?;

        assert_eq!(leader.tick().await.role, TickRole::Leader);
        let report = follower.tick().await;
        assert_eq!(report.role, TickRole::Follower);
        assert_eq!(report.enqueued, 0);
        Ok(())
    }

    #[tokio::test]
    async fn paused_agents_are_discarded_when_their_task_comes_up() -> Result<()> {
        let clock = ManualClock::new(1_000);
        let scheduler = Scheduler::new(
            Config::default(),
            None,
            Arc::new(StaticUpstream),
            Arc::new(clock.clone()),
            SchedulerMetrics::new(),
        )?;
        scheduler.register("u", definition("a1")).await?;
        scheduler.tick().await;
        let report = scheduler.control("u", "a1", ControlAction::Pause).await?;
        assert_eq!(
            report.agent.map(|agent| agent.status),
            Some(AgentStatus::Paused)
        );

        let drained = scheduler.drain_queue().await;
        assert_eq!(drained.discarded, 1);
        assert!(scheduler.control("u", "missing", ControlAction::Pause).await.is_err());
        Ok(())
    }
}
