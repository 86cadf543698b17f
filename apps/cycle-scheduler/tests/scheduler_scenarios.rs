mod support;

use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, header, header_exists, method, path},
};

use agent_cycle_scheduler::{
    clock::ManualClock,
    config::LeaderConfig,
    dispatch::DispatchOutcome,
    leader::LeaderElection,
    metrics::SchedulerMetrics,
    queue::{ClaimOutcome, ExecutionQueue},
    scheduler::{TaskResult, TickRole},
    store::{CoordinationStore, MemoryCoordinationStore},
    types::{Agent, AgentDefinition, AgentStatus, ControlAction, ExecutionTask},
};

use support::{
    GatedMarket, START_MS, agent, local_scheduler, memory_store, shared_scheduler,
    shared_scheduler_with_market, test_config,
};

async fn stored(store: &MemoryCoordinationStore, agent_key: &str) -> Result<Option<Agent>> {
    Ok(match store.get_agent(agent_key).await? {
        Some(raw) => Some(Agent::from_store_json(&raw)?),
        None => None,
    })
}

fn leader_config() -> LeaderConfig {
    LeaderConfig {
        lock_ttl_ms: 1_000,
        renew_interval_ms: 300,
        backoff_base_ms: 100,
        backoff_max_ms: 1_000,
    }
}

#[tokio::test]
async fn racing_instances_elect_exactly_one_leader_with_rising_fences() -> Result<()> {
    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let build = |instance: &str| {
        LeaderElection::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            SchedulerMetrics::new(),
            instance.to_string(),
            leader_config(),
        )
    };
    let first = build("one");
    let second = build("two");

    let (a, b) = tokio::join!(first.acquire_or_renew(), second.acquire_or_renew());
    assert!(a ^ b, "exactly one instance may lead");
    let (leader, follower) = if a { (&first, &second) } else { (&second, &first) };
    assert!(!follower.is_leader());
    let first_fence = leader.fence_token();
    assert!(first_fence > 0);

    assert!(leader.release().await);
    assert!(follower.acquire_or_renew().await);
    assert!(follower.fence_token() > first_fence);
    assert!(!leader.is_leader());
    Ok(())
}

#[tokio::test]
async fn concurrent_claims_never_share_a_task() -> Result<()> {
    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let queue = |worker: &str| {
        ExecutionQueue::shared(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            SchedulerMetrics::new(),
            worker.to_string(),
            10,
            5_000,
        )
    };
    let worker_a = queue("worker-a");
    let worker_b = queue("worker-b");
    let task = ExecutionTask::agent_cycle("u:a1".to_string(), START_MS, 1, "one".to_string());
    worker_a.enqueue(&task).await?;

    let (a, b) = tokio::join!(worker_a.claim(), worker_b.claim());
    let claimed = [a?, b?].into_iter().flatten().collect::<Vec<_>>();
    assert_eq!(claimed, vec![ClaimOutcome::Task(task.clone())]);
    let owner = store.exec_lease_owner(&task.id).await;
    assert!(matches!(owner.as_deref(), Some("worker-a" | "worker-b")));
    Ok(())
}

#[tokio::test]
async fn expired_leases_are_requeued_but_acked_tasks_are_not() -> Result<()> {
    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let queue = |worker: &str| {
        ExecutionQueue::shared(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            SchedulerMetrics::new(),
            worker.to_string(),
            10,
            1_000,
        )
    };
    let crashed = queue("crashed");
    let survivor = queue("survivor");
    let task = ExecutionTask::agent_cycle("u:a1".to_string(), START_MS, 1, "one".to_string());
    crashed.enqueue(&task).await?;
    assert!(crashed.claim().await?.is_some());

    assert!(survivor.requeue_expired(10).await?.requeued.is_empty());
    clock.advance(1_001);
    assert_eq!(survivor.requeue_expired(10).await?.requeued, vec![task.id.clone()]);

    let reclaimed = survivor.claim().await?;
    assert_eq!(reclaimed, Some(ClaimOutcome::Task(task.clone())));
    survivor.ack(&task.id).await?;

    clock.advance(5_000);
    assert!(survivor.requeue_expired(10).await?.requeued.is_empty());
    assert!(survivor.claim().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn redelivered_task_reaches_the_callback_once() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .and(header("X-Fence-Token", "7"))
        .and(header_exists("X-Idempotency-Key"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let scheduler = shared_scheduler(test_config("one"), &store, &clock)?;
    let registered = scheduler
        .register("u", agent("a1", Some(format!("{}/cb", server.uri()))))
        .await?;

    let task = ExecutionTask::agent_cycle(registered.key(), START_MS, 7, "one".to_string());
    let first = scheduler.process_task(&task).await;
    assert!(matches!(
        first,
        TaskResult::Dispatched(DispatchOutcome::Delivered { status: 200 })
    ));

    clock.advance(10);
    let second = scheduler.process_task(&task).await;
    assert_eq!(second, TaskResult::Dispatched(DispatchOutcome::Deduped));
    assert_eq!(scheduler.metrics().snapshot().callbacks("deduped"), 1);
    Ok(())
}

#[tokio::test]
async fn scenario_a_registered_agent_is_dispatched_once_per_tick() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .and(body_partial_json(json!({
            "event": "agent_cycle",
            "agent": {"id": "a1", "cycleIntervalMs": 2000},
            "market": {"priceUsd": 0.125, "balanceSompi": 5_000_000},
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let clock = ManualClock::new(START_MS);
    let scheduler = local_scheduler(test_config("one"), &clock)?;
    let registered = scheduler
        .register("u", agent("a1", Some(format!("{}/cb", server.uri()))))
        .await?;
    assert_eq!(registered.next_run_at, START_MS);

    let tick = scheduler.tick().await;
    assert_eq!(tick.role, TickRole::Local);
    assert_eq!(tick.enqueued, 1);
    let drained = scheduler.drain_queue().await;
    assert_eq!(drained.delivered, 1);

    let after = scheduler
        .get(&registered.key())
        .await
        .ok_or_else(|| anyhow!("agent vanished"))?;
    let last_cycle_at = after.last_cycle_at.ok_or_else(|| anyhow!("no cycle recorded"))?;
    assert_eq!(after.next_run_at, last_cycle_at + 2_000);
    assert_eq!(after.failure_count, 0);
    assert!(after.last_dispatch.is_some_and(|dispatch| dispatch.ok));

    // Not due again until the interval passes.
    assert_eq!(scheduler.tick().await.enqueued, 0);
    Ok(())
}

#[tokio::test]
async fn scenario_b_pause_unindexes_and_resume_reindexes_now() -> Result<()> {
    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let scheduler = shared_scheduler(test_config("one"), &store, &clock)?;
    let registered = scheduler.register("u", agent("a1", None)).await?;
    let key = registered.key();
    assert_eq!(store.schedule_score(&key).await, Some(START_MS));

    let paused = scheduler.control("u", "a1", ControlAction::Pause).await?;
    assert_eq!(paused.agent.map(|agent| agent.status), Some(AgentStatus::Paused));
    assert_eq!(store.schedule_score(&key).await, None);

    clock.advance(10_000);
    let tick = scheduler.tick().await;
    assert_eq!(tick.role, TickRole::Leader);
    assert_eq!(tick.enqueued, 0);

    scheduler.control("u", "a1", ControlAction::Resume).await?;
    assert_eq!(store.schedule_score(&key).await, Some(START_MS + 10_000));
    assert_eq!(scheduler.tick().await.enqueued, 1);
    Ok(())
}

#[tokio::test]
async fn scenario_c_remove_purges_queued_tasks() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let scheduler = shared_scheduler(test_config("one"), &store, &clock)?;
    scheduler
        .register("u", agent("a1", Some(format!("{}/cb", server.uri()))))
        .await?;
    assert_eq!(scheduler.tick().await.enqueued, 1);

    let removed = scheduler.control("u", "a1", ControlAction::Remove).await?;
    assert_eq!(removed.purged_tasks, 1);
    assert!(scheduler.get("u:a1").await.is_none());

    let drained = scheduler.drain_queue().await;
    assert_eq!(drained.processed, 0);
    assert_eq!(scheduler.list(None).await.len(), 0);
    Ok(())
}

#[tokio::test]
async fn scenario_d_full_queue_counts_a_failure_and_retries_soon() -> Result<()> {
    let clock = ManualClock::new(START_MS);
    let mut config = test_config("one");
    config.scheduling.max_queue_depth = 1;
    let scheduler = local_scheduler(config, &clock)?;
    scheduler.register("u", agent("a1", None)).await?;
    scheduler.register("u", agent("a2", None)).await?;

    let tick = scheduler.tick().await;
    assert_eq!(tick.enqueued, 1);
    assert_eq!(tick.queue_full, 1);

    let refused = scheduler
        .get("u:a2")
        .await
        .ok_or_else(|| anyhow!("agent vanished"))?;
    assert_eq!(refused.failure_count, 1);
    assert_eq!(refused.next_run_at, START_MS + 500);
    assert!(!refused.queue_pending);
    let last = refused
        .last_dispatch
        .ok_or_else(|| anyhow!("no dispatch recorded"))?;
    assert!(!last.ok);
    assert_eq!(last.error.as_deref(), Some("queue_full"));
    assert_eq!(scheduler.metrics().snapshot().queue_full_total, 1);
    Ok(())
}

#[tokio::test]
async fn one_failing_callback_does_not_block_other_agents() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/healthy"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let clock = ManualClock::new(START_MS);
    let scheduler = local_scheduler(test_config("one"), &clock)?;
    scheduler
        .register("u", agent("a1", Some(format!("{}/broken", server.uri()))))
        .await?;
    scheduler
        .register("u", agent("a2", Some(format!("{}/healthy", server.uri()))))
        .await?;

    scheduler.tick().await;
    let drained = scheduler.drain_queue().await;
    assert_eq!(drained.failed, 1);
    assert_eq!(drained.delivered, 1);

    let broken = scheduler
        .get("u:a1")
        .await
        .ok_or_else(|| anyhow!("agent vanished"))?;
    assert_eq!(broken.failure_count, 1);
    assert_eq!(broken.next_run_at, START_MS + 500);
    assert_eq!(
        broken.last_dispatch.and_then(|dispatch| dispatch.error).as_deref(),
        Some("callback_status_500")
    );
    Ok(())
}

#[tokio::test]
async fn store_outage_degrades_without_panicking() -> Result<()> {
    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let scheduler = shared_scheduler(test_config("one"), &store, &clock)?;
    scheduler.register("u", agent("a1", None)).await?;

    store.set_available(false);
    let tick = scheduler.tick().await;
    assert_eq!(tick.role, TickRole::Follower);
    assert!(!scheduler.ready().await);
    assert!(scheduler.work_one().await.is_err());
    assert!(scheduler.metrics().snapshot().store_errors.contains_key("leader_acquire"));

    store.set_available(true);
    clock.advance(5_000);
    assert_eq!(scheduler.tick().await.role, TickRole::Leader);
    assert!(scheduler.ready().await);
    Ok(())
}

#[tokio::test]
async fn scenario_d_shared_full_queue_defers_and_frees_the_due_slot() -> Result<()> {
    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let mut config = test_config("one");
    config.scheduling.max_queue_depth = 1;
    let scheduler = shared_scheduler(config, &store, &clock)?;
    scheduler.register("u", agent("a1", None)).await?;
    scheduler.register("u", agent("a2", None)).await?;

    let tick = scheduler.tick().await;
    assert_eq!(tick.role, TickRole::Leader);
    assert_eq!((tick.enqueued, tick.queue_full), (1, 1));

    let refused = stored(&store, "u:a2")
        .await?
        .ok_or_else(|| anyhow!("agent vanished"))?;
    assert_eq!(refused.failure_count, 1);
    assert_eq!(refused.next_run_at, START_MS + 500);
    assert!(!refused.queue_pending);
    assert_eq!(
        refused.last_dispatch.and_then(|dispatch| dispatch.error).as_deref(),
        Some("queue_full")
    );
    assert_eq!(store.schedule_score("u:a2").await, Some(START_MS + 500));

    assert_eq!(scheduler.drain_queue().await.processed, 1);
    clock.advance(500);
    let retry = scheduler.tick().await;
    assert_eq!((retry.enqueued, retry.queue_full), (1, 0));
    assert_eq!(scheduler.metrics().snapshot().queue_full_total, 1);
    Ok(())
}

#[tokio::test]
async fn leader_enqueues_and_another_instance_dispatches_with_its_fence() -> Result<()> {
    let server = MockServer::start().await;
    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let leader = shared_scheduler(test_config("one"), &store, &clock)?;
    let worker = shared_scheduler(test_config("two"), &store, &clock)?;
    let key = leader
        .register("u", agent("a1", Some(format!("{}/cb", server.uri()))))
        .await?
        .key();

    let tick = leader.tick().await;
    assert_eq!(tick.role, TickRole::Leader);
    assert_eq!(tick.enqueued, 1);
    assert_eq!(worker.tick().await.role, TickRole::Follower);

    Mock::given(method("POST"))
        .and(path("/cb"))
        .and(header("X-Fence-Token", tick.fence_token.to_string()))
        .and(header_exists("X-Queue-Task-Id"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let result = worker.work_one().await?;
    assert_eq!(
        result,
        Some(TaskResult::Dispatched(DispatchOutcome::Delivered { status: 200 }))
    );

    let after = stored(&store, &key)
        .await?
        .ok_or_else(|| anyhow!("agent vanished"))?;
    assert!(!after.queue_pending);
    assert_eq!(after.queued_at, None);
    let last_cycle_at = after.last_cycle_at.ok_or_else(|| anyhow!("no cycle recorded"))?;
    assert_eq!(store.schedule_score(&key).await, Some(last_cycle_at + 2_000));
    assert_eq!(store.queue_depth().await?.total(), 0);

    clock.advance(2_000);
    assert_eq!(leader.tick().await.enqueued, 1);
    Ok(())
}

#[tokio::test]
async fn pause_during_a_remote_dispatch_stays_paused() -> Result<()> {
    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let market = Arc::new(GatedMarket::default());
    let leader = shared_scheduler(test_config("one"), &store, &clock)?;
    let worker = Arc::new(shared_scheduler_with_market(
        test_config("two"),
        &store,
        &clock,
        market.clone(),
    )?);
    let key = leader.register("u", agent("a1", None)).await?.key();
    assert_eq!(leader.tick().await.enqueued, 1);

    let running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.work_one().await }
    });
    market.entered.notified().await;
    leader.control("u", "a1", ControlAction::Pause).await?;
    market.release.notify_one();
    assert_eq!(
        running.await??,
        Some(TaskResult::Dispatched(DispatchOutcome::NoCallback))
    );

    let after = stored(&store, &key)
        .await?
        .ok_or_else(|| anyhow!("agent vanished"))?;
    assert_eq!(after.status, AgentStatus::Paused);
    assert!(after.last_cycle_at.is_some());
    assert!(!after.queue_pending);
    assert_eq!(store.schedule_score(&key).await, None);

    clock.advance(10_000);
    assert_eq!(leader.tick().await.enqueued, 0);
    Ok(())
}

#[tokio::test]
async fn remove_during_a_remote_dispatch_stays_removed() -> Result<()> {
    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let market = Arc::new(GatedMarket::default());
    let leader = shared_scheduler(test_config("one"), &store, &clock)?;
    let worker = Arc::new(shared_scheduler_with_market(
        test_config("two"),
        &store,
        &clock,
        market.clone(),
    )?);
    let key = leader.register("u", agent("a1", None)).await?.key();
    assert_eq!(leader.tick().await.enqueued, 1);

    let running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.work_one().await }
    });
    market.entered.notified().await;
    let removed = leader.control("u", "a1", ControlAction::Remove).await?;
    assert_eq!(removed.purged_tasks, 0);
    market.release.notify_one();
    running.await??;

    assert_eq!(stored(&store, &key).await?, None);
    assert_eq!(store.schedule_score(&key).await, None);
    assert!(worker.get(&key).await.is_none());
    assert!(worker.list(None).await.is_empty());
    assert_eq!(leader.gauges().await.registered_agents, 0);
    Ok(())
}

#[tokio::test]
async fn every_instance_lists_agents_registered_anywhere() -> Result<()> {
    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let first = shared_scheduler(test_config("one"), &store, &clock)?;
    let second = shared_scheduler(test_config("two"), &store, &clock)?;
    first.register("alice", agent("a1", None)).await?;
    second.register("bob", agent("b1", None)).await?;

    assert_eq!(first.list(None).await.len(), 2);
    let alice = second.list(Some("alice")).await;
    assert_eq!(
        alice.iter().map(Agent::key).collect::<Vec<_>>(),
        vec!["alice:a1".to_string()]
    );
    assert_eq!(second.gauges().await.registered_agents, 2);
    Ok(())
}

#[tokio::test]
async fn re_registering_does_not_refresh_a_lost_pending_task() -> Result<()> {
    let clock = ManualClock::new(START_MS);
    let store = memory_store(&clock);
    let scheduler = shared_scheduler(test_config("one"), &store, &clock)?;
    let key = scheduler.register("u", agent("a1", None)).await?.key();
    assert_eq!(scheduler.tick().await.enqueued, 1);

    // Pending and younger than the execution lease: left alone.
    clock.advance(30_000);
    let held = scheduler.tick().await;
    assert_eq!((held.enqueued, held.skipped), (0, 1));

    clock.advance(30_000);
    let renamed = AgentDefinition {
        name: Some("renamed".to_string()),
        ..agent("a1", None)
    };
    scheduler.register("u", renamed).await?;
    assert_eq!(scheduler.tick().await.enqueued, 1);
    let after = stored(&store, &key)
        .await?
        .ok_or_else(|| anyhow!("agent vanished"))?;
    assert_eq!(after.queued_at, Some(START_MS + 60_000));
    Ok(())
}
