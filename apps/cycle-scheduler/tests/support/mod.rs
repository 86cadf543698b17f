#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use agent_cycle_scheduler::{
    clock::ManualClock,
    config::Config,
    market::{MarketError, MarketUpstream},
    metrics::SchedulerMetrics,
    scheduler::Scheduler,
    store::{CoordinationStore, MemoryCoordinationStore, StoreKeys},
    types::AgentDefinition,
};

pub const START_MS: u64 = 1_700_000_000_000;

pub struct FixedMarket;

#[async_trait]
impl MarketUpstream for FixedMarket {
    async fn price_usd(&self) -> Result<f64, MarketError> {
        Ok(0.125)
    }

    async fn blockdag(&self) -> Result<Value, MarketError> {
        Ok(json!({"virtualDaaScore": 42}))
    }

    async fn balance_sompi(&self, _address: &str) -> Result<u64, MarketError> {
        Ok(5_000_000)
    }
}

/// Holds the first price fetch until released, so a dispatch can be caught
/// mid-flight.
#[derive(Default)]
pub struct GatedMarket {
    pub entered: Notify,
    pub release: Notify,
}

#[async_trait]
impl MarketUpstream for GatedMarket {
    async fn price_usd(&self) -> Result<f64, MarketError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(0.125)
    }

    async fn blockdag(&self) -> Result<Value, MarketError> {
        FixedMarket.blockdag().await
    }

    async fn balance_sompi(&self, address: &str) -> Result<u64, MarketError> {
        FixedMarket.balance_sompi(address).await
    }
}

pub fn test_config(instance_id: &str) -> Config {
    let mut config = Config::default();
    config.instance_id = instance_id.to_string();
    config.scheduler_id = "sched-test".to_string();
    config.scheduling.min_cycle_interval_ms = 1_000;
    config.scheduling.retry_delay_ms = 500;
    config.callbacks.timeout_ms = 2_000;
    config
}

pub fn memory_store(clock: &ManualClock) -> MemoryCoordinationStore {
    MemoryCoordinationStore::new(StoreKeys::new("test:"), Arc::new(clock.clone()))
}

pub fn local_scheduler(config: Config, clock: &ManualClock) -> Result<Scheduler> {
    Ok(Scheduler::new(
        config,
        None,
        Arc::new(FixedMarket),
        Arc::new(clock.clone()),
        SchedulerMetrics::new(),
    )?)
}

pub fn shared_scheduler(
    config: Config,
    store: &MemoryCoordinationStore,
    clock: &ManualClock,
) -> Result<Scheduler> {
    shared_scheduler_with_market(config, store, clock, Arc::new(FixedMarket))
}

pub fn shared_scheduler_with_market(
    config: Config,
    store: &MemoryCoordinationStore,
    clock: &ManualClock,
    market: Arc<dyn MarketUpstream>,
) -> Result<Scheduler> {
    let store: Arc<dyn CoordinationStore> = Arc::new(store.clone());
    Ok(Scheduler::new(
        config,
        Some(store),
        market,
        Arc::new(clock.clone()),
        SchedulerMetrics::new(),
    )?)
}

pub fn agent(id: &str, callback_url: Option<String>) -> AgentDefinition {
    AgentDefinition {
        id: id.to_string(),
        wallet_address: "kaspa:qpz8agentwallet".to_string(),
        cycle_interval_ms: Some(2_000),
        callback_url,
        ..AgentDefinition::default()
    }
}
