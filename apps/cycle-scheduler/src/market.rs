use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::{
    clock::Clock, config::CacheConfig, error::SchedulerErrorCode, metrics::SchedulerMetrics,
    types::MarketSnapshot,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MarketError {
    #[error("upstream {endpoint} request failed: {message}")]
    Request {
        endpoint: &'static str,
        message: String,
    },
    #[error("upstream {endpoint} timed out")]
    Timeout { endpoint: &'static str },
    #[error("upstream {endpoint} returned status {status}")]
    Status { endpoint: &'static str, status: u16 },
    #[error("upstream {endpoint} body was not understood: {message}")]
    Decode {
        endpoint: &'static str,
        message: String,
    },
}

impl MarketError {
    #[must_use]
    pub fn code(&self) -> SchedulerErrorCode {
        SchedulerErrorCode::UpstreamUnavailable
    }

    fn from_reqwest(endpoint: &'static str, error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout { endpoint }
        } else {
            Self::Request {
                endpoint,
                message: error.to_string(),
            }
        }
    }
}

/// The three upstream reads a snapshot is made of.
#[async_trait]
pub trait MarketUpstream: Send + Sync {
    async fn price_usd(&self) -> Result<f64, MarketError>;
    async fn blockdag(&self) -> Result<Value, MarketError>;
    async fn balance_sompi(&self, address: &str) -> Result<u64, MarketError>;
}

#[derive(Clone)]
pub struct HttpMarketUpstream {
    client: reqwest::Client,
    api_base: String,
}

#[derive(Deserialize)]
struct PriceBody {
    price: f64,
}

#[derive(Deserialize)]
struct BalanceBody {
    balance: u64,
}

impl HttpMarketUpstream {
    pub fn new(api_base: &str, timeout_ms: u64) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T>(&self, endpoint: &'static str, path: &str) -> Result<T, MarketError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .get(format!("{}{path}", self.api_base))
            .send()
            .await
            .map_err(|error| MarketError::from_reqwest(endpoint, &error))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MarketError::Status {
                endpoint,
                status: status.as_u16(),
            });
        }
        response.json().await.map_err(|error| MarketError::Decode {
            endpoint,
            message: error.to_string(),
        })
    }
}

#[async_trait]
impl MarketUpstream for HttpMarketUpstream {
    async fn price_usd(&self) -> Result<f64, MarketError> {
        let body: PriceBody = self.get_json("price", "/info/price").await?;
        Ok(body.price)
    }

    async fn blockdag(&self) -> Result<Value, MarketError> {
        self.get_json("blockdag", "/info/blockdag").await
    }

    async fn balance_sompi(&self, address: &str) -> Result<u64, MarketError> {
        let path = format!("/addresses/{}/balance", urlencode_segment(address));
        let body: BalanceBody = self.get_json("balance", &path).await?;
        Ok(body.balance)
    }
}

fn urlencode_segment(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, MarketError>>>;

struct Cached<T> {
    value: T,
    fetched_at: u64,
}

/// One cached upstream value plus the fetch currently filling it, if any.
struct TtlCell<T: Clone> {
    value: Option<Cached<T>>,
    inflight: Option<SharedFetch<T>>,
    generation: u64,
}

impl<T: Clone> Default for TtlCell<T> {
    fn default() -> Self {
        Self {
            value: None,
            inflight: None,
            generation: 0,
        }
    }
}

enum Lookup<T: Clone> {
    Fresh(T),
    Wait {
        generation: u64,
        fetch: SharedFetch<T>,
    },
}

impl<T: Clone + Send + Sync + 'static> TtlCell<T> {
    fn lookup<F>(&mut self, now_ms: u64, ttl_ms: u64, start: F) -> Lookup<T>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, MarketError>>,
    {
        if let Some(cached) = &self.value {
            if now_ms.saturating_sub(cached.fetched_at) < ttl_ms {
                return Lookup::Fresh(cached.value.clone());
            }
        }
        if let Some(fetch) = &self.inflight {
            return Lookup::Wait {
                generation: self.generation,
                fetch: fetch.clone(),
            };
        }
        self.generation += 1;
        let fetch = start().shared();
        self.inflight = Some(fetch.clone());
        Lookup::Wait {
            generation: self.generation,
            fetch,
        }
    }

    fn settle(&mut self, generation: u64, result: &Result<T, MarketError>, now_ms: u64) {
        if self.generation != generation || self.inflight.is_none() {
            return;
        }
        self.inflight = None;
        if let Ok(value) = result {
            self.value = Some(Cached {
                value: value.clone(),
                fetched_at: now_ms,
            });
        }
    }

    fn stamp(&self) -> u64 {
        self.value.as_ref().map_or(0, |cached| cached.fetched_at)
    }
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketCacheStats {
    pub price_ttl_ms: u64,
    pub blockdag_ttl_ms: u64,
    pub balance_ttl_ms: u64,
    pub balance_entries: usize,
    pub balance_max_entries: usize,
}

/// Single-flight TTL cache over price, chain-tip info and address balances.
pub struct MarketCache {
    upstream: Arc<dyn MarketUpstream>,
    clock: Arc<dyn Clock>,
    metrics: SchedulerMetrics,
    config: CacheConfig,
    price: Mutex<TtlCell<f64>>,
    blockdag: Mutex<TtlCell<Value>>,
    balances: Mutex<HashMap<String, TtlCell<u64>>>,
}

impl MarketCache {
    #[must_use]
    pub fn new(
        upstream: Arc<dyn MarketUpstream>,
        clock: Arc<dyn Clock>,
        metrics: SchedulerMetrics,
        config: CacheConfig,
    ) -> Self {
        Self {
            upstream,
            clock,
            metrics,
            config,
            price: Mutex::new(TtlCell::default()),
            blockdag: Mutex::new(TtlCell::default()),
            balances: Mutex::new(HashMap::new()),
        }
    }

    pub async fn snapshot(&self, address: &str) -> Result<MarketSnapshot, MarketError> {
        let (price_usd, blockdag, balance_sompi) =
            tokio::try_join!(self.price(), self.blockdag(), self.balance(address))?;
        Ok(MarketSnapshot {
            address: address.to_string(),
            price_usd,
            balance_sompi,
            blockdag,
            fetched_at: self.clock.now_ms(),
        })
    }

    pub async fn price(&self) -> Result<f64, MarketError> {
        let lookup = {
            let mut cell = self.price.lock().unwrap_or_else(PoisonError::into_inner);
            cell.lookup(self.clock.now_ms(), self.config.price_ttl_ms, || {
                let upstream = Arc::clone(&self.upstream);
                self.timed("price", async move { upstream.price_usd().await })
            })
        };
        match lookup {
            Lookup::Fresh(value) => Ok(value),
            Lookup::Wait { generation, fetch } => {
                let result = fetch.await;
                if let Ok(mut cell) = self.price.lock() {
                    cell.settle(generation, &result, self.clock.now_ms());
                }
                result
            }
        }
    }

    pub async fn blockdag(&self) -> Result<Value, MarketError> {
        let lookup = {
            let mut cell = self.blockdag.lock().unwrap_or_else(PoisonError::into_inner);
            cell.lookup(self.clock.now_ms(), self.config.blockdag_ttl_ms, || {
                let upstream = Arc::clone(&self.upstream);
                self.timed("blockdag", async move { upstream.blockdag().await })
            })
        };
        match lookup {
            Lookup::Fresh(value) => Ok(value),
            Lookup::Wait { generation, fetch } => {
                let result = fetch.await;
                if let Ok(mut cell) = self.blockdag.lock() {
                    cell.settle(generation, &result, self.clock.now_ms());
                }
                result
            }
        }
    }

    pub async fn balance(&self, address: &str) -> Result<u64, MarketError> {
        let lookup = {
            let mut balances = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
            if !balances.contains_key(address) {
                prune_stalest(&mut balances, self.config.balance_max_entries.saturating_sub(1));
            }
            let cell = balances.entry(address.to_string()).or_default();
            cell.lookup(self.clock.now_ms(), self.config.balance_ttl_ms, || {
                let upstream = Arc::clone(&self.upstream);
                let address = address.to_string();
                self.timed("balance", async move { upstream.balance_sompi(&address).await })
            })
        };
        match lookup {
            Lookup::Fresh(value) => Ok(value),
            Lookup::Wait { generation, fetch } => {
                let result = fetch.await;
                if let Ok(mut balances) = self.balances.lock() {
                    if let Some(cell) = balances.get_mut(address) {
                        cell.settle(generation, &result, self.clock.now_ms());
                    }
                }
                result
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> MarketCacheStats {
        MarketCacheStats {
            price_ttl_ms: self.config.price_ttl_ms,
            blockdag_ttl_ms: self.config.blockdag_ttl_ms,
            balance_ttl_ms: self.config.balance_ttl_ms,
            balance_entries: self.balances.lock().map(|map| map.len()).unwrap_or(0),
            balance_max_entries: self.config.balance_max_entries,
        }
    }

    fn timed<T, F>(&self, endpoint: &'static str, fetch: F) -> BoxFuture<'static, Result<T, MarketError>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, MarketError>> + Send + 'static,
    {
        let metrics = self.metrics.clone();
        async move {
            let started = Instant::now();
            let result = fetch.await;
            metrics.observe_upstream_latency_ms(started.elapsed().as_secs_f64() * 1_000.0);
            if let Err(error) = &result {
                metrics.record_market_fetch_error(endpoint);
                warn!(endpoint, error = %error, "market upstream read failed");
            }
            result
        }
        .boxed()
    }
}

/// Evicts entries with the oldest successful fetch until at most `keep`
/// remain. Entries with a fetch in flight are kept.
fn prune_stalest(balances: &mut HashMap<String, TtlCell<u64>>, keep: usize) {
    if balances.len() <= keep {
        return;
    }
    let mut candidates = balances
        .iter()
        .filter(|(_, cell)| cell.inflight.is_none())
        .map(|(address, cell)| (cell.stamp(), address.clone()))
        .collect::<Vec<_>>();
    candidates.sort();
    let excess = balances.len() - keep;
    for (_, address) in candidates.into_iter().take(excess) {
        balances.remove(&address);
    }
}
