use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::{
    clock::Clock,
    config::QuotaConfig,
    error::SchedulerErrorCode,
    metrics::SchedulerMetrics,
    store::{CoordinationStore, StoreKeys},
};

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QuotaBucket {
    Read,
    Write,
    Tick,
}

impl QuotaBucket {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Tick => "tick",
        }
    }
}

impl std::fmt::Display for QuotaBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDecision {
    pub bucket: QuotaBucket,
    pub limit: u64,
    pub count: u64,
    pub reset_at_ms: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("quota exceeded for {bucket} bucket (limit {limit})")]
    Exceeded {
        bucket: QuotaBucket,
        limit: u64,
        window_ms: u64,
        reset_at_ms: u64,
    },
}

impl QuotaError {
    #[must_use]
    pub fn code(&self) -> SchedulerErrorCode {
        SchedulerErrorCode::QuotaExceeded
    }
}

/// Fixed-window counter per `(bucket, subject)`.
///
/// Counts live in the shared store when one is configured so every instance
/// sees the same window; a store failure falls back to instance-local counts.
pub struct QuotaLimiter {
    store: Option<Arc<dyn CoordinationStore>>,
    keys: StoreKeys,
    local: Mutex<HashMap<String, (u64, u64)>>,
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
    metrics: SchedulerMetrics,
}

impl QuotaLimiter {
    #[must_use]
    pub fn new(
        store: Option<Arc<dyn CoordinationStore>>,
        keys: StoreKeys,
        config: QuotaConfig,
        clock: Arc<dyn Clock>,
        metrics: SchedulerMetrics,
    ) -> Self {
        Self {
            store,
            keys,
            local: Mutex::new(HashMap::new()),
            config,
            clock,
            metrics,
        }
    }

    #[must_use]
    pub fn limit(&self, bucket: QuotaBucket) -> u64 {
        match bucket {
            QuotaBucket::Read => self.config.read_max,
            QuotaBucket::Write => self.config.write_max,
            QuotaBucket::Tick => self.config.tick_max,
        }
    }

    #[must_use]
    pub fn window_ms(&self) -> u64 {
        self.config.window_ms.max(1)
    }

    /// Counts one request. A limit of 0 disables the bucket.
    pub async fn check(
        &self,
        bucket: QuotaBucket,
        subject: &str,
    ) -> Result<QuotaDecision, QuotaError> {
        let limit = self.limit(bucket);
        let window_ms = self.window_ms();
        let now = self.clock.now_ms();
        let window = now / window_ms;
        let reset_at_ms = (window + 1) * window_ms;
        if limit == 0 {
            return Ok(QuotaDecision {
                bucket,
                limit,
                count: 0,
                reset_at_ms,
            });
        }

        let key = self.keys.quota(bucket.as_str(), subject, window);
        let count = self.increment(&key, window, window_ms).await;
        if count > limit {
            return Err(QuotaError::Exceeded {
                bucket,
                limit,
                window_ms,
                reset_at_ms,
            });
        }
        Ok(QuotaDecision {
            bucket,
            limit,
            count,
            reset_at_ms,
        })
    }

    async fn increment(&self, key: &str, window: u64, window_ms: u64) -> u64 {
        if let Some(store) = &self.store {
            match store.quota_increment(key, window_ms).await {
                Ok(count) => return count,
                Err(error) => {
                    self.metrics.record_store_error("quota_increment");
                    warn!(error = %error, "quota store unavailable; counting locally");
                }
            }
        }
        let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        local.retain(|_, (entry_window, _)| *entry_window >= window);
        let entry = local.entry(key.to_string()).or_insert((window, 0));
        entry.1 += 1;
        entry.1
    }
}
