use std::{
    env,
    net::{AddrParseError, SocketAddr},
};

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8790";
const DEFAULT_SERVICE_NAME: &str = "agent-cycle-scheduler";
const DEFAULT_UPSTREAM_API_BASE: &str = "https://api.kaspa.org";
const DEFAULT_KEY_PREFIX: &str = "agent_scheduler:";

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub build_sha: String,
    pub instance_id: String,
    pub scheduler_id: String,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub scheduling: SchedulingConfig,
    pub callbacks: CallbackConfig,
    pub auth: AuthConfig,
    pub quota: QuotaConfig,
    pub store: StoreConfig,
    pub leader: LeaderConfig,
}

#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub api_base: String,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub price_ttl_ms: u64,
    pub blockdag_ttl_ms: u64,
    pub balance_ttl_ms: u64,
    pub balance_max_entries: usize,
}

#[derive(Clone, Debug)]
pub struct SchedulingConfig {
    pub tick_ms: u64,
    pub due_scan_limit: usize,
    pub cycle_concurrency: usize,
    pub max_queue_depth: usize,
    pub min_cycle_interval_ms: u64,
    pub default_cycle_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub job_lease_ttl_ms: u64,
    pub exec_lease_ttl_ms: u64,
}

#[derive(Clone, Debug)]
pub struct CallbackConfig {
    pub timeout_ms: u64,
    pub dedupe_ttl_ms: u64,
}

#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    pub admin_tokens: Vec<String>,
    pub service_tokens: Vec<ServiceTokenEntry>,
    pub require_auth: bool,
    pub public_reads: bool,
    pub jwt_hs256_secret: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    pub jwks_url: Option<String>,
    pub oidc_issuer_url: Option<String>,
    pub jwks_cache_ttl_ms: u64,
    pub http_timeout_ms: u64,
}

impl AuthConfig {
    #[must_use]
    pub fn has_credential_source(&self) -> bool {
        !self.admin_tokens.is_empty()
            || !self.service_tokens.is_empty()
            || self.jwt_hs256_secret.is_some()
            || self.jwks_url.is_some()
            || self.oidc_issuer_url.is_some()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServiceTokenEntry {
    pub token: String,
    pub subject: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct QuotaConfig {
    pub window_ms: u64,
    pub read_max: u64,
    pub write_max: u64,
    pub tick_max: u64,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub op_timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct LeaderConfig {
    pub lock_ttl_ms: u64,
    pub renew_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid SCHEDULER_BIND_ADDR '{value}': {source}")]
    BindAddrParse {
        value: String,
        source: AddrParseError,
    },
    #[error("invalid SCHEDULER_SERVICE_TOKENS_JSON: {0}")]
    ServiceTokens(#[from] serde_json::Error),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8790)),
            build_sha: "dev".to_string(),
            instance_id: generated_instance_id(),
            scheduler_id: DEFAULT_SERVICE_NAME.to_string(),
            upstream: UpstreamConfig {
                api_base: DEFAULT_UPSTREAM_API_BASE.to_string(),
                timeout_ms: 5_000,
            },
            cache: CacheConfig {
                price_ttl_ms: 15_000,
                blockdag_ttl_ms: 5_000,
                balance_ttl_ms: 5_000,
                balance_max_entries: 5_000,
            },
            scheduling: SchedulingConfig {
                tick_ms: 1_000,
                due_scan_limit: 100,
                cycle_concurrency: 4,
                max_queue_depth: 1_000,
                min_cycle_interval_ms: 1_000,
                default_cycle_interval_ms: 60_000,
                retry_delay_ms: 5_000,
                job_lease_ttl_ms: 30_000,
                exec_lease_ttl_ms: 60_000,
            },
            callbacks: CallbackConfig {
                timeout_ms: 5_000,
                dedupe_ttl_ms: 600_000,
            },
            auth: AuthConfig {
                jwks_cache_ttl_ms: 300_000,
                http_timeout_ms: 5_000,
                ..AuthConfig::default()
            },
            quota: QuotaConfig {
                window_ms: 60_000,
                read_max: 600,
                write_max: 120,
                tick_max: 30,
            },
            store: StoreConfig {
                redis_url: None,
                key_prefix: DEFAULT_KEY_PREFIX.to_string(),
                op_timeout_ms: 2_000,
            },
            leader: LeaderConfig {
                lock_ttl_ms: 15_000,
                renew_interval_ms: 5_000,
                backoff_base_ms: 500,
                backoff_max_ms: 15_000,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Blank values count as
    /// unset and unparsable numbers fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let num = |key: &str, fallback: u64| {
            get(key)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(fallback)
        };
        let flag = |key: &str| {
            get(key).map(|value| {
                matches!(
                    value.to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
        };

        let defaults = Self::default();

        let bind_addr = match get("SCHEDULER_BIND_ADDR") {
            Some(value) => value
                .parse()
                .map_err(|source| ConfigError::BindAddrParse { value, source })?,
            None => DEFAULT_BIND_ADDR
                .parse()
                .map_err(|source| ConfigError::BindAddrParse {
                    value: DEFAULT_BIND_ADDR.to_string(),
                    source,
                })?,
        };

        let service_tokens = match get("SCHEDULER_SERVICE_TOKENS_JSON") {
            Some(raw) => serde_json::from_str::<Vec<ServiceTokenEntry>>(&raw)?
                .into_iter()
                .filter(|entry| !entry.token.trim().is_empty())
                .collect(),
            None => Vec::new(),
        };

        let mut auth = AuthConfig {
            admin_tokens: get("SCHEDULER_ADMIN_TOKENS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|token| !token.is_empty())
                        .map(ToOwned::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            service_tokens,
            require_auth: false,
            public_reads: flag("SCHEDULER_PUBLIC_READS").unwrap_or(false),
            jwt_hs256_secret: get("JWT_HS256_SECRET"),
            jwt_issuer: get("JWT_ISSUER"),
            jwt_audience: get("JWT_AUDIENCE"),
            jwks_url: get("JWT_JWKS_URL"),
            oidc_issuer_url: get("JWT_OIDC_ISSUER_URL"),
            jwks_cache_ttl_ms: num("JWKS_CACHE_TTL_MS", defaults.auth.jwks_cache_ttl_ms),
            http_timeout_ms: num("UPSTREAM_TIMEOUT_MS", defaults.auth.http_timeout_ms),
        };
        auth.require_auth =
            flag("SCHEDULER_REQUIRE_AUTH").unwrap_or_else(|| auth.has_credential_source());

        Ok(Self {
            service_name: get("SCHEDULER_SERVICE_NAME").unwrap_or(defaults.service_name),
            bind_addr,
            build_sha: get("SCHEDULER_BUILD_SHA").unwrap_or(defaults.build_sha),
            instance_id: get("SCHEDULER_INSTANCE_ID").unwrap_or(defaults.instance_id),
            scheduler_id: get("SCHEDULER_ID").unwrap_or(defaults.scheduler_id),
            upstream: UpstreamConfig {
                api_base: get("UPSTREAM_API_BASE")
                    .map(|base| base.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.upstream.api_base),
                timeout_ms: num("UPSTREAM_TIMEOUT_MS", defaults.upstream.timeout_ms),
            },
            cache: CacheConfig {
                price_ttl_ms: num("PRICE_CACHE_TTL_MS", defaults.cache.price_ttl_ms),
                blockdag_ttl_ms: num("BLOCKDAG_CACHE_TTL_MS", defaults.cache.blockdag_ttl_ms),
                balance_ttl_ms: num("BALANCE_CACHE_TTL_MS", defaults.cache.balance_ttl_ms),
                balance_max_entries: num(
                    "BALANCE_CACHE_MAX_ENTRIES",
                    defaults.cache.balance_max_entries as u64,
                )
                .max(1) as usize,
            },
            scheduling: SchedulingConfig {
                tick_ms: num("SCHEDULER_TICK_MS", defaults.scheduling.tick_ms).max(50),
                due_scan_limit: num("DUE_SCAN_LIMIT", defaults.scheduling.due_scan_limit as u64)
                    .max(1) as usize,
                cycle_concurrency: num(
                    "CYCLE_CONCURRENCY",
                    defaults.scheduling.cycle_concurrency as u64,
                )
                .max(1) as usize,
                max_queue_depth: num("MAX_QUEUE_DEPTH", defaults.scheduling.max_queue_depth as u64)
                    .max(1) as usize,
                min_cycle_interval_ms: num(
                    "MIN_CYCLE_INTERVAL_MS",
                    defaults.scheduling.min_cycle_interval_ms,
                ),
                default_cycle_interval_ms: num(
                    "DEFAULT_CYCLE_INTERVAL_MS",
                    defaults.scheduling.default_cycle_interval_ms,
                ),
                retry_delay_ms: num("DISPATCH_RETRY_DELAY_MS", defaults.scheduling.retry_delay_ms),
                job_lease_ttl_ms: num("JOB_LEASE_TTL_MS", defaults.scheduling.job_lease_ttl_ms)
                    .max(1),
                exec_lease_ttl_ms: num("EXEC_LEASE_TTL_MS", defaults.scheduling.exec_lease_ttl_ms)
                    .max(1),
            },
            callbacks: CallbackConfig {
                timeout_ms: num("CALLBACK_TIMEOUT_MS", defaults.callbacks.timeout_ms),
                dedupe_ttl_ms: num("CALLBACK_DEDUPE_TTL_MS", defaults.callbacks.dedupe_ttl_ms)
                    .max(1),
            },
            auth,
            quota: QuotaConfig {
                window_ms: num("QUOTA_WINDOW_MS", defaults.quota.window_ms).max(1),
                read_max: num("QUOTA_READ_MAX", defaults.quota.read_max),
                write_max: num("QUOTA_WRITE_MAX", defaults.quota.write_max),
                tick_max: num("QUOTA_TICK_MAX", defaults.quota.tick_max),
            },
            store: StoreConfig {
                redis_url: get("REDIS_URL"),
                key_prefix: get("SCHEDULER_KEY_PREFIX").unwrap_or(defaults.store.key_prefix),
                op_timeout_ms: num("STORE_OP_TIMEOUT_MS", defaults.store.op_timeout_ms).max(1),
            },
            leader: LeaderConfig {
                lock_ttl_ms: num("LEADER_LOCK_TTL_MS", defaults.leader.lock_ttl_ms).max(1),
                renew_interval_ms: num("LEADER_RENEW_MS", defaults.leader.renew_interval_ms),
                backoff_base_ms: num("LEADER_BACKOFF_BASE_MS", defaults.leader.backoff_base_ms),
                backoff_max_ms: num("LEADER_BACKOFF_MAX_MS", defaults.leader.backoff_max_ms),
            },
        })
    }
}

fn generated_instance_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("scheduler-{}", &simple[..8])
}
