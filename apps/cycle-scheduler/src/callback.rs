use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::{
    error::SchedulerErrorCode,
    metrics::SchedulerMetrics,
    types::{CallbackHeaders, CyclePayload},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[error("callback timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("callback request failed: {0}")]
    Request(String),
    #[error("callback returned status {status}")]
    Status { status: u16 },
}

impl CallbackError {
    #[must_use]
    pub fn code(&self) -> SchedulerErrorCode {
        SchedulerErrorCode::DispatchFailed
    }

    /// Short label stored on `lastDispatch.error`.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Timeout { .. } => "callback_timeout".to_string(),
            Self::Request(_) => "callback_request_failed".to_string(),
            Self::Status { status } => format!("callback_status_{status}"),
        }
    }
}

/// Builds the deterministic idempotency key for one logical cycle.
#[must_use]
pub fn idempotency_key(
    scheduler_id: &str,
    agent_key: &str,
    fence_token: u64,
    queue_task_id: Option<&str>,
    now_ms: u64,
    cycle_interval_ms: u64,
) -> String {
    let discriminator = match queue_task_id {
        Some(task_id) => task_id.to_string(),
        None => format!("t{}", now_ms / cycle_interval_ms.max(1)),
    };
    format!("{scheduler_id}:{agent_key}:{fence_token}:{discriminator}")
}

/// POSTs cycle payloads with a bounded timeout and the fixed header set.
#[derive(Clone)]
pub struct CallbackDispatcher {
    client: reqwest::Client,
    timeout: Duration,
    metrics: SchedulerMetrics,
}

impl CallbackDispatcher {
    pub fn new(timeout_ms: u64, metrics: SchedulerMetrics) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_millis(timeout_ms.max(1));
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            timeout,
            metrics,
        })
    }

    /// Returns the response status on 2xx.
    pub async fn send(
        &self,
        url: &str,
        headers: &CallbackHeaders,
        payload: &CyclePayload,
    ) -> Result<u16, CallbackError> {
        let started = Instant::now();
        let result = self
            .client
            .post(url)
            .header("X-Idempotency-Key", &headers.idempotency_key)
            .header("X-Fence-Token", &headers.fence_token)
            .header("X-Queue-Task-Id", &headers.queue_task_id)
            .header("X-Agent-Key", &headers.agent_key)
            .json(payload)
            .send()
            .await;
        self.metrics
            .observe_callback_latency_ms(started.elapsed().as_secs_f64() * 1_000.0);

        let response = result.map_err(|error| {
            if error.is_timeout() {
                CallbackError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                CallbackError::Request(error.to_string())
            }
        })?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(CallbackError::Status { status });
        }
        debug!(
            agent_key = %headers.agent_key,
            task_id = %headers.queue_task_id,
            status,
            "callback delivered"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path},
    };

    use super::{CallbackDispatcher, CallbackError, idempotency_key};
    use crate::{
        metrics::SchedulerMetrics,
        types::{
            AgentEnvelope, CallbackHeaders, CyclePayload, MarketSnapshot, SchedulerEnvelope,
        },
    };

    fn headers() -> CallbackHeaders {
        CallbackHeaders {
            idempotency_key: "sched:u:a1:3:cycle-1".to_string(),
            fence_token: "3".to_string(),
            queue_task_id: "cycle-1".to_string(),
            agent_key: "u:a1".to_string(),
        }
    }

    fn payload() -> CyclePayload {
        CyclePayload {
            event: "agent_cycle".to_string(),
            ts: 1,
            scheduler: SchedulerEnvelope {
                instance_id: "i".to_string(),
                leader_fence_token: 3,
                queue_task_id: Some("cycle-1".to_string()),
                callback_idempotency_key: "sched:u:a1:3:cycle-1".to_string(),
                callback_headers: headers(),
            },
            agent: AgentEnvelope {
                user_id: "u".to_string(),
                id: "a1".to_string(),
                name: "a1".to_string(),
                wallet_address: "kaspa:q".to_string(),
                strategy_label: "default".to_string(),
                cycle_interval_ms: 2_000,
                failure_count: 0,
                last_cycle_at: None,
            },
            market: MarketSnapshot {
                address: "kaspa:q".to_string(),
                price_usd: 0.1,
                balance_sompi: 5,
                blockdag: json!({}),
                fetched_at: 1,
            },
        }
    }

    #[test]
    fn idempotency_key_prefers_task_id_over_time_bucket() {
        assert_eq!(
            idempotency_key("sched", "u:a1", 3, Some("cycle-1"), 9_999, 2_000),
            "sched:u:a1:3:cycle-1"
        );
        assert_eq!(
            idempotency_key("sched", "u:a1", 3, None, 9_999, 2_000),
            "sched:u:a1:3:t4"
        );
    }

    #[tokio::test]
    async fn delivers_with_the_fixed_header_set() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cb"))
            .and(header("X-Idempotency-Key", "sched:u:a1:3:cycle-1"))
            .and(header("X-Fence-Token", "3"))
            .and(header("X-Queue-Task-Id", "cycle-1"))
            .and(header("X-Agent-Key", "u:a1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let metrics = SchedulerMetrics::new();
        let dispatcher = CallbackDispatcher::new(1_000, metrics.clone())?;
        let status = dispatcher
            .send(&format!("{}/cb", server.uri()), &headers(), &payload())
            .await?;
        assert_eq!(status, 202);
        assert_eq!(metrics.snapshot().callback_latency.count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn non_success_and_slow_responses_are_errors() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fail"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let dispatcher = CallbackDispatcher::new(100, SchedulerMetrics::new())?;
        let failed = dispatcher
            .send(&format!("{}/fail", server.uri()), &headers(), &payload())
            .await;
        assert_eq!(failed, Err(CallbackError::Status { status: 500 }));
        assert_eq!(
            failed.err().map(|error| error.label()).as_deref(),
            Some("callback_status_500")
        );

        let slow = dispatcher
            .send(&format!("{}/slow", server.uri()), &headers(), &payload())
            .await;
        assert_eq!(slow, Err(CallbackError::Timeout { timeout_ms: 100 }));
        Ok(())
    }
}
