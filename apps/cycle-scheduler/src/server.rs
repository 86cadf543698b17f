use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::{
    auth::{AuthError, Authenticator, Principal, Scope, token_from_headers},
    error::SchedulerErrorCode,
    queue::QueueError,
    quota::{QuotaBucket, QuotaError, QuotaLimiter},
    registry::RegistryError,
    scheduler::{Scheduler, SchedulerError},
    types::{AgentDefinition, ControlAction},
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Clone)]
pub struct AppState {
    scheduler: Arc<Scheduler>,
    auth: Arc<Authenticator>,
    quota: Arc<QuotaLimiter>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Result<Self, reqwest::Error> {
        let config = scheduler.config();
        let auth = Authenticator::new(
            config.auth.clone(),
            scheduler.clock(),
            scheduler.metrics().clone(),
        )?;
        let quota = QuotaLimiter::new(
            scheduler.store(),
            scheduler.keys().clone(),
            config.quota.clone(),
            scheduler.clock(),
            scheduler.metrics().clone(),
        );
        Ok(Self {
            scheduler,
            auth: Arc::new(auth),
            quota: Arc::new(quota),
        })
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

/// Every route's required scope and quota bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Health,
    Ready,
    Metrics,
    ListAgents,
    RegisterAgent,
    ControlAgent,
    MarketSnapshot,
    Tick,
}

impl Route {
    const fn policy(self) -> (Scope, Option<QuotaBucket>) {
        match self {
            Self::Health | Self::Ready => (Scope::Public, None),
            Self::Metrics => (Scope::MetricsRead, None),
            Self::ListAgents | Self::MarketSnapshot => (Scope::AgentRead, Some(QuotaBucket::Read)),
            Self::RegisterAgent | Self::ControlAgent => {
                (Scope::AgentWrite, Some(QuotaBucket::Write))
            }
            Self::Tick => (Scope::SchedulerTick, Some(QuotaBucket::Tick)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    #[serde(flatten)]
    definition: AgentDefinition,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlBody {
    action: ControlAction,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MarketQuery {
    address: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthStatus {
    require_auth: bool,
    public_reads: bool,
    sources: Vec<&'static str>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics))
        .route("/v1/agents", get(list_agents))
        .route("/v1/agents/register", post(register_agent))
        .route("/v1/agents/:agent_id/control", post(control_agent))
        .route("/v1/market-snapshot", get(market_snapshot))
        .route("/v1/scheduler/tick", post(force_tick))
        .layer(middleware::from_fn(propagate_request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn propagate_request_id(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_REQUEST_ID_LEN)
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

async fn admit(state: &AppState, headers: &HeaderMap, route: Route) -> Result<Principal, ApiError> {
    let (scope, bucket) = route.policy();
    let token = token_from_headers(headers);
    let principal = state.auth.authorize(token.as_deref(), scope).await?;
    if let Some(bucket) = bucket {
        state.quota.check(bucket, &principal.subject).await?;
    }
    Ok(principal)
}

/// Admins may act on behalf of another owner; everyone else acts as
/// themselves.
fn effective_owner(principal: &Principal, requested: Option<&str>) -> String {
    match requested.map(str::trim).filter(|owner| !owner.is_empty()) {
        Some(owner) if principal.is_admin() => owner.to_string(),
        _ => principal.subject.clone(),
    }
}

async fn health(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    admit(&state, &headers, Route::Health).await?;
    let config = state.scheduler.config();
    let status = state.scheduler.status().await;
    Ok(Json(json!({
        "ok": true,
        "service": config.service_name,
        "buildSha": config.build_sha,
        "scheduler": status,
        "auth": AuthStatus {
            require_auth: state.auth.require_auth(),
            public_reads: state.auth.public_reads(),
            sources: state.auth.sources(),
        },
        "quota": {
            "windowMs": state.quota.window_ms(),
            "readMax": state.quota.limit(QuotaBucket::Read),
            "writeMax": state.quota.limit(QuotaBucket::Write),
            "tickMax": state.quota.limit(QuotaBucket::Tick),
        },
    })))
}

async fn readiness(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    admit(&state, &headers, Route::Ready).await?;
    let ready = state.scheduler.ready().await;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((
        status,
        Json(json!({
            "ok": ready,
            "status": if ready { "ready" } else { "not_ready" },
            "shared": state.scheduler.is_shared(),
        })),
    )
        .into_response())
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    admit(&state, &headers, Route::Metrics).await?;
    let gauges = state.scheduler.gauges().await;
    let body = state.scheduler.metrics().render_prometheus(&gauges);
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response())
}

async fn list_agents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let principal = admit(&state, &headers, Route::ListAgents).await?;
    let agents = state.scheduler.list(principal.owner_filter()).await;
    Ok(Json(json!({
        "ok": true,
        "subject": principal.subject,
        "count": agents.len(),
        "agents": agents,
    })))
}

async fn register_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let principal = admit(&state, &headers, Route::RegisterAgent).await?;
    let Json(body) = body.map_err(|rejection| ApiError::Validation(rejection.body_text()))?;
    let owner = effective_owner(&principal, body.user_id.as_deref());
    let agent = state.scheduler.register(&owner, body.definition).await?;
    Ok(Json(json!({ "ok": true, "agent": agent })))
}

async fn control_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
    body: Result<Json<ControlBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let principal = admit(&state, &headers, Route::ControlAgent).await?;
    let Json(body) = body.map_err(|rejection| ApiError::Validation(rejection.body_text()))?;
    let owner = effective_owner(&principal, body.user_id.as_deref());
    let report = state.scheduler.control(&owner, &agent_id, body.action).await?;
    Ok(Json(json!({ "ok": true, "control": report })))
}

async fn market_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MarketQuery>,
) -> Result<Json<Value>, ApiError> {
    admit(&state, &headers, Route::MarketSnapshot).await?;
    let address = query
        .address
        .as_deref()
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .ok_or_else(|| ApiError::Validation("address query parameter is required".to_string()))?;
    let snapshot = state.scheduler.market_snapshot(address).await?;
    Ok(Json(json!({ "ok": true, "snapshot": snapshot })))
}

async fn force_tick(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    admit(&state, &headers, Route::Tick).await?;
    let requeued = state.scheduler.requeue_expired().await;
    let tick = state.scheduler.tick().await;
    let drain = state.scheduler.drain_queue().await;
    Ok(Json(json!({
        "ok": true,
        "requeued": requeued,
        "tick": tick,
        "drain": drain,
    })))
}

#[derive(Debug)]
enum ApiError {
    Auth(AuthError),
    Quota(QuotaError),
    Validation(String),
    NotFound(String),
    QueueFull { depth: usize, max_depth: usize },
    Upstream(String),
    StoreUnavailable(String),
    Internal(String),
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        Self::Auth(error)
    }
}

impl From<QuotaError> for ApiError {
    fn from(error: QuotaError) -> Self {
        Self::Quota(error)
    }
}

impl From<SchedulerError> for ApiError {
    fn from(error: SchedulerError) -> Self {
        match error {
            SchedulerError::Registry(RegistryError::Validation(message)) => {
                Self::Validation(message)
            }
            SchedulerError::Registry(RegistryError::NotFound(key)) => {
                Self::NotFound(format!("agent not found: {key}"))
            }
            SchedulerError::Registry(RegistryError::Store(error))
            | SchedulerError::Queue(QueueError::Store(error)) => {
                Self::StoreUnavailable(error.to_string())
            }
            SchedulerError::Queue(QueueError::Full { depth, max_depth }) => {
                Self::QueueFull { depth, max_depth }
            }
            SchedulerError::Market(error) => Self::Upstream(error.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

fn error_body(code: SchedulerErrorCode, message: String, details: Value) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let (Some(error), Value::Object(details)) = (error.as_object_mut(), details) {
        error.extend(details);
    }
    json!({ "ok": false, "error": error })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Auth(error) => {
                let status = if error.is_unauthorized() {
                    StatusCode::UNAUTHORIZED
                } else {
                    StatusCode::FORBIDDEN
                };
                let details = match &error {
                    AuthError::Forbidden { required } => json!({ "requiredScope": required }),
                    _ => Value::Null,
                };
                let body = error_body(error.code(), error.to_string(), details);
                if error.is_unauthorized() {
                    (
                        status,
                        [(header::WWW_AUTHENTICATE, "Bearer")],
                        Json(body),
                    )
                        .into_response()
                } else {
                    (status, Json(body)).into_response()
                }
            }
            Self::Quota(error) => {
                let QuotaError::Exceeded {
                    bucket,
                    limit,
                    window_ms,
                    reset_at_ms,
                } = &error;
                let body = error_body(
                    error.code(),
                    error.to_string(),
                    json!({
                        "bucket": bucket,
                        "limit": limit,
                        "windowMs": window_ms,
                        "resetAtMs": reset_at_ms,
                    }),
                );
                (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
            }
            Self::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(error_body(SchedulerErrorCode::Validation, message, Value::Null)),
            )
                .into_response(),
            Self::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(error_body(SchedulerErrorCode::NotFound, message, Value::Null)),
            )
                .into_response(),
            Self::QueueFull { depth, max_depth } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(error_body(
                    SchedulerErrorCode::QueueFull,
                    "execution queue is full".to_string(),
                    json!({ "depth": depth, "maxDepth": max_depth }),
                )),
            )
                .into_response(),
            Self::Upstream(message) => (
                StatusCode::BAD_GATEWAY,
                Json(error_body(
                    SchedulerErrorCode::UpstreamUnavailable,
                    message,
                    Value::Null,
                )),
            )
                .into_response(),
            Self::StoreUnavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(error_body(
                    SchedulerErrorCode::BackingStoreUnavailable,
                    message,
                    Value::Null,
                )),
            )
                .into_response(),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(error_body(SchedulerErrorCode::Internal, message, Value::Null)),
            )
                .into_response(),
        }
    }
}
