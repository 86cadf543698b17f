use serde::Serialize;

/// Stable error codes surfaced in HTTP bodies, `lastDispatch.error` and
/// metric labels.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerErrorCode {
    Validation,
    QueueFull,
    InvalidExecutionTask,
    DispatchFailed,
    LeaseExpired,
    Unauthorized,
    Forbidden,
    QuotaExceeded,
    BackingStoreUnavailable,
    NotFound,
    UpstreamUnavailable,
    Internal,
}

impl SchedulerErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::QueueFull => "queue_full",
            Self::InvalidExecutionTask => "invalid_execution_task",
            Self::DispatchFailed => "dispatch_failed",
            Self::LeaseExpired => "lease_expired",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::QuotaExceeded => "quota_exceeded",
            Self::BackingStoreUnavailable => "backing_store_unavailable",
            Self::NotFound => "not_found",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for SchedulerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
