use std::time::Duration;

use thiserror::Error;

use crate::core::gateway::GatewayError;
use crate::core::llm::LlmError;
use crate::core::worker::LifecycleState;

pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    /// A patch or request violates a configuration invariant. Nothing was committed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The write committed but a fresh read did not reflect it in time.
    /// Callers must re-check state rather than assume either outcome.
    #[error("write for {subject} not confirmed within {waited:?}")]
    NotConfirmed { subject: String, waited: Duration },

    #[error("worker {0} is already running")]
    AlreadyRunning(i64),

    #[error("worker {0} is not running")]
    NotRunning(i64),

    #[error("owner {owner_id} quota exceeded ({used}/{limit} units)")]
    QuotaExceeded { owner_id: i64, used: i64, limit: i64 },

    #[error("messaging gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("credential rejected: {0}")]
    InvalidCredential(String),

    #[error("worker {0} not found")]
    WorkerNotFound(i64),

    #[error("owner {0} not found")]
    OwnerNotFound(i64),

    #[error("owner {owner_id} does not own worker {worker_id}")]
    Forbidden { owner_id: i64, worker_id: i64 },

    #[error("owner {owner_id} already has the maximum of {limit} workers")]
    WorkerLimitReached { owner_id: i64, limit: usize },

    #[error("illegal lifecycle transition {from} -> {to}")]
    IllegalTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("llm request failed: {0}")]
    Llm(#[from] LlmError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Stable identifier exposed to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::InvalidConfig(_) => "invalid_config",
            FleetError::NotConfirmed { .. } => "not_confirmed",
            FleetError::AlreadyRunning(_) => "already_running",
            FleetError::NotRunning(_) => "not_running",
            FleetError::QuotaExceeded { .. } => "quota_exceeded",
            FleetError::GatewayUnavailable(_) => "gateway_unavailable",
            FleetError::InvalidCredential(_) => "invalid_credential",
            FleetError::WorkerNotFound(_) => "worker_not_found",
            FleetError::OwnerNotFound(_) => "owner_not_found",
            FleetError::Forbidden { .. } => "forbidden",
            FleetError::WorkerLimitReached { .. } => "worker_limit_reached",
            FleetError::IllegalTransition { .. } => "illegal_transition",
            FleetError::Llm(_) => "llm_error",
            FleetError::Storage(_) => "storage_error",
            FleetError::Serialization(_) => "serialization_error",
            FleetError::Io(_) => "io_error",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FleetError::GatewayUnavailable(_) | FleetError::NotConfirmed { .. }
        )
    }
}

impl From<GatewayError> for FleetError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unauthorized(msg) => FleetError::InvalidCredential(msg),
            other => FleetError::GatewayUnavailable(other.to_string()),
        }
    }
}
