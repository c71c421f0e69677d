/// Errors internal to the request pipeline, before they're collapsed into an [`EsiError`]
/// at the facade boundary. Kept separate from `EsiError` because a few call sites
/// (retry loops) need to match on the specific failure mode rather than an HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("rate limited")]
    RateLimited { status: u16, retry_after: u64 },

    #[error("request timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("service unavailable")]
    HealthGate,

    #[error("failed to get access token")]
    AuthMissingToken,

    #[error("token provider error: {0}")]
    AuthProviderError(String),

    #[error("{status}: {message}")]
    Protocol { status: u16, message: String },

    #[error("paginated response missing expiry metadata")]
    PaginationMissingMeta,
}

/// The error surfaced across the public API. Concrete rather than `anyhow::Error`
/// because callers branch on `status` (e.g. to decide whether a 401 means the stored
/// token needs refreshing) and on `retry_after`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct EsiError {
    pub message: String,
    pub status: u16,
    pub retry_after: Option<u64>,
}

impl EsiError {
    pub(crate) fn new(message: impl Into<String>, status: u16) -> Self {
        Self { message: message.into(), status, retry_after: None }
    }

    pub(crate) fn with_retry_after(mut self, retry_after: u64) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl From<PipelineError> for EsiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::RateLimited { status, retry_after } => {
                EsiError::new("rate limited", status).with_retry_after(retry_after)
            }
            PipelineError::Timeout => EsiError::new("request timeout", 0),
            PipelineError::Network(msg) => EsiError::new(msg, 0),
            PipelineError::HealthGate => EsiError::new("service unhealthy", 503).with_retry_after(60),
            PipelineError::AuthMissingToken => EsiError::new("failed to get access token", 401),
            PipelineError::AuthProviderError(msg) => {
                EsiError::new(format!("token provider error: {msg}"), 401)
            }
            PipelineError::Protocol { status, message } => EsiError::new(message, status),
            PipelineError::PaginationMissingMeta => {
                EsiError::new("paginated response missing expiry metadata", 0)
            }
        }
    }
}
