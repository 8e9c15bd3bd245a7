//! Error kinds for the relay gateway core.
//!
//! One flat enum, mirroring the policy table in the design doc: each kind
//! carries exactly the context needed to pick an HTTP status and a local
//! handling action (retry, refund, none) without re-inspecting the source.

use thiserror::Error;

/// Result alias used throughout the core.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("no credential presented")]
    NoCredential,

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("insufficient quota: available {available}, requested {requested}")]
    Insufficient { available: f64, requested: f64 },

    #[error("billing mismatch: actual amount {actual} exceeds frozen amount {frozen}")]
    BillingMismatch { frozen: f64, actual: f64 },

    #[error("no candidate channel for model '{model}' in group '{group}'")]
    NoCandidate { model: String, group: String },

    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    #[error("upstream fatal error (status {status}): {body}")]
    UpstreamFatal { status: u16, body: String },

    #[error("retries exhausted, last upstream status {last_status:?}: {message}")]
    Exhausted {
        last_status: Option<u16>,
        message: String,
    },

    #[error("body too large: {size} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge { size: u64, limit: u64 },

    #[error("cache entry corrupted: {0}")]
    CorruptedCache(String),

    #[error("channel '{0}' at local concurrency limit")]
    RateLimitedLocal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl GatewayError {
    /// HTTP status a caller-facing layer should surface for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::NoCredential | GatewayError::InvalidCredential(_) => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::Insufficient { .. } => 402,
            GatewayError::BillingMismatch { .. } => 500,
            GatewayError::NoCandidate { .. } => 503,
            GatewayError::UpstreamTransient(_) => 502,
            GatewayError::UpstreamFatal { status, .. } => *status,
            GatewayError::Exhausted { .. } => 502,
            GatewayError::BodyTooLarge { .. } => 413,
            GatewayError::CorruptedCache(_) => 500,
            GatewayError::RateLimitedLocal(_) => 503,
            GatewayError::NotFound(_) => 404,
            GatewayError::InternalInvariant(_) => 500,
            GatewayError::Config(_) => 500,
            GatewayError::Serialization(_) => 500,
        }
    }

    /// Whether the retry controller should treat this as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTransient(_) | GatewayError::RateLimitedLocal(_)
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            GatewayError::UpstreamTransient(e.to_string())
        } else {
            GatewayError::UpstreamFatal {
                status: e.status().map(|s| s.as_u16()).unwrap_or(502),
                body: e.to_string(),
            }
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::InternalInvariant(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}
