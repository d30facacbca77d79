//! Error types for task-relay.

use std::time::Duration;

use uuid::Uuid;

use crate::retry::RetryClass;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Ingress error: {0}")]
    Ingress(#[from] IngressError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid flow {flow_id}: {reason}")]
    InvalidFlow { flow_id: Uuid, reason: String },
}

/// Persistence errors from any store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by source and sink adapters.
///
/// Carries enough structure for the retry layer to tell transient failures
/// (network, 5xx, rate limits) from permanent ones (bad credentials,
/// missing resources, malformed payloads).
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("No adapter registered for platform '{0}'")]
    UnknownPlatform(String),

    #[error("Invalid payload from {platform}: {reason}")]
    InvalidPayload { platform: String, reason: String },

    #[error("Webhook signature verification failed for {platform}")]
    SignatureInvalid { platform: String },

    #[error("Webhook timestamp outside freshness window for {platform}: {age_secs}s old")]
    StaleTimestamp { platform: String, age_secs: i64 },

    #[error("Authentication failed for {platform}")]
    AuthFailed { platform: String },

    #[error("{platform}: {resource} not found")]
    NotFound { platform: String, resource: String },

    #[error("Rate limited by {platform}, retry after {retry_after:?}")]
    RateLimited {
        platform: String,
        retry_after: Option<Duration>,
    },

    #[error("{platform} returned HTTP {status}: {body}")]
    Http {
        platform: String,
        status: u16,
        body: String,
    },

    #[error("Network error talking to {platform}: {reason}")]
    Network { platform: String, reason: String },
}

impl RetryClass for AdapterError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Errors from the AI classifier capability.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier request failed: {0}")]
    RequestFailed(String),

    #[error("Classifier rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid classifier response: {0}")]
    InvalidResponse(String),

    #[error("Classifier authentication failed")]
    AuthFailed,
}

impl RetryClass for ClassifierError {
    fn is_retryable(&self) -> bool {
        // A re-prompt can recover from garbled model output, so only
        // credential failures are permanent here.
        !matches!(self, Self::AuthFailed)
    }
}

/// Pipeline orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Stage {stage} failed: {reason}")]
    Stage { stage: String, reason: String },

    #[error("Flow {flow_id} no longer exists")]
    FlowGone { flow_id: Uuid },

    #[error("Flow {flow_id} has no default output")]
    NoDefaultOutput { flow_id: Uuid },

    #[error("Flow {flow_id} has no input for workspace {workspace_id}")]
    MissingInput { flow_id: Uuid, workspace_id: String },

    #[error("All {total} task deliveries failed")]
    AllDeliveriesFailed { total: usize },

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl RetryClass for PipelineError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Adapter(e) => e.is_retryable(),
            Self::Classifier(e) => e.is_retryable(),
            // Store hiccups are worth another attempt; config/referential
            // problems are not.
            Self::Store(_) => true,
            Self::Stage { .. } => true,
            Self::FlowGone { .. }
            | Self::NoDefaultOutput { .. }
            | Self::MissingInput { .. }
            | Self::AllDeliveriesFailed { .. } => false,
        }
    }
}

/// Errors surfaced at the webhook/API boundary.
///
/// These map directly onto HTTP status codes in the ingress layer and never
/// create a Job.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("Signature rejected: {0}")]
    SignatureRejected(String),

    #[error("No flow configured for {platform} workspace {workspace_id}")]
    NoMatchingFlow {
        platform: String,
        workspace_id: String,
    },

    #[error("Discussion {0} not found")]
    DiscussionNotFound(Uuid),

    #[error("Discussion {0} already has an active job")]
    JobConflict(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
