//! Error types for the reconciler.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Remote API error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors returned by the remote mailbox, calendar, storage and portal APIs.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("{service} request failed: {reason}")]
    Transport { service: String, reason: String },

    #[error("{service} resource not found: {resource}")]
    NotFound { service: String, resource: String },

    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {service}: {reason}")]
    Decode { service: String, reason: String },
}

impl RemoteError {
    /// Whether the remote service reported the entity as gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Malformed notification: {0}")]
    Decode(String),

    #[error("Artifact extraction failed: {0}")]
    Artifact(String),

    #[error("Rules loading failed: {0}")]
    Rules(String),

    #[error("Message {0} is claimed by an invocation still in flight")]
    ClaimInFlight(String),

    #[error("{failed} message(s) failed; checkpoint for {mailbox} not advanced")]
    Incomplete { mailbox: String, failed: usize },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Remote API error: {0}")]
    Remote(#[from] RemoteError),
}
