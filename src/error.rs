use thiserror::Error;

/// Layered error taxonomy for the engine. Keeping these as distinct variants
/// (rather than a single string-wrapped error) lets the Chunk Worker and
/// Classifier dispatch retry policy on the error *type*, per the §7 taxonomy,
/// instead of matching on message text.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("malformed chunk payload: {0}")]
    Serialization(String),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl From<tokio_postgres::Error> for EngineError {
    fn from(err: tokio_postgres::Error) -> Self {
        EngineError::Database(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for EngineError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        EngineError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Classification of an upstream classifier failure, per §4.5/§7.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("rate limited (429)")]
    RateLimited,

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("permanent upstream failure: {0}")]
    Permanent(String),
}

impl UpstreamError {
    /// Error message as it should be durably recorded on a `ResultRow`.
    pub fn as_result_message(&self) -> String {
        match self {
            UpstreamError::RateLimited => "rate limited (429)".to_string(),
            UpstreamError::Transient(msg) => msg.clone(),
            UpstreamError::Permanent(msg) => msg.clone(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
