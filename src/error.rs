use thiserror::Error;

/// Error types for module and source calls
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Timeout error: operation took longer than {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimit { retry_after: u64 },

    #[error("Circuit open for '{resource}', next attempt in {retry_in_ms}ms")]
    CircuitOpen { resource: String, retry_in_ms: u64 },

    #[error("Data validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for module and source calls
pub type CallResult<T> = Result<T, SourceError>;

impl SourceError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Network(_) => true,
            SourceError::Timeout { .. } => true,
            SourceError::RateLimit { .. } => true,
            SourceError::Api { status_code, .. } => {
                // Retry on server errors (5xx) and rate limiting (429)
                *status_code >= 500 || *status_code == 429
            }
            // Circuit-open means the resource is known-bad right now; retrying
            // immediately would only hammer the breaker.
            _ => false,
        }
    }

    /// Get retry delay in seconds for retryable errors
    pub fn retry_delay(&self) -> Option<u64> {
        match self {
            SourceError::RateLimit { retry_after } => Some(*retry_after),
            SourceError::Network(_) => Some(1),
            SourceError::Timeout { .. } => Some(2),
            SourceError::Api { status_code, .. } if *status_code >= 500 => Some(5),
            _ => None,
        }
    }

    /// Create a parse error with context
    pub fn parse_error<S: Into<String>>(message: S) -> Self {
        SourceError::Parse {
            message: message.into(),
        }
    }

    /// Create a validation error with field context
    pub fn validation_error<S: Into<String>>(field: S, message: S) -> Self {
        SourceError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an API error with status code
    pub fn api_error<S: Into<String>>(status_code: u16, message: S) -> Self {
        SourceError::Api {
            status_code,
            message: message.into(),
        }
    }
}

/// Fatal orchestration errors
///
/// Individual module failures never surface here; they are reported through
/// the orchestration result. Only unrecoverable setup problems and a cyclic
/// module graph abort a run.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Circular dependency detected at module '{module}'")]
    CircularDependency { module: String },

    #[error("Unknown module '{name}' requested")]
    UnknownModule { name: String },

    #[error("Setup error: {0}")]
    Setup(String),
}
