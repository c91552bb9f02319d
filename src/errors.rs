use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaultError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid percentage: {0}")]
    InvalidPercentage(String),

    #[error("Invalid abort status: {0}")]
    InvalidAbortStatus(u32),

    #[error("Invalid header matcher: {0}")]
    InvalidHeaderMatcher(String),

    #[error("Invalid rate limit: {0}")]
    InvalidRateLimit(String),

    #[error("Timer error: {0}")]
    TimerError(String),

    #[error("File system error: {0}")]
    FileSystemError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("File watch error: {0}")]
    WatchError(#[from] notify::Error),
}

impl FaultError {
    /// Whether the error was raised while building a policy, as opposed to
    /// while serving a request.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FaultError::ConfigurationError(_)
                | FaultError::InvalidPercentage(_)
                | FaultError::InvalidAbortStatus(_)
                | FaultError::InvalidHeaderMatcher(_)
                | FaultError::InvalidRateLimit(_)
                | FaultError::JsonError(_)
        )
    }
}

/// Result type alias for fault filter operations
pub type Result<T> = std::result::Result<T, FaultError>;
