use thiserror::Error;

/// Outward-facing error shared by every crate in the workspace.
///
/// Domain crates keep their own detailed error enums and convert into this
/// type at the boundary with the surrounding application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Too many requests: {0}")]
    TooManyRequests(String, Option<u64>),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Bad Gateway: {0}")]
    BadGateway(String),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Short message that is safe to show to an end user.
    pub fn public_message(&self) -> String {
        match self {
            AppError::BadRequest(err) => err.to_string(),
            AppError::NotFound(err) => err.to_string(),
            AppError::Conflict(err) => err.to_string(),
            AppError::TooManyRequests(msg, _) => msg.clone(),
            AppError::InternalError(_) => "Internal server error".to_string(),
            AppError::BadGateway(msg) => format!("Bad Gateway: {}", msg),
            AppError::ServiceUnavailable => "Service unavailable".to_string(),
            AppError::DatabaseError(_) => "Database error".to_string(),
            AppError::ConfigError(_) => "Configuration error".to_string(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::TooManyRequests(..)
                | AppError::BadGateway(_)
                | AppError::ServiceUnavailable
                | AppError::DatabaseError(_)
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}
