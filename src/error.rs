use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payload too large: {size} characters exceeds the limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Render queue is full ({limit} waiting), retry later")]
    QueueFull { limit: usize },

    #[error("Render queue was reset while waiting for a slot")]
    Cancelled,

    #[error("Browser is not connected")]
    BrowserUnavailable,

    #[error("Could not connect to browser at {endpoint}: {reason}")]
    BrowserConnectFailed { endpoint: String, reason: String },

    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Content load timed out after {0:?}")]
    ContentLoadTimeout(Duration),

    #[error("Content load failed: {0}")]
    ContentLoadFailed(String),

    #[error("Selector '{selector}' not found within {timeout:?}")]
    SelectorTimeout { selector: String, timeout: Duration },

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl RenderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RenderError::QueueFull { .. }
                | RenderError::Cancelled
                | RenderError::BrowserUnavailable
                | RenderError::NavigationTimeout(_)
                | RenderError::NavigationFailed(_)
                | RenderError::ContentLoadTimeout(_)
                | RenderError::PageError(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RenderError::NavigationTimeout(_)
                | RenderError::ContentLoadTimeout(_)
                | RenderError::SelectorTimeout { .. }
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RenderError::InvalidInput(_) => ErrorSeverity::Low,
            RenderError::PayloadTooLarge { .. } => ErrorSeverity::Low,
            RenderError::SelectorTimeout { .. } => ErrorSeverity::Low,
            RenderError::QueueFull { .. } => ErrorSeverity::Low,
            RenderError::ConfigurationError(_) => ErrorSeverity::High,
            RenderError::BrowserUnavailable => ErrorSeverity::High,
            RenderError::BrowserConnectFailed { .. } => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::SerializationError(err.to_string())
    }
}

impl From<url::ParseError> for RenderError {
    fn from(err: url::ParseError) -> Self {
        RenderError::InvalidInput(format!("malformed URL: {err}"))
    }
}
