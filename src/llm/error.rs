use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    Permission,
    Quota,
    RateLimit,
    Server,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Quota => "quota",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Server => "server",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn hint(self) -> Option<&'static str> {
        match self {
            ErrorCategory::Authentication => Some("Check the configured API key."),
            ErrorCategory::Permission => Some("The API key lacks access to this model or endpoint."),
            ErrorCategory::Quota => Some("API quota exceeded; check the account billing."),
            ErrorCategory::RateLimit => Some("Rate limit exceeded; wait a few minutes and retry."),
            ErrorCategory::Server => Some("The provider is having trouble; retry later."),
            ErrorCategory::Unknown => None,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const INSUFFICIENT_QUOTA: &str = "insufficient_quota";

/// Typed failure from the model provider or the transport beneath it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub struct ApiError {
    pub status: Option<u16>,
    pub message: String,
    pub error_type: String,
    pub recoverable: bool,
}

impl ApiError {
    pub fn from_status(status: u16, message: impl Into<String>, error_type: impl Into<String>) -> Self {
        let error_type = error_type.into();
        let recoverable =
            !matches!(status, 401 | 403) && error_type != INSUFFICIENT_QUOTA;

        Self {
            status: Some(status),
            message: message.into(),
            error_type,
            recoverable,
        }
    }

    /// Connection, timeout, or body-read failure with no HTTP status.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            error_type: "transport_error".to_string(),
            recoverable: true,
        }
    }

    /// 2xx reply whose body does not have the expected shape.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            error_type: "invalid_response".to_string(),
            recoverable: true,
        }
    }

    pub fn unsupported(capability: &str) -> Self {
        Self {
            status: None,
            message: format!("{capability} is not supported by this gateway"),
            error_type: "unsupported_capability".to_string(),
            recoverable: false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        if self.error_type == INSUFFICIENT_QUOTA {
            return ErrorCategory::Quota;
        }
        match self.status {
            Some(401) => ErrorCategory::Authentication,
            Some(403) => ErrorCategory::Permission,
            Some(429) => ErrorCategory::RateLimit,
            Some(status) if status >= 500 => ErrorCategory::Server,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Model API error [{}", self.category())?;
        if let Some(status) = self.status {
            write!(f, " {status}")?;
        }
        write!(f, "]: {}", self.message)
    }
}
