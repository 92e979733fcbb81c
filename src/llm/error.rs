//! LLM error classification.

use std::fmt;

use crate::error::ToolError;

/// Coarse category of an LLM call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429 Too Many Requests
    RateLimited,
    /// 5xx from the provider
    ServerError,
    /// 401/403: bad or missing credentials
    Unauthorized,
    /// Other 4xx
    ClientError,
    /// Connection refused, DNS, timeouts
    NetworkError,
    /// Response body did not match the expected format
    ParseError,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LlmErrorKind::RateLimited => "rate_limited",
            LlmErrorKind::ServerError => "server_error",
            LlmErrorKind::Unauthorized => "unauthorized",
            LlmErrorKind::ClientError => "client_error",
            LlmErrorKind::NetworkError => "network_error",
            LlmErrorKind::ParseError => "parse_error",
        };
        f.write_str(s)
    }
}

/// Map an HTTP status code to an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        401 | 403 => LlmErrorKind::Unauthorized,
        429 => LlmErrorKind::RateLimited,
        500..=599 => LlmErrorKind::ServerError,
        _ => LlmErrorKind::ClientError,
    }
}

#[derive(Debug, Clone)]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl LlmError {
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self {
            kind: classify_http_status(status),
            status: Some(status),
            message: body.into(),
        }
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::NetworkError,
            status: None,
            message: message.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::ParseError,
            status: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {}): {}", self.kind, status, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<LlmError> for ToolError {
    fn from(err: LlmError) -> Self {
        let message = format!("decision provider {}", err);
        match err.kind {
            LlmErrorKind::Unauthorized => ToolError::non_recoverable(message),
            LlmErrorKind::RateLimited
            | LlmErrorKind::ServerError
            | LlmErrorKind::NetworkError => ToolError::unavailable(message),
            LlmErrorKind::ClientError | LlmErrorKind::ParseError => {
                ToolError::recoverable(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_classify_http_status() {
        assert_eq!(classify_http_status(401), LlmErrorKind::Unauthorized);
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(503), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(400), LlmErrorKind::ClientError);
    }

    #[test]
    fn test_tool_error_classes() {
        assert_eq!(
            ToolError::from(LlmError::http(403, "forbidden")).class,
            ErrorClass::NonRecoverable
        );
        assert_eq!(
            ToolError::from(LlmError::http(502, "bad gateway")).class,
            ErrorClass::ProviderUnavailable
        );
        assert_eq!(
            ToolError::from(LlmError::parse_error("no choices")).class,
            ErrorClass::Recoverable
        );
    }
}
