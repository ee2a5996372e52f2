//! Huginn error types

use std::time::Duration;

/// Huginn error types.
///
/// The set is closed: every failure surfaced to a caller maps to one of
/// these kinds, each with a stable machine-readable code (see
/// [`HuginnError::code_str`]) and a JSON-RPC error code (see
/// [`HuginnError::jsonrpc_code`]). Messages never carry credentials, raw
/// backend tokens, or stack traces.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum HuginnError {
    /// Malformed caller input. `path` names the offending field when known.
    #[error("invalid input{}: {message}", .path.as_deref().map(|p| format!(" at {p}")).unwrap_or_default())]
    InvalidInput {
        message: String,
        path: Option<String>,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Query rejected by the validator. `reason` is a stable slug
    /// (`multi-statement`, `comment`, `destructive-keyword`, `quoting`,
    /// `length`, `nesting`); `detail` is human-readable.
    #[error("query validation failed ({reason}): {detail}")]
    ValidationFailed { reason: String, detail: String },

    /// A tool prerequisite has no (or too weak a) discovery result.
    /// `missing` lists the prerequisites the caller should discover first.
    #[error("discovery required: {} prerequisite(s) unresolved", missing.len())]
    DiscoveryRequired { missing: Vec<String> },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Rate limited, either by the backend or by huginn's own limiter.
    ///
    /// `retry_after` is populated when the limiter or the backend response
    /// encodes a wait duration.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Request cancelled (connection closed or `cancel` notification).
    /// Surfaces as a transport closure, never as a protocol error.
    #[error("cancelled")]
    Cancelled,
}

impl HuginnError {
    /// Shorthand for an [`InvalidInput`](Self::InvalidInput) without a field path.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            path: None,
        }
    }

    /// Shorthand for an [`InvalidInput`](Self::InvalidInput) with a field path.
    pub fn invalid_param(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Whether this error is transient and the request may succeed on retry.
    ///
    /// Used by `RetryingBackend` to decide whether to retry a failed call.
    /// Permanent errors (auth, validation, bad input) return `false`.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::BackendUnavailable(_) => true,
            // Timeouts get one more attempt, budget permitting.
            Self::Timeout(_) => true,

            Self::InvalidInput { .. }
            | Self::Unauthorized(_)
            | Self::Forbidden(_)
            | Self::NotFound(_)
            | Self::ValidationFailed { .. }
            | Self::DiscoveryRequired { .. }
            | Self::Internal(_)
            | Self::Configuration(_)
            | Self::Cancelled => false,
        }
    }

    /// For `RateLimited` errors, the suggested wait duration, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Stable machine-readable error kind.
    pub fn code_str(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid-input",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not-found",
            Self::ValidationFailed { .. } => "validation-failed",
            Self::DiscoveryRequired { .. } => "discovery-required",
            Self::BackendUnavailable(_) => "backend-unavailable",
            Self::RateLimited { .. } => "backend-rate-limited",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) | Self::Configuration(_) => "internal-error",
            Self::Cancelled => "cancelled",
        }
    }

    /// JSON-RPC error code for this kind.
    ///
    /// Standard codes for protocol-level failures, `-400xx` for huginn's
    /// domain errors. `Cancelled` never reaches the wire: cancelled requests
    /// get a transport closure, not an error response.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::InvalidInput { .. } => -32602,
            Self::NotFound(_) => -32601,
            Self::Unauthorized(_) | Self::Forbidden(_) => -40005,
            Self::ValidationFailed { .. } => -40004,
            Self::DiscoveryRequired { .. } => -40001,
            Self::BackendUnavailable(_) => -40002,
            Self::RateLimited { .. } => -40003,
            Self::Timeout(_) | Self::Internal(_) | Self::Configuration(_) | Self::Cancelled => {
                -32603
            }
        }
    }

    /// Optional remediation hint surfaced in the error `data`.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::DiscoveryRequired { missing } => Some(format!(
                "run discovery for: {} (or pass discover_first=false to proceed with assumptions)",
                missing.join(", ")
            )),
            Self::RateLimited { retry_after } => retry_after
                .map(|d| format!("retry after {}ms", d.as_millis()))
                .or_else(|| Some("reduce request rate and retry".to_string())),
            Self::ValidationFailed { .. } => {
                Some("only single read-only query statements are accepted".to_string())
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for HuginnError {
    fn from(err: serde_json::Error) -> Self {
        HuginnError::invalid_input(format!("JSON error: {err}"))
    }
}

/// Result type alias for huginn operations
pub type Result<T> = std::result::Result<T, HuginnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(HuginnError::BackendUnavailable("503".into()).is_transient());
        assert!(HuginnError::RateLimited { retry_after: None }.is_transient());
        assert!(HuginnError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!HuginnError::Unauthorized("bad key".into()).is_transient());
        assert!(!HuginnError::invalid_input("nope").is_transient());
        assert!(!HuginnError::Cancelled.is_transient());
    }

    #[test]
    fn jsonrpc_codes_match_contract() {
        assert_eq!(HuginnError::invalid_input("x").jsonrpc_code(), -32602);
        assert_eq!(HuginnError::NotFound("t".into()).jsonrpc_code(), -32601);
        assert_eq!(
            HuginnError::DiscoveryRequired { missing: vec![] }.jsonrpc_code(),
            -40001
        );
        assert_eq!(
            HuginnError::BackendUnavailable("x".into()).jsonrpc_code(),
            -40002
        );
        assert_eq!(
            HuginnError::RateLimited { retry_after: None }.jsonrpc_code(),
            -40003
        );
        assert_eq!(
            HuginnError::ValidationFailed {
                reason: "length".into(),
                detail: "too long".into()
            }
            .jsonrpc_code(),
            -40004
        );
        assert_eq!(HuginnError::Unauthorized("x".into()).jsonrpc_code(), -40005);
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let d = Duration::from_millis(250);
        assert_eq!(
            HuginnError::RateLimited {
                retry_after: Some(d)
            }
            .retry_after(),
            Some(d)
        );
        assert_eq!(HuginnError::Timeout(d).retry_after(), None);
    }

    #[test]
    fn invalid_param_carries_path() {
        let err = HuginnError::invalid_param("arguments.query", "expected string");
        assert!(err.to_string().contains("arguments.query"));
    }
}
