//! Error types for the telebridge core
//!
//! One taxonomy covers every component; the dispatcher folds any variant
//! into the uniform JSON envelope returned to MCP callers. Retryability is
//! a property of the variant, never of the call site.

use crate::domain_types::{CorrelationId, ToolName};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Main error type for telebridge operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    #[error("Client {client} lacks capability for tool {tool}")]
    Authorization { client: String, tool: ToolName },

    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Validation error: {field} - {reason}")]
    Validation {
        field: String,
        reason: String,
        constraint: String,
    },

    #[error("Rate limit exceeded for {scope}, retry after {retry_after_s}s")]
    RateLimitExceeded { scope: String, retry_after_s: u64 },

    #[error("Request blocked by security rule {rule}")]
    SecurityBlocked { rule: String, detail: String },

    #[error("Bridge executable not found in any candidate path")]
    BridgeNotFound { searched: Vec<String> },

    #[error("Bridge misconfigured: missing {missing:?}")]
    BridgeMisconfigured { missing: Vec<String> },

    #[error("Bridge failed to start after {attempts} attempts: {reason}")]
    BridgeStartFailed { attempts: u32, reason: String },

    #[error("Circuit breaker open for {class}, retry after {retry_after_s}s")]
    CircuitOpen { class: String, retry_after_s: u64 },

    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Network error during {operation}: {detail}")]
    Network { operation: String, detail: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Stable machine-readable error kinds surfaced in the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthenticationError,
    AuthorizationError,
    UnknownTool,
    ValidationError,
    RateLimitExceeded,
    SecurityBlocked,
    BridgeNotFound,
    BridgeMisconfigured,
    BridgeStartFailed,
    CircuitOpen,
    Timeout,
    NetworkError,
    InternalError,
}

impl ErrorKind {
    /// Canonical SCREAMING_SNAKE_CASE name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthenticationError => "AUTHENTICATION_ERROR",
            ErrorKind::AuthorizationError => "AUTHORIZATION_ERROR",
            ErrorKind::UnknownTool => "UNKNOWN_TOOL",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorKind::SecurityBlocked => "SECURITY_BLOCKED",
            ErrorKind::BridgeNotFound => "BRIDGE_NOT_FOUND",
            ErrorKind::BridgeMisconfigured => "BRIDGE_MISCONFIGURED",
            ErrorKind::BridgeStartFailed => "BRIDGE_START_FAILED",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CoreError {
    /// Machine-readable kind for the envelope
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Authentication { .. } => ErrorKind::AuthenticationError,
            CoreError::Authorization { .. } => ErrorKind::AuthorizationError,
            CoreError::UnknownTool { .. } => ErrorKind::UnknownTool,
            CoreError::Validation { .. } => ErrorKind::ValidationError,
            CoreError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            CoreError::SecurityBlocked { .. } => ErrorKind::SecurityBlocked,
            CoreError::BridgeNotFound { .. } => ErrorKind::BridgeNotFound,
            CoreError::BridgeMisconfigured { .. } => ErrorKind::BridgeMisconfigured,
            CoreError::BridgeStartFailed { .. } => ErrorKind::BridgeStartFailed,
            CoreError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            CoreError::Timeout { .. } => ErrorKind::Timeout,
            CoreError::Network { .. } => ErrorKind::NetworkError,
            CoreError::Io { .. } | CoreError::Serialization { .. } | CoreError::Internal { .. } => {
                ErrorKind::InternalError
            }
        }
    }

    /// Whether the retry executor may re-attempt the failed operation
    ///
    /// Authentication, authorization, validation, rate-limit, and security
    /// failures are terminal; repeating them cannot change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Network { .. }
                | CoreError::Timeout { .. }
                | CoreError::BridgeStartFailed { .. }
                | CoreError::Io { .. }
        )
    }

    /// Seconds the caller should wait before retrying, when known
    pub fn retry_after_s(&self) -> Option<u64> {
        match self {
            CoreError::RateLimitExceeded { retry_after_s, .. }
            | CoreError::CircuitOpen { retry_after_s, .. } => Some(*retry_after_s),
            _ => None,
        }
    }

    /// Structured details for the envelope
    fn details(&self) -> Value {
        match self {
            CoreError::Validation {
                field,
                reason,
                constraint,
            } => json!({ "field": field, "reason": reason, "constraint": constraint }),
            CoreError::RateLimitExceeded { scope, .. } => json!({ "scope": scope }),
            CoreError::SecurityBlocked { rule, detail } => {
                json!({ "rule": rule, "detail": detail })
            }
            CoreError::BridgeNotFound { searched } => json!({ "searched": searched }),
            CoreError::BridgeMisconfigured { missing } => json!({ "missing": missing }),
            CoreError::BridgeStartFailed { attempts, reason } => {
                json!({ "attempts": attempts, "reason": reason })
            }
            CoreError::CircuitOpen { class, .. } => json!({ "class": class }),
            CoreError::Timeout {
                operation,
                timeout_ms,
            } => json!({ "operation": operation, "timeout_ms": timeout_ms }),
            CoreError::Network { operation, .. } => json!({ "operation": operation }),
            CoreError::Authorization { client, tool } => {
                json!({ "client": client, "tool": tool.as_str() })
            }
            CoreError::UnknownTool { name } => json!({ "name": name }),
            _ => json!({}),
        }
    }

    /// Folds the error into the uniform JSON envelope returned to callers
    ///
    /// Internal errors keep their full context in the logs only; the
    /// user-visible message stays generic.
    pub fn to_envelope(&self, correlation_id: CorrelationId) -> Value {
        let message = if self.kind() == ErrorKind::InternalError {
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };
        let mut envelope = json!({
            "error": true,
            "kind": self.kind().as_str(),
            "message": message,
            "details": self.details(),
            "correlation_id": correlation_id.to_string(),
        });
        if let Some(retry_after_s) = self.retry_after_s() {
            envelope["retry_after_s"] = json!(retry_after_s);
        }
        envelope
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        let operation = err
            .url()
            .map_or_else(|| "http".to_string(), |u| u.path().to_string());
        if err.is_timeout() {
            CoreError::Timeout {
                operation,
                timeout_ms: 0,
            }
        } else {
            CoreError::Network {
                operation,
                detail: err.to_string(),
            }
        }
    }
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, CoreError>;
