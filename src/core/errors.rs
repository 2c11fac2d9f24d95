use crate::core::types::{OperationType, ServiceLevel, TransportKind};
use thiserror::Error;

/// How a transport failure is counted by the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Timeout,
    RateLimited,
    NonceConflict,
    Authentication,
}

#[derive(Error, Debug)]
pub enum ConnectivityError {
    #[error("Authentication error on {transport}: {message}")]
    Authentication {
        transport: TransportKind,
        message: String,
    },

    #[error(
        "Nonce conflict on {connection_id}: provided={provided:?}, expected_minimum={expected_minimum:?}"
    )]
    NonceConflict {
        connection_id: String,
        provided: Option<i64>,
        expected_minimum: Option<i64>,
    },

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Transport unavailable ({transport}): {reason}")]
    TransportUnavailable {
        transport: TransportKind,
        reason: String,
    },

    #[error("Request timed out on {transport} after {elapsed_ms}ms")]
    Timeout {
        transport: TransportKind,
        elapsed_ms: u64,
    },

    #[error("Validation discrepancy: {0}")]
    ValidationDiscrepancy(String),

    #[error("Operation {operation} deferred at {level} (pending #{pending_id})")]
    OperationDeferred {
        operation: OperationType,
        level: ServiceLevel,
        pending_id: u64,
    },

    #[error("Operation {operation} rejected: {reason}")]
    OperationRejected {
        operation: OperationType,
        reason: String,
    },

    #[error("API error: {code} - {message}")]
    ApiError { code: i32, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::core::config::ConfigError),

    #[error("{operation} failed on {transport}: {source}")]
    Exhausted {
        operation: OperationType,
        transport: TransportKind,
        source: Box<ConnectivityError>,
    },
}

impl ConnectivityError {
    #[cold]
    #[inline(never)]
    pub fn unavailable(transport: TransportKind, reason: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            transport,
            reason: reason.into(),
        }
    }

    #[cold]
    #[inline(never)]
    pub fn exhausted(operation: OperationType, transport: TransportKind, source: Self) -> Self {
        // Never nest exhausted errors, keep the innermost root cause
        let source = match source {
            Self::Exhausted { source, .. } => *source,
            other => other,
        };
        Self::Exhausted {
            operation,
            transport,
            source: Box::new(source),
        }
    }

    /// Copy for fan-out to several waiters; non-cloneable sources keep only their message
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Authentication { transport, message } => Self::Authentication {
                transport: *transport,
                message: message.clone(),
            },
            Self::NonceConflict {
                connection_id,
                provided,
                expected_minimum,
            } => Self::NonceConflict {
                connection_id: connection_id.clone(),
                provided: *provided,
                expected_minimum: *expected_minimum,
            },
            Self::RateLimitExceeded(message) => Self::RateLimitExceeded(message.clone()),
            Self::TransportUnavailable { transport, reason } => {
                Self::unavailable(*transport, reason.clone())
            }
            Self::Timeout {
                transport,
                elapsed_ms,
            } => Self::Timeout {
                transport: *transport,
                elapsed_ms: *elapsed_ms,
            },
            Self::ValidationDiscrepancy(message) => Self::ValidationDiscrepancy(message.clone()),
            Self::OperationDeferred {
                operation,
                level,
                pending_id,
            } => Self::OperationDeferred {
                operation: *operation,
                level: *level,
                pending_id: *pending_id,
            },
            Self::OperationRejected { operation, reason } => Self::OperationRejected {
                operation: *operation,
                reason: reason.clone(),
            },
            Self::ApiError { code, message } => Self::ApiError {
                code: *code,
                message: message.clone(),
            },
            Self::Protocol(message) => Self::Protocol(message.clone()),
            Self::Serialization(e) => Self::Protocol(e.to_string()),
            Self::Config(e) => Self::Protocol(e.to_string()),
            Self::Exhausted {
                operation,
                transport,
                source,
            } => Self::Exhausted {
                operation: *operation,
                transport: *transport,
                source: Box::new(source.duplicate()),
            },
        }
    }

    /// Map the error onto the breaker's failure classification.
    ///
    /// `None` means the transport itself worked (the exchange answered with a
    /// business error, or the call never reached the wire).
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Authentication { .. } => Some(FailureKind::Authentication),
            Self::NonceConflict { .. } => Some(FailureKind::NonceConflict),
            Self::RateLimitExceeded(_) => Some(FailureKind::RateLimited),
            Self::TransportUnavailable { .. } | Self::Protocol(_) => Some(FailureKind::Network),
            Self::Timeout { .. } => Some(FailureKind::Timeout),
            Self::Exhausted { source, .. } => source.failure_kind(),
            Self::ValidationDiscrepancy(_)
            | Self::OperationDeferred { .. }
            | Self::OperationRejected { .. }
            | Self::ApiError { .. }
            | Self::Serialization(_)
            | Self::Config(_) => None,
        }
    }

    /// Whether the router may try the alternate transport after this error
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self.failure_kind(),
            Some(FailureKind::Network | FailureKind::Timeout | FailureKind::RateLimited)
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.failure_kind() == Some(FailureKind::Authentication)
    }

    /// Classify an error string reported by the exchange (`EAPI:Invalid nonce`, ...)
    pub fn from_exchange_message(
        message: &str,
        transport: TransportKind,
        connection_id: &str,
    ) -> Self {
        let lower = message.to_ascii_lowercase();

        if lower.contains("invalid nonce") || lower.contains("nonce") {
            Self::NonceConflict {
                connection_id: connection_id.to_string(),
                provided: None,
                expected_minimum: None,
            }
        } else if lower.contains("invalid key")
            || lower.contains("invalid signature")
            || lower.contains("permission denied")
            || lower.contains("authentication")
        {
            Self::Authentication {
                transport,
                message: message.to_string(),
            }
        } else if lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("temporary lockout")
            || lower.contains("throttled")
        {
            Self::RateLimitExceeded(message.to_string())
        } else if lower.contains("service:unavailable")
            || lower.contains("service:busy")
            || lower.contains("internal error")
        {
            Self::unavailable(transport, message)
        } else {
            Self::ApiError {
                code: 0,
                message: message.to_string(),
            }
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_http_status(status: u16, body: String, transport: TransportKind) -> Self {
        match status {
            401 | 403 => Self::Authentication {
                transport,
                message: body,
            },
            429 => Self::RateLimitExceeded(body),
            500..=599 => Self::unavailable(transport, format!("HTTP {}: {}", status, body)),
            _ => Self::ApiError {
                code: i32::from(status),
                message: body,
            },
        }
    }
}
