// ── Core error types ──
//
// Caller-facing errors from fleetlink-core. The `From<fleetlink_api::Error>`
// impl translates transport-layer errors into this taxonomy and applies
// connection-failure classification at the boundary, so remap decisions
// never need to look at HTTP details.

use std::fmt;

use thiserror::Error;

/// Which circuit rejected a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitScope {
    /// The process-wide circuit.
    Global,
    /// A single device's circuit, by circuit key.
    Device(String),
}

impl fmt::Display for CircuitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Device(key) => write!(f, "device '{key}'"),
        }
    }
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Resolution errors ────────────────────────────────────────────
    #[error("Device not found: {identifier}")]
    DeviceNotFound { identifier: String },

    #[error("Generation of device '{identifier}' is unknown; detect it before calling")]
    UnknownGeneration { identifier: String },

    // ── Admission errors ─────────────────────────────────────────────
    #[error("Call canceled while waiting for admission")]
    ContextCanceled,

    #[error("Circuit open for {scope}")]
    CircuitOpen { scope: CircuitScope },

    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to device at {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Device call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// HTTP status or RPC error code, when the device supplied one.
        code: Option<i64>,
    },

    #[error("Operation failed: {message}")]
    Operation { message: String },

    // ── Batch errors ─────────────────────────────────────────────────
    #[error("Fleet parallelism must be at least 1")]
    InvalidParallelism,

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for an operation failure with a message.
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
        }
    }

    /// Returns `true` if the device could not be reached.
    ///
    /// Typed variants decide directly. Errors produced by caller operations
    /// carry only text, so those fall back to message matching.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } | Self::Timeout { .. } => true,
            Self::Operation { message } | Self::Internal(message) => {
                fleetlink_api::error::is_connection_message(message)
            }
            _ => false,
        }
    }

    /// Returns `true` for admission rejections (circuit open or canceled).
    pub fn is_admission_error(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::ContextCanceled)
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<fleetlink_api::Error> for CoreError {
    fn from(err: fleetlink_api::Error) -> Self {
        if err.is_connection_error() {
            return match err {
                fleetlink_api::Error::Timeout { timeout_secs } => Self::Timeout { timeout_secs },
                fleetlink_api::Error::ConnectionFailed { address, reason } => {
                    Self::ConnectionFailed { address, reason }
                }
                fleetlink_api::Error::Transport(ref e) => Self::ConnectionFailed {
                    address: e
                        .url()
                        .and_then(|u| u.host_str().map(String::from))
                        .unwrap_or_else(|| "<unknown>".into()),
                    reason: e.to_string(),
                },
                other => Self::ConnectionFailed {
                    address: "<unknown>".into(),
                    reason: other.to_string(),
                },
            };
        }

        match err {
            fleetlink_api::Error::Authentication { message } => {
                Self::AuthenticationFailed { message }
            }
            fleetlink_api::Error::Rpc { code: 401, message } => {
                Self::AuthenticationFailed { message }
            }
            fleetlink_api::Error::Rpc { code, message } => Self::Api {
                message,
                code: Some(code),
            },
            fleetlink_api::Error::LegacyApi { message, status } => Self::Api {
                message,
                code: Some(i64::from(status)),
            },
            fleetlink_api::Error::Transport(e) => Self::Api {
                message: e.to_string(),
                code: e.status().map(|s| i64::from(s.as_u16())),
            },
            fleetlink_api::Error::InvalidUrl(e) => Self::Config {
                message: format!("Invalid device address: {e}"),
            },
            fleetlink_api::Error::Deserialization { message, body: _ } => {
                Self::Internal(format!("Deserialization error: {message}"))
            }
            fleetlink_api::Error::Discovery(reason) => {
                Self::Internal(format!("Discovery error: {reason}"))
            }
            fleetlink_api::Error::NotDiscovered { mac } => Self::DeviceNotFound { identifier: mac },
            fleetlink_api::Error::Timeout { timeout_secs } => Self::Timeout { timeout_secs },
            fleetlink_api::Error::ConnectionFailed { address, reason } => {
                Self::ConnectionFailed { address, reason }
            }
        }
    }
}
