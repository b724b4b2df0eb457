use thiserror::Error;

/// Top-level error type for the `fleetlink-api` crate.
///
/// Covers every failure mode across both device dialects:
/// authentication, transport, legacy REST, JSON-RPC, and discovery.
/// `fleetlink-core` maps these into caller-facing errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Device rejected the request (HTTP 401 or an auth-required RPC error).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The device could not be reached at all.
    #[error("connection failed: {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    // ── Legacy API ──────────────────────────────────────────────────
    /// Non-success status from a legacy REST endpoint.
    #[error("Legacy API error (HTTP {status}): {message}")]
    LegacyApi { message: String, status: u16 },

    // ── JSON-RPC ────────────────────────────────────────────────────
    /// Error frame returned by an RPC device.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Discovery ───────────────────────────────────────────────────
    /// mDNS daemon could not be started or browsed.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// No device with the given MAC answered within the browse window.
    #[error("No device with MAC {mac} found on the local network")]
    NotDiscovered { mac: String },
}

/// Message fragments that identify a connection-level failure when the
/// transport only hands back text.
const CONNECTION_ERROR_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection failed",
    "network is unreachable",
    "host is unreachable",
    "no route to host",
    "no such host",
    "name or service not known",
    "failed to lookup address",
    "dns error",
    "timed out",
    "i/o timeout",
    "deadline exceeded",
    "error trying to connect",
];

/// Returns `true` if `message` looks like a connection failure.
///
/// Fallback for errors that arrive without a typed transport cause.
pub fn is_connection_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    CONNECTION_ERROR_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

impl Error {
    /// Returns `true` if the device could not be reached (refused,
    /// unreachable, timeout, DNS/route failure).
    ///
    /// Typed transport errors are classified directly; anything else falls
    /// back to matching the rendered message.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Transport(e) => {
                e.is_connect() || e.is_timeout() || is_connection_message(&e.to_string())
            }
            Self::Timeout { .. } | Self::ConnectionFailed { .. } => true,
            Self::Authentication { .. }
            | Self::InvalidUrl(_)
            | Self::LegacyApi { .. }
            | Self::Rpc { .. }
            | Self::Deserialization { .. }
            | Self::Discovery(_)
            | Self::NotDiscovered { .. } => false,
        }
    }

    /// Returns `true` if this error indicates the credentials were rejected.
    pub fn is_auth_error(&self) -> bool {
        match self {
            Self::Authentication { .. } => true,
            Self::Rpc { code, .. } => *code == 401,
            Self::LegacyApi { status, .. } => *status == 401,
            _ => false,
        }
    }

    /// The HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            Self::LegacyApi { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_refusal_and_timeouts() {
        assert!(is_connection_message("dial tcp 192.168.1.50:80: connect: connection refused"));
        assert!(is_connection_message("operation timed out"));
        assert!(is_connection_message("No route to host (os error 113)"));
        assert!(is_connection_message("lookup kitchen.lan: no such host"));
        assert!(is_connection_message("Connection failed"));
    }

    #[test]
    fn ignores_protocol_failures() {
        assert!(!is_connection_message("401 Unauthorized"));
        assert!(!is_connection_message("method not found"));
    }

    #[test]
    fn typed_variants_are_classified() {
        let err = Error::ConnectionFailed {
            address: "10.0.0.2".into(),
            reason: "boom".into(),
        };
        assert!(err.is_connection_error());
        assert!(Error::Timeout { timeout_secs: 3 }.is_connection_error());

        let rpc = Error::Rpc {
            code: 401,
            message: "connection refused".into(),
        };
        assert!(!rpc.is_connection_error());
        assert!(rpc.is_auth_error());
    }
}
