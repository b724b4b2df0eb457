// Shared transport configuration for building reqwest::Client instances.
//
// Both the Legacy and RPC clients share timeout and user-agent settings
// through this module, avoiding duplicated builder logic.

use std::time::Duration;

use crate::error::Error;

const USER_AGENT: &str = concat!("fleetlink/", env!("CARGO_PKG_VERSION"));

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Whole-request timeout.
    pub timeout: Duration,
    /// TCP connect timeout. Embedded devices either answer quickly or not
    /// at all, so this is kept well below `timeout`.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(Error::Transport)
    }

    /// Override the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Build the `http://{address}/` base URL for a device.
///
/// Accepts bare hosts (`192.168.1.50`), `host:port`, or a full URL.
pub fn device_base_url(address: &str) -> Result<url::Url, Error> {
    let trimmed = address.trim().trim_end_matches('/');
    let raw = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        format!("{trimmed}/")
    } else {
        format!("http://{trimmed}/")
    };
    Ok(url::Url::parse(&raw)?)
}
