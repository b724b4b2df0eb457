// ── MAC-keyed discovery ──
//
// Used only by remap recovery: given a device's hardware address, find the
// network address it currently answers on.

use std::time::Duration;

use async_trait::async_trait;
use fleetlink_api::MdnsBrowser;
use tracing::debug;

use crate::context::{CallContext, Done};
use crate::error::CoreError;
use crate::model::MacAddress;

/// Longest single mDNS browse, even when the caller allows more.
const DEFAULT_BROWSE_WINDOW: Duration = Duration::from_secs(3);

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Current address of the device with `mac`.
    async fn find_by_mac(&self, ctx: &CallContext, mac: &MacAddress) -> Result<String, CoreError>;
}

/// Discovery that never finds anything. Remap recovery always gives up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiscovery;

#[async_trait]
impl Discovery for NoDiscovery {
    async fn find_by_mac(&self, _ctx: &CallContext, mac: &MacAddress) -> Result<String, CoreError> {
        Err(CoreError::DeviceNotFound {
            identifier: mac.to_string(),
        })
    }
}

/// mDNS browse on the local link.
#[derive(Debug, Clone)]
pub struct MdnsDiscovery {
    browser: MdnsBrowser,
    max_window: Duration,
}

impl Default for MdnsDiscovery {
    fn default() -> Self {
        Self {
            browser: MdnsBrowser::default(),
            max_window: DEFAULT_BROWSE_WINDOW,
        }
    }
}

impl MdnsDiscovery {
    pub fn new(browser: MdnsBrowser) -> Self {
        Self {
            browser,
            ..Self::default()
        }
    }

    pub fn with_max_window(mut self, window: Duration) -> Self {
        self.max_window = window;
        self
    }

    /// Browse window: the configured maximum, shortened to whatever the
    /// context has left.
    fn window(&self, ctx: &CallContext) -> Duration {
        ctx.remaining()
            .map_or(self.max_window, |left| left.min(self.max_window))
    }
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn find_by_mac(&self, ctx: &CallContext, mac: &MacAddress) -> Result<String, CoreError> {
        let window = self.window(ctx);
        if window.is_zero() {
            return Err(CoreError::Timeout {
                timeout_secs: 0,
            });
        }
        debug!(%mac, ?window, "browsing mDNS for device");
        match ctx.run(self.browser.find_by_mac(mac.as_str(), window)).await {
            Ok(found) => Ok(found?),
            Err(Done::Canceled) => Err(CoreError::ContextCanceled),
            Err(Done::DeadlineExceeded) => Err(CoreError::Timeout {
                timeout_secs: window.as_secs(),
            }),
        }
    }
}
