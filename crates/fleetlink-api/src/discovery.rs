//! mDNS lookup of a device by hardware address.
//!
//! Devices advertise themselves under `_http._tcp.local.` with instance and
//! host names that embed their MAC in bare hex (`plus1-a8032ab12345`).
//! Newer firmware also publishes a `mac` TXT property. A lookup browses for
//! a bounded window and returns the first IPv4/IPv6 address whose
//! advertisement carries the requested MAC.

use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, trace};

use crate::error::Error;

/// Service type browsed for device advertisements.
pub const DEVICE_SERVICE_TYPE: &str = "_http._tcp.local.";

/// Blocking mDNS browser. Each lookup runs on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct MdnsBrowser {
    service_type: String,
}

impl Default for MdnsBrowser {
    fn default() -> Self {
        Self {
            service_type: DEVICE_SERVICE_TYPE.to_owned(),
        }
    }
}

impl MdnsBrowser {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
        }
    }

    /// Browse for up to `window` and return the address of the device with
    /// hardware address `mac` (any common MAC notation).
    pub async fn find_by_mac(&self, mac: &str, window: Duration) -> Result<String, Error> {
        let needle = bare_mac(mac);
        if needle.len() != 12 {
            return Err(Error::Discovery(format!("not a MAC address: {mac}")));
        }
        let service_type = self.service_type.clone();
        let display_mac = mac.to_owned();

        tokio::task::spawn_blocking(move || browse_for(&service_type, &needle, window))
            .await
            .map_err(|e| Error::Discovery(format!("browse task failed: {e}")))?
            .ok_or(Error::NotDiscovered { mac: display_mac })
    }
}

fn browse_for(service_type: &str, needle: &str, window: Duration) -> Option<String> {
    let daemon = match ServiceDaemon::new() {
        Ok(d) => d,
        Err(e) => {
            debug!(error = %e, "mDNS daemon unavailable");
            return None;
        }
    };
    let receiver = match daemon.browse(service_type) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "mDNS browse failed");
            let _ = daemon.shutdown();
            return None;
        }
    };

    let deadline = Instant::now() + window;
    let mut found = None;
    while found.is_none() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                trace!(name = info.get_fullname(), "mDNS service resolved");
                if advertises_mac(&info, needle) {
                    found = info.get_addresses().iter().next().map(ToString::to_string);
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let _ = daemon.stop_browse(service_type);
    let _ = daemon.shutdown();
    found
}

fn advertises_mac(info: &ServiceInfo, needle: &str) -> bool {
    let txt_mac = info.get_property_val_str("mac").map(bare_mac);
    txt_mac.as_deref() == Some(needle)
        || bare_name(info.get_fullname()).contains(needle)
        || bare_name(info.get_hostname()).contains(needle)
}

/// Strip separators and lowercase: `AA:BB:CC:DD:EE:FF` → `aabbccddeeff`.
pub fn bare_mac(mac: &str) -> String {
    mac.chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn bare_name(name: &str) -> String {
    name.to_ascii_lowercase().replace(['-', ':'], "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_mac_accepts_common_notations() {
        assert_eq!(bare_mac("AA:BB:CC:DD:EE:FF"), "aabbccddeeff");
        assert_eq!(bare_mac("aa-bb-cc-dd-ee-ff"), "aabbccddeeff");
        assert_eq!(bare_mac("AABBCCDDEEFF"), "aabbccddeeff");
    }

    #[test]
    fn host_names_embed_the_mac() {
        assert!(bare_name("plus1-A8032AB12345.local.").contains("a8032ab12345"));
    }

    #[tokio::test]
    async fn rejects_malformed_mac_without_browsing() {
        let browser = MdnsBrowser::default();
        let err = browser
            .find_by_mac("not-a-mac", Duration::from_millis(10))
            .await
            .expect_err("malformed MAC");
        assert!(matches!(err, Error::Discovery(_)));
    }
}
