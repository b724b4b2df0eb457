// Device identity probe.
//
// Every device, whatever its generation, answers an unauthenticated
// `GET /shelly` with a small identity document. Generation 2+ devices
// include a numeric `gen` field; generation-1 devices never do.

use serde::Deserialize;
use tracing::debug;

use crate::error::Error;
use crate::transport::device_base_url;

const IDENTITY_PATH: &str = "shelly";

/// Identity document as returned by either generation.
#[derive(Debug, Clone, Deserialize)]
struct RawIdentity {
    #[serde(default)]
    r#gen: Option<u8>,
    #[serde(default)]
    mac: Option<String>,
    /// Legacy devices report their model as `type`.
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    model: Option<String>,
    /// Legacy auth flag.
    #[serde(default)]
    auth: Option<bool>,
    /// RPC auth flag.
    #[serde(default)]
    auth_en: Option<bool>,
}

/// What a device says about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Protocol generation: 1 for legacy REST, 2+ for JSON-RPC.
    pub generation: u8,
    /// Bare uppercase hex MAC as reported by the device, if present.
    pub mac: Option<String>,
    pub model: Option<String>,
    pub auth_required: bool,
}

impl DeviceIdentity {
    pub fn is_gen1(&self) -> bool {
        self.generation <= 1
    }
}

impl From<RawIdentity> for DeviceIdentity {
    fn from(raw: RawIdentity) -> Self {
        Self {
            generation: raw.r#gen.filter(|g| *g >= 2).unwrap_or(1),
            mac: raw.mac,
            model: raw.model.or(raw.kind),
            auth_required: raw.auth_en.or(raw.auth).unwrap_or(false),
        }
    }
}

/// Probe the device at `address` for its identity document.
pub async fn identify(http: &reqwest::Client, address: &str) -> Result<DeviceIdentity, Error> {
    let url = device_base_url(address)?.join(IDENTITY_PATH)?;
    debug!("probing identity at {url}");

    let resp = http.get(url).send().await.map_err(Error::Transport)?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::LegacyApi {
            message: format!("identity probe rejected for {address}"),
            status: status.as_u16(),
        });
    }

    let body = resp.text().await.map_err(Error::Transport)?;
    let raw: RawIdentity = serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: format!("identity document: {e}"),
        body: body.clone(),
    })?;

    let identity = DeviceIdentity::from(raw);
    debug!(address, generation = identity.generation, "identified device");
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(value: serde_json::Value) -> DeviceIdentity {
        DeviceIdentity::from(serde_json::from_value::<RawIdentity>(value).expect("valid doc"))
    }

    #[test]
    fn legacy_document_is_gen1() {
        let id = parse(json!({
            "type": "SHSW-1",
            "mac": "A4CF12F45431",
            "auth": true,
            "fw": "20230913-112003/v1.14.0-gcb84623",
        }));
        assert!(id.is_gen1());
        assert_eq!(id.model.as_deref(), Some("SHSW-1"));
        assert!(id.auth_required);
    }

    #[test]
    fn rpc_document_reports_generation() {
        let id = parse(json!({
            "id": "plus1-a8032ab12345",
            "mac": "A8032AB12345",
            "model": "SNSW-001X16EU",
            "gen": 3,
            "auth_en": false,
        }));
        assert_eq!(id.generation, 3);
        assert!(!id.is_gen1());
        assert!(!id.auth_required);
    }
}
