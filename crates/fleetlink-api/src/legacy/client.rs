// Legacy REST HTTP client
//
// Wraps `reqwest::Client` with device URL construction, basic auth, and
// status/body handling for generation-1 devices. Every endpoint is a GET
// with its arguments in the query string.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::auth::Credentials;
use crate::error::Error;
use crate::transport::{TransportConfig, device_base_url};

/// Raw HTTP client for a generation-1 (legacy REST) device.
///
/// Paths are relative to the device root (`status`, `relay/0`,
/// `settings/sta`). Responses are returned as parsed JSON; the client does
/// not interpret payloads.
pub struct LegacyClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Option<Credentials>,
}

impl LegacyClient {
    /// Create a new legacy client from a `TransportConfig`.
    ///
    /// `address` is the device host (`192.168.1.50`), `host:port`, or a
    /// full `http://` URL.
    pub fn new(
        address: &str,
        credentials: Option<Credentials>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Self::with_client(http, address, credentials)
    }

    /// Create a legacy client with a pre-built `reqwest::Client`.
    pub fn with_client(
        http: reqwest::Client,
        address: &str,
        credentials: Option<Credentials>,
    ) -> Result<Self, Error> {
        Ok(Self {
            http,
            base_url: device_base_url(address)?,
            credentials,
        })
    }

    /// The device base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build a full URL for a device path.
    fn url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// `GET /{path}?{params}` and return the JSON body.
    ///
    /// `params` must be a JSON object (or `None`); nested values are sent
    /// as their JSON text.
    pub async fn call(&self, path: &str, params: Option<&Value>) -> Result<Value, Error> {
        self.get(path, params).await
    }

    /// `GET /{path}?{params}` and deserialize the JSON body into `T`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Option<&Value>,
    ) -> Result<T, Error> {
        let url = self.url(path)?;
        let query = query_pairs(params);
        debug!("GET {url} params={query:?}");

        let mut builder = self.http.get(url).query(&query);
        if let Some(ref creds) = self.credentials {
            builder = creds.apply(builder);
        }
        let resp = builder.send().await.map_err(Error::Transport)?;

        parse_response(resp).await
    }
}

/// Flatten a JSON object into query pairs.
fn query_pairs(params: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Object(map)) = params else {
        return Vec::new();
    };
    map.iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect()
}

/// Map status codes to errors and parse the JSON body.
async fn parse_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(Error::Authentication {
            message: "device requires credentials (HTTP 401)".into(),
        });
    }

    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::LegacyApi {
            message: body.chars().take(200).collect(),
            status: status.as_u16(),
        });
    }

    let body = resp.text().await.map_err(Error::Transport)?;
    serde_json::from_str(&body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        Error::Deserialization {
            message: format!("{e} (body preview: {preview:?})"),
            body: body.clone(),
        }
    })
}
