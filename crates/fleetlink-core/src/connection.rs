// ── Device connections ──
//
// A connection is a dialect-specific handle to one device address. The
// manager opens one per scoped call and closes it on every exit path via
// `ScopedConnection`; connections are never shared between calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use fleetlink_api::{LegacyClient, RpcClient, TransportConfig};
use serde_json::Value;
use tracing::trace;

use crate::error::CoreError;
use crate::model::{Device, GenerationClass};

/// Wire dialect a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Dialect {
    /// Generation-1 REST: `method` is a URL path, params go in the query.
    Legacy,
    /// Generation-2+ JSON-RPC: `method` is an RPC method name.
    Rpc,
}

impl From<GenerationClass> for Dialect {
    fn from(class: GenerationClass) -> Self {
        match class {
            GenerationClass::Legacy => Self::Legacy,
            GenerationClass::Rpc => Self::Rpc,
        }
    }
}

/// An open handle to one device.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Address this connection was opened against.
    fn address(&self) -> &str;

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CoreError>;

    /// Release the connection. Called exactly once by the owning scope.
    fn close(&self);
}

/// Opens connections in either dialect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open_legacy(&self, device: &Device) -> Result<Arc<dyn DeviceConnection>, CoreError>;

    async fn open_rpc(&self, device: &Device) -> Result<Arc<dyn DeviceConnection>, CoreError>;

    async fn open(
        &self,
        device: &Device,
        dialect: Dialect,
    ) -> Result<Arc<dyn DeviceConnection>, CoreError> {
        match dialect {
            Dialect::Legacy => self.open_legacy(device).await,
            Dialect::Rpc => self.open_rpc(device).await,
        }
    }
}

// ── ScopedConnection ────────────────────────────────────────────────

/// Owns a connection for the length of one scope and closes it on drop.
pub struct ScopedConnection {
    conn: Arc<dyn DeviceConnection>,
}

impl ScopedConnection {
    pub fn new(conn: Arc<dyn DeviceConnection>) -> Self {
        Self { conn }
    }

    /// Handle passed to caller operations. Outliving the scope is allowed
    /// but the connection will already be closed.
    pub fn handle(&self) -> Arc<dyn DeviceConnection> {
        Arc::clone(&self.conn)
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        self.conn.close();
    }
}

// ── HTTP implementation ─────────────────────────────────────────────

/// [`Connector`] over the HTTP clients in `fleetlink-api`.
///
/// One `reqwest::Client` (and its pool) is shared by every connection this
/// connector opens.
#[derive(Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
}

impl HttpConnector {
    pub fn new(transport: &TransportConfig) -> Result<Self, CoreError> {
        Ok(Self {
            http: transport.build_client()?,
        })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn open_legacy(&self, device: &Device) -> Result<Arc<dyn DeviceConnection>, CoreError> {
        let client =
            LegacyClient::with_client(self.http.clone(), &device.address, device.credentials.clone())?;
        trace!(address = %device.address, "opened legacy connection");
        Ok(Arc::new(HttpConnection {
            address: device.address.clone(),
            client: HttpClient::Legacy(client),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_rpc(&self, device: &Device) -> Result<Arc<dyn DeviceConnection>, CoreError> {
        let client =
            RpcClient::with_client(self.http.clone(), &device.address, device.credentials.clone())?;
        trace!(address = %device.address, "opened rpc connection");
        Ok(Arc::new(HttpConnection {
            address: device.address.clone(),
            client: HttpClient::Rpc(client),
            closed: AtomicBool::new(false),
        }))
    }
}

enum HttpClient {
    Legacy(LegacyClient),
    Rpc(RpcClient),
}

struct HttpConnection {
    address: String,
    client: HttpClient,
    closed: AtomicBool,
}

#[async_trait]
impl DeviceConnection for HttpConnection {
    fn dialect(&self) -> Dialect {
        match self.client {
            HttpClient::Legacy(_) => Dialect::Legacy,
            HttpClient::Rpc(_) => Dialect::Rpc,
        }
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Internal(format!(
                "call '{method}' on closed connection to {}",
                self.address
            )));
        }
        let value = match &self.client {
            HttpClient::Legacy(client) => client.call(method, params.as_ref()).await?,
            HttpClient::Rpc(client) => client.call(method, params.as_ref()).await?,
        };
        Ok(value)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            trace!(address = %self.address, dialect = %self.dialect(), "closed connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct CountingConnection {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeviceConnection for CountingConnection {
        fn dialect(&self) -> Dialect {
            Dialect::Rpc
        }

        fn address(&self) -> &str {
            "10.0.0.1"
        }

        async fn call(&self, _method: &str, _params: Option<Value>) -> Result<Value, CoreError> {
            Ok(Value::Null)
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn scope_closes_once_on_drop() {
        let closes = Arc::new(AtomicUsize::new(0));
        let scoped = ScopedConnection::new(Arc::new(CountingConnection {
            closes: Arc::clone(&closes),
        }));
        let handle = scoped.handle();
        drop(scoped);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        drop(handle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_http_connection_refuses_calls() {
        let connector = HttpConnector::with_client(reqwest::Client::new());
        let conn = connector
            .open_rpc(&Device::new("porch", "127.0.0.1:9"))
            .await
            .expect("open is lazy");
        assert_eq!(conn.dialect(), Dialect::Rpc);
        conn.close();
        let err = conn.call("Shelly.GetStatus", None).await.expect_err("closed");
        assert!(matches!(err, CoreError::Internal(_)));
    }

    #[test]
    fn dialect_follows_generation_class() {
        assert_eq!(Dialect::from(GenerationClass::Legacy), Dialect::Legacy);
        assert_eq!(Dialect::from(GenerationClass::Rpc), Dialect::Rpc);
    }
}
