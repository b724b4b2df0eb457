// fleetlink-api: Async Rust clients for embedded IoT devices (Legacy REST + JSON-RPC)

pub mod auth;
pub mod discovery;
pub mod error;
pub mod legacy;
pub mod probe;
pub mod rpc;
pub mod transport;

pub use auth::Credentials;
pub use discovery::MdnsBrowser;
pub use error::Error;
pub use legacy::LegacyClient;
pub use probe::DeviceIdentity;
pub use rpc::RpcClient;
pub use transport::TransportConfig;
