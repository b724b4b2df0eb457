// fleetlink-core: Admission control, circuit breaking and address-remap
// recovery between fleetlink-api and consumers.

pub mod admission;
pub mod config;
pub mod connection;
pub mod context;
pub mod detect;
pub mod discovery;
pub mod error;
pub mod fleet;
pub mod manager;
pub mod model;
pub mod resolver;

// ── Primary re-exports ──────────────────────────────────────────────
pub use admission::{AdmissionController, AdmissionPermit, CircuitSnapshot, CircuitState};
pub use config::{
    AdmissionConfig, ConnectionConfig, DEFAULT_CALL_TIMEOUT, GenerationLimits, GlobalLimits,
    UnknownGenerationPolicy,
};
pub use connection::{Connector, DeviceConnection, Dialect, HttpConnector, ScopedConnection};
pub use context::{CallContext, Done};
pub use detect::{Detection, GenerationDetector, HttpGenerationDetector};
pub use discovery::{Discovery, MdnsDiscovery, NoDiscovery};
pub use error::{CircuitScope, CoreError};
pub use fleet::{DeviceResult, FleetDispatcher};
pub use manager::ConnectionManager;
pub use model::{Device, Generation, GenerationClass, MacAddress};
pub use resolver::{
    ConnectionResolver, DetectingRegistry, DeviceRegistry, GenerationAwareRegistry,
    GenerationLookup, StaticRegistry,
};

// Credentials live in the transport crate; re-export so embedders need one import.
pub use fleetlink_api::Credentials;
