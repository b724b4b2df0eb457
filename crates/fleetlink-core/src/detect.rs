// ── Generation detection ──

use async_trait::async_trait;
use fleetlink_api::{Credentials, TransportConfig};
use tracing::debug;

use crate::context::{CallContext, Done};
use crate::error::CoreError;
use crate::model::{Generation, MacAddress};

/// Result of probing a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub generation: Generation,
    /// Hardware address, when the device reports one.
    pub mac: Option<MacAddress>,
    pub model: Option<String>,
    pub auth_required: bool,
}

impl Detection {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_gen1(&self) -> bool {
        self.generation.is_gen1()
    }
}

impl From<fleetlink_api::DeviceIdentity> for Detection {
    fn from(identity: fleetlink_api::DeviceIdentity) -> Self {
        Self {
            generation: Generation::from_number(identity.generation.max(1)),
            mac: identity.mac.as_deref().map(MacAddress::new),
            model: identity.model,
            auth_required: identity.auth_required,
        }
    }
}

#[async_trait]
pub trait GenerationDetector: Send + Sync {
    /// Probe `address`. `auth_hint` carries credentials the registry holds
    /// for the device, for detectors whose probe needs them.
    async fn detect(
        &self,
        ctx: &CallContext,
        address: &str,
        auth_hint: Option<&Credentials>,
    ) -> Result<Detection, CoreError>;
}

/// Detector built on the unauthenticated identity endpoint.
#[derive(Clone)]
pub struct HttpGenerationDetector {
    http: reqwest::Client,
}

impl HttpGenerationDetector {
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
impl GenerationDetector for HttpGenerationDetector {
    async fn detect(
        &self,
        ctx: &CallContext,
        address: &str,
        auth_hint: Option<&Credentials>,
    ) -> Result<Detection, CoreError> {
        let identity = match ctx.run(fleetlink_api::probe::identify(&self.http, address)).await {
            Ok(result) => result?,
            Err(Done::Canceled) => return Err(CoreError::ContextCanceled),
            Err(Done::DeadlineExceeded) => {
                return Err(CoreError::Timeout {
                    timeout_secs: 0,
                });
            }
        };
        let detection = Detection::from(identity);
        if detection.auth_required && auth_hint.is_none() {
            debug!(address, "device requires auth but no credentials are configured");
        }
        debug!(address, generation = %detection.generation, "detected device generation");
        Ok(detection)
    }
}
