// ── Identifier resolution ──
//
// Turns whatever the caller passed (device name or address) into a Device.
// The resolver's capability is fixed when it is built: a Basic resolver
// never probes, a GenerationAware one can.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::context::CallContext;
use crate::detect::GenerationDetector;
use crate::error::CoreError;
use crate::model::{Device, Generation};

/// Static device lookup. No network I/O.
pub trait DeviceRegistry: Send + Sync {
    fn resolve(&self, identifier: &str) -> Result<Device, CoreError>;
}

/// Whether a generation-aware lookup may reuse what it already knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationLookup {
    /// Use the stored or cached generation; probe only when it is unknown.
    #[default]
    Cached,
    /// Probe even when a generation is known.
    Refresh,
}

/// Registry that can fill in a device's generation by probing it.
#[async_trait]
pub trait GenerationAwareRegistry: DeviceRegistry {
    async fn resolve_with_generation(
        &self,
        ctx: &CallContext,
        identifier: &str,
        lookup: GenerationLookup,
    ) -> Result<Device, CoreError>;
}

/// Resolver handed to the connection manager.
#[derive(Clone)]
pub enum ConnectionResolver {
    Basic(Arc<dyn DeviceRegistry>),
    GenerationAware(Arc<dyn GenerationAwareRegistry>),
}

impl ConnectionResolver {
    pub fn resolve(&self, identifier: &str) -> Result<Device, CoreError> {
        match self {
            Self::Basic(registry) => registry.resolve(identifier),
            Self::GenerationAware(registry) => registry.resolve(identifier),
        }
    }

    /// Resolve with detection where supported; a Basic resolver answers
    /// with the stored record.
    pub async fn resolve_with_generation(
        &self,
        ctx: &CallContext,
        identifier: &str,
        lookup: GenerationLookup,
    ) -> Result<Device, CoreError> {
        match self {
            Self::Basic(registry) => registry.resolve(identifier),
            Self::GenerationAware(registry) => {
                registry.resolve_with_generation(ctx, identifier, lookup).await
            }
        }
    }

    pub fn is_generation_aware(&self) -> bool {
        matches!(self, Self::GenerationAware(_))
    }
}

impl std::fmt::Debug for ConnectionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic(_) => f.write_str("ConnectionResolver::Basic"),
            Self::GenerationAware(_) => f.write_str("ConnectionResolver::GenerationAware"),
        }
    }
}

// ── StaticRegistry ──────────────────────────────────────────────────

/// In-memory registry.
///
/// Lookup order: exact name, then address, then (for identifiers shaped
/// like an IP address or a dotted hostname, with an optional port) an
/// ad-hoc device of unknown generation keyed by its address.
#[derive(Debug, Default, Clone)]
pub struct StaticRegistry {
    devices: Vec<Device>,
    by_name: HashMap<String, usize>,
}

impl StaticRegistry {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        let mut registry = Self::default();
        for device in devices {
            registry.insert(device);
        }
        registry
    }

    /// Add or replace a device by name.
    pub fn insert(&mut self, device: Device) {
        if let Some(&idx) = self.by_name.get(&device.name) {
            if let Some(slot) = self.devices.get_mut(idx) {
                *slot = device;
            }
            return;
        }
        self.by_name.insert(device.name.clone(), self.devices.len());
        self.devices.push(device);
    }

    pub fn get(&self, name: &str) -> Option<&Device> {
        self.by_name.get(name).and_then(|&idx| self.devices.get(idx))
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceRegistry for StaticRegistry {
    fn resolve(&self, identifier: &str) -> Result<Device, CoreError> {
        let identifier = identifier.trim();
        if let Some(device) = self.get(identifier) {
            return Ok(device.clone());
        }
        if let Some(device) = self.devices.iter().find(|d| d.address == identifier) {
            return Ok(device.clone());
        }
        if looks_like_address(identifier) {
            debug!(identifier, "resolving unregistered address as ad-hoc device");
            return Ok(Device::new("", identifier));
        }
        Err(CoreError::DeviceNotFound {
            identifier: identifier.to_owned(),
        })
    }
}

/// IP literal or dotted hostname, optionally with `:port`.
fn looks_like_address(identifier: &str) -> bool {
    if identifier.parse::<IpAddr>().is_ok() {
        return true;
    }
    let host = match identifier.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => identifier,
    };
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    host.contains('.')
        && host.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

// ── DetectingRegistry ───────────────────────────────────────────────

/// Adds generation detection to any [`DeviceRegistry`].
///
/// Detected generations are cached per device so repeat calls skip the
/// probe. A failed probe falls back to the stored record; only
/// cancellation is propagated.
pub struct DetectingRegistry {
    registry: Arc<dyn DeviceRegistry>,
    detector: Arc<dyn GenerationDetector>,
    detected: DashMap<String, Generation>,
}

impl DetectingRegistry {
    pub fn new(registry: Arc<dyn DeviceRegistry>, detector: Arc<dyn GenerationDetector>) -> Self {
        Self {
            registry,
            detector,
            detected: DashMap::new(),
        }
    }

    /// Generation learned by an earlier probe, if any.
    pub fn cached_generation(&self, device_key: &str) -> Option<Generation> {
        self.detected.get(device_key).map(|g| *g.value())
    }
}

impl DeviceRegistry for DetectingRegistry {
    fn resolve(&self, identifier: &str) -> Result<Device, CoreError> {
        let mut device = self.registry.resolve(identifier)?;
        if !device.generation.is_known() {
            if let Some(generation) = self.cached_generation(device.circuit_key()) {
                device.generation = generation;
            }
        }
        Ok(device)
    }
}

#[async_trait]
impl GenerationAwareRegistry for DetectingRegistry {
    async fn resolve_with_generation(
        &self,
        ctx: &CallContext,
        identifier: &str,
        lookup: GenerationLookup,
    ) -> Result<Device, CoreError> {
        let mut device = self.resolve(identifier)?;
        if lookup == GenerationLookup::Cached && device.generation.is_known() {
            return Ok(device);
        }

        match self
            .detector
            .detect(ctx, &device.address, device.credentials.as_ref())
            .await
        {
            Ok(detection) => {
                device.generation = detection.generation;
                if device.known_mac().is_none() {
                    device.mac = detection.mac;
                }
                self.detected
                    .insert(device.circuit_key().to_owned(), detection.generation);
            }
            Err(CoreError::ContextCanceled) => return Err(CoreError::ContextCanceled),
            Err(e) => {
                warn!(
                    device = %device.circuit_key(),
                    error = %e,
                    "generation probe failed, using stored record"
                );
            }
        }
        Ok(device)
    }
}
