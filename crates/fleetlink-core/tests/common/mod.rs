// Shared fakes for fleetlink-core integration tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use fleetlink_core::{
    CallContext, Connector, CoreError, Credentials, Detection, Device, DeviceConnection, Dialect,
    Discovery, Generation, GenerationDetector, MacAddress,
};

// ── Connector ───────────────────────────────────────────────────────

#[derive(Default)]
struct Network {
    /// Addresses where nothing answers.
    unreachable: HashSet<String>,
    /// Addresses that answer with an API error.
    rejecting: HashSet<String>,
    /// Addresses where opening itself fails.
    refuse_open: HashSet<String>,
    opened: Vec<(String, Dialect)>,
}

/// In-memory connector with scripted reachability.
#[derive(Clone, Default)]
pub struct FakeConnector {
    network: Arc<Mutex<Network>>,
    closes: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(self, address: &str) -> Self {
        self.network.lock().unwrap().unreachable.insert(address.to_owned());
        self
    }

    pub fn rejecting(self, address: &str) -> Self {
        self.network.lock().unwrap().rejecting.insert(address.to_owned());
        self
    }

    pub fn refuse_open(self, address: &str) -> Self {
        self.network.lock().unwrap().refuse_open.insert(address.to_owned());
        self
    }

    pub fn opened(&self) -> Vec<(String, Dialect)> {
        self.network.lock().unwrap().opened.clone()
    }

    pub fn open_count(&self) -> usize {
        self.network.lock().unwrap().opened.len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn open_at(&self, device: &Device, dialect: Dialect) -> Result<Arc<dyn DeviceConnection>, CoreError> {
        let mut network = self.network.lock().unwrap();
        network.opened.push((device.address.clone(), dialect));
        if network.refuse_open.contains(&device.address) {
            return Err(CoreError::ConnectionFailed {
                address: device.address.clone(),
                reason: "no route to host".into(),
            });
        }
        Ok(Arc::new(FakeConnection {
            address: device.address.clone(),
            dialect,
            unreachable: network.unreachable.contains(&device.address),
            rejecting: network.rejecting.contains(&device.address),
            closes: Arc::clone(&self.closes),
        }))
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open_legacy(&self, device: &Device) -> Result<Arc<dyn DeviceConnection>, CoreError> {
        self.open_at(device, Dialect::Legacy)
    }

    async fn open_rpc(&self, device: &Device) -> Result<Arc<dyn DeviceConnection>, CoreError> {
        self.open_at(device, Dialect::Rpc)
    }
}

struct FakeConnection {
    address: String,
    dialect: Dialect,
    unreachable: bool,
    rejecting: bool,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl DeviceConnection for FakeConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, method: &str, _params: Option<Value>) -> Result<Value, CoreError> {
        if self.unreachable {
            return Err(CoreError::ConnectionFailed {
                address: self.address.clone(),
                reason: "connection refused".into(),
            });
        }
        if self.rejecting {
            return Err(CoreError::Api {
                message: format!("{method} not supported"),
                code: Some(404),
            });
        }
        Ok(json!({
            "address": self.address,
            "dialect": self.dialect.to_string(),
            "method": method,
        }))
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Operation that issues one call and returns the address that answered.
pub async fn answering_address(conn: Arc<dyn DeviceConnection>) -> Result<String, CoreError> {
    let body = conn.call("Shelly.GetStatus", None).await?;
    Ok(body["address"].as_str().unwrap_or_default().to_owned())
}

// ── Discovery ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeDiscovery {
    table: HashMap<MacAddress, String>,
    lookups: AtomicUsize,
}

impl FakeDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, mac: &str, address: &str) -> Self {
        self.table.insert(MacAddress::new(mac), address.to_owned());
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discovery for FakeDiscovery {
    async fn find_by_mac(&self, _ctx: &CallContext, mac: &MacAddress) -> Result<String, CoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.table
            .get(mac)
            .cloned()
            .ok_or_else(|| CoreError::DeviceNotFound {
                identifier: mac.to_string(),
            })
    }
}

// ── Detector ────────────────────────────────────────────────────────

/// Detector answering from a fixed address → generation table.
#[derive(Default)]
pub struct FakeDetector {
    table: HashMap<String, Generation>,
    probes: AtomicUsize,
}

impl FakeDetector {
    pub fn with(mut self, address: &str, generation: Generation) -> Self {
        self.table.insert(address.to_owned(), generation);
        self
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationDetector for FakeDetector {
    async fn detect(
        &self,
        _ctx: &CallContext,
        address: &str,
        _auth_hint: Option<&Credentials>,
    ) -> Result<Detection, CoreError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let generation = self.table.get(address).copied().ok_or_else(|| {
            CoreError::ConnectionFailed {
                address: address.to_owned(),
                reason: "connection refused".into(),
            }
        })?;
        Ok(Detection {
            generation,
            mac: None,
            model: None,
            auth_required: false,
        })
    }
}
