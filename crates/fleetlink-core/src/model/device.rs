// ── Device domain types ──

use std::fmt;
use std::str::FromStr;

use fleetlink_api::Credentials;
use serde::{Deserialize, Serialize};

// ── Generation ──────────────────────────────────────────────────────

/// Protocol generation a device speaks.
///
/// Serialized as the bare number the devices themselves report:
/// `0` = unknown, `1` = legacy REST, `2+` = JSON-RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Generation {
    #[default]
    Unknown,
    Gen1,
    Rpc(u8),
}

impl Generation {
    pub fn from_number(n: u8) -> Self {
        match n {
            0 => Self::Unknown,
            1 => Self::Gen1,
            n => Self::Rpc(n),
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Gen1 => 1,
            Self::Rpc(n) => n,
        }
    }

    pub fn is_gen1(self) -> bool {
        matches!(self, Self::Gen1)
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Admission bucket this generation is throttled in.
    ///
    /// Unknown devices share the RPC bucket, matching the default dialect
    /// they are routed to.
    pub fn class(self) -> GenerationClass {
        match self {
            Self::Gen1 => GenerationClass::Legacy,
            Self::Unknown | Self::Rpc(_) => GenerationClass::Rpc,
        }
    }
}

impl From<u8> for Generation {
    fn from(n: u8) -> Self {
        Self::from_number(n)
    }
}

impl From<Generation> for u8 {
    fn from(g: Generation) -> Self {
        g.number()
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            n => write!(f, "gen{}", n.number()),
        }
    }
}

/// The two throttling buckets: generation 1, and everything newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum GenerationClass {
    Legacy,
    Rpc,
}

// ── MacAddress ──────────────────────────────────────────────────────

/// MAC address, normalized to lowercase colon-separated format (aa:bb:cc:dd:ee:ff).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddress(String);

impl MacAddress {
    /// Create a normalized MAC address from any common format.
    /// Accepts colon-separated, dash-separated, or bare hex.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let lowered = raw.as_ref().trim().to_lowercase().replace('-', ":");
        if lowered.len() == 12 && lowered.chars().all(|c| c.is_ascii_hexdigit()) {
            let pairs: Vec<&str> = (0..6).filter_map(|i| lowered.get(i * 2..i * 2 + 2)).collect();
            return Self(pairs.join(":"));
        }
        Self(lowered)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MacAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

// ── Device ──────────────────────────────────────────────────────────

/// A device as known to the registry.
///
/// The core only ever holds a transient copy per call; address changes
/// found during remap recovery are applied to that copy, never written back.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub address: String,
    pub mac: Option<MacAddress>,
    pub generation: Generation,
    pub credentials: Option<Credentials>,
}

impl Device {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            mac: None,
            generation: Generation::Unknown,
            credentials: None,
        }
    }

    pub fn with_mac(mut self, mac: impl AsRef<str>) -> Self {
        let mac = MacAddress::new(mac);
        self.mac = (!mac.is_empty()).then_some(mac);
        self
    }

    pub fn with_generation(mut self, generation: Generation) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Copy of this device pointed at a different address.
    pub fn at_address(&self, address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..self.clone()
        }
    }

    /// Key used for per-device circuit state: the name, or the address for
    /// ad-hoc devices without one.
    pub fn circuit_key(&self) -> &str {
        if self.name.is_empty() {
            &self.address
        } else {
            &self.name
        }
    }

    /// The MAC address, if one is known and non-empty.
    pub fn known_mac(&self) -> Option<&MacAddress> {
        self.mac.as_ref().filter(|m| !m.is_empty())
    }
}
