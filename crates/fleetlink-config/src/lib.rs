//! Configuration for fleetlink.
//!
//! TOML file + `FLEETLINK_` environment overrides, password resolution
//! (env var or plaintext), and translation into the runtime types of
//! `fleetlink_core`: admission limits, connection settings and a static
//! device registry.
//!
//! Nested keys are reached from the environment with a double underscore:
//! `FLEETLINK_ADMISSION__GEN1__MIN_INTERVAL=500ms`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleetlink_api::{Credentials, TransportConfig};
use fleetlink_core::{
    AdmissionConfig, AdmissionController, ConnectionConfig, CoreError, Device, Generation,
    GenerationLimits, GlobalLimits, MacAddress, StaticRegistry, UnknownGenerationPolicy,
};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "FLEETLINK_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── Durations ───────────────────────────────────────────────────────

/// Duration written as a humantime string (`"250ms"`, `"30s"`) or a bare
/// number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDuration", into = "String")]
pub struct HumanDuration(pub Duration);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Text(String),
    Secs(u64),
}

impl TryFrom<RawDuration> for HumanDuration {
    type Error = String;

    fn try_from(raw: RawDuration) -> Result<Self, Self::Error> {
        match raw {
            RawDuration::Secs(secs) => Ok(Self(Duration::from_secs(secs))),
            RawDuration::Text(text) => humantime::parse_duration(text.trim())
                .map(Self)
                .map_err(|e| format!("'{text}' is not a duration: {e}")),
        }
    }
}

impl From<HumanDuration> for String {
    fn from(d: HumanDuration) -> Self {
        d.to_string()
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,

    /// Absent or `enabled = false` means pass-through admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<AdmissionSection>,

    /// Known devices by name.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// Per-call bound covering connect, operation and remap discovery.
    #[serde(default = "default_timeout")]
    pub timeout: HumanDuration,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: HumanDuration,

    /// `"assume-rpc"` or `"reject"`.
    #[serde(default = "default_unknown_generation")]
    pub unknown_generation: String,

    /// Retry at the discovered address when a device has moved.
    #[serde(default = "default_true")]
    pub remap: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            unknown_generation: default_unknown_generation(),
            remap: true,
        }
    }
}

fn default_timeout() -> HumanDuration {
    HumanDuration(fleetlink_core::DEFAULT_CALL_TIMEOUT)
}
fn default_connect_timeout() -> HumanDuration {
    HumanDuration(TransportConfig::default().connect_timeout)
}
fn default_unknown_generation() -> String {
    "assume-rpc".into()
}
fn default_true() -> bool {
    true
}

/// `[admission]` table. Missing keys fall back to the built-in limits.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AdmissionSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub gen1: LimitsSection,

    #[serde(default)]
    pub gen2: LimitsSection,

    #[serde(default)]
    pub global: GlobalSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LimitsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_interval: Option<HumanDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_threshold: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct GlobalSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_open_duration: Option<HumanDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_success_threshold: Option<u32>,
    /// Consecutive failures fleet-wide that open the global circuit; 0 disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_threshold: Option<u32>,
}

/// A `[devices.<name>]` entry.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DeviceEntry {
    /// IP address or hostname, optionally with `:port`.
    pub address: String,

    /// Hardware address; enables remap recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    /// 1 = legacy REST, 2+ = JSON-RPC. Absent or 0 = detect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password (plaintext; prefer `password_env`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Environment variable holding the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "fleetlink", "fleetlink").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("fleetlink");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Layered sources: built-in defaults, then the TOML file, then env.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load from the canonical path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + environment. A missing file is not an error.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = figment(path).extract()?;
    config.validate()?;
    Ok(config)
}

/// Load config, returning a default if it cannot be read.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation to runtime types ────────────────────────────────────

impl Config {
    /// Check everything that extraction alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_unknown_policy(&self.defaults.unknown_generation)?;
        if self.defaults.timeout.0.is_zero() {
            return Err(invalid("defaults.timeout", "must be greater than zero"));
        }
        self.admission_config()?;
        for (name, entry) in &self.devices {
            entry.to_device(name)?;
        }
        Ok(())
    }

    /// Admission limits, or `None` when admission is off.
    pub fn admission_config(&self) -> Result<Option<AdmissionConfig>, ConfigError> {
        let Some(section) = self.admission.as_ref().filter(|a| a.enabled) else {
            return Ok(None);
        };

        let config = AdmissionConfig {
            legacy: section
                .gen1
                .apply("admission.gen1", GenerationLimits::legacy_defaults())?,
            rpc: section
                .gen2
                .apply("admission.gen2", GenerationLimits::rpc_defaults())?,
            global: section.global.apply()?,
        };
        Ok(Some(config))
    }

    /// Controller built from [`admission_config`](Self::admission_config).
    pub fn admission_controller(&self) -> Result<AdmissionController, ConfigError> {
        match self.admission_config()? {
            Some(config) => Ok(AdmissionController::new(config)?),
            None => Ok(AdmissionController::disabled()),
        }
    }

    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        Ok(ConnectionConfig {
            call_timeout: self.defaults.timeout.0,
            unknown_generation: parse_unknown_policy(&self.defaults.unknown_generation)?,
            remap_enabled: self.defaults.remap,
        })
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            timeout: self.defaults.timeout.0,
            connect_timeout: self.defaults.connect_timeout.0,
        }
    }

    /// Registry of every `[devices.*]` entry.
    pub fn registry(&self) -> Result<StaticRegistry, ConfigError> {
        let devices = self
            .devices
            .iter()
            .map(|(name, entry)| entry.to_device(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StaticRegistry::new(devices))
    }
}

fn parse_unknown_policy(raw: &str) -> Result<UnknownGenerationPolicy, ConfigError> {
    match raw {
        "assume-rpc" => Ok(UnknownGenerationPolicy::AssumeRpc),
        "reject" => Ok(UnknownGenerationPolicy::Reject),
        other => Err(invalid(
            "defaults.unknown_generation",
            format!("expected 'assume-rpc' or 'reject', got '{other}'"),
        )),
    }
}

impl LimitsSection {
    fn apply(&self, table: &str, base: GenerationLimits) -> Result<GenerationLimits, ConfigError> {
        let limits = GenerationLimits {
            min_interval: self.min_interval.map_or(base.min_interval, |d| d.0),
            max_concurrent: self.max_concurrent.unwrap_or(base.max_concurrent),
            circuit_threshold: self.circuit_threshold.unwrap_or(base.circuit_threshold),
        };
        if limits.max_concurrent == 0 {
            return Err(invalid(format!("{table}.max_concurrent"), "must be at least 1"));
        }
        if limits.circuit_threshold == 0 {
            return Err(invalid(format!("{table}.circuit_threshold"), "must be at least 1"));
        }
        Ok(limits)
    }
}

impl GlobalSection {
    fn apply(&self) -> Result<GlobalLimits, ConfigError> {
        let base = GlobalLimits::default();
        let limits = GlobalLimits {
            max_concurrent: self.max_concurrent.unwrap_or(base.max_concurrent),
            circuit_open_duration: self
                .circuit_open_duration
                .map_or(base.circuit_open_duration, |d| d.0),
            circuit_success_threshold: self
                .circuit_success_threshold
                .unwrap_or(base.circuit_success_threshold),
            circuit_threshold: self.circuit_threshold.unwrap_or(base.circuit_threshold),
        };
        if limits.max_concurrent == 0 {
            return Err(invalid("admission.global.max_concurrent", "must be at least 1"));
        }
        if limits.circuit_success_threshold == 0 {
            return Err(invalid(
                "admission.global.circuit_success_threshold",
                "must be at least 1",
            ));
        }
        Ok(limits)
    }
}

impl DeviceEntry {
    /// Build the core `Device` for `[devices.<name>]`.
    pub fn to_device(&self, name: &str) -> Result<Device, ConfigError> {
        let field = |key: &str| format!("devices.{name}.{key}");

        if self.address.trim().is_empty() {
            return Err(invalid(field("address"), "must not be empty"));
        }
        let mut device = Device::new(name, self.address.trim())
            .with_generation(Generation::from_number(self.generation.unwrap_or(0)));

        if let Some(raw) = &self.mac {
            let mac = MacAddress::new(raw);
            let hex_digits = mac.as_str().chars().filter(char::is_ascii_hexdigit).count();
            if hex_digits != 12 || mac.as_str().len() != 17 {
                return Err(invalid(field("mac"), format!("'{raw}' is not a MAC address")));
            }
            device.mac = Some(mac);
        }

        if let Some(password) = self.resolve_password(name)? {
            let Some(username) = self.username.clone() else {
                return Err(invalid(field("username"), "required when a password is set"));
            };
            device = device.with_credentials(Credentials { username, password });
        }
        Ok(device)
    }

    /// Password from `password_env` first, then plaintext.
    fn resolve_password(&self, name: &str) -> Result<Option<SecretString>, ConfigError> {
        if let Some(env_name) = &self.password_env {
            return match std::env::var(env_name) {
                Ok(value) => Ok(Some(SecretString::from(value))),
                Err(_) if self.password.is_some() => {
                    Ok(self.password.clone().map(SecretString::from))
                }
                Err(_) => Err(invalid(
                    format!("devices.{name}.password_env"),
                    format!("environment variable '{env_name}' is not set"),
                )),
            };
        }
        Ok(self.password.clone().map(SecretString::from))
    }
}
