// ── Runtime admission and connection configuration ──
//
// These types describe *how* calls are admitted and connections made.
// They never touch disk: fleetlink-config (or any embedder) constructs them
// and hands them in.

use std::time::Duration;

use crate::error::CoreError;
use crate::model::GenerationClass;

/// Default per-call timeout when the caller supplies no tighter deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Throttle and circuit settings for one generation bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationLimits {
    /// Minimum gap between the starts of two calls in this bucket.
    pub min_interval: Duration,
    /// Calls of this bucket allowed in flight at once.
    pub max_concurrent: usize,
    /// Consecutive failures that open a device's circuit.
    pub circuit_threshold: u32,
}

impl GenerationLimits {
    /// Conservative defaults for legacy REST devices, which handle one
    /// request at a time and fall over when flooded.
    pub fn legacy_defaults() -> Self {
        Self {
            min_interval: Duration::from_millis(250),
            max_concurrent: 2,
            circuit_threshold: 3,
        }
    }

    pub fn rpc_defaults() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_concurrent: 4,
            circuit_threshold: 5,
        }
    }
}

/// Process-wide ceiling and circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalLimits {
    pub max_concurrent: usize,
    /// How long any circuit stays open before a probe is allowed.
    pub circuit_open_duration: Duration,
    /// Consecutive probe successes that close a half-open circuit.
    pub circuit_success_threshold: u32,
    /// Consecutive failures across all devices that open the global
    /// circuit. `0` disables it.
    pub circuit_threshold: u32,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            circuit_open_duration: Duration::from_secs(30),
            circuit_success_threshold: 2,
            circuit_threshold: 0,
        }
    }
}

/// Full admission configuration. Absence of one (see
/// [`AdmissionController::disabled`](crate::AdmissionController::disabled))
/// means pass-through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    pub legacy: GenerationLimits,
    pub rpc: GenerationLimits,
    pub global: GlobalLimits,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            legacy: GenerationLimits::legacy_defaults(),
            rpc: GenerationLimits::rpc_defaults(),
            global: GlobalLimits::default(),
        }
    }
}

impl AdmissionConfig {
    pub fn limits(&self, class: GenerationClass) -> &GenerationLimits {
        match class {
            GenerationClass::Legacy => &self.legacy,
            GenerationClass::Rpc => &self.rpc,
        }
    }

    /// Reject settings that would deadlock or never open a circuit.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (class, limits) in [
            (GenerationClass::Legacy, &self.legacy),
            (GenerationClass::Rpc, &self.rpc),
        ] {
            if limits.max_concurrent == 0 {
                return Err(CoreError::Config {
                    message: format!("{class}.max_concurrent must be at least 1"),
                });
            }
            if limits.circuit_threshold == 0 {
                return Err(CoreError::Config {
                    message: format!("{class}.circuit_threshold must be at least 1"),
                });
            }
        }
        if self.global.max_concurrent == 0 {
            return Err(CoreError::Config {
                message: "global.max_concurrent must be at least 1".into(),
            });
        }
        if self.global.circuit_success_threshold == 0 {
            return Err(CoreError::Config {
                message: "global.circuit_success_threshold must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// What to do with a device whose generation is still unknown after
/// resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownGenerationPolicy {
    /// Route it to the JSON-RPC dialect. Legacy devices reliably report
    /// themselves as generation 1, so an unknown device is most likely new.
    #[default]
    AssumeRpc,
    /// Fail the call with [`CoreError::UnknownGeneration`].
    Reject,
}

/// Settings for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on connect + operation + remap discovery, counted from
    /// admission, when the caller's context has no tighter deadline.
    pub call_timeout: Duration,
    pub unknown_generation: UnknownGenerationPolicy,
    /// Attempt address-remap recovery on connection failures.
    pub remap_enabled: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            unknown_generation: UnknownGenerationPolicy::default(),
            remap_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AdmissionConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = AdmissionConfig::default();
        config.rpc.max_concurrent = 0;
        let err = config.validate().expect_err("invalid");
        assert!(err.to_string().contains("rpc.max_concurrent"));
    }

    #[test]
    fn limits_select_bucket() {
        let config = AdmissionConfig::default();
        assert_eq!(config.limits(GenerationClass::Legacy).max_concurrent, 2);
        assert_eq!(config.limits(GenerationClass::Rpc).max_concurrent, 4);
    }
}
