// ── Admission control ──
//
// Gatekeeper in front of every device call. Check order:
//   1. global circuit         (fast reject)
//   2. device circuit         (fast reject)
//   3. global concurrency     (wait)
//   4. generation concurrency (wait)
//   5. generation pacing      (wait)
//
// Every wait races the caller's context. The permit handed back owns the
// slots and probe claims and releases them exactly once.

mod circuit;
mod lane;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::AdmissionConfig;
use crate::context::CallContext;
use crate::error::{CircuitScope, CoreError};
use crate::model::{Generation, GenerationClass};

pub use circuit::{CircuitSnapshot, CircuitState};

use circuit::{Circuit, Thresholds, Ticket};
use lane::Lane;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Rate limiter and circuit breaker shared by every call in the process.
///
/// Cheap to clone; clones share state. Built from an [`AdmissionConfig`],
/// or [`disabled`](Self::disabled) for pass-through.
#[derive(Clone, Default)]
pub struct AdmissionController {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    config: AdmissionConfig,
    global_slots: Arc<Semaphore>,
    global_circuit: Mutex<Circuit>,
    legacy: Lane,
    rpc: Lane,
    devices: DashMap<String, Arc<Mutex<Circuit>>>,
}

impl Inner {
    fn lane(&self, class: GenerationClass) -> &Lane {
        match class {
            GenerationClass::Legacy => &self.legacy,
            GenerationClass::Rpc => &self.rpc,
        }
    }

    fn global_enabled(&self) -> bool {
        self.config.global.circuit_threshold > 0
    }

    fn device_circuit(&self, key: &str) -> Arc<Mutex<Circuit>> {
        if let Some(existing) = self.devices.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.devices
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(Circuit::default())))
                .value(),
        )
    }

    fn thresholds(&self, failures: u32) -> Thresholds {
        Thresholds {
            failures,
            successes: self.config.global.circuit_success_threshold,
            open_duration: self.config.global.circuit_open_duration,
        }
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            None => f.write_str("AdmissionController(disabled)"),
            Some(inner) => f
                .debug_struct("AdmissionController")
                .field("config", &inner.config)
                .field("devices", &inner.devices.len())
                .finish_non_exhaustive(),
        }
    }
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let inner = Inner {
            global_slots: Arc::new(Semaphore::new(config.global.max_concurrent)),
            global_circuit: Mutex::new(Circuit::default()),
            legacy: Lane::new(config.legacy.clone()),
            rpc: Lane::new(config.rpc.clone()),
            devices: DashMap::new(),
            config,
        };
        Ok(Self {
            inner: Some(Arc::new(inner)),
        })
    }

    /// Pass-through controller: admits everything immediately.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn config(&self) -> Option<&AdmissionConfig> {
        self.inner.as_deref().map(|i| &i.config)
    }

    /// Global concurrency ceiling, when admission is enabled.
    pub fn max_concurrent(&self) -> Option<usize> {
        self.config().map(|c| c.global.max_concurrent)
    }

    /// Calls currently holding a global slot.
    pub fn in_flight(&self) -> usize {
        self.inner.as_deref().map_or(0, |i| {
            i.config.global.max_concurrent - i.global_slots.available_permits()
        })
    }

    /// State of a device's circuit, if it has seen any traffic.
    pub fn snapshot(&self, device_key: &str) -> Option<CircuitSnapshot> {
        let inner = self.inner.as_deref()?;
        let circuit = inner.devices.get(device_key)?;
        let snapshot = lock(circuit.value()).snapshot();
        Some(snapshot)
    }

    pub fn global_snapshot(&self) -> Option<CircuitSnapshot> {
        self.inner
            .as_deref()
            .map(|i| lock(&i.global_circuit).snapshot())
    }

    /// Fast, non-claiming check of the global and device circuits.
    ///
    /// Returns the [`CoreError::CircuitOpen`] that [`acquire`](Self::acquire)
    /// would return right now. Nothing is reserved, so a later `acquire`
    /// can still reject.
    pub fn check(&self, device_key: &str) -> Result<(), CoreError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let now = Instant::now();
        let open_duration = inner.config.global.circuit_open_duration;

        if inner.global_enabled() && !lock(&inner.global_circuit).would_admit(now, open_duration) {
            return Err(CoreError::CircuitOpen {
                scope: CircuitScope::Global,
            });
        }
        let rejected = inner
            .devices
            .get(device_key)
            .is_some_and(|c| !lock(c.value()).would_admit(now, open_duration));
        if rejected {
            return Err(CoreError::CircuitOpen {
                scope: CircuitScope::Device(device_key.to_owned()),
            });
        }
        Ok(())
    }

    /// Wait for permission to call `device_key`.
    ///
    /// Open circuits reject immediately with [`CoreError::CircuitOpen`];
    /// concurrency and pacing waits end with [`CoreError::ContextCanceled`]
    /// if `ctx` is canceled or its deadline passes first.
    pub async fn acquire(
        &self,
        ctx: &CallContext,
        device_key: &str,
        generation: Generation,
    ) -> Result<AdmissionPermit, CoreError> {
        let Some(inner) = &self.inner else {
            return Ok(AdmissionPermit::pass_through());
        };
        if ctx.state().is_some() {
            return Err(CoreError::ContextCanceled);
        }

        let class = generation.class();
        let now = Instant::now();
        let open_duration = inner.config.global.circuit_open_duration;

        let global_ticket = if inner.global_enabled() {
            let ticket = lock(&inner.global_circuit).try_admit(now, open_duration);
            let Some(ticket) = ticket else {
                debug!("global circuit open, rejecting call to {device_key}");
                return Err(CoreError::CircuitOpen {
                    scope: CircuitScope::Global,
                });
            };
            if ticket == Ticket::Probe {
                debug!("global circuit half-open, {device_key} is the probe");
            }
            Some(ticket)
        } else {
            None
        };

        let circuit = inner.device_circuit(device_key);
        let ticket = lock(&circuit).try_admit(now, open_duration);
        let Some(ticket) = ticket else {
            if let Some(global) = global_ticket {
                lock(&inner.global_circuit).abandon(global);
            }
            debug!("circuit open for {device_key}, rejecting");
            return Err(CoreError::CircuitOpen {
                scope: CircuitScope::Device(device_key.to_owned()),
            });
        };
        if ticket == Ticket::Probe {
            debug!("circuit half-open for {device_key}, admitting probe");
        }

        // From here on the permit owns both circuit claims, so an early
        // return through `?` hands them back via Drop.
        let mut permit = AdmissionPermit {
            state: Some(Held {
                inner: Arc::clone(inner),
                device_key: device_key.to_owned(),
                class,
                global_ticket,
                device: (circuit, ticket),
                slots: Vec::with_capacity(2),
            }),
        };

        permit.hold(lane::acquire(ctx, &inner.global_slots).await?);
        let lane = inner.lane(class);
        permit.hold(lane.acquire_slot(ctx).await?);
        lane.pace(ctx).await?;
        Ok(permit)
    }
}

// ── Permit ──────────────────────────────────────────────────────────

struct Held {
    inner: Arc<Inner>,
    device_key: String,
    class: GenerationClass,
    global_ticket: Option<Ticket>,
    device: (Arc<Mutex<Circuit>>, Ticket),
    /// Global and generation slots; freed when dropped.
    slots: Vec<OwnedSemaphorePermit>,
}

impl Held {
    fn record(self, success: bool) {
        let now = Instant::now();
        let inner = &self.inner;
        let device_threshold = inner.lane(self.class).limits().circuit_threshold;

        let (circuit, ticket) = &self.device;
        let changed = lock(circuit).record(*ticket, success, now, inner.thresholds(device_threshold));
        log_transition(&format!("device '{}'", self.device_key), changed);

        if let Some(ticket) = self.global_ticket {
            let threshold = inner.config.global.circuit_threshold;
            let changed =
                lock(&inner.global_circuit).record(ticket, success, now, inner.thresholds(threshold));
            log_transition("global", changed);
        }
    }

    fn abandon(self) {
        let (circuit, ticket) = &self.device;
        lock(circuit).abandon(*ticket);
        if let Some(ticket) = self.global_ticket {
            lock(&self.inner.global_circuit).abandon(ticket);
        }
    }
}

fn log_transition(scope: &str, changed: Option<CircuitState>) {
    match changed {
        Some(CircuitState::Open) => warn!("{scope} circuit opened"),
        Some(state) => debug!("{scope} circuit now {state}"),
        None => {}
    }
}

/// Proof of admission for one call.
///
/// [`complete`](Self::complete) reports the outcome and releases the slots.
/// Dropping without completing releases everything without touching the
/// circuits, except while unwinding from a panic, which counts as a failure.
#[must_use = "an admission permit should be completed with the call outcome"]
pub struct AdmissionPermit {
    state: Option<Held>,
}

impl AdmissionPermit {
    fn pass_through() -> Self {
        Self { state: None }
    }

    fn hold(&mut self, slot: OwnedSemaphorePermit) {
        if let Some(held) = self.state.as_mut() {
            held.slots.push(slot);
        }
    }

    /// `true` for permits from a disabled controller.
    pub fn is_pass_through(&self) -> bool {
        self.state.is_none()
    }

    /// Report the call outcome and release the slots.
    pub fn complete(mut self, success: bool) {
        if let Some(held) = self.state.take() {
            held.record(success);
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(held) = self.state.take() {
            if std::thread::panicking() {
                held.record(false);
            } else {
                held.abandon();
            }
        }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            None => f.write_str("AdmissionPermit(pass-through)"),
            Some(held) => f
                .debug_struct("AdmissionPermit")
                .field("device", &held.device_key)
                .field("class", &held.class)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{GenerationLimits, GlobalLimits};

    fn config() -> AdmissionConfig {
        AdmissionConfig {
            legacy: GenerationLimits {
                min_interval: Duration::ZERO,
                max_concurrent: 2,
                circuit_threshold: 2,
            },
            rpc: GenerationLimits {
                min_interval: Duration::ZERO,
                max_concurrent: 4,
                circuit_threshold: 3,
            },
            global: GlobalLimits {
                max_concurrent: 8,
                circuit_open_duration: Duration::from_secs(30),
                circuit_success_threshold: 1,
                circuit_threshold: 0,
            },
        }
    }

    #[tokio::test]
    async fn disabled_controller_passes_everything() {
        let admission = AdmissionController::disabled();
        let permit = admission
            .acquire(&CallContext::new(), "any", Generation::Gen1)
            .await
            .expect("admitted");
        assert!(permit.is_pass_through());
        permit.complete(false);
        assert!(admission.snapshot("any").is_none());
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn legacy_devices_use_legacy_threshold() {
        let admission = AdmissionController::new(config()).expect("valid");
        let ctx = CallContext::new();
        for _ in 0..2 {
            admission
                .acquire(&ctx, "kitchen", Generation::Gen1)
                .await
                .expect("closed")
                .complete(false);
        }
        let err = admission
            .acquire(&ctx, "kitchen", Generation::Gen1)
            .await
            .expect_err("open");
        assert!(matches!(
            err,
            CoreError::CircuitOpen { scope: CircuitScope::Device(ref k) } if k == "kitchen"
        ));
    }

    #[tokio::test]
    async fn dropped_permit_frees_slots_without_outcome() {
        let admission = AdmissionController::new(config()).expect("valid");
        let ctx = CallContext::new();
        let permit = admission
            .acquire(&ctx, "porch", Generation::Rpc(2))
            .await
            .expect("admitted");
        assert_eq!(admission.in_flight(), 1);
        drop(permit);
        assert_eq!(admission.in_flight(), 0);
        let snapshot = admission.snapshot("porch").expect("tracked");
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut bad = config();
        bad.global.max_concurrent = 0;
        assert!(AdmissionController::new(bad).is_err());
    }
}
