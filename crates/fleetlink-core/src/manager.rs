// ── Connection manager ──
//
// Scoped device calls: resolve, admit, open, run, report, close. When a
// call fails because the device could not be reached and its MAC is known,
// the manager asks discovery where the device went and retries once there.
//
// Operations are `Fn` rather than `FnOnce` because a remap retry runs them
// a second time against a fresh connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::admission::AdmissionController;
use crate::config::{ConnectionConfig, UnknownGenerationPolicy};
use crate::connection::{Connector, DeviceConnection, Dialect, ScopedConnection};
use crate::context::{CallContext, Done};
use crate::discovery::{Discovery, NoDiscovery};
use crate::error::CoreError;
use crate::model::{Device, Generation};
use crate::resolver::{ConnectionResolver, GenerationLookup};

/// Runs operations against devices under admission control.
///
/// Cheaply cloneable; clones share the admission state, connector and
/// discovery backend.
#[derive(Clone)]
pub struct ConnectionManager {
    resolver: ConnectionResolver,
    connector: Arc<dyn Connector>,
    discovery: Arc<dyn Discovery>,
    admission: AdmissionController,
    config: ConnectionConfig,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("resolver", &self.resolver)
            .field("admission", &self.admission)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Manager with admission disabled and no discovery backend.
    pub fn new(resolver: ConnectionResolver, connector: Arc<dyn Connector>) -> Self {
        Self {
            resolver,
            connector,
            discovery: Arc::new(NoDiscovery),
            admission: AdmissionController::disabled(),
            config: ConnectionConfig::default(),
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_admission(mut self, admission: AdmissionController) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn resolver(&self) -> &ConnectionResolver {
        &self.resolver
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    // ── Entry points ─────────────────────────────────────────────────

    /// Run `op` over a connection in the dialect matching the device's
    /// stored generation.
    ///
    /// Resolution and admission errors are returned before anything is
    /// opened. Otherwise the connection is closed and the admission outcome
    /// reported on every exit path.
    pub async fn with_connection<T, F, Fut>(
        &self,
        ctx: &CallContext,
        identifier: &str,
        op: F,
    ) -> Result<T, CoreError>
    where
        F: Fn(Arc<dyn DeviceConnection>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, CoreError>> + Send,
        T: Send,
    {
        let device = self.resolver.resolve(identifier)?;
        let dialect = self.dialect_for(&device)?;
        self.scoped(ctx, device, dialect, &op).await
    }

    /// Detect the device's generation (when the resolver can), then run
    /// `gen1_op` over a legacy connection or `gen2_op` over an RPC one.
    ///
    /// A device whose circuit is open is rejected before detection runs.
    pub async fn with_gen_aware_action<T, F1, Fut1, F2, Fut2>(
        &self,
        ctx: &CallContext,
        identifier: &str,
        gen1_op: F1,
        gen2_op: F2,
    ) -> Result<T, CoreError>
    where
        F1: Fn(Arc<dyn DeviceConnection>) -> Fut1 + Send + Sync,
        Fut1: Future<Output = Result<T, CoreError>> + Send,
        F2: Fn(Arc<dyn DeviceConnection>) -> Fut2 + Send + Sync,
        Fut2: Future<Output = Result<T, CoreError>> + Send,
        T: Send,
    {
        // Detection may hit the network; an open circuit rejects first.
        if self.admission.is_enabled() {
            let stored = self.resolver.resolve(identifier)?;
            self.admission.check(stored.circuit_key())?;
        }
        let device = self
            .resolver
            .resolve_with_generation(ctx, identifier, GenerationLookup::Cached)
            .await?;
        match self.dialect_for(&device)? {
            Dialect::Legacy => self.scoped(ctx, device, Dialect::Legacy, &gen1_op).await,
            Dialect::Rpc => self.scoped(ctx, device, Dialect::Rpc, &gen2_op).await,
        }
    }

    /// Like [`with_connection`](Self::with_connection) but always legacy.
    pub async fn with_legacy_connection<T, F, Fut>(
        &self,
        ctx: &CallContext,
        identifier: &str,
        op: F,
    ) -> Result<T, CoreError>
    where
        F: Fn(Arc<dyn DeviceConnection>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, CoreError>> + Send,
        T: Send,
    {
        let device = self.resolver.resolve(identifier)?;
        self.scoped(ctx, device, Dialect::Legacy, &op).await
    }

    /// Like [`with_connection`](Self::with_connection) but always RPC.
    pub async fn with_rpc_connection<T, F, Fut>(
        &self,
        ctx: &CallContext,
        identifier: &str,
        op: F,
    ) -> Result<T, CoreError>
    where
        F: Fn(Arc<dyn DeviceConnection>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, CoreError>> + Send,
        T: Send,
    {
        let device = self.resolver.resolve(identifier)?;
        self.scoped(ctx, device, Dialect::Rpc, &op).await
    }

    // ── Internals ────────────────────────────────────────────────────

    fn dialect_for(&self, device: &Device) -> Result<Dialect, CoreError> {
        match device.generation {
            Generation::Gen1 => Ok(Dialect::Legacy),
            Generation::Rpc(_) => Ok(Dialect::Rpc),
            Generation::Unknown => match self.config.unknown_generation {
                UnknownGenerationPolicy::AssumeRpc => {
                    debug!(device = %device.circuit_key(), "generation unknown, assuming rpc");
                    Ok(Dialect::Rpc)
                }
                UnknownGenerationPolicy::Reject => Err(CoreError::UnknownGeneration {
                    identifier: device.circuit_key().to_owned(),
                }),
            },
        }
    }

    async fn scoped<T, F, Fut>(
        &self,
        ctx: &CallContext,
        device: Device,
        dialect: Dialect,
        op: &F,
    ) -> Result<T, CoreError>
    where
        F: Fn(Arc<dyn DeviceConnection>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, CoreError>> + Send,
        T: Send,
    {
        // Queueing for admission is bounded by the caller's context only;
        // the call budget starts once the call is admitted.
        let permit = self
            .admission
            .acquire(ctx, device.circuit_key(), throttle_generation(&device, dialect))
            .await?;

        let budget = ctx
            .remaining()
            .map_or(self.config.call_timeout, |left| left.min(self.config.call_timeout));
        let call_ctx = ctx.with_timeout(budget);
        let result = self
            .attempt_with_remap(&call_ctx, budget, &device, dialect, op)
            .await;
        permit.complete(result.is_ok());
        result
    }

    async fn attempt_with_remap<T, F, Fut>(
        &self,
        ctx: &CallContext,
        budget: Duration,
        device: &Device,
        dialect: Dialect,
        op: &F,
    ) -> Result<T, CoreError>
    where
        F: Fn(Arc<dyn DeviceConnection>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, CoreError>> + Send,
        T: Send,
    {
        let original = match self.attempt(ctx, budget, device, dialect, op).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !self.config.remap_enabled || !original.is_connection_error() {
            return Err(original);
        }
        let Some(mac) = device.known_mac() else {
            debug!(device = %device.circuit_key(), "unreachable and no MAC on record, not remapping");
            return Err(original);
        };

        let address = match self.discovery.find_by_mac(ctx, mac).await {
            Ok(address) => address,
            Err(e) => {
                debug!(device = %device.circuit_key(), %mac, error = %e, "remap discovery failed");
                return Err(original);
            }
        };
        if address == device.address {
            debug!(device = %device.circuit_key(), %address, "device still at recorded address");
            return Err(original);
        }

        info!(
            device = %device.circuit_key(),
            from = %device.address,
            to = %address,
            "device moved, retrying at discovered address"
        );
        let moved = device.at_address(address);
        match self.attempt(ctx, budget, &moved, dialect, op).await {
            Ok(value) => Ok(value),
            Err(retry) if retry.is_connection_error() => Err(original),
            Err(retry) => Err(retry),
        }
    }

    /// One open + run against `device.address`. The connection is closed
    /// before this returns, whether the op finished, failed or was cut off
    /// by the context.
    async fn attempt<T, F, Fut>(
        &self,
        ctx: &CallContext,
        budget: Duration,
        device: &Device,
        dialect: Dialect,
        op: &F,
    ) -> Result<T, CoreError>
    where
        F: Fn(Arc<dyn DeviceConnection>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, CoreError>> + Send,
        T: Send,
    {
        let run = async {
            let conn = ScopedConnection::new(self.connector.open(device, dialect).await?);
            op(conn.handle()).await
        };
        match ctx.run(run).await {
            Ok(result) => result,
            Err(Done::Canceled) => Err(CoreError::ContextCanceled),
            Err(Done::DeadlineExceeded) => Err(CoreError::Timeout {
                timeout_secs: ceil_secs(budget),
            }),
        }
    }
}

/// Whole seconds, rounded up so a sub-second budget never reads as 0s.
fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Generation to throttle a call under. A forced dialect wins over the
/// stored generation so the call lands in the bucket of the protocol it
/// actually speaks.
fn throttle_generation(device: &Device, dialect: Dialect) -> Generation {
    match (dialect, device.generation) {
        (Dialect::Legacy, _) => Generation::Gen1,
        (Dialect::Rpc, Generation::Gen1) => Generation::Unknown,
        (Dialect::Rpc, generation) => generation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GenerationClass;

    #[test]
    fn forced_dialect_picks_throttle_bucket() {
        let legacy = Device::new("a", "10.0.0.1").with_generation(Generation::Gen1);
        let rpc = Device::new("b", "10.0.0.2").with_generation(Generation::Rpc(2));

        assert_eq!(throttle_generation(&legacy, Dialect::Legacy), Generation::Gen1);
        assert_eq!(
            throttle_generation(&legacy, Dialect::Rpc).class(),
            GenerationClass::Rpc
        );
        assert_eq!(throttle_generation(&rpc, Dialect::Rpc), Generation::Rpc(2));
        assert_eq!(
            throttle_generation(&rpc, Dialect::Legacy).class(),
            GenerationClass::Legacy
        );
    }
}
