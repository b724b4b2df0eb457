// ── Fleet dispatch ──
//
// Fan a per-device operation out over many devices with a bounded worker
// pool. A batch never fails because one device did: every identifier gets
// exactly one `DeviceResult`, including devices whose task panicked or
// never started because the batch was canceled.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::connection::DeviceConnection;
use crate::context::CallContext;
use crate::error::CoreError;
use crate::manager::ConnectionManager;

/// Outcome for one device in a batch.
#[derive(Debug)]
pub struct DeviceResult<T> {
    /// The identifier the caller passed for this device.
    pub device: String,
    pub outcome: Result<T, CoreError>,
}

impl<T> DeviceResult<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub fn count_successes<T>(results: &[DeviceResult<T>]) -> usize {
    results.iter().filter(|r| r.is_success()).count()
}

pub fn count_failures<T>(results: &[DeviceResult<T>]) -> usize {
    results.len() - count_successes(results)
}

/// Failed devices with their errors, in result order.
pub fn failures<T>(results: &[DeviceResult<T>]) -> Vec<(&str, &CoreError)> {
    results
        .iter()
        .filter_map(|r| r.outcome.as_ref().err().map(|e| (r.device.as_str(), e)))
        .collect()
}

/// Order results by device identifier (results arrive in completion order).
pub fn sort_by_device<T>(results: &mut [DeviceResult<T>]) {
    results.sort_by(|a, b| a.device.cmp(&b.device));
}

// ── FleetDispatcher ─────────────────────────────────────────────────

/// Runs operations across a fleet through a shared [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct FleetDispatcher {
    manager: ConnectionManager,
}

impl FleetDispatcher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Worker count actually used for a requested parallelism: never more
    /// than the global admission ceiling, since extra workers would only
    /// queue inside admission.
    pub fn effective_parallelism(&self, requested: usize) -> Result<usize, CoreError> {
        if requested == 0 {
            return Err(CoreError::InvalidParallelism);
        }
        Ok(self
            .manager
            .admission()
            .max_concurrent()
            .map_or(requested, |max| requested.min(max)))
    }

    /// [`ConnectionManager::with_connection`] for every identifier.
    pub async fn run_all<T, F, Fut, I, S>(
        &self,
        ctx: &CallContext,
        identifiers: I,
        parallelism: usize,
        op: F,
    ) -> Result<Vec<DeviceResult<T>>, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Arc<dyn DeviceConnection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
        T: Send + 'static,
    {
        let manager = self.manager.clone();
        let op = Arc::new(op);
        self.dispatch(ctx, identifiers, parallelism, move |ctx, id| {
            let manager = manager.clone();
            let op = Arc::clone(&op);
            async move { manager.with_connection(&ctx, &id, |conn| (*op)(conn)).await }
        })
        .await
    }

    /// [`ConnectionManager::with_gen_aware_action`] for every identifier.
    pub async fn run_all_gen_aware<T, F1, Fut1, F2, Fut2, I, S>(
        &self,
        ctx: &CallContext,
        identifiers: I,
        parallelism: usize,
        gen1_op: F1,
        gen2_op: F2,
    ) -> Result<Vec<DeviceResult<T>>, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F1: Fn(Arc<dyn DeviceConnection>) -> Fut1 + Send + Sync + 'static,
        Fut1: Future<Output = Result<T, CoreError>> + Send + 'static,
        F2: Fn(Arc<dyn DeviceConnection>) -> Fut2 + Send + Sync + 'static,
        Fut2: Future<Output = Result<T, CoreError>> + Send + 'static,
        T: Send + 'static,
    {
        let manager = self.manager.clone();
        let ops = Arc::new((gen1_op, gen2_op));
        self.dispatch(ctx, identifiers, parallelism, move |ctx, id| {
            let manager = manager.clone();
            let ops = Arc::clone(&ops);
            async move {
                manager
                    .with_gen_aware_action(&ctx, &id, |conn| (ops.0)(conn), |conn| (ops.1)(conn))
                    .await
            }
        })
        .await
    }

    /// Run `op` for every identifier in the same bounded pool, without
    /// opening a connection.
    pub async fn run_each<T, F, Fut, I, S>(
        &self,
        ctx: &CallContext,
        identifiers: I,
        parallelism: usize,
        op: F,
    ) -> Result<Vec<DeviceResult<T>>, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
        T: Send + 'static,
    {
        self.dispatch(ctx, identifiers, parallelism, move |ctx, id| {
            let work = op(id);
            async move {
                ctx.run(work)
                    .await
                    .unwrap_or(Err(CoreError::ContextCanceled))
            }
        })
        .await
    }

    async fn dispatch<T, W, Fut, I, S>(
        &self,
        ctx: &CallContext,
        identifiers: I,
        parallelism: usize,
        work: W,
    ) -> Result<Vec<DeviceResult<T>>, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        W: Fn(CallContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
        T: Send + 'static,
    {
        let limit = self.effective_parallelism(parallelism)?;
        let identifiers: Vec<String> = identifiers.into_iter().map(Into::into).collect();
        debug!(devices = identifiers.len(), workers = limit, "dispatching fleet batch");

        let slots = Arc::new(Semaphore::new(limit));
        let mut results = Vec::with_capacity(identifiers.len());
        let mut reported = vec![false; identifiers.len()];
        let mut tasks = JoinSet::new();

        for (index, id) in identifiers.iter().enumerate() {
            let slot = match ctx.run(Arc::clone(&slots).acquire_owned()).await {
                Ok(Ok(slot)) => slot,
                Ok(Err(_)) | Err(_) => {
                    reported[index] = true;
                    results.push(DeviceResult {
                        device: id.clone(),
                        outcome: Err(CoreError::ContextCanceled),
                    });
                    continue;
                }
            };

            let fut = work(ctx.child(), id.clone());
            let device = id.clone();
            tasks.spawn(async move {
                let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(payload) => Err(CoreError::Internal(format!(
                        "operation panicked: {}",
                        panic_message(payload.as_ref())
                    ))),
                };
                drop(slot);
                (index, DeviceResult { device, outcome })
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if let Some(flag) = reported.get_mut(index) {
                        *flag = true;
                    }
                    results.push(result);
                }
                Err(e) => warn!(error = %e, "fleet worker did not finish"),
            }
        }

        // Workers that died without reporting (aborted at runtime shutdown).
        for (id, _) in identifiers.into_iter().zip(reported).filter(|(_, done)| !done) {
            results.push(DeviceResult {
                device: id,
                outcome: Err(CoreError::Internal("worker task aborted".into())),
            });
        }

        debug!(
            ok = count_successes(&results),
            failed = count_failures(&results),
            "fleet batch finished"
        );
        Ok(results)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(device: &str, ok: bool) -> DeviceResult<()> {
        DeviceResult {
            device: device.to_owned(),
            outcome: if ok {
                Ok(())
            } else {
                Err(CoreError::operation(format!("{device} failed")))
            },
        }
    }

    #[test]
    fn aggregation_helpers() {
        let mut results = vec![
            result("porch", true),
            result("attic", false),
            result("kitchen", true),
        ];
        assert_eq!(count_successes(&results), 2);
        assert_eq!(count_failures(&results), 1);

        let failed = failures(&results);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "attic");

        sort_by_device(&mut results);
        let order: Vec<_> = results.iter().map(|r| r.device.as_str()).collect();
        assert_eq!(order, ["attic", "kitchen", "porch"]);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
