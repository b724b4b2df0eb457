// ── Per-generation lane: concurrency slots + start pacing ──

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::GenerationLimits;
use crate::context::CallContext;
use crate::error::CoreError;

pub(crate) struct Lane {
    limits: GenerationLimits,
    slots: Arc<Semaphore>,
    /// Earliest instant the next call in this lane may start.
    next_start: Mutex<Option<Instant>>,
}

impl Lane {
    pub(crate) fn new(limits: GenerationLimits) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limits.max_concurrent)),
            limits,
            next_start: Mutex::new(None),
        }
    }

    pub(crate) fn limits(&self) -> &GenerationLimits {
        &self.limits
    }

    pub(crate) async fn acquire_slot(
        &self,
        ctx: &CallContext,
    ) -> Result<OwnedSemaphorePermit, CoreError> {
        acquire(ctx, &self.slots).await
    }

    /// Reserve a start instant at least `min_interval` after the previous
    /// reservation, then wait for it.
    ///
    /// The reservation is taken before waiting, so concurrent callers queue
    /// up one interval apart instead of all waking at once. A caller that is
    /// canceled mid-wait forfeits its slot; the gap only ever grows.
    pub(crate) async fn pace(&self, ctx: &CallContext) -> Result<(), CoreError> {
        let interval = self.limits.min_interval;
        if interval.is_zero() {
            return Ok(());
        }

        let now = Instant::now();
        let start = {
            let mut next = self.next_start.lock().unwrap_or_else(PoisonError::into_inner);
            let start = next.filter(|t| *t > now).unwrap_or(now);
            *next = Some(start + interval);
            start
        };

        if start > now {
            ctx.run(tokio::time::sleep_until(start))
                .await
                .map_err(|_| CoreError::ContextCanceled)?;
        }
        Ok(())
    }
}

/// Wait for a semaphore slot unless the context finishes first.
pub(crate) async fn acquire(
    ctx: &CallContext,
    slots: &Arc<Semaphore>,
) -> Result<OwnedSemaphorePermit, CoreError> {
    match ctx.run(Arc::clone(slots).acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_closed)) => Err(CoreError::Internal("admission semaphore closed".into())),
        Err(_) => Err(CoreError::ContextCanceled),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn lane(interval_ms: u64, max: usize) -> Lane {
        Lane::new(GenerationLimits {
            min_interval: Duration::from_millis(interval_ms),
            max_concurrent: max,
            circuit_threshold: 3,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_starts_are_spaced() {
        let lane = lane(250, 2);
        let ctx = CallContext::new();

        let t0 = Instant::now();
        lane.pace(&ctx).await.expect("first");
        assert_eq!(Instant::now(), t0, "first call waits for nothing");

        lane.pace(&ctx).await.expect("second");
        assert!(Instant::now() - t0 >= Duration::from_millis(250));

        lane.pace(&ctx).await.expect("third");
        assert!(Instant::now() - t0 >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_lane_does_not_wait() {
        let lane = lane(100, 1);
        let ctx = CallContext::new();
        lane.pace(&ctx).await.expect("first");
        tokio::time::advance(Duration::from_secs(1)).await;

        let before = Instant::now();
        lane.pace(&ctx).await.expect("second");
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_wait_honours_cancellation() {
        let lane = lane(10_000, 1);
        let ctx = CallContext::new();
        lane.pace(&ctx).await.expect("first");

        let short = ctx.with_timeout(Duration::from_millis(10));
        let err = lane.pace(&short).await.expect_err("should stop waiting");
        assert!(matches!(err, CoreError::ContextCanceled));
    }

    #[tokio::test]
    async fn slot_wait_honours_cancellation() {
        let lane = lane(0, 1);
        let ctx = CallContext::new();
        let _held = lane.acquire_slot(&ctx).await.expect("slot");

        let waiting = ctx.child();
        waiting.cancel();
        let err = lane.acquire_slot(&waiting).await.expect_err("canceled");
        assert!(matches!(err, CoreError::ContextCanceled));
    }
}
