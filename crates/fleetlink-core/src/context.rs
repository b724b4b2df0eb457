// ── Call context ──
//
// Cancellation token plus optional deadline, threaded through every
// suspension point (admission waits, connection I/O, pool admission).

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    Canceled,
    DeadlineExceeded,
}

/// Cancellation and deadline for one logical call (or batch).
///
/// Cheap to clone. Derived contexts ([`with_timeout`](Self::with_timeout),
/// [`child`](Self::child)) hold a child token: canceling them leaves the
/// parent untouched, canceling the parent cancels them.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an externally owned token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derived context without a tighter deadline.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derived context whose deadline is the earlier of the current one and
    /// `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derived context whose deadline is the earlier of the current one and
    /// `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Non-blocking check.
    pub fn state(&self) -> Option<Done> {
        if self.token.is_cancelled() {
            Some(Done::Canceled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(Done::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the context is canceled or its deadline passes.
    pub async fn done(&self) -> Done {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => Done::Canceled,
                    () = tokio::time::sleep_until(deadline) => Done::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Done::Canceled
            }
        }
    }

    /// Drive `fut` unless the context finishes first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Done> {
        if let Some(done) = self.state() {
            return Err(done);
        }
        tokio::select! {
            biased;
            done = self.done() => Err(done),
            out = fut => Ok(out),
        }
    }
}
