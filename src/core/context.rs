//! Cancellation Context
//!
//! A cloneable cancellation scope shared by the stream, the bridge and the
//! simulation loop. Cancellation is signalled through a `watch` channel in the
//! same way the server fans out its shutdown signal; an optional deadline makes
//! the scope expire on its own.
//!
//! Callers race `ctx.cancelled()` inside `tokio::select!` at every await point
//! and use the returned [`CancelReason`] to tell an explicit cancel apart from
//! an expired deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Cancelled explicitly through a [`CancelHandle`].
    Canceled,
    /// The context deadline elapsed.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Canceled => write!(f, "context canceled"),
            CancelReason::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

/// Cancellation scope.
#[derive(Debug, Clone)]
pub struct Context {
    signal: Arc<watch::Sender<bool>>,
    deadline: Option<Instant>,
}

/// Cancels every clone of the [`Context`] it was created with.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl Context {
    /// A context that is never cancelled.
    pub fn background() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
            deadline: None,
        }
    }

    /// A context plus the handle that cancels it.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let ctx = Self::background();
        let handle = CancelHandle {
            signal: ctx.signal.clone(),
        };
        (ctx, handle)
    }

    /// A context that expires after `timeout`, plus its cancel handle.
    pub fn with_timeout(timeout: Duration) -> (Self, CancelHandle) {
        let (mut ctx, handle) = Self::with_cancel();
        ctx.deadline = Some(Instant::now() + timeout);
        (ctx, handle)
    }

    /// Deadline of this context, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Reason the context stopped, or `None` while it is still live.
    pub fn err(&self) -> Option<CancelReason> {
        if *self.signal.borrow() {
            return Some(CancelReason::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) -> CancelReason {
        if let Some(reason) = self.err() {
            return reason;
        }

        let mut rx = self.signal.subscribe();
        let flagged = async move {
            // The sender lives in `self`, so `wait_for` only returns once flagged.
            let _ = rx.wait_for(|cancelled| *cancelled).await;
        };

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = flagged => CancelReason::Canceled,
                    _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
                }
            }
            None => {
                flagged.await;
                CancelReason::Canceled
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl CancelHandle {
    /// Cancel the context. Idempotent.
    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }
}

// =============================================================================
// TESTS
// =============================================================================
