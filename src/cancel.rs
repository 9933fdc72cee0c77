//! Cooperative cancellation.
//!
//! A [`CancellationToken`] carries a one-shot reason: once [`cancel`] is
//! called, every subsequent [`checkpoint`] call (anywhere the token was
//! cloned to) fails with [`CancelledError`]. Cancellation never aborts a
//! step mid-instruction; it only takes effect at the next checkpoint, which
//! steps are expected to call at their own suspension points.
//!
//! [`cancel`]: CancellationToken::cancel
//! [`checkpoint`]: CancellationToken::checkpoint

use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::RwLock;
use thiserror::Error;

/// Raised by [`CancellationToken::checkpoint`] once the token has been
/// cancelled.
#[derive(Debug, Error, Diagnostic, Clone, PartialEq, Eq)]
#[error("pipeline cancelled: {reason}")]
#[diagnostic(code(workweave::cancel::cancelled))]
pub struct CancelledError {
    pub reason: String,
}

#[derive(Debug, Default)]
struct Inner {
    reason: RwLock<Option<String>>,
}

/// Cheaply cloneable cooperative-cancellation handle.
///
/// Cloning shares the same underlying flag, so cancelling any clone
/// cancels every other clone derived from the same [`CancellationToken::new`]
/// call.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token. Idempotent: the first reason wins, later calls are
    /// no-ops so the original cause is preserved.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut slot = self.inner.reason.write();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.read().is_some()
    }

    /// Fail with [`CancelledError`] if the token has been cancelled,
    /// otherwise return `Ok(())`. Steps call this at suspension points to
    /// observe cancellation cooperatively.
    pub fn checkpoint(&self) -> Result<(), CancelledError> {
        match self.inner.reason.read().clone() {
            Some(reason) => Err(CancelledError { reason }),
            None => Ok(()),
        }
    }
}
