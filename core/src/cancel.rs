//! Cooperative cancellation (§5).
//!
//! Upstream's cancellation handle is a `GCancellable`: a GObject that can be
//! shared, cloned by reference, and polled or connected to a callback.
//! Nothing here needs the signal/callback half of that API -- every
//! long-running primitive in this crate is synchronous and polls for
//! cancellation itself between filesystem operations -- so this is a plain
//! `Arc<AtomicBool>` handle instead (§9 "GObject properties" redesign
//! reasoning, applied to `GCancellable` the same way it was applied to the
//! bootloader backend hierarchy).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// A shareable cancellation flag, checked between filesystem operations by
/// the writer and cleanup passes.
///
/// Cloning shares the same underlying flag: cancelling any clone cancels all
/// of them. The default token is never cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`Self::cancel`] has been called on this token or a clone of it.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return [`Error::Cancelled`] if cancellation has been requested,
    /// otherwise `Ok(())`. Called between filesystem operations by
    /// long-running primitives (§5).
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_is_observed_through_clone() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}
