//! Cancellation context (`Cx`).
//!
//! Long-running operations (change folding, the commit tree walk) call
//! [`Cx::checkpoint`] at bounded intervals; cancellation is delivered
//! cooperatively by any clone of the context. The commit pipeline's publish
//! window runs under [`Cx::masked`], where checkpoints succeed even after a
//! cancel request, so a half-published revision is never abandoned between
//! the rename and the `current` bump.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use fsvn_error::{FsfsError, Result};

#[derive(Debug, Default)]
struct CxInner {
    cancel_requested: AtomicBool,
    mask_depth: AtomicU32,
}

/// Shared cancellation context. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    inner: Arc<CxInner>,
}

impl Cx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::Release);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    /// Check for cancellation at a yield point.
    ///
    /// Returns `Ok(())` when not cancelled or when inside a masked section.
    pub fn checkpoint(&self) -> Result<()> {
        if !self.inner.cancel_requested.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.inner.mask_depth.load(Ordering::Acquire) > 0 {
            return Ok(());
        }
        Err(FsfsError::Cancelled)
    }

    /// Enter a masked section where `checkpoint()` returns `Ok(())` even if
    /// cancellation has been requested. The returned guard restores the
    /// previous mask depth on drop.
    #[must_use]
    pub fn masked(&self) -> MaskGuard<'_> {
        self.inner.mask_depth.fetch_add(1, Ordering::AcqRel);
        MaskGuard { inner: &self.inner }
    }
}

/// RAII guard keeping a [`Cx`] masked while alive.
#[derive(Debug)]
pub struct MaskGuard<'a> {
    inner: &'a CxInner,
}

impl Drop for MaskGuard<'_> {
    fn drop(&mut self) {
        self.inner.mask_depth.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_observes_cancellation() {
        let cx = Cx::new();
        assert!(cx.checkpoint().is_ok());
        cx.cancel();
        assert!(matches!(cx.checkpoint(), Err(FsfsError::Cancelled)));
    }

    #[test]
    fn cancel_shared_across_clones() {
        let cx1 = Cx::new();
        let cx2 = cx1.clone();
        cx1.cancel();
        assert!(cx2.is_cancel_requested());
        assert!(cx2.checkpoint().is_err());
    }

    #[test]
    fn masked_section_defers_cancel() {
        let cx = Cx::new();
        cx.cancel();
        {
            let _guard = cx.masked();
            assert!(cx.checkpoint().is_ok());
            {
                let _inner = cx.masked();
                assert!(cx.checkpoint().is_ok());
            }
            assert!(cx.checkpoint().is_ok());
        }
        assert!(cx.checkpoint().is_err());
    }
}
