//! Cooperative cancellation and progress reporting for long-running
//! archive operations.
//!
//! A [`Probe`] is passed down into every chunked I/O loop and polled once per
//! buffer-sized chunk. Cancellation is requested from any thread through the
//! shared flag and surfaces as [`SafeError::Cancelled`], which callers treat
//! as "cancelled", never as "failed".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::SafeError;

/// Progress callback invoked with the running byte count.
pub type ProgressCallback = dyn Fn(u64) + Send + Sync;

/// Cancellation flag plus byte-level progress for one operation.
pub struct Probe {
    cancel: Arc<AtomicBool>,
    bytes: AtomicU64,
    callback: Option<Arc<ProgressCallback>>,
}

impl Probe {
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            bytes: AtomicU64::new(0),
            callback: None,
        }
    }

    /// Attach a progress callback. It is invoked after every chunk with the
    /// total number of bytes processed so far.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// A handle that can be moved to another thread to request cancellation.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Poll the cancellation flag. Called once per chunk inside I/O loops,
    /// before the next read.
    pub fn check(&self) -> Result<(), SafeError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(SafeError::Cancelled);
        }
        Ok(())
    }

    /// Record `n` more processed bytes and fire the callback, if any.
    pub fn advance(&self, n: u64) {
        let total = self.bytes.fetch_add(n, Ordering::Relaxed) + n;
        if let Some(cb) = &self.callback {
            cb(total);
        }
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl Default for Probe {
    fn default() -> Self {
        Self::new()
    }
}
