//! Cooperative cancellation for long-running merges.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::MergeError;

/// A cloneable token observed by merges at coarse batch boundaries.
///
/// Checks happen before an output file is opened, every few thousand cursor
/// steps, and around accessor salt retries. On observation the merge closes
/// and unlinks its partial output, releases its input readers, and returns
/// [`MergeError::Cancelled`] without touching any file set.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; observed at the next batch boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Errors with [`MergeError::Cancelled`] once [`cancel`](Self::cancel)
    /// has been called.
    pub fn check(&self) -> Result<(), MergeError> {
        if self.is_cancelled() {
            Err(MergeError::Cancelled)
        } else {
            Ok(())
        }
    }
}
