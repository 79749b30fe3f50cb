//! A hierarchical merge engine for step-aligned, immutable state files.
//!
//! The engine maintains, per data stream, an ordered set of immutable files
//! covering disjoint half-open ranges of a monotonically increasing logical
//! clock (the *tx number*). Streams come in three kinds: [`Domain`] streams
//! hold the latest value per key, [`History`] streams hold every prior value
//! keyed by the tx number at which it changed, and [`InvertedIndex`] streams
//! hold, per key, the Elias-Fano-packed list of tx numbers at which the key
//! changed. A [`Domain`] owns its [`History`], which in turn owns its sibling
//! [`InvertedIndex`].
//!
//! File boundaries are aligned to a fixed *step* of tx numbers, and merging
//! follows a strict binary-tree hierarchy: a file ending at step `e` may span
//! at most `e & e.wrapping_neg()` steps. The planner ([`plan`]) selects the
//! longest legal merge from the current snapshot view, the mergers rewrite
//! the selected inputs into one output through an N-way cursor set, and the
//! integrator installs the output and retires the inputs once their last
//! reader releases them.
//!
//! Readers and merges run concurrently; a reader first captures a
//! [`FilesView`](view::FilesView) — a reference-counted snapshot of the
//! largest non-overlapping cover of a stream — and everything it observes
//! stays valid until the view is dropped.

pub mod cancel;
pub mod config;
pub mod cursor;
pub mod domain;
pub mod ef;
pub mod error;
pub mod files;
pub mod history;
pub mod index;
pub mod integrate;
pub mod inverted_index;
pub mod plan;
pub mod seg;
pub mod view;

pub use cancel::CancelToken;
pub use config::{AccessorKind, DomainOpts, IndexOpts, StreamSpec};
pub use domain::{Domain, DomainContext, DomainFiles, COMMITMENT_STATE_KEY};
pub use error::MergeError;
pub use files::{FileItem, FileSet};
pub use history::{History, HistoryContext, HistoryFiles};
pub use inverted_index::InvertedIndex;
pub use plan::{DomainRanges, HistoryRanges, MergeRange};
pub use view::FilesView;

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters reported by a running merge.
///
/// Shared with the caller so that long merges can be observed from another
/// thread; all counters are monotonic.
#[derive(Debug, Default)]
pub struct MergeProgress {
    keys: AtomicU64,
}

impl MergeProgress {
    /// Number of distinct keys written to merge outputs so far.
    pub fn keys(&self) -> u64 {
        self.keys.load(Ordering::Relaxed)
    }

    pub(crate) fn add_keys(&self, n: u64) {
        self.keys.fetch_add(n, Ordering::Relaxed);
    }
}
