//! Error taxonomy of the merge engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by merge planning, merging, and file lifecycle operations.
///
/// Transient I/O errors may be retried by re-running the whole merge; the
/// engine guarantees that a failed merge leaves the file sets unchanged.
/// Integrity violations (unaligned steps, overlapping inserts, out-of-order
/// cursor data) are programmer errors and panic instead.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Reading or writing one of the files failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A history file and its sibling inverted-index file went out of sync:
    /// one side of the pair exists for a range while the other does not.
    ///
    /// This signals torn state on disk. The merge is abandoned and the
    /// stream keeps operating from its un-merged files.
    #[error("missing sibling file: {missing} (required by {present})")]
    MissingPair {
        /// File that is present and demands a sibling.
        present: String,
        /// Sibling file that could not be found.
        missing: String,
    },

    /// The accessor index could not be built collision-free within the salt
    /// retry ceiling.
    #[error("accessor build for {path:?} still colliding after {attempts} salts")]
    AccessorCollision { path: PathBuf, attempts: u32 },

    /// The operation observed a cancellation request and unwound cleanly;
    /// partial outputs have been unlinked.
    #[error("merge cancelled")]
    Cancelled,

    /// A stored blob does not decode.
    #[error("corrupt {what} in {path:?}")]
    Corrupt { what: &'static str, path: PathBuf },
}
