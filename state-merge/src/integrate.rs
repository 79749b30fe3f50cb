//! Installation of merged outputs and retirement of their inputs.
//!
//! The sequence is: insert the new item, then walk the set and retire
//! every file the new item makes redundant. Both halves run under the
//! stream's short lock, so a reader capturing a view observes either the
//! old layout or the new one, never a torn mix. Retired files are removed
//! from the set and flagged `can_delete`; whoever observes the refcount at
//! zero — the integrator here, or the last releasing reader — unlinks them.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::files::{FileItem, FileSet};

/// Inserts freshly merged items into the set.
pub(crate) fn integrate_merged(files: &Mutex<FileSet>, outs: &[Arc<FileItem>]) {
    let mut set = files.lock().expect("file set lock poisoned");
    for out in outs {
        set.insert(Arc::clone(out));
    }
}

/// Retires every file made redundant by `merged` (or, with `None`, any
/// file already covered by a larger one — the startup pruning case).
///
/// A file is garbage when it is fully contained in the merged output, or
/// lies entirely before it while some other file in the set covers it.
/// Frozen files are never garbage.
pub(crate) fn clean_after_merge(files: &Mutex<FileSet>, merged: Option<&FileItem>) {
    let mut unlink_now = Vec::new();
    {
        let mut set = files.lock().expect("file set lock poisoned");
        let garbage: Vec<Arc<FileItem>> = set
            .iter()
            .filter(|item| !item.frozen && is_garbage(&set, item, merged))
            .cloned()
            .collect();
        for item in garbage {
            set.remove(&item);
            debug!(file = %item.reader.file_name(), "retired by merge");
            if item.mark_deletable() {
                unlink_now.push(item);
            }
        }
    }
    // Unlinking happens outside the critical section; readers that raced
    // ahead of the retire flag will unlink on their own release instead.
    for item in unlink_now {
        item.delete_files();
    }
}

fn is_garbage(set: &FileSet, item: &FileItem, merged: Option<&FileItem>) -> bool {
    match merged {
        Some(merged) => {
            item.is_subset_of(merged) || (item.is_before(merged) && set.has_cover(item))
        }
        None => set.has_cover(item),
    }
}
