//! Reference-counted snapshot views over a [`FileSet`].
//!
//! A consumer — query or merge — first captures a view: the largest
//! non-overlapping cover of the set at that instant, with every item's
//! refcount raised. Garbage (smaller files subsumed by a merged one) never
//! appears in a view. The view pins its items for as long as it lives;
//! dropping it releases them, and the last release of a retired item
//! unlinks its files.

use std::sync::Arc;

use crate::files::{FileItem, FileSet};

/// An immutable snapshot of the files visible to one reader.
pub struct FilesView {
    items: Vec<Arc<FileItem>>,
}

impl FilesView {
    /// Captures the largest non-overlapping cover of `set`.
    ///
    /// Callers hold the owning stream's lock, which is what makes the
    /// refcount raise atomic with respect to the integrator's retire step.
    pub(crate) fn capture(set: &FileSet) -> Self {
        let mut items: Vec<Arc<FileItem>> = Vec::with_capacity(set.len());
        for item in set.iter() {
            if item.can_delete() {
                continue;
            }
            // Ascending (end, start) order: a subsumed predecessor is on
            // top of the stack, and a subsuming successor replaces it.
            while let Some(top) = items.last() {
                if top.is_subset_of(item) {
                    items.pop();
                } else {
                    break;
                }
            }
            if items.last().is_some_and(|top| item.is_subset_of(top)) {
                continue;
            }
            items.push(Arc::clone(item));
        }
        for item in &items {
            let acquired = item.try_acquire();
            debug_assert!(acquired, "live view item was concurrently retired");
        }
        Self { items }
    }

    /// Visible items, ascending by end tx number.
    pub fn items(&self) -> &[Arc<FileItem>] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// End of the covered prefix of the tx axis; `None` when no file is
    /// visible.
    pub fn end_tx_num(&self) -> Option<u64> {
        self.items.last().map(|item| item.end_tx_num)
    }

    /// Items lying fully inside `[from, to)`, in ascending order.
    pub fn files_in_range(&self, from: u64, to: u64) -> Vec<Arc<FileItem>> {
        self.items
            .iter()
            .filter(|item| item.start_tx_num >= from && item.end_tx_num <= to)
            .cloned()
            .collect()
    }

    /// True when some visible item fully covers `item`.
    pub fn has_cover(&self, item: &FileItem) -> bool {
        self.items.iter().any(|other| {
            item.start_tx_num >= other.start_tx_num && item.end_tx_num <= other.end_tx_num
        })
    }
}

impl Drop for FilesView {
    fn drop(&mut self) {
        for item in &self.items {
            item.release();
        }
    }
}
