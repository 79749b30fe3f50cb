//! Immutable file items and the per-stream ordered file set.
//!
//! A [`FileItem`] bundles one on-disk data file with its secondary
//! structures and its lifecycle state. Items are shared behind `Arc`:
//! snapshot views hold clones with `refcount` raised, and the integrator
//! flips `can_delete` once a file is subsumed. The last releasing reader —
//! or the integrator itself, when no reader holds the file — unlinks the
//! files from disk.
//!
//! Within one stream, non-garbage items never overlap except that a larger
//! merged file may completely cover smaller ones, and every item's span
//! obeys the binary merge hierarchy: a file ending at step `e` spans at
//! most `e & e.wrapping_neg()` steps.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::index::btree::SampledIndex;
use crate::index::existence::ExistenceFilter;
use crate::index::AccessorIndex;
use crate::seg;

/// Version prefix carried by every file name.
pub const FILE_VERSION: &str = "v1";

/// Formats `v1-<name>.<from>-<to>.<ext>`.
pub fn file_name(name: &str, from_step: u64, to_step: u64, ext: &str) -> String {
    format!("{FILE_VERSION}-{name}.{from_step}-{to_step}.{ext}")
}

/// A parsed stream file name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedFileName {
    pub name: String,
    pub from_step: u64,
    pub to_step: u64,
    pub ext: String,
}

/// Parses names produced by [`file_name`]; anything else (including staged
/// `.tmp` leftovers) returns `None`.
pub fn parse_file_name(file_name: &str) -> Option<ParsedFileName> {
    let rest = file_name.strip_prefix(FILE_VERSION)?.strip_prefix('-')?;
    let (name, rest) = rest.split_once('.')?;
    let (steps, ext) = rest.split_once('.')?;
    let (from, to) = steps.split_once('-')?;
    let from_step = from.parse().ok()?;
    let to_step = to.parse().ok()?;
    if name.is_empty() || ext.is_empty() || ext.contains('.') || to_step <= from_step {
        return None;
    }
    Some(ParsedFileName { name: name.to_string(), from_step, to_step, ext: ext.to_string() })
}

/// One immutable file triple and its lifecycle state.
pub struct FileItem {
    pub start_tx_num: u64,
    pub end_tx_num: u64,
    /// Reached the maximum merge tier; never merged again, never garbage.
    pub frozen: bool,
    refcount: AtomicU32,
    can_delete: AtomicBool,
    /// Word-file reader; always present.
    pub reader: seg::Reader,
    pub accessor: Option<AccessorIndex>,
    pub sampled: Option<SampledIndex>,
    pub existence: Option<ExistenceFilter>,
    /// Everything to unlink when the item is retired.
    paths: Vec<PathBuf>,
}

impl FileItem {
    pub(crate) fn new(
        start_tx_num: u64,
        end_tx_num: u64,
        frozen: bool,
        reader: seg::Reader,
        paths: Vec<PathBuf>,
    ) -> Self {
        assert!(start_tx_num < end_tx_num, "empty file range [{start_tx_num}, {end_tx_num})");
        Self {
            start_tx_num,
            end_tx_num,
            frozen,
            refcount: AtomicU32::new(0),
            can_delete: AtomicBool::new(false),
            reader,
            accessor: None,
            sampled: None,
            existence: None,
            paths,
        }
    }

    /// Fully contained in `other` without being it.
    pub fn is_subset_of(&self, other: &FileItem) -> bool {
        self.start_tx_num >= other.start_tx_num
            && self.end_tx_num <= other.end_tx_num
            && !std::ptr::eq(self, other)
    }

    /// Entirely earlier than `other`.
    pub fn is_before(&self, other: &FileItem) -> bool {
        self.end_tx_num <= other.start_tx_num
    }

    pub fn can_delete(&self) -> bool {
        self.can_delete.load(Ordering::SeqCst)
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Raises the refcount for a new view. Fails once the item is marked
    /// deletable; callers invoke this under the owning stream's lock.
    pub(crate) fn try_acquire(&self) -> bool {
        if self.can_delete() {
            return false;
        }
        self.refcount.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Drops one view reference; the last reference of a deletable item
    /// unlinks its files.
    pub(crate) fn release(&self) {
        let previous = self.refcount.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "refcount underflow on {}", self.reader.file_name());
        if previous == 1 && self.can_delete() {
            self.delete_files();
        }
    }

    /// Marks the item deletable; returns true when no reader holds it and
    /// the caller should unlink synchronously.
    pub(crate) fn mark_deletable(&self) -> bool {
        self.can_delete.store(true, Ordering::SeqCst);
        self.refcount.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn delete_files(&self) {
        for path in &self.paths {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), %err, "failed to unlink retired file");
                }
            }
        }
    }

    fn sort_key(&self) -> (u64, u64) {
        (self.end_tx_num, self.start_tx_num)
    }
}

impl fmt::Debug for FileItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileItem")
            .field("range", &(self.start_tx_num..self.end_tx_num))
            .field("frozen", &self.frozen)
            .field("refcount", &self.refcount())
            .field("can_delete", &self.can_delete())
            .finish()
    }
}

/// Ordered set of a stream's files, keyed by `(end_tx_num, start_tx_num)`.
#[derive(Default)]
pub struct FileSet {
    items: BTreeMap<(u64, u64), Arc<FileItem>>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts a freshly built or scanned item. Two items covering the
    /// same range would shadow each other, which is a bug in the caller.
    pub fn insert(&mut self, item: Arc<FileItem>) {
        let key = item.sort_key();
        let replaced = self.items.insert(key, item);
        assert!(replaced.is_none(), "duplicate file inserted for range {key:?}");
    }

    pub fn remove(&mut self, item: &FileItem) -> Option<Arc<FileItem>> {
        self.items.remove(&item.sort_key())
    }

    /// Ascending walk by `(end_tx_num, start_tx_num)`.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<FileItem>> {
        self.items.values()
    }

    pub fn first(&self) -> Option<&Arc<FileItem>> {
        self.items.values().next()
    }

    pub fn last(&self) -> Option<&Arc<FileItem>> {
        self.items.values().next_back()
    }

    /// Exact-range lookup.
    pub fn get(&self, start_tx_num: u64, end_tx_num: u64) -> Option<&Arc<FileItem>> {
        self.items.get(&(end_tx_num, start_tx_num))
    }

    /// True when some other item in the set fully covers `item`.
    pub fn has_cover(&self, item: &FileItem) -> bool {
        self.items.values().any(|other| item.is_subset_of(other))
    }
}
