//! Inverted-index streams: key → Elias-Fano-packed tx numbers.
//!
//! One `.ef` file covers a step-aligned tx range and stores, per key, the
//! sorted tx numbers at which the key changed within that range. Merging
//! unions the posting lists of adjacent files; since input ranges are
//! disjoint, the union is a concatenation in file order.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{IndexOpts, StreamSpec};
use crate::cursor::{CursorSet, CursorSource, MergeCursor};
use crate::ef::{self, EliasFano, EliasFanoBuilder};
use crate::error::MergeError;
use crate::files::{parse_file_name, FileItem, FileSet};
use crate::index::existence::{ExistenceFilter, ExistenceFilterBuilder};
use crate::index::{AccessorBuilder, AccessorIndex};
use crate::integrate;
use crate::plan::{self, MergeRange};
use crate::seg;
use crate::view::FilesView;
use crate::MergeProgress;

/// Cursor steps between cancellation checks.
pub(crate) const CANCEL_BATCH: u64 = 4096;

/// Panics unless `inputs` tile `[range.from, range.to)` exactly.
pub(crate) fn assert_contiguous(inputs: &[Arc<FileItem>], range: MergeRange) {
    assert!(!inputs.is_empty(), "merge of {range} selected no inputs");
    let mut expected = range.from;
    for item in inputs {
        assert_eq!(
            item.start_tx_num, expected,
            "merge inputs leave a gap at tx {expected} in {range}",
        );
        expected = item.end_tx_num;
    }
    assert_eq!(expected, range.to, "merge inputs fall short of {range}");
}

/// One inverted-index stream and its file set.
pub struct InvertedIndex {
    spec: StreamSpec,
    opts: IndexOpts,
    files: Mutex<FileSet>,
}

impl InvertedIndex {
    /// Opens the stream, scanning `spec.dir` for its files and pruning
    /// anything already subsumed by a larger merged file.
    pub fn open(spec: StreamSpec, opts: IndexOpts) -> Result<Self, MergeError> {
        fs::create_dir_all(&spec.dir)?;
        let stream = Self { spec, opts, files: Mutex::new(FileSet::new()) };
        stream.scan_dir()?;
        integrate::clean_after_merge(&stream.files, None);
        Ok(stream)
    }

    fn scan_dir(&self) -> Result<(), MergeError> {
        let mut set = self.files.lock().expect("file set lock poisoned");
        for entry in fs::read_dir(&self.spec.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(parsed) = parse_file_name(&file_name.to_string_lossy()) else { continue };
            if parsed.name != self.spec.name || parsed.ext != "ef" {
                continue;
            }
            if !dyadic_span(parsed.from_step, parsed.to_step) {
                warn!(file = %file_name.to_string_lossy(), "skipping file with non-dyadic span");
                continue;
            }
            match self.open_file(parsed.from_step, parsed.to_step, None, &CancelToken::new()) {
                Ok(item) => set.insert(Arc::new(item)),
                Err(err) => {
                    warn!(file = %file_name.to_string_lossy(), %err, "skipping unreadable file")
                }
            }
        }
        Ok(())
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    pub fn step(&self) -> u64 {
        self.spec.step
    }

    /// Captures the snapshot view new readers and merge decisions use.
    pub fn context(&self) -> FilesView {
        FilesView::capture(&self.files.lock().expect("file set lock poisoned"))
    }

    /// Largest tx number covered by this stream's files.
    pub fn end_tx_num(&self) -> Option<u64> {
        self.files.lock().expect("file set lock poisoned").last().map(|f| f.end_tx_num)
    }

    /// Selects the next merge, if the layout calls for one.
    pub fn find_merge_range(
        &self,
        ctx: &FilesView,
        max_end_tx_num: u64,
        max_span: u64,
    ) -> Option<MergeRange> {
        let range = plan::find_merge_range(
            ctx,
            self.spec.step,
            max_end_tx_num,
            max_span.min(self.spec.frozen_span()),
        );
        if let Some(range) = range {
            debug!(stream = %self.spec.name, %range, "index merge planned");
        }
        range
    }

    /// Input files of `range`, ascending; panics unless they tile it.
    pub fn files_in_range(&self, ctx: &FilesView, range: MergeRange) -> Vec<Arc<FileItem>> {
        let inputs = ctx.files_in_range(range.from, range.to);
        assert_contiguous(&inputs, range);
        inputs
    }

    /// Exact-range lookup in the full set, garbage included; the history
    /// merger uses this to pair lagging history files with index files
    /// that have already been merged past them.
    pub(crate) fn lookup_file(&self, start_tx_num: u64, end_tx_num: u64) -> Option<Arc<FileItem>> {
        self.files.lock().expect("file set lock poisoned").get(start_tx_num, end_tx_num).cloned()
    }

    /// Smallest file starting at `start_tx_num`, if any.
    pub(crate) fn lookup_file_starting_at(&self, start_tx_num: u64) -> Option<Arc<FileItem>> {
        self.files
            .lock()
            .expect("file set lock poisoned")
            .iter()
            .find(|f| f.start_tx_num == start_tx_num)
            .cloned()
    }

    /// Merges `inputs` into one file covering `range`.
    ///
    /// On success the new item is returned un-integrated; on any error —
    /// cancellation included — every partial output is unlinked and the
    /// file set is untouched.
    pub fn merge_files(
        &self,
        inputs: &[Arc<FileItem>],
        range: MergeRange,
        cancel: &CancelToken,
        progress: &MergeProgress,
    ) -> Result<Arc<FileItem>, MergeError> {
        // Merging a file into exactly itself is a no-op.
        if let [only] = inputs {
            if only.start_tx_num == range.from && only.end_tx_num == range.to {
                return Ok(Arc::clone(only));
            }
        }
        let result = self.merge_files_inner(inputs, range, cancel, progress);
        if result.is_err() {
            self.remove_outputs(range);
        }
        result
    }

    fn merge_files_inner(
        &self,
        inputs: &[Arc<FileItem>],
        range: MergeRange,
        cancel: &CancelToken,
        progress: &MergeProgress,
    ) -> Result<Arc<FileItem>, MergeError> {
        assert_contiguous(inputs, range);
        cancel.check()?;
        let step = self.spec.step;
        let (from_step, to_step) = (range.from / step, range.to / step);
        let scratch = tempfile::tempdir_in(&self.spec.dir)?;
        let _read_ahead = seg::ReadAhead::new(inputs.iter().map(|f| &f.reader).collect());

        let mut writer = seg::Writer::create(&self.spec.file_path(from_step, to_step, "ef"))?;
        let mut cursors = CursorSet::new(
            inputs
                .iter()
                .map(|f| MergeCursor::new(f.end_tx_num, CursorSource::File(f.reader.getter())))
                .collect(),
        );

        let mut value_buf = Vec::new();
        let mut keys = 0u64;
        while let Some(key) = cursors.peek_key() {
            if keys % CANCEL_BATCH == 0 {
                cancel.check()?;
            }
            let key = key.to_vec();
            let mut merged: Option<EliasFano> = None;
            for &idx in &cursors.min_indices() {
                let ef = EliasFano::read(cursors.val(idx)).ok_or_else(|| MergeError::Corrupt {
                    what: "posting list",
                    path: self.input_path(inputs, cursors.end_tx_num(idx)),
                })?;
                merged = Some(match merged {
                    None => ef,
                    Some(prior) => ef::merge_disjoint(&prior, &ef),
                });
            }
            let merged = merged.expect("minimum key without a posting list");
            value_buf.clear();
            merged.append_bytes(&mut value_buf);
            writer.add_word(&key)?;
            writer.add_word(&value_buf)?;
            keys += 1;
            progress.add_keys(1);
            cursors.step();
        }
        writer.finish()?;

        let item = self.open_file(from_step, to_step, Some(scratch.path()), cancel)?;
        info!(stream = %self.spec.name, %range, keys, "merged index files");
        Ok(Arc::new(item))
    }

    fn input_path(&self, inputs: &[Arc<FileItem>], end_tx_num: u64) -> std::path::PathBuf {
        inputs
            .iter()
            .find(|f| f.end_tx_num == end_tx_num)
            .map(|f| f.reader.path().to_path_buf())
            .unwrap_or_default()
    }

    /// Installs a merged item; siblings of a domain stream are installed
    /// by their owner so the pair appears together.
    pub fn integrate_merged_files(&self, out: &Arc<FileItem>) {
        integrate::integrate_merged(&self.files, std::slice::from_ref(out));
    }

    /// Retires the inputs the merged item subsumes.
    pub fn clean_after_merge(&self, merged: Option<&Arc<FileItem>>) {
        integrate::clean_after_merge(&self.files, merged.map(|f| f.as_ref()));
    }

    /// Writes a complete `.ef` file (plus secondary structures) from
    /// already-sorted postings. This is the ingest seam used by the layers
    /// below the merge engine and by tests; the item is returned
    /// un-integrated.
    pub fn build_file(
        &self,
        from_step: u64,
        to_step: u64,
        postings: &[(Vec<u8>, Vec<u64>)],
    ) -> Result<Arc<FileItem>, MergeError> {
        let mut writer = seg::Writer::create(&self.spec.file_path(from_step, to_step, "ef"))?;
        let mut value_buf = Vec::new();
        let mut previous: Option<&[u8]> = None;
        for (key, txs) in postings {
            assert!(previous.is_none_or(|p| p < key.as_slice()), "postings must be sorted by key");
            assert!(!txs.is_empty(), "empty posting list for key {key:?}");
            previous = Some(key);
            let mut builder = EliasFanoBuilder::new(txs.len() as u64, *txs.last().expect("non-empty"));
            for &tx in txs {
                builder.add_offset(tx);
            }
            value_buf.clear();
            builder.build().append_bytes(&mut value_buf);
            writer.add_word(key)?;
            writer.add_word(&value_buf)?;
        }
        writer.finish()?;
        Ok(Arc::new(self.open_file(from_step, to_step, None, &CancelToken::new())?))
    }

    /// Opens one data file and its secondary structures, building any
    /// structure missing on disk.
    pub(crate) fn open_file(
        &self,
        from_step: u64,
        to_step: u64,
        scratch: Option<&Path>,
        cancel: &CancelToken,
    ) -> Result<FileItem, MergeError> {
        let spec = &self.spec;
        let data_path = spec.file_path(from_step, to_step, "ef");
        let reader = seg::Reader::open(&data_path)?;

        let accessor_path = spec.file_path(from_step, to_step, "efi");
        if !accessor_path.exists() {
            build_key_accessor(&reader, &accessor_path, spec.dir(), scratch, cancel)?;
        }
        let mut paths = vec![data_path, accessor_path.clone()];

        let existence = if self.opts.existence_filter {
            let path = spec.file_path(from_step, to_step, "efei");
            if !path.exists() {
                build_existence_filter(&reader, &path)?;
            }
            paths.push(path.clone());
            Some(ExistenceFilter::open(&path)?)
        } else {
            None
        };

        let frozen = to_step - from_step >= spec.frozen_steps;
        let mut item = FileItem::new(from_step * spec.step, to_step * spec.step, frozen, reader, paths);
        item.accessor = Some(AccessorIndex::open(&accessor_path)?);
        item.existence = existence;
        Ok(item)
    }

    pub(crate) fn remove_outputs(&self, range: MergeRange) {
        let (from_step, to_step) = (range.from / self.spec.step, range.to / self.spec.step);
        for ext in ["ef", "efi", "efei"] {
            let _ = fs::remove_file(self.spec.file_path(from_step, to_step, ext));
        }
    }
}

pub(crate) fn dyadic_span(from_step: u64, to_step: u64) -> bool {
    to_step > from_step && (to_step & to_step.wrapping_neg()) >= to_step - from_step
}

/// Builds a key → word-offset accessor over an alternating key/value file.
pub(crate) fn build_key_accessor(
    reader: &seg::Reader,
    path: &Path,
    dir: &Path,
    scratch: Option<&Path>,
    cancel: &CancelToken,
) -> Result<(), MergeError> {
    let local;
    let scratch = match scratch {
        Some(path) => path,
        None => {
            local = tempfile::tempdir_in(dir)?;
            local.path()
        }
    };
    let mut builder = AccessorBuilder::new(reader.word_count() / 2, scratch)?;
    let mut getter = reader.getter();
    while getter.has_next() {
        let at = getter.pos();
        builder.add_key(getter.next(), at)?;
        getter.skip();
    }
    builder.build(path, cancel)
}

pub(crate) fn build_existence_filter(reader: &seg::Reader, path: &Path) -> Result<(), MergeError> {
    let mut builder = ExistenceFilterBuilder::new(reader.word_count() / 2);
    let mut getter = reader.getter();
    while getter.has_next() {
        builder.add(getter.next());
        getter.skip();
    }
    builder.finish(path)?;
    Ok(())
}
