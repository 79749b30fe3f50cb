//! History streams: per-key prior values, addressed by tx number.
//!
//! A history `.v` file holds, for every key changed in its range, the
//! values at each change in tx order — one word per value, with no keys.
//! The sibling inverted-index `.ef` file of the same range carries the
//! keys and the tx numbers, and the `.vi` accessor maps `txnum ‖ key` to
//! the value's offset in the `.v` file. The pairing is a hard invariant:
//! every history file must be matched by an index file of the same range,
//! and the merger refuses to run when a pairing is missing.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::{IndexOpts, StreamSpec};
use crate::cursor::{CursorSet, CursorSource, MergeCursor};
use crate::ef::EliasFano;
use crate::error::MergeError;
use crate::files::{file_name, parse_file_name, FileItem, FileSet};
use crate::index::{AccessorBuilder, AccessorIndex};
use crate::integrate;
use crate::inverted_index::{assert_contiguous, dyadic_span, InvertedIndex, CANCEL_BATCH};
use crate::plan::{self, HistoryRanges, MergeRange};
use crate::seg;
use crate::view::FilesView;
use crate::MergeProgress;

/// A history stream together with its sibling inverted index.
pub struct History {
    ii: InvertedIndex,
    spec: StreamSpec,
    files: Mutex<FileSet>,
}

/// Snapshot of both sides of the pair, captured index first so a reader
/// never sees history ahead of its index.
pub struct HistoryContext {
    pub index: FilesView,
    pub history: FilesView,
}

/// Inputs selected for one history merge.
#[derive(Debug)]
pub struct SelectedHistoryFiles {
    /// Index files to merge, when the index range is present.
    pub index: Vec<Arc<FileItem>>,
    /// History files to merge, when the history range is present.
    pub history: Vec<Arc<FileItem>>,
    /// For each history input, the index file of the identical range.
    pub paired_index: Vec<Arc<FileItem>>,
}

/// Outputs of one history merge.
pub struct HistoryFiles {
    pub index: Option<Arc<FileItem>>,
    pub history: Option<Arc<FileItem>>,
}

impl History {
    /// Opens the pair, scanning for `.ef` files first and then `.v` files;
    /// a `.v` file without its index sibling is an orphan and is skipped.
    pub fn open(spec: StreamSpec, index_opts: IndexOpts) -> Result<Self, MergeError> {
        let ii = InvertedIndex::open(spec.clone(), index_opts)?;
        let stream = Self { ii, spec, files: Mutex::new(FileSet::new()) };
        stream.scan_dir()?;
        integrate::clean_after_merge(&stream.files, None);
        Ok(stream)
    }

    fn scan_dir(&self) -> Result<(), MergeError> {
        let mut set = self.files.lock().expect("file set lock poisoned");
        for entry in fs::read_dir(&self.spec.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(parsed) = parse_file_name(&name.to_string_lossy()) else { continue };
            if parsed.name != self.spec.name || parsed.ext != "v" {
                continue;
            }
            if !dyadic_span(parsed.from_step, parsed.to_step) {
                warn!(file = %name.to_string_lossy(), "skipping file with non-dyadic span");
                continue;
            }
            let step = self.spec.step;
            let Some(sibling) =
                self.ii.lookup_file(parsed.from_step * step, parsed.to_step * step)
            else {
                warn!(file = %name.to_string_lossy(), "skipping orphan history file without index sibling");
                continue;
            };
            match self.open_file(parsed.from_step, parsed.to_step, &sibling.reader, None, &CancelToken::new())
            {
                Ok(item) => set.insert(Arc::new(item)),
                Err(err) => warn!(file = %name.to_string_lossy(), %err, "skipping unreadable file"),
            }
        }
        Ok(())
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    pub fn inverted_index(&self) -> &InvertedIndex {
        &self.ii
    }

    pub fn context(&self) -> HistoryContext {
        let index = self.ii.context();
        let history = FilesView::capture(&self.files.lock().expect("file set lock poisoned"));
        HistoryContext { index, history }
    }

    /// Largest tx number up to which both sides are fully indexed;
    /// `None` while either side has no files at all.
    pub fn end_indexed_tx_num(&self) -> Option<u64> {
        let history = self.files.lock().expect("file set lock poisoned").last().map(|f| f.end_tx_num);
        match (history, self.ii.end_tx_num()) {
            (Some(h), Some(i)) => Some(h.min(i)),
            _ => None,
        }
    }

    /// Plans both sides and reconciles them so history never outruns its
    /// index.
    pub fn find_merge_range(
        &self,
        ctx: &HistoryContext,
        max_end_tx_num: u64,
        max_span: u64,
    ) -> HistoryRanges {
        let history = plan::find_merge_range(
            &ctx.history,
            self.spec.step,
            max_end_tx_num,
            max_span.min(self.spec.frozen_span()),
        );
        let index = self.ii.find_merge_range(&ctx.index, max_end_tx_num, max_span);
        plan::reconcile_pair(history, index)
    }

    /// Selects the merge inputs, pairing every history file with the index
    /// file of its exact range.
    ///
    /// Pairing consults the index's full set rather than its view: when the
    /// index has already merged past the history (allowed by the pair
    /// invariant), the smaller index files are garbage-in-waiting but still
    /// on disk, and they are exactly what the history values must be
    /// replayed against.
    pub fn files_in_range(
        &self,
        ctx: &HistoryContext,
        ranges: &HistoryRanges,
    ) -> Result<SelectedHistoryFiles, MergeError> {
        let index = match ranges.index {
            Some(range) => self.ii.files_in_range(&ctx.index, range),
            None => Vec::new(),
        };

        let mut history = Vec::new();
        let mut paired_index = Vec::new();
        if let Some(range) = ranges.history {
            history = ctx.history.files_in_range(range.from, range.to);
            self.check_gaps(&history, range)?;
            for item in &history {
                let Some(sibling) = self.ii.lookup_file(item.start_tx_num, item.end_tx_num) else {
                    return Err(MergeError::MissingPair {
                        present: item.reader.file_name(),
                        missing: self.step_file_name(item.start_tx_num, item.end_tx_num, "ef"),
                    });
                };
                paired_index.push(sibling);
            }
        }
        Ok(SelectedHistoryFiles { index, history, paired_index })
    }

    // A gap in the selected history files means a history file is missing
    // for a range its index sibling covers.
    fn check_gaps(&self, history: &[Arc<FileItem>], range: MergeRange) -> Result<(), MergeError> {
        let mut expected = range.from;
        for item in history {
            if item.start_tx_num != expected {
                return Err(self.missing_history(expected, item.start_tx_num));
            }
            expected = item.end_tx_num;
        }
        if expected != range.to {
            return Err(self.missing_history(expected, range.to));
        }
        Ok(())
    }

    fn missing_history(&self, from_tx: u64, to_tx: u64) -> MergeError {
        // Name the absent file after the index sibling that demands it.
        let sibling = self
            .ii
            .lookup_file_starting_at(from_tx)
            .map(|f| (f.start_tx_num, f.end_tx_num, f.reader.file_name()));
        match sibling {
            Some((start, end, present)) => MergeError::MissingPair {
                present,
                missing: self.step_file_name(start, end, "v"),
            },
            None => MergeError::MissingPair {
                present: self.step_file_name(from_tx, to_tx, "ef"),
                missing: self.step_file_name(from_tx, to_tx, "v"),
            },
        }
    }

    fn step_file_name(&self, from_tx: u64, to_tx: u64, ext: &str) -> String {
        let step = self.spec.step;
        file_name(&self.spec.name, from_tx / step, to_tx / step, ext)
    }

    /// Merges the index side first, then replays the history values in
    /// true tx order. Returns the un-integrated output pair; on error all
    /// partial outputs are unlinked and both file sets stay unchanged.
    pub fn merge_files(
        &self,
        selected: &SelectedHistoryFiles,
        ranges: &HistoryRanges,
        cancel: &CancelToken,
        progress: &MergeProgress,
    ) -> Result<HistoryFiles, MergeError> {
        let index = match ranges.index {
            Some(range) => Some(self.ii.merge_files(&selected.index, range, cancel, progress)?),
            None => None,
        };

        let history = match ranges.history {
            Some(range) => {
                match self.merge_history_files(selected, range, index.as_deref(), cancel, progress) {
                    Ok(item) => Some(item),
                    Err(err) => {
                        if let Some(range) = ranges.index {
                            self.ii.remove_outputs(range);
                        }
                        return Err(err);
                    }
                }
            }
            None => None,
        };
        Ok(HistoryFiles { index, history })
    }

    fn merge_history_files(
        &self,
        selected: &SelectedHistoryFiles,
        range: MergeRange,
        merged_index: Option<&FileItem>,
        cancel: &CancelToken,
        progress: &MergeProgress,
    ) -> Result<Arc<FileItem>, MergeError> {
        // Merging a file into exactly itself is a no-op.
        if let [only] = selected.history.as_slice() {
            if only.start_tx_num == range.from && only.end_tx_num == range.to {
                return Ok(Arc::clone(only));
            }
        }
        let result =
            self.merge_history_files_inner(selected, range, merged_index, cancel, progress);
        if result.is_err() {
            self.remove_outputs(range);
        }
        result
    }

    fn merge_history_files_inner(
        &self,
        selected: &SelectedHistoryFiles,
        range: MergeRange,
        merged_index: Option<&FileItem>,
        cancel: &CancelToken,
        progress: &MergeProgress,
    ) -> Result<Arc<FileItem>, MergeError> {
        assert_contiguous(&selected.history, range);
        assert_eq!(
            selected.history.len(),
            selected.paired_index.len(),
            "history inputs and their index pairings diverged",
        );
        cancel.check()?;

        // The .vi accessor replays tx numbers out of the merged index
        // file; when this merge did not produce one, the index must have
        // merged this exact range already.
        let existing_index;
        let index_reader = match merged_index {
            Some(item) => &item.reader,
            None => {
                existing_index = self.ii.lookup_file(range.from, range.to).ok_or_else(|| {
                    MergeError::MissingPair {
                        present: self.step_file_name(range.from, range.to, "v"),
                        missing: self.step_file_name(range.from, range.to, "ef"),
                    }
                })?;
                &existing_index.reader
            }
        };

        let step = self.spec.step;
        let (from_step, to_step) = (range.from / step, range.to / step);
        let scratch = tempfile::tempdir_in(&self.spec.dir)?;
        let _read_ahead = seg::ReadAhead::new(
            selected
                .history
                .iter()
                .chain(selected.paired_index.iter())
                .map(|f| &f.reader)
                .collect(),
        );

        let mut writer = seg::Writer::create(&self.spec.file_path(from_step, to_step, "v"))?;
        // Cursors walk the paired index files; each carries a secondary
        // reader into its history file, consumed in lockstep.
        let mut cursors = CursorSet::new(
            selected
                .paired_index
                .iter()
                .zip(selected.history.iter())
                .map(|(index, history)| {
                    MergeCursor::new(index.end_tx_num, CursorSource::File(index.reader.getter()))
                        .with_aux(history.reader.getter())
                })
                .collect(),
        );

        let mut keys = 0u64;
        while cursors.peek_key().is_some() {
            if keys % CANCEL_BATCH == 0 {
                cancel.check()?;
            }
            // Earliest file first, so values append in true tx order.
            for &idx in &cursors.min_indices() {
                let posting = EliasFano::read(cursors.val(idx)).ok_or_else(|| {
                    MergeError::Corrupt {
                        what: "posting list",
                        path: selected.paired_index[idx].reader.path().to_path_buf(),
                    }
                })?;
                let values = cursors.aux_mut(idx);
                for _ in 0..posting.count() {
                    assert!(values.has_next(), "history file ran out of values mid-key");
                    writer.add_word(values.next())?;
                }
            }
            keys += 1;
            progress.add_keys(1);
            cursors.step();
        }
        writer.finish()?;

        let item = self.open_file(from_step, to_step, index_reader, Some(scratch.path()), cancel)?;
        info!(stream = %self.spec.name, %range, keys, "merged history files");
        Ok(Arc::new(item))
    }

    /// Installs a merged pair, index first so the pair invariant holds for
    /// every concurrent reader.
    pub fn integrate_merged_files(&self, outs: &HistoryFiles) {
        if let Some(index) = &outs.index {
            self.ii.integrate_merged_files(index);
        }
        if let Some(history) = &outs.history {
            integrate::integrate_merged(&self.files, std::slice::from_ref(history));
        }
    }

    /// Retires the inputs subsumed by the merged pair.
    pub fn clean_after_merge(&self, outs: &HistoryFiles) {
        self.ii.clean_after_merge(outs.index.as_ref());
        integrate::clean_after_merge(&self.files, outs.history.as_deref());
    }

    /// Writes a complete sibling pair from already-sorted per-key changes
    /// (`(key, [(tx, value)])`, keys ascending, txs ascending). The ingest
    /// seam for the layers below the merge engine and for tests.
    pub fn build_files(
        &self,
        from_step: u64,
        to_step: u64,
        changes: &[(Vec<u8>, Vec<(u64, Vec<u8>)>)],
    ) -> Result<HistoryFiles, MergeError> {
        let postings: Vec<(Vec<u8>, Vec<u64>)> = changes
            .iter()
            .map(|(key, values)| (key.clone(), values.iter().map(|(tx, _)| *tx).collect()))
            .collect();
        let index = self.ii.build_file(from_step, to_step, &postings)?;

        let mut writer = seg::Writer::create(&self.spec.file_path(from_step, to_step, "v"))?;
        for (_, values) in changes {
            for (_, value) in values {
                writer.add_word(value)?;
            }
        }
        writer.finish()?;

        let history =
            self.open_file(from_step, to_step, &index.reader, None, &CancelToken::new())?;
        Ok(HistoryFiles { index: Some(index), history: Some(Arc::new(history)) })
    }

    /// Opens one `.v` file, building its `.vi` accessor from the sibling
    /// index file when missing.
    fn open_file(
        &self,
        from_step: u64,
        to_step: u64,
        index_reader: &seg::Reader,
        scratch: Option<&Path>,
        cancel: &CancelToken,
    ) -> Result<FileItem, MergeError> {
        let spec = &self.spec;
        let data_path = spec.file_path(from_step, to_step, "v");
        let reader = seg::Reader::open(&data_path)?;

        let accessor_path = spec.file_path(from_step, to_step, "vi");
        if !accessor_path.exists() {
            build_history_accessor(index_reader, &reader, &accessor_path, spec.dir(), scratch, cancel)?;
        }

        let frozen = to_step - from_step >= spec.frozen_steps;
        let paths = vec![data_path, accessor_path.clone()];
        let mut item =
            FileItem::new(from_step * spec.step, to_step * spec.step, frozen, reader, paths);
        item.accessor = Some(AccessorIndex::open(&accessor_path)?);
        Ok(item)
    }

    pub(crate) fn remove_outputs(&self, range: MergeRange) {
        let (from_step, to_step) = (range.from / self.spec.step, range.to / self.spec.step);
        for ext in ["v", "vi"] {
            let _ = fs::remove_file(self.spec.file_path(from_step, to_step, ext));
        }
    }
}

/// Builds the `txnum ‖ key → value offset` accessor by walking the index
/// file's postings and the history file's values in lockstep. The exact
/// key count is the history file's word count.
fn build_history_accessor(
    index_reader: &seg::Reader,
    history_reader: &seg::Reader,
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
    let mut builder = AccessorBuilder::new(history_reader.word_count(), scratch)?;
    let mut postings = index_reader.getter();
    let mut values = history_reader.getter();
    let mut compound = Vec::new();
    while postings.has_next() {
        let key = postings.next();
        let posting = EliasFano::read(postings.next()).ok_or_else(|| MergeError::Corrupt {
            what: "posting list",
            path: index_reader.path().to_path_buf(),
        })?;
        for tx in posting.iter() {
            compound.clear();
            compound.extend_from_slice(&tx.to_be_bytes());
            compound.extend_from_slice(key);
            builder.add_key(&compound, values.skip())?;
        }
    }
    builder.build(path, cancel)
}
