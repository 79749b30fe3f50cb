//! Domain streams: key → latest value, with history and index in tow.
//!
//! A values `.kv` file holds one entry per key — the latest value within
//! its tx range. Merging adjacent files keeps the entry from the newest
//! file for every key; a zero-length value in a merge starting at tx 0
//! means the key was deleted and, with no older layer left to shadow, the
//! entry is dropped entirely. The commitment domain additionally rewrites
//! its values through a caller-supplied transformer, except for the state
//! root entry.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::{AccessorKind, DomainOpts, IndexOpts, StreamSpec};
use crate::cursor::{CursorSet, CursorSource, MergeCursor};
use crate::error::MergeError;
use crate::files::{parse_file_name, FileItem, FileSet};
use crate::history::{History, HistoryContext, HistoryFiles, SelectedHistoryFiles};
use crate::index::btree::SampledIndex;
use crate::index::existence::ExistenceFilter;
use crate::index::AccessorIndex;
use crate::integrate;
use crate::inverted_index::{
    assert_contiguous, build_existence_filter, build_key_accessor, dyadic_span, CANCEL_BATCH,
};
use crate::plan::{self, DomainRanges, HistoryRanges, MergeRange};
use crate::seg;
use crate::view::FilesView;
use crate::MergeProgress;

/// The one key the commitment value transformer must never rewrite.
pub const COMMITMENT_STATE_KEY: &[u8] = b"state";

/// Rewrites a value while its file moves to a wider tx range; used by the
/// commitment domain to relocate branch references.
pub type ValueTransform<'a> = dyn FnMut(&[u8], u64, u64) -> Result<Vec<u8>, MergeError> + 'a;

/// A domain stream owning its history (and, through it, the sibling
/// inverted index).
pub struct Domain {
    history: History,
    spec: StreamSpec,
    opts: DomainOpts,
    files: Mutex<FileSet>,
}

/// Snapshot of all three sub-streams.
pub struct DomainContext {
    pub values: FilesView,
    pub history: HistoryContext,
}

/// Inputs selected for one domain merge.
pub struct SelectedDomainFiles {
    pub values: Vec<Arc<FileItem>>,
    pub history: SelectedHistoryFiles,
}

/// Outputs of one domain merge.
pub struct DomainFiles {
    pub values: Option<Arc<FileItem>>,
    pub history: Option<Arc<FileItem>>,
    pub index: Option<Arc<FileItem>>,
}

impl Domain {
    /// Opens the domain and its nested streams, scanning `spec.dir`.
    pub fn open(spec: StreamSpec, opts: DomainOpts, index_opts: IndexOpts) -> Result<Self, MergeError> {
        let history = History::open(spec.clone(), index_opts)?;
        let stream = Self { history, spec, opts, files: Mutex::new(FileSet::new()) };
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
            if parsed.name != self.spec.name || parsed.ext != "kv" {
                continue;
            }
            if !dyadic_span(parsed.from_step, parsed.to_step) {
                warn!(file = %name.to_string_lossy(), "skipping file with non-dyadic span");
                continue;
            }
            match self.open_file(parsed.from_step, parsed.to_step, None, &CancelToken::new()) {
                Ok(item) => set.insert(Arc::new(item)),
                Err(err) => warn!(file = %name.to_string_lossy(), %err, "skipping unreadable file"),
            }
        }
        Ok(())
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn context(&self) -> DomainContext {
        DomainContext {
            values: FilesView::capture(&self.files.lock().expect("file set lock poisoned")),
            history: self.history.context(),
        }
    }

    /// Plans all three sub-streams. Values merge independently; the
    /// history/index pair is reconciled.
    pub fn find_merge_range(
        &self,
        ctx: &DomainContext,
        max_end_tx_num: u64,
        max_span: u64,
    ) -> DomainRanges {
        let values = plan::find_merge_range(
            &ctx.values,
            self.spec.step,
            max_end_tx_num,
            max_span.min(self.spec.frozen_span()),
        );
        let HistoryRanges { history, index } =
            self.history.find_merge_range(&ctx.history, max_end_tx_num, max_span);
        DomainRanges { values, history, index }
    }

    /// Selects input files for every sub-stream of `ranges`.
    pub fn files_in_range(
        &self,
        ctx: &DomainContext,
        ranges: &DomainRanges,
    ) -> Result<SelectedDomainFiles, MergeError> {
        let values = match ranges.values {
            Some(range) => {
                let inputs = ctx.values.files_in_range(range.from, range.to);
                assert_contiguous(&inputs, range);
                inputs
            }
            None => Vec::new(),
        };
        let history = self.history.files_in_range(
            &ctx.history,
            &HistoryRanges { history: ranges.history, index: ranges.index },
        )?;
        Ok(SelectedDomainFiles { values, history })
    }

    /// Runs the full domain merge: history/index pair first, then values.
    ///
    /// `transform` rewrites each surviving value for the output range; the
    /// commitment state key is exempt. On error all partial outputs are
    /// unlinked and every file set stays unchanged.
    pub fn merge_files(
        &self,
        selected: &SelectedDomainFiles,
        ranges: &DomainRanges,
        mut transform: Option<&mut ValueTransform<'_>>,
        cancel: &CancelToken,
        progress: &MergeProgress,
    ) -> Result<DomainFiles, MergeError> {
        let HistoryFiles { index, history } = self.history.merge_files(
            &selected.history,
            &HistoryRanges { history: ranges.history, index: ranges.index },
            cancel,
            progress,
        )?;

        let values = match ranges.values {
            Some(range) => {
                match self.merge_values_files(selected, range, transform.take(), cancel, progress) {
                    Ok(item) => Some(item),
                    Err(err) => {
                        if let Some(range) = ranges.index {
                            self.history.inverted_index().remove_outputs(range);
                        }
                        if let Some(range) = ranges.history {
                            self.history.remove_outputs(range);
                        }
                        return Err(err);
                    }
                }
            }
            None => None,
        };
        Ok(DomainFiles { values, history, index })
    }

    fn merge_values_files(
        &self,
        selected: &SelectedDomainFiles,
        range: MergeRange,
        transform: Option<&mut ValueTransform<'_>>,
        cancel: &CancelToken,
        progress: &MergeProgress,
    ) -> Result<Arc<FileItem>, MergeError> {
        // Merging a file into exactly itself is a no-op.
        if let [only] = selected.values.as_slice() {
            if only.start_tx_num == range.from && only.end_tx_num == range.to {
                return Ok(Arc::clone(only));
            }
        }
        let result = self.merge_values_files_inner(selected, range, transform, cancel, progress);
        if result.is_err() {
            self.remove_outputs(range);
        }
        result
    }

    fn merge_values_files_inner(
        &self,
        selected: &SelectedDomainFiles,
        range: MergeRange,
        mut transform: Option<&mut ValueTransform<'_>>,
        cancel: &CancelToken,
        progress: &MergeProgress,
    ) -> Result<Arc<FileItem>, MergeError> {
        assert_contiguous(&selected.values, range);
        cancel.check()?;
        let step = self.spec.step;
        let (from_step, to_step) = (range.from / step, range.to / step);
        let scratch = tempfile::tempdir_in(&self.spec.dir)?;
        let _read_ahead =
            seg::ReadAhead::new(selected.values.iter().map(|f| &f.reader).collect());

        let mut writer = seg::Writer::create(&self.spec.file_path(from_step, to_step, "kv"))?;
        let mut cursors = CursorSet::new(
            selected
                .values
                .iter()
                .map(|f| MergeCursor::new(f.end_tx_num, CursorSource::File(f.reader.getter())))
                .collect(),
        );

        let mut keys = 0u64;
        while let Some(key) = cursors.peek_key() {
            if keys % CANCEL_BATCH == 0 {
                cancel.check()?;
            }
            let key = key.to_vec();
            // The newest file wins the key; older entries are shadowed.
            let winner = *cursors.min_indices().last().expect("minimum key without cursors");
            let value = cursors.val(winner);
            // A zero-length value at the absolute origin is a deletion
            // with no layer beneath it to shadow: drop the entry.
            let dropped = range.from == 0 && value.is_empty();
            if !dropped {
                match transform.as_mut().filter(|_| key != COMMITMENT_STATE_KEY) {
                    Some(transform) => {
                        let rewritten = transform(value, range.from, range.to)?;
                        writer.add_word(&key)?;
                        writer.add_word(&rewritten)?;
                    }
                    None => {
                        let value = value.to_vec();
                        writer.add_word(&key)?;
                        writer.add_word(&value)?;
                    }
                }
            }
            keys += 1;
            progress.add_keys(1);
            cursors.step();
        }
        writer.finish()?;

        let item = self.open_file(from_step, to_step, Some(scratch.path()), cancel)?;
        info!(stream = %self.spec.name, %range, keys, "merged values files");
        Ok(Arc::new(item))
    }

    /// Installs the merged outputs: index, then history, then values, so
    /// every intermediate state a reader can observe is consistent.
    pub fn integrate_merged_files(&self, outs: &DomainFiles) {
        self.history.integrate_merged_files(&HistoryFiles {
            index: outs.index.clone(),
            history: outs.history.clone(),
        });
        if let Some(values) = &outs.values {
            integrate::integrate_merged(&self.files, std::slice::from_ref(values));
        }
    }

    /// Retires the inputs subsumed by the merged outputs.
    pub fn clean_after_merge(&self, outs: &DomainFiles) {
        self.history.clean_after_merge(&HistoryFiles {
            index: outs.index.clone(),
            history: outs.history.clone(),
        });
        integrate::clean_after_merge(&self.files, outs.values.as_deref());
    }

    /// Writes a complete `.kv` file (plus secondary structures) from
    /// already-sorted pairs. The ingest seam for the layers below the
    /// merge engine and for tests; the item is returned un-integrated.
    pub fn build_file(
        &self,
        from_step: u64,
        to_step: u64,
        pairs: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<Arc<FileItem>, MergeError> {
        let mut writer = seg::Writer::create(&self.spec.file_path(from_step, to_step, "kv"))?;
        let mut previous: Option<&[u8]> = None;
        for (key, value) in pairs {
            assert!(previous.is_none_or(|p| p < key.as_slice()), "values must be sorted by key");
            previous = Some(key);
            writer.add_word(key)?;
            writer.add_word(value)?;
        }
        writer.finish()?;
        Ok(Arc::new(self.open_file(from_step, to_step, None, &CancelToken::new())?))
    }

    /// Opens one values file, building whichever secondary structures the
    /// domain options call for.
    fn open_file(
        &self,
        from_step: u64,
        to_step: u64,
        scratch: Option<&Path>,
        cancel: &CancelToken,
    ) -> Result<FileItem, MergeError> {
        let spec = &self.spec;
        let data_path = spec.file_path(from_step, to_step, "kv");
        let reader = seg::Reader::open(&data_path)?;
        let mut paths = vec![data_path];

        let mut accessor = None;
        let mut sampled = None;
        match self.opts.accessor {
            AccessorKind::Hash => {
                let path = spec.file_path(from_step, to_step, "kvi");
                if !path.exists() {
                    build_key_accessor(&reader, &path, spec.dir(), scratch, cancel)?;
                }
                accessor = Some(AccessorIndex::open(&path)?);
                paths.push(path);
            }
            AccessorKind::Sampled => {
                let path = spec.file_path(from_step, to_step, "bt");
                if !path.exists() {
                    SampledIndex::build(&reader, &path)?;
                }
                sampled = Some(SampledIndex::open(&path)?);
                paths.push(path);
            }
        }

        let existence = if self.opts.existence_filter {
            let path = spec.file_path(from_step, to_step, "kvei");
            if !path.exists() {
                build_existence_filter(&reader, &path)?;
            }
            paths.push(path.clone());
            Some(ExistenceFilter::open(&path)?)
        } else {
            None
        };

        let frozen = to_step - from_step >= spec.frozen_steps;
        let mut item =
            FileItem::new(from_step * spec.step, to_step * spec.step, frozen, reader, paths);
        item.accessor = accessor;
        item.sampled = sampled;
        item.existence = existence;
        Ok(item)
    }

    fn remove_outputs(&self, range: MergeRange) {
        let (from_step, to_step) = (range.from / self.spec.step, range.to / self.spec.step);
        for ext in ["kv", "kvi", "bt", "kvei"] {
            let _ = fs::remove_file(self.spec.file_path(from_step, to_step, ext));
        }
    }
}
