//! Merge range selection.
//!
//! File spans follow a dyadic hierarchy: a file ending at step `e` may
//! legally span `e & e.wrapping_neg()` steps — the highest binary-tree
//! ancestor whose right boundary is `e`. The planner walks a snapshot view
//! and, for each file whose legal span reaches further left than the file
//! itself, proposes merging everything back to that boundary. Among the
//! proposals it keeps the one starting earliest, letting a strict superset
//! replace an earlier pick. The result keeps at most `O(log total)` live
//! files per stream.

use std::fmt;

use crate::view::FilesView;

/// A half-open, step-aligned tx range selected for merging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeRange {
    pub from: u64,
    pub to: u64,
}

impl MergeRange {
    pub fn span(&self) -> u64 {
        self.to - self.from
    }
}

impl fmt::Display for MergeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

/// Reconciled ranges for a history stream and its sibling inverted index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HistoryRanges {
    pub history: Option<MergeRange>,
    pub index: Option<MergeRange>,
}

impl HistoryRanges {
    pub fn any(&self) -> bool {
        self.history.is_some() || self.index.is_some()
    }
}

/// Ranges for a domain: its values files plus the history/index pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DomainRanges {
    pub values: Option<MergeRange>,
    pub history: Option<MergeRange>,
    pub index: Option<MergeRange>,
}

impl DomainRanges {
    pub fn any(&self) -> bool {
        self.values.is_some() || self.history.is_some() || self.index.is_some()
    }
}

/// Selects the merge to perform next on one stream, if any.
///
/// `max_end_tx_num` caps how far along the tx axis merging may reach;
/// `max_span` caps the size of a single merge. Both are in tx numbers.
pub fn find_merge_range(
    view: &FilesView,
    step: u64,
    max_end_tx_num: u64,
    max_span: u64,
) -> Option<MergeRange> {
    assert!(step > 0, "aggregation step must be positive");
    let max_span_steps = (max_span / step).max(1);
    let mut selected: Option<MergeRange> = None;

    for item in view.items() {
        if item.frozen {
            continue;
        }
        if item.end_tx_num > max_end_tx_num {
            break;
        }
        assert!(
            item.start_tx_num % step == 0 && item.end_tx_num % step == 0,
            "file [{}, {}) not aligned to step {step}",
            item.start_tx_num,
            item.end_tx_num,
        );
        let end_step = item.end_tx_num / step;
        // Lowest set bit of the end step: the largest span that may
        // legally end at this boundary.
        let span_steps = (end_step & end_step.wrapping_neg()).min(max_span_steps);
        let from = item.end_tx_num - span_steps * step;
        if from >= item.start_tx_num {
            continue;
        }
        let candidate = MergeRange { from, to: item.end_tx_num };
        selected = match selected {
            None => Some(candidate),
            // Earliest start wins; a strict superset replaces the pick
            // rather than accumulating next to it.
            Some(prior) if candidate.from < prior.from => Some(candidate),
            Some(prior) if candidate.from <= prior.from && candidate.to > prior.to => {
                Some(candidate)
            }
            Some(prior) => Some(prior),
        };
    }
    selected
}

/// Keeps the history/index pair consistent: history files must never cover
/// tx ranges their sibling index does not.
///
/// When both sides propose ranges with different ends, the side reaching
/// further is dropped for this round — history must not outrun the index,
/// and a lagging history is given the chance to catch up before the index
/// grows again.
pub fn reconcile_pair(
    history: Option<MergeRange>,
    index: Option<MergeRange>,
) -> HistoryRanges {
    match (history, index) {
        (Some(h), Some(i)) if h.to > i.to => HistoryRanges { history: None, index: Some(i) },
        (Some(h), Some(i)) if h.to < i.to => HistoryRanges { history: Some(h), index: None },
        (history, index) => HistoryRanges { history, index },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{file_name, FileItem, FileSet};
    use crate::seg;
    use std::sync::Arc;

    const STEP: u64 = 10;

    fn view_of(dir: &std::path::Path, ranges: &[(u64, u64)]) -> FilesView {
        let mut set = FileSet::new();
        for &(from_step, to_step) in ranges {
            let path = dir.join(file_name("t", from_step, to_step, "ef"));
            let mut w = seg::Writer::create(&path).unwrap();
            w.add_word(b"k").unwrap();
            w.add_word(b"v").unwrap();
            w.finish().unwrap();
            let reader = seg::Reader::open(&path).unwrap();
            set.insert(Arc::new(FileItem::new(
                from_step * STEP,
                to_step * STEP,
                false,
                reader,
                vec![path],
            )));
        }
        FilesView::capture(&set)
    }

    #[test]
    fn selects_dyadic_cover_of_end_step() {
        let dir = tempfile::tempdir().unwrap();
        // End step 4 covers span 4, pulling all three files together.
        let view = view_of(dir.path(), &[(0, 2), (2, 3), (3, 4)]);
        let range = find_merge_range(&view, STEP, 4 * STEP, 4 * STEP);
        assert_eq!(range, Some(MergeRange { from: 0, to: 4 * STEP }));
    }

    #[test]
    fn no_candidate_when_files_sit_at_their_tier() {
        let dir = tempfile::tempdir().unwrap();
        // Spans 2 and 1 reach exactly their own starts; nothing to do.
        let view = view_of(dir.path(), &[(0, 2), (2, 3)]);
        assert_eq!(find_merge_range(&view, STEP, 4 * STEP, 4 * STEP), None);
    }

    #[test]
    fn span_cap_limits_the_merge() {
        let dir = tempfile::tempdir().unwrap();
        let view = view_of(dir.path(), &[(0, 2), (2, 3), (3, 4)]);
        // Capped at 2 steps: end step 4 may only reach back to step 2.
        let range = find_merge_range(&view, STEP, 4 * STEP, 2 * STEP);
        assert_eq!(range, Some(MergeRange { from: 2 * STEP, to: 4 * STEP }));
    }

    #[test]
    fn end_cap_excludes_later_files() {
        let dir = tempfile::tempdir().unwrap();
        let view = view_of(dir.path(), &[(0, 2), (2, 3), (3, 4)]);
        assert_eq!(find_merge_range(&view, STEP, 3 * STEP, 4 * STEP), None);
    }

    #[test]
    fn reconciliation_drops_the_leading_side() {
        let a = MergeRange { from: 0, to: 40 };
        let b = MergeRange { from: 0, to: 20 };

        let r = reconcile_pair(Some(a), Some(b));
        assert_eq!(r, HistoryRanges { history: None, index: Some(b) });

        let r = reconcile_pair(Some(b), Some(a));
        assert_eq!(r, HistoryRanges { history: Some(b), index: None });

        let r = reconcile_pair(Some(a), Some(a));
        assert_eq!(r, HistoryRanges { history: Some(a), index: Some(a) });

        let r = reconcile_pair(None, Some(a));
        assert_eq!(r, HistoryRanges { history: None, index: Some(a) });
    }
}
