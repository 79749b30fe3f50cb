//! End-to-end merge scenarios across the three stream kinds.

mod common;

use common::*;

use state_merge::config::DomainOpts;
use state_merge::error::MergeError;
use state_merge::files::file_name;
use state_merge::plan::{DomainRanges, HistoryRanges, MergeRange};
use state_merge::{CancelToken, MergeProgress, COMMITMENT_STATE_KEY};

#[test]
fn index_merge_unions_posting_lists() {
    let dir = tempfile::tempdir().unwrap();
    let ii = index_stream(dir.path());

    let first = ii
        .build_file(0, 1, &postings(&[(b"a", &[1]), (b"b", &[STEP])]))
        .unwrap();
    let second = ii.build_file(1, 2, &postings(&[(b"a", &[STEP + 2])])).unwrap();
    ii.integrate_merged_files(&first);
    ii.integrate_merged_files(&second);

    let ctx = ii.context();
    let range = ii.find_merge_range(&ctx, 2 * STEP, 4 * STEP).unwrap();
    assert_eq!(range, MergeRange { from: 0, to: 2 * STEP });

    let inputs = ii.files_in_range(&ctx, range);
    let merged = ii.merge_files(&inputs, range, &CancelToken::new(), &MergeProgress::default()).unwrap();

    let decoded = read_postings(&merged);
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[b"a".as_slice()], vec![1, STEP + 2]);
    assert_eq!(decoded[b"b".as_slice()], vec![STEP]);

    ii.integrate_merged_files(&merged);
    ii.clean_after_merge(Some(&merged));
    drop(ctx);

    assert_eq!(ranges_of(&ii.context()), vec![(0, 2 * STEP)]);
}

#[test]
fn planner_selects_dyadic_cover_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let ii = index_stream(dir.path());

    for (from, to) in [(0, 2), (2, 3), (3, 4)] {
        let item = ii.build_file(from, to, &postings(&[(b"k", &[from * STEP])])).unwrap();
        ii.integrate_merged_files(&item);
    }

    let ctx = ii.context();
    let range = ii.find_merge_range(&ctx, 4 * STEP, 4 * STEP).unwrap();
    assert_eq!(range, MergeRange { from: 0, to: 4 * STEP });

    let inputs = ii.files_in_range(&ctx, range);
    assert_eq!(inputs.len(), 3);
    let merged = ii.merge_files(&inputs, range, &CancelToken::new(), &MergeProgress::default()).unwrap();
    assert_eq!(read_postings(&merged)[b"k".as_slice()], vec![0, 2 * STEP, 3 * STEP]);
}

#[test]
fn domain_merge_drops_deletions_at_origin() {
    let dir = tempfile::tempdir().unwrap();
    let domain = domain_stream(dir.path(), DomainOpts::default());

    let first = domain
        .build_file(0, 1, &pairs(&[(b"gone", b"v1"), (b"kept", b"old")]))
        .unwrap();
    let second = domain.build_file(1, 2, &pairs(&[(b"gone", b""), (b"kept", b"new")])).unwrap();
    for item in [&first, &second] {
        domain.integrate_merged_files(&state_merge::DomainFiles {
            values: Some(item.clone()),
            history: None,
            index: None,
        });
    }

    let ctx = domain.context();
    let ranges = domain.find_merge_range(&ctx, 2 * STEP, 4 * STEP);
    assert_eq!(ranges.values, Some(MergeRange { from: 0, to: 2 * STEP }));
    assert_eq!(ranges.history, None);
    assert_eq!(ranges.index, None);

    let selected = domain.files_in_range(&ctx, &ranges).unwrap();
    let outs = domain
        .merge_files(&selected, &ranges, None, &CancelToken::new(), &MergeProgress::default())
        .unwrap();

    // The zero-length value at the absolute origin deletes the key; the
    // other key keeps the newest file's value.
    let values = outs.values.as_ref().unwrap();
    assert_eq!(read_pairs(values), pairs(&[(b"kept", b"new")]));
}

#[test]
fn deletion_survives_when_merge_starts_past_origin() {
    let dir = tempfile::tempdir().unwrap();
    let domain = domain_stream(dir.path(), DomainOpts::default());

    // Same shape shifted right by two steps: [2,3) + [3,4) merges into
    // [2,4), which does not start at tx 0, so the empty value must stay
    // to shadow older layers.
    let first = domain.build_file(2, 3, &pairs(&[(b"gone", b"v1")])).unwrap();
    let second = domain.build_file(3, 4, &pairs(&[(b"gone", b"")])).unwrap();
    for item in [&first, &second] {
        domain.integrate_merged_files(&state_merge::DomainFiles {
            values: Some(item.clone()),
            history: None,
            index: None,
        });
    }

    let ranges = DomainRanges {
        values: Some(MergeRange { from: 2 * STEP, to: 4 * STEP }),
        history: None,
        index: None,
    };
    let ctx = domain.context();
    let selected = domain.files_in_range(&ctx, &ranges).unwrap();
    let outs = domain
        .merge_files(&selected, &ranges, None, &CancelToken::new(), &MergeProgress::default())
        .unwrap();
    assert_eq!(read_pairs(outs.values.as_ref().unwrap()), pairs(&[(b"gone", b"")]));
}

#[test]
fn missing_history_sibling_fails_the_merge() {
    let dir = tempfile::tempdir().unwrap();
    let history = history_stream(dir.path());

    // A complete pair for [0,1), but only the index side for [1,2).
    let pair = history
        .build_files(0, 1, &[(b"k".to_vec(), vec![(1, b"v".to_vec())])])
        .unwrap();
    history.integrate_merged_files(&pair);
    let lone_index = history
        .inverted_index()
        .build_file(1, 2, &postings(&[(b"k", &[STEP + 1])]))
        .unwrap();
    history.inverted_index().integrate_merged_files(&lone_index);

    let ctx = history.context();
    let ranges = HistoryRanges {
        history: Some(MergeRange { from: 0, to: 2 * STEP }),
        index: Some(MergeRange { from: 0, to: 2 * STEP }),
    };
    let err = history.files_in_range(&ctx, &ranges).unwrap_err();
    match err {
        MergeError::MissingPair { present, missing } => {
            assert_eq!(present, file_name("accounts", 1, 2, "ef"));
            assert_eq!(missing, file_name("accounts", 1, 2, "v"));
        }
        other => panic!("expected missing pair, got {other}"),
    }

    // Nothing changed: both sides still expose their original files.
    drop(ctx);
    let ctx = history.context();
    assert_eq!(ranges_of(&ctx.history), vec![(0, STEP)]);
    assert_eq!(ranges_of(&ctx.index), vec![(0, STEP), (STEP, 2 * STEP)]);
}

#[test]
fn integration_retires_inputs_and_defers_unlink_to_readers() {
    let dir = tempfile::tempdir().unwrap();
    let ii = index_stream(dir.path());

    let first = ii.build_file(0, 2, &postings(&[(b"k", &[5])])).unwrap();
    let second = ii.build_file(2, 4, &postings(&[(b"k", &[2 * STEP + 5])])).unwrap();
    ii.integrate_merged_files(&first);
    ii.integrate_merged_files(&second);

    // A reader captured before the merge keeps the small files alive.
    let old_ctx = ii.context();

    let range = MergeRange { from: 0, to: 4 * STEP };
    let inputs = ii.files_in_range(&old_ctx, range);
    let merged = ii.merge_files(&inputs, range, &CancelToken::new(), &MergeProgress::default()).unwrap();
    ii.integrate_merged_files(&merged);
    ii.clean_after_merge(Some(&merged));

    assert!(first.can_delete() && second.can_delete());
    let small = dir.path().join(file_name("logaddrs", 0, 2, "ef"));
    assert!(small.exists(), "unlink must wait for the live reader");

    // New readers already see only the merged file.
    assert_eq!(ranges_of(&ii.context()), vec![(0, 4 * STEP)]);

    drop(old_ctx);
    assert!(!small.exists(), "last reader release unlinks the files");
    assert!(!dir.path().join(file_name("logaddrs", 0, 2, "efi")).exists());
    assert!(!dir.path().join(file_name("logaddrs", 2, 4, "ef")).exists());
    assert!(dir.path().join(file_name("logaddrs", 0, 4, "ef")).exists());
}

#[test]
fn integration_unlinks_synchronously_without_readers() {
    let dir = tempfile::tempdir().unwrap();
    let ii = index_stream(dir.path());

    let first = ii.build_file(0, 1, &postings(&[(b"k", &[1])])).unwrap();
    let second = ii.build_file(1, 2, &postings(&[(b"k", &[STEP + 1])])).unwrap();
    ii.integrate_merged_files(&first);
    ii.integrate_merged_files(&second);

    let range = MergeRange { from: 0, to: 2 * STEP };
    let merged = {
        let ctx = ii.context();
        let inputs = ii.files_in_range(&ctx, range);
        ii.merge_files(&inputs, range, &CancelToken::new(), &MergeProgress::default()).unwrap()
    };
    ii.integrate_merged_files(&merged);
    ii.clean_after_merge(Some(&merged));

    assert!(!dir.path().join(file_name("logaddrs", 0, 1, "ef")).exists());
    assert!(!dir.path().join(file_name("logaddrs", 1, 2, "ef")).exists());
}

#[test]
fn history_merge_replays_values_in_tx_order() {
    let dir = tempfile::tempdir().unwrap();
    let history = history_stream(dir.path());

    let first = history
        .build_files(
            0,
            1,
            &[
                (b"k1".to_vec(), vec![(1, b"x1".to_vec()), (5, b"x2".to_vec())]),
                (b"k2".to_vec(), vec![(3, b"y1".to_vec())]),
            ],
        )
        .unwrap();
    let second = history
        .build_files(1, 2, &[(b"k1".to_vec(), vec![(STEP + 2, b"x3".to_vec())])])
        .unwrap();
    history.integrate_merged_files(&first);
    history.integrate_merged_files(&second);
    assert_eq!(history.end_indexed_tx_num(), Some(2 * STEP));

    let ctx = history.context();
    let ranges = history.find_merge_range(&ctx, 2 * STEP, 4 * STEP);
    let expected = Some(MergeRange { from: 0, to: 2 * STEP });
    assert_eq!(ranges, HistoryRanges { history: expected, index: expected });

    let selected = history.files_in_range(&ctx, &ranges).unwrap();
    let outs = history
        .merge_files(&selected, &ranges, &CancelToken::new(), &MergeProgress::default())
        .unwrap();

    let index = outs.index.as_ref().unwrap();
    let decoded = read_postings(index);
    assert_eq!(decoded[b"k1".as_slice()], vec![1, 5, STEP + 2]);
    assert_eq!(decoded[b"k2".as_slice()], vec![3]);

    // Values land keyed ascending, tx ascending within each key.
    let merged_history = outs.history.as_ref().unwrap();
    assert_eq!(
        read_words(merged_history),
        vec![b"x1".to_vec(), b"x2".to_vec(), b"x3".to_vec(), b"y1".to_vec()],
    );

    // The accessor finds every (tx ‖ key) at its value offset.
    let accessor = merged_history.accessor.as_ref().unwrap();
    for (key, tx, value) in
        [(b"k1", 1u64, b"x1" as &[u8]), (b"k1", 5, b"x2"), (b"k1", STEP + 2, b"x3"), (b"k2", 3, b"y1")]
    {
        let mut compound = tx.to_be_bytes().to_vec();
        compound.extend_from_slice(key);
        let offset = accessor.lookup(&compound).expect("indexed value");
        let mut getter = merged_history.reader.getter();
        getter.reset(offset);
        assert_eq!(getter.next(), value);
    }

    history.integrate_merged_files(&outs);
    history.clean_after_merge(&outs);
    drop(ctx);

    let ctx = history.context();
    assert_eq!(ranges_of(&ctx.history), vec![(0, 2 * STEP)]);
    assert_eq!(ranges_of(&ctx.index), vec![(0, 2 * STEP)]);
}

#[test]
fn lagging_history_catches_up_with_merged_index() {
    let dir = tempfile::tempdir().unwrap();
    let history = history_stream(dir.path());

    for (from, to, tx) in [(0, 1, 4u64), (1, 2, STEP + 4)] {
        let pair = history
            .build_files(from, to, &[(b"k".to_vec(), vec![(tx, format!("v{tx}").into_bytes())])])
            .unwrap();
        history.integrate_merged_files(&pair);
    }

    // Round one: merge only the index side, leaving history behind.
    let ctx = history.context();
    let index_only = HistoryRanges {
        history: None,
        index: Some(MergeRange { from: 0, to: 2 * STEP }),
    };
    let selected = history.files_in_range(&ctx, &index_only).unwrap();
    let outs = history
        .merge_files(&selected, &index_only, &CancelToken::new(), &MergeProgress::default())
        .unwrap();
    assert!(outs.history.is_none());
    history.integrate_merged_files(&outs);
    drop(ctx);

    // Round two: the planner sees history lagging and lets it catch up;
    // its values replay against the retired small index files.
    let ctx = history.context();
    let ranges = history.find_merge_range(&ctx, 2 * STEP, 4 * STEP);
    assert_eq!(ranges.history, Some(MergeRange { from: 0, to: 2 * STEP }));
    assert_eq!(ranges.index, None);

    let selected = history.files_in_range(&ctx, &ranges).unwrap();
    let outs = history
        .merge_files(&selected, &ranges, &CancelToken::new(), &MergeProgress::default())
        .unwrap();
    let merged_history = outs.history.as_ref().unwrap();
    assert_eq!(merged_history.start_tx_num, 0);
    assert_eq!(merged_history.end_tx_num, 2 * STEP);
    assert_eq!(read_words(merged_history).len(), 2);

    history.integrate_merged_files(&outs);
    history.clean_after_merge(&outs);
    drop(ctx);

    let ctx = history.context();
    assert_eq!(ranges_of(&ctx.history), vec![(0, 2 * STEP)]);
    assert_eq!(ranges_of(&ctx.index), vec![(0, 2 * STEP)]);
}

#[test]
fn full_domain_pipeline_merges_all_three_streams() {
    let dir = tempfile::tempdir().unwrap();
    let domain = domain_stream(dir.path(), DomainOpts::default());

    for (from, to, value, tx) in [(0u64, 1u64, b"a1" as &[u8], 2u64), (1, 2, b"a2", STEP + 7)] {
        let values = domain.build_file(from, to, &pairs(&[(b"acct", value)])).unwrap();
        let pair = domain
            .history()
            .build_files(from, to, &[(b"acct".to_vec(), vec![(tx, value.to_vec())])])
            .unwrap();
        domain.integrate_merged_files(&state_merge::DomainFiles {
            values: Some(values),
            history: pair.history,
            index: pair.index,
        });
    }

    let ctx = domain.context();
    let ranges = domain.find_merge_range(&ctx, 2 * STEP, 4 * STEP);
    let expected = Some(MergeRange { from: 0, to: 2 * STEP });
    assert_eq!((ranges.values, ranges.history, ranges.index), (expected, expected, expected));

    let selected = domain.files_in_range(&ctx, &ranges).unwrap();
    let progress = MergeProgress::default();
    let outs = domain
        .merge_files(&selected, &ranges, None, &CancelToken::new(), &progress)
        .unwrap();
    assert!(progress.keys() > 0);

    assert_eq!(read_pairs(outs.values.as_ref().unwrap()), pairs(&[(b"acct", b"a2")]));
    assert_eq!(
        read_postings(outs.index.as_ref().unwrap())[b"acct".as_slice()],
        vec![2, STEP + 7],
    );

    domain.integrate_merged_files(&outs);
    domain.clean_after_merge(&outs);
    drop(ctx);

    let ctx = domain.context();
    assert_eq!(ranges_of(&ctx.values), vec![(0, 2 * STEP)]);
    assert_eq!(ranges_of(&ctx.history.history), vec![(0, 2 * STEP)]);
    assert_eq!(ranges_of(&ctx.history.index), vec![(0, 2 * STEP)]);
    assert_eq!(domain.history().end_indexed_tx_num(), Some(2 * STEP));
}

#[test]
fn value_transformer_rewrites_all_but_the_state_key() {
    let dir = tempfile::tempdir().unwrap();
    let domain = domain_stream(dir.path(), DomainOpts::default());

    let first = domain
        .build_file(0, 1, &pairs(&[(b"branch", b"ref-old"), (COMMITMENT_STATE_KEY, b"root-old")]))
        .unwrap();
    let second = domain.build_file(1, 2, &pairs(&[(b"branch", b"ref-new")])).unwrap();
    for item in [&first, &second] {
        domain.integrate_merged_files(&state_merge::DomainFiles {
            values: Some(item.clone()),
            history: None,
            index: None,
        });
    }

    let ctx = domain.context();
    let ranges = domain.find_merge_range(&ctx, 2 * STEP, 4 * STEP);
    let selected = domain.files_in_range(&ctx, &ranges).unwrap();

    let mut seen = Vec::new();
    let mut transform = |value: &[u8], from: u64, to: u64| -> Result<Vec<u8>, MergeError> {
        seen.push((value.to_vec(), from, to));
        Ok(value.to_ascii_uppercase())
    };
    let outs = domain
        .merge_files(&selected, &ranges, Some(&mut transform), &CancelToken::new(), &MergeProgress::default())
        .unwrap();

    assert_eq!(
        read_pairs(outs.values.as_ref().unwrap()),
        pairs(&[(b"branch", b"REF-NEW"), (COMMITMENT_STATE_KEY, b"root-old")]),
    );
    // The transformer saw only the surviving non-state value, tagged with
    // the output range.
    assert_eq!(seen, vec![(b"ref-new".to_vec(), 0, 2 * STEP)]);
}
