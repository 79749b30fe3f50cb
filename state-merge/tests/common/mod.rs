//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use state_merge::config::{DomainOpts, IndexOpts, StreamSpec};
use state_merge::ef::EliasFano;
use state_merge::{Domain, FileItem, History, InvertedIndex};

pub const STEP: u64 = 10;
pub const FROZEN_STEPS: u64 = 64;

pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn spec(name: &str, dir: &Path) -> StreamSpec {
    StreamSpec::new(name, dir, STEP, FROZEN_STEPS)
}

pub fn index_stream(dir: &Path) -> InvertedIndex {
    init_logging();
    InvertedIndex::open(spec("logaddrs", dir), IndexOpts::default()).unwrap()
}

pub fn history_stream(dir: &Path) -> History {
    init_logging();
    History::open(spec("accounts", dir), IndexOpts::default()).unwrap()
}

pub fn domain_stream(dir: &Path, opts: DomainOpts) -> Domain {
    init_logging();
    Domain::open(spec("accounts", dir), opts, IndexOpts::default()).unwrap()
}

pub fn postings(entries: &[(&[u8], &[u64])]) -> Vec<(Vec<u8>, Vec<u64>)> {
    entries.iter().map(|(k, txs)| (k.to_vec(), txs.to_vec())).collect()
}

pub fn pairs(entries: &[(&[u8], &[u8])]) -> Vec<(Vec<u8>, Vec<u8>)> {
    entries.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect()
}

/// Decodes an `.ef` file back into `key → tx numbers`.
pub fn read_postings(item: &FileItem) -> BTreeMap<Vec<u8>, Vec<u64>> {
    let mut out = BTreeMap::new();
    let mut getter = item.reader.getter();
    while getter.has_next() {
        let key = getter.next().to_vec();
        let posting = EliasFano::read(getter.next()).expect("valid posting list");
        out.insert(key, posting.iter().collect());
    }
    out
}

/// Reads an alternating key/value file back into pairs.
pub fn read_pairs(item: &FileItem) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut getter = item.reader.getter();
    while getter.has_next() {
        out.push((getter.next().to_vec(), getter.next().to_vec()));
    }
    out
}

/// Reads every word of a history `.v` file.
pub fn read_words(item: &FileItem) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut getter = item.reader.getter();
    while getter.has_next() {
        out.push(getter.next().to_vec());
    }
    out
}

pub fn ranges_of(view: &state_merge::FilesView) -> Vec<(u64, u64)> {
    view.items().iter().map(|f| (f.start_tx_num, f.end_tx_num)).collect()
}
