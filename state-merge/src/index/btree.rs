//! Sampled sorted-key indices (`.bt`) over values files.
//!
//! Values files are written in key order, so an index that records every
//! `SAMPLE_EVERY`-th key with its file offset is enough for lookups: binary
//! search the samples, then walk the data file from the sampled offset with
//! an embedded cursor. This stands in for a full B+-tree while keeping its
//! contract (ordered seeks over the data file).

use std::fs::{self, File};
use std::io::{self, BufWriter, Write as _};
use std::path::{Path, PathBuf};

use crate::error::MergeError;
use crate::seg;

const SAMPLE_EVERY: u64 = 128;

/// A read-only sampled index over one values file.
pub struct SampledIndex {
    samples: Vec<(Vec<u8>, u64)>,
    key_count: u64,
}

impl SampledIndex {
    /// Scans `reader` (alternating key/value words) and installs the index
    /// at `path`.
    pub fn build(reader: &seg::Reader, path: &Path) -> io::Result<()> {
        let mut samples = Vec::new();
        let mut getter = reader.getter();
        let mut keys = 0u64;
        while getter.has_next() {
            let at = getter.pos();
            let key = getter.next();
            getter.skip();
            if keys % SAMPLE_EVERY == 0 {
                samples.push((key.to_vec(), at));
            }
            keys += 1;
        }

        let mut staged = path.as_os_str().to_os_string();
        staged.push(".tmp");
        let staged = PathBuf::from(staged);
        {
            let mut out = BufWriter::new(File::create(&staged)?);
            out.write_all(&keys.to_le_bytes())?;
            out.write_all(&(samples.len() as u64).to_le_bytes())?;
            for (key, off) in &samples {
                out.write_all(&(key.len() as u32).to_le_bytes())?;
                out.write_all(key)?;
                out.write_all(&off.to_le_bytes())?;
            }
            out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        fs::rename(&staged, path)
    }

    pub fn open(path: &Path) -> Result<Self, MergeError> {
        let data = fs::read(path)?;
        let corrupt = || MergeError::Corrupt { what: "sampled index", path: path.to_path_buf() };
        if data.len() < 16 {
            return Err(corrupt());
        }
        let key_count = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let sample_count = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let mut samples = Vec::with_capacity(sample_count as usize);
        let mut at = 16usize;
        for _ in 0..sample_count {
            if at + 4 > data.len() {
                return Err(corrupt());
            }
            let len = u32::from_le_bytes(data[at..at + 4].try_into().unwrap()) as usize;
            at += 4;
            if at + len + 8 > data.len() {
                return Err(corrupt());
            }
            let key = data[at..at + len].to_vec();
            at += len;
            let off = u64::from_le_bytes(data[at..at + 8].try_into().unwrap());
            at += 8;
            samples.push((key, off));
        }
        Ok(Self { samples, key_count })
    }

    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    /// Positions a cursor at the first entry with key `>= key`.
    pub fn seek<'a>(&self, key: &[u8], reader: &'a seg::Reader) -> Option<(&'a [u8], &'a [u8])> {
        let block = self.samples.partition_point(|(k, _)| k.as_slice() <= key);
        let start = match block.checked_sub(1) {
            Some(i) => self.samples[i].1,
            None => self.samples.first()?.1,
        };
        let mut getter = reader.getter();
        getter.reset(start);
        while getter.has_next() {
            let k = getter.next();
            let v = getter.next();
            if k >= key {
                return Some((k, v));
            }
        }
        None
    }

    /// Exact-match lookup through [`seek`](Self::seek).
    pub fn get<'a>(&self, key: &[u8], reader: &'a seg::Reader) -> Option<&'a [u8]> {
        match self.seek(key, reader) {
            Some((k, v)) if k == key => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeks_across_sample_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("v1-test.0-2.kv");
        let index_path = dir.path().join("v1-test.0-2.bt");

        let mut w = seg::Writer::create(&data_path).unwrap();
        let keys: Vec<Vec<u8>> = (0u32..1000).map(|i| format!("k{i:06}").into_bytes()).collect();
        for (i, key) in keys.iter().enumerate() {
            w.add_word(key).unwrap();
            w.add_word(format!("value-{i}").as_bytes()).unwrap();
        }
        w.finish().unwrap();

        let reader = seg::Reader::open(&data_path).unwrap();
        SampledIndex::build(&reader, &index_path).unwrap();
        let idx = SampledIndex::open(&index_path).unwrap();
        assert_eq!(idx.key_count(), 1000);

        assert_eq!(idx.get(b"k000000", &reader), Some(b"value-0" as &[u8]));
        assert_eq!(idx.get(b"k000500", &reader), Some(b"value-500" as &[u8]));
        assert_eq!(idx.get(b"k000999", &reader), Some(b"value-999" as &[u8]));
        assert_eq!(idx.get(b"missing", &reader), None);

        let (k, _) = idx.seek(b"k0005", &reader).unwrap();
        assert_eq!(k, b"k000500");
    }
}
