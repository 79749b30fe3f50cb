//! Bloom-style existence filters (`.kvei` / `.efei`).
//!
//! Sized at roughly ten bits per key with seven probes; absent keys are
//! rejected with high probability without touching the accessor or the
//! data file.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write as _};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::MergeError;
use crate::index::salted_hash;

const BITS_PER_KEY: u64 = 10;
const PROBES: u64 = 7;
const HEADER_LEN: usize = 16;
const SEED_A: u64 = 0x9e37_79b9_7f4a_7c15;
const SEED_B: u64 = 0xc2b2_ae3d_27d4_eb4f;

/// Accumulates keys for one filter build.
pub struct ExistenceFilterBuilder {
    bits: Vec<u64>,
    nbits: u64,
}

impl ExistenceFilterBuilder {
    pub fn new(expected_keys: u64) -> Self {
        let nbits = (expected_keys * BITS_PER_KEY).max(64);
        Self { bits: vec![0; ((nbits + 63) / 64) as usize], nbits }
    }

    pub fn add(&mut self, key: &[u8]) {
        let h1 = salted_hash(SEED_A, key);
        let h2 = salted_hash(SEED_B, key);
        for i in 0..PROBES {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.nbits;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// Installs the filter at `path` via a staged rename.
    pub fn finish(self, path: &Path) -> io::Result<()> {
        let mut staged = path.as_os_str().to_os_string();
        staged.push(".tmp");
        let staged = PathBuf::from(staged);
        {
            let mut out = BufWriter::new(File::create(&staged)?);
            out.write_all(&self.nbits.to_le_bytes())?;
            out.write_all(&PROBES.to_le_bytes())?;
            for word in &self.bits {
                out.write_all(&word.to_le_bytes())?;
            }
            out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        fs::rename(&staged, path)
    }
}

/// A read-only existence filter.
pub struct ExistenceFilter {
    map: Mmap,
    nbits: u64,
    probes: u64,
}

impl ExistenceFilter {
    pub fn open(path: &Path) -> Result<Self, MergeError> {
        let file = File::open(path)?;
        // Safety: installed by rename, never rewritten.
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < HEADER_LEN {
            return Err(MergeError::Corrupt { what: "existence filter", path: path.to_path_buf() });
        }
        let nbits = u64::from_le_bytes(map[0..8].try_into().unwrap());
        let probes = u64::from_le_bytes(map[8..16].try_into().unwrap());
        if nbits == 0 || map.len() < HEADER_LEN + (((nbits + 63) / 64) * 8) as usize {
            return Err(MergeError::Corrupt { what: "existence filter", path: path.to_path_buf() });
        }
        Ok(Self { map, nbits, probes })
    }

    /// False means the key is definitely absent.
    pub fn contains(&self, key: &[u8]) -> bool {
        let h1 = salted_hash(SEED_A, key);
        let h2 = salted_hash(SEED_B, key);
        (0..self.probes).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.nbits;
            let at = HEADER_LEN + (bit / 64) as usize * 8;
            let word = u64::from_le_bytes(self.map[at..at + 8].try_into().unwrap());
            word & (1 << (bit % 64)) != 0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_keys_always_hit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1-test.0-2.kvei");

        let keys: Vec<Vec<u8>> = (0u32..300).map(|i| i.to_be_bytes().to_vec()).collect();
        let mut b = ExistenceFilterBuilder::new(keys.len() as u64);
        for key in &keys {
            b.add(key);
        }
        b.finish(&path).unwrap();

        let filter = ExistenceFilter::open(&path).unwrap();
        assert!(keys.iter().all(|k| filter.contains(k)));

        let misses = (1000u32..2000)
            .filter(|i| filter.contains(format!("absent-{i}").as_bytes()))
            .count();
        assert!(misses < 50, "false positive rate too high: {misses}/1000");
    }
}
