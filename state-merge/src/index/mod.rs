//! Secondary structures built next to each data file.
//!
//! The accessor index in this module maps a key to the absolute file offset
//! of its word in the data file. It is an open-addressed table of salted
//! 64-bit fingerprints: the builder spools `(key, offset)` pairs to scratch
//! once, then tries successive salts until the table places every key with
//! a bounded probe distance and no fingerprint duplicates. Lookups are
//! unambiguous for present keys; an absent key may return an arbitrary
//! offset, so callers that need certainty verify against the data file or
//! consult the existence filter first.

pub mod btree;
pub mod existence;

use std::fs::{self, File};
use std::hash::Hasher as _;
use std::io::{self, BufWriter, Read as _, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use fnv::FnvHasher;
use memmap2::Mmap;

use crate::cancel::CancelToken;
use crate::error::MergeError;

/// Salts tried before giving up with [`MergeError::AccessorCollision`].
pub const SALT_ATTEMPTS: u32 = 8;

const PROBE_LIMIT: u64 = 32;
const HEADER_LEN: usize = 24;

pub(crate) fn salted_hash(salt: u64, key: &[u8]) -> u64 {
    let mut h = FnvHasher::with_key(0xcbf2_9ce4_8422_2325 ^ salt);
    h.write(key);
    h.finish()
}

fn slot_count(keys: u64) -> u64 {
    (keys * 2).next_power_of_two().max(16)
}

/// Accumulates `(key, offset)` pairs for one accessor build.
///
/// Pairs are staged in an unlinked scratch file inside the per-merge
/// tempdir, so salt retries re-read the scratch rather than re-scanning the
/// data file.
pub struct AccessorBuilder {
    key_count: u64,
    added: u64,
    scratch: BufWriter<File>,
}

impl AccessorBuilder {
    /// Sizes a builder for exactly `key_count` keys.
    pub fn new(key_count: u64, tmpdir: &Path) -> io::Result<Self> {
        let scratch = BufWriter::new(tempfile::tempfile_in(tmpdir)?);
        Ok(Self { key_count, added: 0, scratch })
    }

    pub fn add_key(&mut self, key: &[u8], offset: u64) -> io::Result<()> {
        debug_assert!(self.added < self.key_count, "accessor key count exceeded");
        write_len_prefixed(&mut self.scratch, key)?;
        self.scratch.write_all(&offset.to_le_bytes())?;
        self.added += 1;
        Ok(())
    }

    /// Builds and installs the index at `path`, retrying salts on
    /// collision. The cancellation token is consulted before each attempt.
    pub fn build(self, path: &Path, cancel: &CancelToken) -> Result<(), MergeError> {
        assert_eq!(self.added, self.key_count, "accessor built with {} of {} keys", self.added, self.key_count);
        let mut scratch = self.scratch.into_inner().map_err(|e| io::Error::from(e.into_error()))?;
        scratch.seek(SeekFrom::Start(0))?;
        let mut pairs = Vec::new();
        scratch.read_to_end(&mut pairs)?;

        let slots = slot_count(self.key_count);
        let mask = slots - 1;
        for attempt in 0..SALT_ATTEMPTS {
            cancel.check()?;
            let salt = u64::from(attempt);
            if let Some(table) = try_place(&pairs, self.key_count, salt, slots, mask) {
                return write_index(path, salt, self.key_count, &table).map_err(MergeError::Io);
            }
        }
        Err(MergeError::AccessorCollision { path: path.to_path_buf(), attempts: SALT_ATTEMPTS })
    }
}

// One linear-probing pass over the staged pairs; None signals a collision
// (probe overrun or duplicate fingerprint) and asks for the next salt.
fn try_place(pairs: &[u8], key_count: u64, salt: u64, slots: u64, mask: u64) -> Option<Vec<(u64, u64)>> {
    let mut table = vec![(0u64, 0u64); slots as usize];
    let mut at = 0usize;
    for _ in 0..key_count {
        let (key, offset, next) = read_pair(pairs, at);
        at = next;
        let fp = salted_hash(salt, key);
        let mut slot = fp & mask;
        let mut placed = false;
        for _ in 0..PROBE_LIMIT {
            let entry = &mut table[slot as usize];
            if entry.1 == 0 {
                *entry = (fp, offset + 1);
                placed = true;
                break;
            }
            if entry.0 == fp {
                return None;
            }
            slot = (slot + 1) & mask;
        }
        if !placed {
            return None;
        }
    }
    Some(table)
}

fn write_index(path: &Path, salt: u64, key_count: u64, table: &[(u64, u64)]) -> io::Result<()> {
    let mut staged = path.as_os_str().to_os_string();
    staged.push(".tmp");
    let staged = PathBuf::from(staged);
    {
        let mut out = BufWriter::new(File::create(&staged)?);
        out.write_all(&salt.to_le_bytes())?;
        out.write_all(&key_count.to_le_bytes())?;
        out.write_all(&(table.len() as u64).to_le_bytes())?;
        for (fp, off) in table {
            out.write_all(&fp.to_le_bytes())?;
            out.write_all(&off.to_le_bytes())?;
        }
        out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    }
    fs::rename(&staged, path)
}

/// A read-only accessor index.
pub struct AccessorIndex {
    map: Mmap,
    salt: u64,
    key_count: u64,
    mask: u64,
}

impl AccessorIndex {
    pub fn open(path: &Path) -> Result<Self, MergeError> {
        let file = File::open(path)?;
        // Safety: installed by rename, never rewritten.
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < HEADER_LEN {
            return Err(MergeError::Corrupt { what: "accessor index", path: path.to_path_buf() });
        }
        let salt = u64::from_le_bytes(map[0..8].try_into().unwrap());
        let key_count = u64::from_le_bytes(map[8..16].try_into().unwrap());
        let slots = u64::from_le_bytes(map[16..24].try_into().unwrap());
        if !slots.is_power_of_two() || map.len() != HEADER_LEN + slots as usize * 16 {
            return Err(MergeError::Corrupt { what: "accessor index", path: path.to_path_buf() });
        }
        Ok(Self { map, salt, key_count, mask: slots - 1 })
    }

    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    pub fn salt(&self) -> u64 {
        self.salt
    }

    /// Offset of `key`'s word in the data file, for keys the file contains.
    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        if self.key_count == 0 {
            return None;
        }
        let fp = salted_hash(self.salt, key);
        let mut slot = fp & self.mask;
        for _ in 0..PROBE_LIMIT {
            let (stored, off) = self.slot(slot);
            if off == 0 {
                return None;
            }
            if stored == fp {
                return Some(off - 1);
            }
            slot = (slot + 1) & self.mask;
        }
        None
    }

    fn slot(&self, i: u64) -> (u64, u64) {
        let at = HEADER_LEN + i as usize * 16;
        (
            u64::from_le_bytes(self.map[at..at + 8].try_into().unwrap()),
            u64::from_le_bytes(self.map[at + 8..at + 16].try_into().unwrap()),
        )
    }
}

fn write_len_prefixed<W: io::Write>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    out.write_all(&(bytes.len() as u32).to_le_bytes())?;
    out.write_all(bytes)
}

fn read_pair(data: &[u8], at: usize) -> (&[u8], u64, usize) {
    let len = u32::from_le_bytes(data[at..at + 4].try_into().unwrap()) as usize;
    let key = &data[at + 4..at + 4 + len];
    let off_at = at + 4 + len;
    let offset = u64::from_le_bytes(data[off_at..off_at + 8].try_into().unwrap());
    (key, offset, off_at + 8)
}
