//! Length-prefixed word files: the storage format behind every stream.
//!
//! A word file is a header (word count) followed by a sequence of
//! varint-length-prefixed byte strings. Data files store words in
//! alternating `key, value` order; history `.v` files store one word per
//! value. Writers stage output under a `.tmp` name and install it with an
//! atomic rename, so a file that exists under its final name is always
//! complete; readers map the file and hand out any number of concurrent
//! [`Getter`] cursors.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

const HEADER_LEN: usize = 8;
const TMP_SUFFIX: &str = "tmp";

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(TMP_SUFFIX);
    PathBuf::from(os)
}

/// Streams words into a staged file; [`finish`](Writer::finish) installs it
/// under its final name. Dropping an unfinished writer unlinks the staged
/// file, which is what unwinds a cancelled or failed merge.
pub struct Writer {
    out: Option<BufWriter<File>>,
    path: PathBuf,
    staged: PathBuf,
    words: u64,
}

impl Writer {
    /// Creates the staged file for `path`, truncating a leftover one.
    pub fn create(path: &Path) -> io::Result<Self> {
        let staged = tmp_path(path);
        let mut out = BufWriter::new(
            OpenOptions::new().write(true).create(true).truncate(true).open(&staged)?,
        );
        out.write_all(&[0u8; HEADER_LEN])?;
        Ok(Self { out: Some(out), path: path.to_path_buf(), staged, words: 0 })
    }

    pub fn add_word(&mut self, word: &[u8]) -> io::Result<()> {
        let out = self.out.as_mut().expect("writer already finished");
        write_uvarint(out, word.len() as u64)?;
        out.write_all(word)?;
        self.words += 1;
        Ok(())
    }

    pub fn word_count(&self) -> u64 {
        self.words
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes, stamps the header, syncs, and renames into place.
    pub fn finish(mut self) -> io::Result<()> {
        let out = self.out.take().expect("writer already finished");
        let mut file = out.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.words.to_le_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.staged, &self.path)
    }

    /// Discards the staged output.
    pub fn abort(self) {}
}

impl Drop for Writer {
    fn drop(&mut self) {
        if self.out.take().is_some() {
            let _ = fs::remove_file(&self.staged);
        }
    }
}

/// A shared, read-only view of a finished word file.
///
/// The mapping is immutable, so getters from concurrent threads never
/// interfere with each other.
pub struct Reader {
    path: PathBuf,
    map: Mmap,
    words: u64,
}

impl Reader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        // Safety: the file is installed by rename and never written again.
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("word file too short: {}", path.display()),
            ));
        }
        let words = u64::from_le_bytes(map[..HEADER_LEN].try_into().unwrap());
        Ok(Self { path: path.to_path_buf(), map, words })
    }

    pub fn word_count(&self) -> u64 {
        self.words
    }

    pub fn size(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }

    /// A fresh cursor positioned at the first word.
    pub fn getter(&self) -> Getter<'_> {
        Getter { data: &self.map[..], pos: HEADER_LEN }
    }

    /// Advises the OS that the whole mapping is about to be scanned.
    pub fn enable_read_ahead(&self) {
        #[cfg(unix)]
        let _ = self.map.advise(memmap2::Advice::Sequential);
    }

    /// Restores default paging behaviour.
    pub fn disable_read_ahead(&self) {
        #[cfg(unix)]
        let _ = self.map.advise(memmap2::Advice::Normal);
    }
}

/// Enables read-ahead on a set of readers, restoring default behaviour on
/// drop regardless of how the merge exits.
pub struct ReadAhead<'a> {
    readers: Vec<&'a Reader>,
}

impl<'a> ReadAhead<'a> {
    pub fn new(readers: Vec<&'a Reader>) -> Self {
        for r in &readers {
            r.enable_read_ahead();
        }
        Self { readers }
    }
}

impl Drop for ReadAhead<'_> {
    fn drop(&mut self) {
        for r in &self.readers {
            r.disable_read_ahead();
        }
    }
}

/// A forward cursor over the words of a [`Reader`].
///
/// Offsets reported by [`pos`](Getter::pos) are absolute file offsets and
/// are what accessor indices store. Truncated or garbled word data panics:
/// these files are engine-owned and installed atomically, so a bad length
/// prefix is an integrity violation, not an I/O condition.
#[derive(Clone)]
pub struct Getter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Getter<'a> {
    pub fn has_next(&self) -> bool {
        self.pos < self.data.len()
    }

    /// Absolute file offset of the next word.
    pub fn pos(&self) -> u64 {
        self.pos as u64
    }

    /// Returns the next word and advances past it.
    pub fn next(&mut self) -> &'a [u8] {
        let (len, at) = read_uvarint(self.data, self.pos);
        let end = at + len as usize;
        assert!(end <= self.data.len(), "word overruns file at offset {}", self.pos);
        let word = &self.data[at..end];
        self.pos = end;
        word
    }

    /// Skips the next word, returning the offset it started at.
    pub fn skip(&mut self) -> u64 {
        let start = self.pos;
        let (len, at) = read_uvarint(self.data, self.pos);
        self.pos = at + len as usize;
        assert!(self.pos <= self.data.len(), "word overruns file at offset {start}");
        start as u64
    }

    /// Repositions the cursor at an absolute file offset.
    pub fn reset(&mut self, offset: u64) {
        assert!(offset as usize >= HEADER_LEN && offset as usize <= self.data.len());
        self.pos = offset as usize;
    }
}

fn write_uvarint<W: io::Write>(out: &mut W, mut v: u64) -> io::Result<()> {
    let mut buf = [0u8; 10];
    let mut n = 0;
    while v >= 0x80 {
        buf[n] = (v as u8) | 0x80;
        v >>= 7;
        n += 1;
    }
    buf[n] = v as u8;
    out.write_all(&buf[..=n])
}

fn read_uvarint(data: &[u8], mut at: usize) -> (u64, usize) {
    let mut v = 0u64;
    let mut shift = 0u32;
    loop {
        assert!(at < data.len() && shift < 64, "bad varint at offset {at}");
        let byte = data[at];
        at += 1;
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return (v, at);
        }
        shift += 7;
    }
}
