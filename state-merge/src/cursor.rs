//! N-way merge cursors over sibling files.
//!
//! A [`CursorSet`] tracks the indices of cursors positioned at the minimum
//! key, in ascending end-tx order. Mergers read the minimum key, visit the
//! tied cursors (earliest file first, or latest by taking the tail), then
//! advance exactly those cursors and re-minimise. Cursor sources are a
//! closed set of variants rather than trait objects, so the set stays a
//! plain vector.

use std::borrow::Cow;

use smallvec::SmallVec;

use crate::seg;

/// Where a cursor draws its `(key, value)` pairs from.
pub enum CursorSource<'a> {
    /// Alternating key/value words of one data file.
    File(seg::Getter<'a>),
    /// Pre-sorted pairs held in memory; used for small synthetic inputs.
    Mem(std::vec::IntoIter<(Vec<u8>, Vec<u8>)>),
}

/// One input of an N-way merge.
pub struct MergeCursor<'a> {
    /// End of the source file's tx range; orders cursors within a key tie.
    pub end_tx_num: u64,
    source: CursorSource<'a>,
    /// Secondary reader into the paired history file, advanced by the
    /// history merger as posting counts are consumed.
    pub aux: Option<seg::Getter<'a>>,
    key: Option<Cow<'a, [u8]>>,
    val: Option<Cow<'a, [u8]>>,
}

impl<'a> MergeCursor<'a> {
    pub fn new(end_tx_num: u64, source: CursorSource<'a>) -> Self {
        Self { end_tx_num, source, aux: None, key: None, val: None }
    }

    pub fn with_aux(mut self, aux: seg::Getter<'a>) -> Self {
        self.aux = Some(aux);
        self
    }

    /// Loads the next pair; false once the source is exhausted.
    fn advance(&mut self) -> bool {
        match &mut self.source {
            CursorSource::File(getter) => {
                if getter.has_next() {
                    self.key = Some(Cow::Borrowed(getter.next()));
                    self.val = Some(Cow::Borrowed(getter.next()));
                    true
                } else {
                    self.key = None;
                    self.val = None;
                    false
                }
            }
            CursorSource::Mem(pairs) => match pairs.next() {
                Some((key, val)) => {
                    self.key = Some(Cow::Owned(key));
                    self.val = Some(Cow::Owned(val));
                    true
                }
                None => {
                    self.key = None;
                    self.val = None;
                    false
                }
            },
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn val(&self) -> Option<&[u8]> {
        self.val.as_deref()
    }
}

/// The cursor set of one merge, tracking the minimum-key cursors.
pub struct CursorSet<'a> {
    cursors: Vec<MergeCursor<'a>>,
    min_key: SmallVec<[usize; 8]>,
}

impl<'a> CursorSet<'a> {
    /// Primes every cursor and finds the initial minimum.
    ///
    /// Cursors are ordered by ascending `end_tx_num`, so ties in `min_key`
    /// always run earliest file first.
    pub fn new(mut cursors: Vec<MergeCursor<'a>>) -> Self {
        cursors.sort_by_key(|c| c.end_tx_num);
        for cursor in &mut cursors {
            cursor.advance();
        }
        let mut set = Self { cursors, min_key: SmallVec::new() };
        set.minimize();
        set
    }

    fn minimize(&mut self) {
        self.min_key.clear();
        let mut min: Option<&[u8]> = None;
        for (idx, cursor) in self.cursors.iter().enumerate() {
            let Some(key) = cursor.key() else { continue };
            match min {
                None => {
                    min = Some(key);
                    self.min_key.push(idx);
                }
                Some(current) => match key.cmp(current) {
                    std::cmp::Ordering::Less => {
                        self.min_key.clear();
                        self.min_key.push(idx);
                        min = Some(key);
                    }
                    std::cmp::Ordering::Equal => self.min_key.push(idx),
                    std::cmp::Ordering::Greater => {}
                },
            }
        }
    }

    /// The current minimum key, until every cursor is exhausted.
    pub fn peek_key(&self) -> Option<&[u8]> {
        self.min_key.first().map(|&idx| {
            self.cursors[idx].key().expect("minimum cursor lost its key")
        })
    }

    /// Indices of the cursors tied at the minimum key, ascending by end tx
    /// number. Cloned out so callers may re-borrow the set mutably.
    pub fn min_indices(&self) -> SmallVec<[usize; 8]> {
        self.min_key.clone()
    }

    pub fn val(&self, idx: usize) -> &[u8] {
        self.cursors[idx].val().expect("cursor read past its last value")
    }

    pub fn end_tx_num(&self, idx: usize) -> u64 {
        self.cursors[idx].end_tx_num
    }

    pub fn aux_mut(&mut self, idx: usize) -> &mut seg::Getter<'a> {
        self.cursors[idx].aux.as_mut().expect("cursor has no paired reader")
    }

    /// Advances every minimum-key cursor and re-minimises.
    pub fn step(&mut self) {
        for i in 0..self.min_key.len() {
            let idx = self.min_key[i];
            self.cursors[idx].advance();
        }
        self.minimize();
    }
}
