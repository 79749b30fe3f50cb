//! Elias-Fano encoding of monotonically non-decreasing integer sequences.
//!
//! An encoded sequence of `count` values bounded by `max` splits each value
//! into `l = floor(log2(max / count))` low bits, stored packed, and the
//! remaining high bits, stored as a unary-coded bit vector: the `i`-th value
//! `v` sets bit `(v >> l) + i`. Decoding walks the set bits in order. The
//! whole structure serialises as a 16-byte header (`count`, `max`) followed
//! by the two bit arrays as little-endian words, which is the wire form
//! stored as the value of every inverted-index entry.

/// An immutable Elias-Fano sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EliasFano {
    count: u64,
    max: u64,
    low_bits: u32,
    lows: Vec<u64>,
    ups: Vec<u64>,
}

fn low_bit_count(count: u64, max: u64) -> u32 {
    if count == 0 || max / count == 0 {
        0
    } else {
        63 - (max / count).leading_zeros()
    }
}

fn low_words(count: u64, low_bits: u32) -> usize {
    ((count * low_bits as u64 + 63) / 64) as usize
}

fn up_words(count: u64, max: u64, low_bits: u32) -> usize {
    if count == 0 {
        0
    } else {
        (((max >> low_bits) + count + 63) / 64) as usize
    }
}

impl EliasFano {
    /// Decodes a sequence from its serialised form.
    ///
    /// Returns `None` when the blob is too short for the sizes its header
    /// implies.
    pub fn read(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }
        let count = u64::from_le_bytes(data[0..8].try_into().ok()?);
        let max = u64::from_le_bytes(data[8..16].try_into().ok()?);
        let low_bits = low_bit_count(count, max);
        let lw = low_words(count, low_bits);
        let uw = up_words(count, max, low_bits);
        if data.len() < 16 + 8 * (lw + uw) {
            return None;
        }
        let word_at = |i: usize| {
            let at = 16 + 8 * i;
            u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
        };
        Some(Self {
            count,
            max,
            low_bits,
            lows: (0..lw).map(word_at).collect(),
            ups: (lw..lw + uw).map(word_at).collect(),
        })
    }

    /// Appends the serialised form to `out`.
    pub fn append_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.max.to_le_bytes());
        for word in self.lows.iter().chain(self.ups.iter()) {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Upper bound declared at construction; equals the last value for
    /// sequences built by the mergers.
    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn min(&self) -> Option<u64> {
        self.iter().next()
    }

    /// Iterates the values in their stored (non-decreasing) order.
    pub fn iter(&self) -> Iter<'_> {
        Iter { ef: self, word_idx: 0, word: self.ups.first().copied().unwrap_or(0), emitted: 0 }
    }

    fn low(&self, i: u64) -> u64 {
        if self.low_bits == 0 {
            return 0;
        }
        let l = self.low_bits as u64;
        let bit = i * l;
        let word = (bit / 64) as usize;
        let off = (bit % 64) as u32;
        let mut v = self.lows[word] >> off;
        if off as u64 + l > 64 {
            v |= self.lows[word + 1] << (64 - off);
        }
        v & ((1u64 << l) - 1)
    }
}

/// Unions two sequences whose value ranges are disjoint and ordered:
/// every value of `earlier` precedes every value of `later`.
///
/// The result has `count(earlier) + count(later)` values and the later
/// operand's `max`; duplicates are impossible by the disjointness contract.
pub fn merge_disjoint(earlier: &EliasFano, later: &EliasFano) -> EliasFano {
    if earlier.count() == 0 {
        return later.clone();
    }
    if later.count() == 0 {
        return earlier.clone();
    }
    assert!(
        earlier.max() <= later.max(),
        "posting lists merged out of order: {} > {}",
        earlier.max(),
        later.max(),
    );
    let mut builder = EliasFanoBuilder::new(earlier.count() + later.count(), later.max());
    for v in earlier.iter().chain(later.iter()) {
        builder.add_offset(v);
    }
    builder.build()
}

/// Iterator over the values of an [`EliasFano`] sequence.
pub struct Iter<'a> {
    ef: &'a EliasFano,
    word_idx: usize,
    word: u64,
    emitted: u64,
}

impl Iterator for Iter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.emitted >= self.ef.count {
            return None;
        }
        loop {
            if self.word != 0 {
                let tz = self.word.trailing_zeros() as u64;
                self.word &= self.word - 1;
                let pos = self.word_idx as u64 * 64 + tz;
                let upper = pos - self.emitted;
                let value = (upper << self.ef.low_bits) | self.ef.low(self.emitted);
                self.emitted += 1;
                return Some(value);
            }
            self.word_idx += 1;
            self.word = self.ef.ups[self.word_idx];
        }
    }
}

/// Builds an [`EliasFano`] from exactly `count` non-decreasing values.
pub struct EliasFanoBuilder {
    count: u64,
    max: u64,
    low_bits: u32,
    lows: Vec<u64>,
    ups: Vec<u64>,
    added: u64,
    last: u64,
}

impl EliasFanoBuilder {
    /// Sizes a builder for `count` values, the largest being `max`.
    pub fn new(count: u64, max: u64) -> Self {
        let low_bits = low_bit_count(count, max);
        Self {
            count,
            max,
            low_bits,
            lows: vec![0; low_words(count, low_bits)],
            ups: vec![0; up_words(count, max, low_bits)],
            added: 0,
            last: 0,
        }
    }

    /// Appends the next value; values must be non-decreasing and at most
    /// `max`.
    pub fn add_offset(&mut self, v: u64) {
        assert!(self.added < self.count, "elias-fano overflow: count {} exceeded", self.count);
        assert!(v >= self.last, "elias-fano values must not decrease: {v} < {}", self.last);
        assert!(v <= self.max, "elias-fano value {v} above declared max {}", self.max);
        if self.low_bits > 0 {
            let l = self.low_bits as u64;
            let low = v & ((1u64 << l) - 1);
            let bit = self.added * l;
            let word = (bit / 64) as usize;
            let off = (bit % 64) as u32;
            self.lows[word] |= low << off;
            if off as u64 + l > 64 {
                self.lows[word + 1] |= low >> (64 - off);
            }
        }
        let pos = (v >> self.low_bits) + self.added;
        self.ups[(pos / 64) as usize] |= 1u64 << (pos % 64);
        self.last = v;
        self.added += 1;
    }

    pub fn build(self) -> EliasFano {
        assert_eq!(self.added, self.count, "elias-fano built with {} of {} values", self.added, self.count);
        EliasFano { count: self.count, max: self.max, low_bits: self.low_bits, lows: self.lows, ups: self.ups }
    }
}
