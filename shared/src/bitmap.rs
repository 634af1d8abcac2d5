use alloc::{boxed::Box, vec};

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-length array of bits packed into machine words.
#[derive(Clone, Debug)]
pub struct Bitmap {
    words: Box<[u64]>,
    len: usize,
}

impl Bitmap {
    /// Create a bitmap of `len` bits, all cleared.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)].into_boxed_slice(),
            len,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range ({})", self.len);
        (self.words[idx / WORD_BITS] >> (idx % WORD_BITS)) & 1 != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range ({})", self.len);
        let mask = 1 << (idx % WORD_BITS);
        if value {
            self.words[idx / WORD_BITS] |= mask;
        } else {
            self.words[idx / WORD_BITS] &= !mask;
        }
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Find the first bit equal to `value` and flip it.
    ///
    /// Returns the index of the flipped bit, or `None` if every bit is `!value`.
    pub fn scan_and_flip(&mut self, value: bool) -> Option<usize> {
        let skip = if value { 0 } else { u64::MAX };
        let (word_idx, word) = self
            .words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != skip)?;
        let bit = if value {
            word.trailing_zeros()
        } else {
            word.trailing_ones()
        } as usize;

        let idx = word_idx * WORD_BITS + bit;
        if idx >= self.len {
            return None;
        }
        self.set(idx, !value);
        Some(idx)
    }
}
