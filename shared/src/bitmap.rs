//! A fixed-size bitmap backed by machine words.

use alloc::vec;
use alloc::vec::Vec;

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all cleared.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        self.words[idx / WORD_BITS] >> (idx % WORD_BITS) & 1 != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        let mask = 1 << (idx % WORD_BITS);
        if value {
            self.words[idx / WORD_BITS] |= mask;
        } else {
            self.words[idx / WORD_BITS] &= !mask;
        }
    }

    /// Sets the `cnt` bits starting at `start` to `value`.
    pub fn set_multiple(&mut self, start: usize, cnt: usize, value: bool) {
        for idx in start..start + cnt {
            self.set(idx, value);
        }
    }

    /// Whether every bit in `start..start + cnt` equals `value`.
    pub fn all(&self, start: usize, cnt: usize, value: bool) -> bool {
        start + cnt <= self.len && (start..start + cnt).all(|idx| self.get(idx) == value)
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Finds the first run of `cnt` bits equal to `value`, starting at or after `start` and
    /// beginning on a multiple of `stride`.
    pub fn scan(&self, start: usize, cnt: usize, value: bool, stride: usize) -> Option<usize> {
        assert!(stride > 0);
        let mut idx = start.div_ceil(stride) * stride;
        while idx + cnt <= self.len {
            if self.all(idx, cnt, value) {
                return Some(idx);
            }
            idx += stride;
        }
        None
    }

    /// Like [`Bitmap::scan`], but also flips the run it finds so the next scan skips it.
    pub fn scan_and_flip(
        &mut self,
        start: usize,
        cnt: usize,
        value: bool,
        stride: usize,
    ) -> Option<usize> {
        let idx = self.scan(start, cnt, value, stride)?;
        self.set_multiple(idx, cnt, !value);
        Some(idx)
    }
}
