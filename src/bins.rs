use std::cmp::PartialEq;

/// Output bit accumulator of the arithmetic encoder. Full 64-bit words move
/// to `tail`; `head` holds the last `num_bins % 64` (or 64) bits, MSB first.
#[derive(Clone, Debug)]
pub struct Bins {
    pub head: u64,
    pub tail: Vec<u64>,
    pub num_bins: usize,
}

impl Bins {
    #[inline(always)]
    pub fn new() -> Bins {
        Bins {
            head: 0,
            tail: vec![],
            num_bins: 0,
        }
    }

    #[inline(always)]
    fn head_len(&self) -> usize {
        if self.num_bins == 0 {
            0
        } else {
            (self.num_bins - 1) % 64 + 1
        }
    }

    #[inline(always)]
    pub fn push_bin(&mut self, bin: bool) {
        if self.head_len() == 64 {
            self.tail.push(self.head);
            self.head = bin as u64;
        } else {
            self.head = (self.head << 1) | bin as u64;
        }
        self.num_bins += 1;
    }

    #[inline(always)]
    pub fn push_bins_with_size(&mut self, bins: u64, size: usize) {
        debug_assert!(size <= 64);
        if size == 0 {
            return;
        }
        let r = self.head_len();
        if r == 64 {
            self.tail.push(self.head);
            self.head = if size == 64 {
                bins
            } else {
                bins & ((1u64 << size) - 1)
            };
        } else if r + size > 64 {
            let n0 = 64 - r;
            let n1 = size - n0;
            let bins0 = bins >> n1;
            let bins1 = bins & ((1u64 << n1) - 1);
            self.tail.push((self.head << n0) | bins0);
            self.head = bins1;
        } else if size == 64 {
            self.head = bins;
        } else {
            self.head = (self.head << size) | (bins & ((1u64 << size) - 1));
        }
        self.num_bins += size;
    }

    #[inline(always)]
    pub fn push_byte(&mut self, byte: u8) {
        self.push_bins_with_size(byte as u64, 8);
    }

    #[inline(always)]
    pub fn is_byte_aligned(&self) -> bool {
        self.num_bins % 8 == 0
    }

    /// Pads with zero bits up to the next byte boundary.
    #[inline(always)]
    pub fn byte_align(&mut self) {
        while !self.is_byte_aligned() {
            self.push_bin(false);
        }
    }

    pub fn len(&self) -> usize {
        self.num_bins
    }

    pub fn is_empty(&self) -> bool {
        self.num_bins == 0
    }

    #[inline(always)]
    pub fn bin(&self, index: usize) -> bool {
        debug_assert!(index < self.num_bins);
        let word = index / 64;
        if word < self.tail.len() {
            (self.tail[word] >> (63 - index % 64)) & 1 > 0
        } else {
            let r = self.head_len();
            (self.head >> (r - 1 - index % 64)) & 1 > 0
        }
    }

    #[inline(always)]
    pub fn bytes(&self) -> BinsByteIterator {
        BinsByteIterator {
            bins: self,
            index: 0,
        }
    }
}

impl Default for Bins {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Bins {
    fn eq(&self, other: &Bins) -> bool {
        self.num_bins == other.num_bins && self.head == other.head && self.tail == other.tail
    }
}

pub struct BinsIntoIterator {
    bins: Bins,
    index: usize,
}

impl Iterator for BinsIntoIterator {
    type Item = bool;

    #[inline(always)]
    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.bins.num_bins {
            None
        } else {
            let b = self.bins.bin(self.index);
            self.index += 1;
            Some(b)
        }
    }
}

/// Yields whole bytes; a trailing partial byte is padded with zero bits.
pub struct BinsByteIterator<'a> {
    bins: &'a Bins,
    index: usize,
}

impl<'a> Iterator for BinsByteIterator<'a> {
    type Item = u8;

    #[inline(always)]
    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.bins.num_bins {
            None
        } else {
            let mut byte = 0u8;
            for i in 0..8 {
                let idx = self.index + i;
                let bit = idx < self.bins.num_bins && self.bins.bin(idx);
                byte = (byte << 1) | bit as u8;
            }
            self.index += 8;
            Some(byte)
        }
    }
}

impl IntoIterator for Bins {
    type Item = bool;
    type IntoIter = BinsIntoIterator;

    fn into_iter(self) -> Self::IntoIter {
        BinsIntoIterator {
            bins: self,
            index: 0,
        }
    }
}
