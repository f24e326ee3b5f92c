use num::FromPrimitive;

#[derive(Clone, Copy, PartialEq, Eq, Debug, FromPrimitive)]
pub enum SliceType {
    P = 0,
    B = 1,
    I = 2,
    SP = 3,
    SI = 4,
}

impl SliceType {
    pub fn is_intra(&self) -> bool {
        matches!(self, Self::I | Self::SI)
    }

    /// Number of `mb_type` values that precede the intra macroblock types.
    pub fn intra_mb_type_offset(&self) -> usize {
        match self {
            Self::I => 0,
            Self::SI => 1,
            Self::P | Self::SP => 5,
            Self::B => 23,
        }
    }

    /// Accepts either the letter form (`I`, `P`, `B`, `SP`, `SI`) or the
    /// numeric `slice_type` (0..=9) of a slice header.
    pub fn parse(s: &str) -> Option<SliceType> {
        match s.to_ascii_uppercase().as_str() {
            "P" => Some(Self::P),
            "B" => Some(Self::B),
            "I" => Some(Self::I),
            "SP" => Some(Self::SP),
            "SI" => Some(Self::SI),
            n => n
                .parse::<usize>()
                .ok()
                .filter(|v| *v < 10)
                .and_then(|v| Self::from_usize(v % 5)),
        }
    }
}

/// Slice-level values the entropy coder depends on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SliceParams {
    pub slice_type: SliceType,
    pub cabac_init_idc: usize,
    pub slice_qp: isize,
    pub mb_width: usize,
    pub mb_height: usize,
    pub first_mb_addr: usize,
    pub num_mbs: usize,
    pub num_ref_idx_active: [usize; 2],
    pub transform_8x8_mode: bool,
    pub direct_8x8_inference: bool,
}

impl SliceParams {
    pub fn new(slice_type: SliceType, slice_qp: isize, mb_width: usize, mb_height: usize) -> SliceParams {
        SliceParams {
            slice_type,
            cabac_init_idc: 0,
            slice_qp,
            mb_width,
            mb_height,
            first_mb_addr: 0,
            num_mbs: mb_width * mb_height,
            num_ref_idx_active: [1, 1],
            transform_8x8_mode: false,
            direct_8x8_inference: true,
        }
    }

    /// Splits the picture into `num_slices` runs of consecutive macroblocks.
    pub fn split(&self, num_slices: usize) -> Vec<SliceParams> {
        let total = self.mb_width * self.mb_height;
        let num_slices = num_slices.clamp(1, total.max(1));
        (0..num_slices)
            .map(|i| {
                let first = total * i / num_slices;
                let last = total * (i + 1) / num_slices;
                SliceParams {
                    first_mb_addr: first,
                    num_mbs: last - first,
                    ..*self
                }
            })
            .collect()
    }

    pub fn is_valid(&self) -> bool {
        self.cabac_init_idc <= 2
            && (-12..=51).contains(&self.slice_qp)
            && self.mb_width > 0
            && self.first_mb_addr + self.num_mbs <= self.mb_width * self.mb_height
            && self.num_ref_idx_active.iter().all(|n| (1..=32).contains(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_type_parse_works() {
        assert_eq!(SliceType::parse("i"), Some(SliceType::I));
        assert_eq!(SliceType::parse("SP"), Some(SliceType::SP));
        assert_eq!(SliceType::parse("6"), Some(SliceType::B));
        assert_eq!(SliceType::parse("10"), None);
        assert_eq!(SliceType::parse("X"), None);
    }

    #[test]
    fn split_works() {
        let params = SliceParams::new(SliceType::P, 26, 11, 9);
        let slices = params.split(4);
        assert_eq!(slices.len(), 4);
        assert_eq!(slices[0].first_mb_addr, 0);
        let mut next = 0;
        for s in slices.iter() {
            assert_eq!(s.first_mb_addr, next);
            assert!(s.num_mbs > 0);
            assert!(s.is_valid());
            next += s.num_mbs;
        }
        assert_eq!(next, 99);
    }
}
