#![allow(non_camel_case_types, non_snake_case)]
use super::slice_header::SliceType;

#[macro_export]
macro_rules! hashmap {
    () => { std::collections::HashMap::new() };
    ($( $key: expr => $val: expr ),*) => {{
         let mut map = ::std::collections::HashMap::new();
         $( map.insert($key, $val); )*
         map
    }};
}

#[inline(always)]
pub fn clip<T: PartialOrd>(v: T, min: T, max: T) -> T {
    num::clamp(v, min, max)
}

/// Macroblock type after slice-type specific mapping of the coded `mb_type` value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[allow(clippy::upper_case_acronyms)]
pub enum MbType {
    SI,
    I_NxN,
    I_16x16,
    I_PCM,
    P_L0_16x16,
    P_L0_L0_16x8,
    P_L0_L0_8x16,
    P_8x8,
    P_8x8ref0,
    P_Skip,
    B_Direct_16x16,
    B_16x16,
    B_16x8,
    B_8x16,
    B_8x8,
    B_Skip,
}

impl MbType {
    pub fn is_intra(&self) -> bool {
        matches!(self, Self::SI | Self::I_NxN | Self::I_16x16 | Self::I_PCM)
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::P_Skip | Self::B_Skip)
    }

    pub fn is_pcm(&self) -> bool {
        self == &Self::I_PCM
    }

    pub fn is_i16x16(&self) -> bool {
        self == &Self::I_16x16
    }

    /// B_Skip and B_Direct_16x16 derive their motion entirely from neighbors.
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::B_Direct_16x16 | Self::B_Skip)
    }

    pub fn has_sub_mb_partitions(&self) -> bool {
        matches!(self, Self::P_8x8 | Self::P_8x8ref0 | Self::B_8x8)
    }

    /// Maps an I-slice `mb_type` value (0..=25) to its type.
    pub fn from_i(mb_type: usize) -> MbType {
        match mb_type {
            0 => Self::I_NxN,
            1..=24 => Self::I_16x16,
            25 => Self::I_PCM,
            _ => panic!("invalid I mb_type {mb_type}"),
        }
    }

    pub fn from_slice_mb_type(slice_type: SliceType, mb_type: usize) -> MbType {
        match slice_type {
            SliceType::I => Self::from_i(mb_type),
            SliceType::SI => {
                if mb_type == 0 {
                    Self::SI
                } else {
                    Self::from_i(mb_type - 1)
                }
            }
            SliceType::P | SliceType::SP => match mb_type {
                0 => Self::P_L0_16x16,
                1 => Self::P_L0_L0_16x8,
                2 => Self::P_L0_L0_8x16,
                3 => Self::P_8x8,
                4 => Self::P_8x8ref0,
                _ => Self::from_i(mb_type - 5),
            },
            SliceType::B => match mb_type {
                0 => Self::B_Direct_16x16,
                1..=3 => Self::B_16x16,
                4..=21 if mb_type % 2 == 0 => Self::B_16x8,
                4..=21 => Self::B_8x16,
                22 => Self::B_8x8,
                _ => Self::from_i(mb_type - 23),
            },
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PartPred {
    Pred_L0,
    Pred_L1,
    BiPred,
    Direct,
}

impl PartPred {
    pub fn uses_list(&self, list: usize) -> bool {
        match self {
            Self::Pred_L0 => list == 0,
            Self::Pred_L1 => list == 1,
            Self::BiPred => true,
            Self::Direct => false,
        }
    }
}

/// Whether a neighbouring partition predicted with `neighbor` carries motion
/// data for `list` that is comparable with the current partition.
pub fn pred_eq(neighbor: PartPred, cur: PartPred, list: usize) -> bool {
    if neighbor == PartPred::Direct {
        return false;
    }
    neighbor == PartPred::BiPred
        || neighbor == cur
        || (cur == PartPred::BiPred && neighbor.uses_list(list))
}

/// Context-relevant summary of an already coded macroblock.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MbInfo {
    pub mb_type: MbType,
    pub cbp: usize,
    pub transform_8x8: bool,
}

impl MbInfo {
    pub fn new(mb_type: MbType, cbp: usize, transform_8x8: bool) -> MbInfo {
        MbInfo {
            mb_type,
            cbp,
            transform_8x8,
        }
    }

    pub fn cbp_luma(&self) -> usize {
        self.cbp & 15
    }

    pub fn cbp_chroma(&self) -> usize {
        self.cbp >> 4
    }
}

/// Left (A) and top (B) macroblocks of the current one, `None` when outside
/// the picture or the slice.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MbNeighbors {
    pub mb_x: usize,
    pub left: Option<MbInfo>,
    pub top: Option<MbInfo>,
}

impl MbNeighbors {
    pub fn new(mb_x: usize, left: Option<MbInfo>, top: Option<MbInfo>) -> MbNeighbors {
        MbNeighbors { mb_x, left, top }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PartNeighbor {
    pub mb_type: MbType,
    pub pred: PartPred,
}

/// An inter (sub-)macroblock partition in 4x4 block units.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InterPartition {
    pub mb_x: usize,
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
    pub pred: PartPred,
    pub left: Option<PartNeighbor>,
    pub top: Option<PartNeighbor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num::FromPrimitive;
    use rand::{prelude::StdRng, Rng, SeedableRng};

    #[test]
    fn pred_eq_works() {
        use PartPred::*;
        let preds = [Pred_L0, Pred_L1, BiPred, Direct];
        for &neighbor in preds.iter() {
            for &cur in preds.iter().filter(|p| **p != Direct) {
                for list in 0..2 {
                    if !cur.uses_list(list) {
                        continue;
                    }
                    assert_eq!(
                        pred_eq(neighbor, cur, list),
                        neighbor.uses_list(list),
                        "neighbor={:?}, cur={:?}, list={}",
                        neighbor,
                        cur,
                        list
                    );
                }
            }
        }
    }

    #[test]
    fn slice_mb_type_mapping_works() {
        assert_eq!(MbType::from_slice_mb_type(SliceType::I, 0), MbType::I_NxN);
        assert_eq!(MbType::from_slice_mb_type(SliceType::I, 25), MbType::I_PCM);
        assert_eq!(MbType::from_slice_mb_type(SliceType::SI, 0), MbType::SI);
        assert_eq!(MbType::from_slice_mb_type(SliceType::SI, 26), MbType::I_PCM);
        assert_eq!(MbType::from_slice_mb_type(SliceType::P, 4), MbType::P_8x8ref0);
        assert_eq!(MbType::from_slice_mb_type(SliceType::P, 5), MbType::I_NxN);
        assert_eq!(MbType::from_slice_mb_type(SliceType::B, 4), MbType::B_16x8);
        assert_eq!(MbType::from_slice_mb_type(SliceType::B, 21), MbType::B_8x16);
        assert_eq!(MbType::from_slice_mb_type(SliceType::B, 22), MbType::B_8x8);
        assert_eq!(MbType::from_slice_mb_type(SliceType::B, 48), MbType::I_PCM);
        for i in 0..5 {
            let slice_type = SliceType::from_usize(i).unwrap();
            let offset = slice_type.intra_mb_type_offset();
            assert!(MbType::from_slice_mb_type(slice_type, offset).is_intra());
        }
    }

    #[test]
    fn clip_works() {
        let mut rng: StdRng = SeedableRng::seed_from_u64(2);
        for _ in 0..100 {
            let v = rng.gen_range(-100..200);
            let c = clip(v, 0, 51);
            assert!((0..=51).contains(&c));
            if (0..=51).contains(&v) {
                assert_eq!(c, v);
            }
        }
    }
}
