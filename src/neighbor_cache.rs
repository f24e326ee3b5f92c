use super::common::*;

// mvd context selection only distinguishes sums up to 32
pub const MAX_CACHED_MVD: u32 = 70;

/// Per-slice scratch state feeding context selection. `*_top` arrays span the
/// macroblock row (in 4x4 columns or whole macroblocks), `*_left` values
/// describe the right edge of the previously coded macroblock and are
/// overwritten while the current one is coded.
#[derive(Clone, Debug)]
pub struct NeighborStateCache {
    coded_block_left: [[u8; 4]; 3],
    coded_block_top: [Vec<u8>; 3],
    coded_dc_left: [u8; 3],
    coded_dc_top: [Vec<u8>; 3],
    ref_idx_left: [[u8; 4]; 2],
    ref_idx_top: [Vec<u8>; 2],
    // [list][component]
    mvd_left: [[[u32; 4]; 2]; 2],
    mvd_top: [[Vec<u32>; 2]; 2],
    chroma_pred_mode_left: u8,
    chroma_pred_mode_top: Vec<u8>,
    skip_left: bool,
    skip_top: Vec<bool>,
    pub prev_mb_type: Option<MbType>,
    pub prev_cbp: usize,
    pub prev_mb_qp_delta: i32,
}

impl NeighborStateCache {
    pub fn new(mb_width: usize) -> NeighborStateCache {
        let w4 = mb_width * 4;
        NeighborStateCache {
            coded_block_left: [[0; 4]; 3],
            coded_block_top: [vec![0; w4], vec![0; w4], vec![0; w4]],
            coded_dc_left: [0; 3],
            coded_dc_top: [vec![0; mb_width], vec![0; mb_width], vec![0; mb_width]],
            ref_idx_left: [[0; 4]; 2],
            ref_idx_top: [vec![0; w4], vec![0; w4]],
            mvd_left: [[[0; 4]; 2]; 2],
            mvd_top: [[vec![0; w4], vec![0; w4]], [vec![0; w4], vec![0; w4]]],
            chroma_pred_mode_left: 0,
            chroma_pred_mode_top: vec![0; mb_width],
            skip_left: false,
            skip_top: vec![false; mb_width],
            prev_mb_type: None,
            prev_cbp: 0,
            prev_mb_qp_delta: 0,
        }
    }

    /// Independent deep copy for trial coding.
    pub fn fork(&self) -> NeighborStateCache {
        self.clone()
    }

    #[inline(always)]
    pub fn coded_block_flag_left(&self, comp: usize, blk_y: usize) -> u8 {
        self.coded_block_left[comp][blk_y]
    }

    #[inline(always)]
    pub fn coded_block_flag_top(&self, comp: usize, mb_x: usize, blk_x: usize) -> u8 {
        self.coded_block_top[comp][mb_x * 4 + blk_x]
    }

    pub fn set_coded_block_flag(&mut self, comp: usize, mb_x: usize, blk_x: usize, blk_y: usize, flag: bool) {
        self.coded_block_left[comp][blk_y] = flag as u8;
        self.coded_block_top[comp][mb_x * 4 + blk_x] = flag as u8;
    }

    /// Marks the four 4x4 positions covered by 8x8 block `b8`.
    pub fn set_coded_block_flags_8x8(&mut self, comp: usize, mb_x: usize, b8: usize, flag: bool) {
        let (x0, y0) = ((b8 % 2) * 2, (b8 / 2) * 2);
        for y in y0..y0 + 2 {
            for x in x0..x0 + 2 {
                self.set_coded_block_flag(comp, mb_x, x, y, flag);
            }
        }
    }

    #[inline(always)]
    pub fn coded_dc_flag_left(&self, comp: usize) -> u8 {
        self.coded_dc_left[comp]
    }

    #[inline(always)]
    pub fn coded_dc_flag_top(&self, comp: usize, mb_x: usize) -> u8 {
        self.coded_dc_top[comp][mb_x]
    }

    pub fn set_coded_dc_flag(&mut self, comp: usize, mb_x: usize, flag: bool) {
        self.coded_dc_left[comp] = flag as u8;
        self.coded_dc_top[comp][mb_x] = flag as u8;
    }

    #[inline(always)]
    pub fn ref_idx_left(&self, list: usize, y: usize) -> u8 {
        self.ref_idx_left[list][y]
    }

    #[inline(always)]
    pub fn ref_idx_top(&self, list: usize, mb_x: usize, x: usize) -> u8 {
        self.ref_idx_top[list][mb_x * 4 + x]
    }

    /// Stores `ref_idx` over a whole partition given in 4x4 units.
    pub fn set_ref_idx(&mut self, list: usize, part: &InterPartition, ref_idx: u8) {
        for y in part.y..part.y + part.height {
            self.ref_idx_left[list][y] = ref_idx;
        }
        let x0 = part.mb_x * 4 + part.x;
        for v in self.ref_idx_top[list][x0..x0 + part.width].iter_mut() {
            *v = ref_idx;
        }
    }

    #[inline(always)]
    pub fn mvd_left(&self, list: usize, comp: usize, y: usize) -> u32 {
        self.mvd_left[list][comp][y]
    }

    #[inline(always)]
    pub fn mvd_top(&self, list: usize, comp: usize, mb_x: usize, x: usize) -> u32 {
        self.mvd_top[list][comp][mb_x * 4 + x]
    }

    /// Stores the absolute mvd components over a whole partition, clamped to
    /// `MAX_CACHED_MVD`.
    pub fn set_mvd(&mut self, list: usize, part: &InterPartition, mvd: [i32; 2]) {
        let x0 = part.mb_x * 4 + part.x;
        for (comp, &v) in mvd.iter().enumerate() {
            let abs = v.unsigned_abs().min(MAX_CACHED_MVD);
            for y in part.y..part.y + part.height {
                self.mvd_left[list][comp][y] = abs;
            }
            for t in self.mvd_top[list][comp][x0..x0 + part.width].iter_mut() {
                *t = abs;
            }
        }
    }

    #[inline(always)]
    pub fn chroma_pred_mode_left(&self) -> u8 {
        self.chroma_pred_mode_left
    }

    #[inline(always)]
    pub fn chroma_pred_mode_top(&self, mb_x: usize) -> u8 {
        self.chroma_pred_mode_top[mb_x]
    }

    pub fn set_chroma_pred_mode(&mut self, mb_x: usize, mode: u8) {
        self.chroma_pred_mode_left = mode;
        self.chroma_pred_mode_top[mb_x] = mode;
    }

    #[inline(always)]
    pub fn skip_left(&self) -> bool {
        self.skip_left
    }

    #[inline(always)]
    pub fn skip_top(&self, mb_x: usize) -> bool {
        self.skip_top[mb_x]
    }

    pub fn set_skip_flag(&mut self, mb_x: usize, skip: bool) {
        self.skip_left = skip;
        self.skip_top[mb_x] = skip;
    }

    /// Clears everything a skipped macroblock leaves behind for its right and
    /// bottom neighbours.
    pub fn mark_skipped(&mut self, mb_x: usize) {
        for comp in 0..3 {
            for blk in 0..4 {
                self.set_coded_block_flag(comp, mb_x, blk, blk, false);
            }
            self.set_coded_dc_flag(comp, mb_x, false);
        }
        self.clear_motion(mb_x);
        self.set_chroma_pred_mode(mb_x, 0);
        self.set_skip_flag(mb_x, true);
    }

    /// Zeroes reference indices and mvds of both lists over the whole
    /// macroblock, as left behind by intra and direct macroblocks.
    pub fn clear_motion(&mut self, mb_x: usize) {
        let whole = InterPartition {
            mb_x,
            x: 0,
            y: 0,
            width: 4,
            height: 4,
            pred: PartPred::Direct,
            left: None,
            top: None,
        };
        for list in 0..2 {
            self.set_ref_idx(list, &whole, 0);
            self.set_mvd(list, &whole, [0, 0]);
        }
    }

    /// Records the values the next macroblock in decoding order needs for
    /// its mb_qp_delta context.
    pub fn finish_mb(&mut self, mb_type: MbType, cbp: usize, mb_qp_delta: i32) {
        self.prev_mb_type = Some(mb_type);
        self.prev_cbp = cbp;
        self.prev_mb_qp_delta = mb_qp_delta;
    }
}
