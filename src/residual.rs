use super::bool_coder::*;
use super::cabac::Cabac;
use super::cabac_contexts::*;
use super::common::*;
use super::neighbor_cache::NeighborStateCache;
use debug_print::*;

const COEFF_ABS_LEVEL_PREFIX_MAX: u32 = 14;

/// A residual block of the current macroblock. `blk_x`/`blk_y` are in 4x4
/// units (0..=3 for luma, 0..=1 for 4:2:0 chroma AC); `comp` is 0 for luma,
/// 1 for Cb and 2 for Cr.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ResidualBlock {
    pub block_type: BlockType,
    pub comp: usize,
    pub blk_x: usize,
    pub blk_y: usize,
}

impl ResidualBlock {
    pub fn new(block_type: BlockType, comp: usize, blk_x: usize, blk_y: usize) -> ResidualBlock {
        if let Some(c) = block_type.component() {
            debug_assert_eq!(c, comp);
        }
        ResidualBlock {
            block_type,
            comp,
            blk_x,
            blk_y,
        }
    }

    pub fn luma_dc() -> ResidualBlock {
        Self::new(BlockType::LUMA_16_DC, 0, 0, 0)
    }

    pub fn luma_ac(blk_x: usize, blk_y: usize) -> ResidualBlock {
        Self::new(BlockType::LUMA_15_AC, 0, blk_x, blk_y)
    }

    pub fn luma_4x4(blk_x: usize, blk_y: usize) -> ResidualBlock {
        Self::new(BlockType::LUMA_16, 0, blk_x, blk_y)
    }

    pub fn luma_8x8(b8: usize) -> ResidualBlock {
        Self::new(BlockType::LUMA_64, 0, (b8 % 2) * 2, (b8 / 2) * 2)
    }

    pub fn chroma_dc(comp: usize) -> ResidualBlock {
        Self::new(BlockType::CHROMA_DC, comp, 0, 0)
    }

    pub fn chroma_ac(comp: usize, blk_x: usize, blk_y: usize) -> ResidualBlock {
        Self::new(BlockType::CHROMA_AC, comp, blk_x, blk_y)
    }

    pub fn b8(&self) -> usize {
        (self.blk_y / 2) * 2 + self.blk_x / 2
    }

    /// maxNumCoeff for 4:2:0 chroma.
    pub fn num_coeffs(&self) -> usize {
        match self.block_type {
            BlockType::CHROMA_DC => 4,
            BlockType::LUMA_15_AC | BlockType::CB_15x16_AC | BlockType::CR_15x16_AC | BlockType::CHROMA_AC => 15,
            BlockType::LUMA_64 | BlockType::CB_64 | BlockType::CR_64 => 64,
            _ => 16,
        }
    }
}

impl Cabac {
    fn derive_cond_term_for_coded_block_flag(
        &self,
        cur: &MbInfo,
        nb: &MbNeighbors,
        cache: &NeighborStateCache,
        blk: &ResidualBlock,
        left: bool,
    ) -> usize {
        let cur_is_intra = cur.mb_type.is_intra();
        let neighbor = if left { nb.left } else { nb.top };
        let kind = blk.block_type.kind();
        match kind {
            BlockKind::Dc | BlockKind::ChromaDc => {
                let cached = if left {
                    cache.coded_dc_flag_left(blk.comp)
                } else {
                    cache.coded_dc_flag_top(blk.comp, nb.mb_x)
                };
                let available = neighbor.map_or(false, |info| {
                    if kind == BlockKind::Dc {
                        info.mb_type.is_i16x16()
                    } else {
                        info.cbp_chroma() != 0
                    }
                });
                Self::cond_term(cur_is_intra, neighbor.map(|info| info.mb_type), available, cached)
            }
            _ => {
                let edge = if kind == BlockKind::ChromaAc { 1 } else { 3 };
                let (info, nx, ny) = if left {
                    if blk.blk_x > 0 {
                        (Some(*cur), blk.blk_x - 1, blk.blk_y)
                    } else {
                        (neighbor, edge, blk.blk_y)
                    }
                } else if blk.blk_y > 0 {
                    (Some(*cur), blk.blk_x, blk.blk_y - 1)
                } else {
                    (neighbor, blk.blk_x, edge)
                };
                let cached = if left {
                    cache.coded_block_flag_left(blk.comp, blk.blk_y)
                } else {
                    cache.coded_block_flag_top(blk.comp, nb.mb_x, blk.blk_x)
                };
                let b8 = (ny / 2) * 2 + nx / 2;
                let available = info.map_or(false, |info| match kind {
                    BlockKind::ChromaAc => info.cbp_chroma() == 2,
                    BlockKind::Blk8x8 => (info.cbp_luma() >> b8) & 1 != 0 && info.transform_8x8,
                    _ => (info.cbp_luma() >> b8) & 1 != 0,
                });
                Self::cond_term(cur_is_intra, info.map(|info| info.mb_type), available, cached)
            }
        }
    }

    /// `cur` carries the type and coded block pattern of the macroblock being
    /// coded; blocks inside it are looked up there.
    pub fn derive_ctx_inc_for_coded_block_flag(
        &self,
        cur: &MbInfo,
        nb: &MbNeighbors,
        cache: &NeighborStateCache,
        blk: &ResidualBlock,
    ) -> usize {
        let cond_a = self.derive_cond_term_for_coded_block_flag(cur, nb, cache, blk, true);
        let cond_b = self.derive_cond_term_for_coded_block_flag(cur, nb, cache, blk, false);
        cond_a + 2 * cond_b
    }

    fn update_coded_block_flag(
        &self,
        nb: &MbNeighbors,
        cache: &mut NeighborStateCache,
        blk: &ResidualBlock,
        flag: bool,
    ) {
        match blk.block_type.kind() {
            BlockKind::Dc | BlockKind::ChromaDc => cache.set_coded_dc_flag(blk.comp, nb.mb_x, flag),
            BlockKind::Blk8x8 => cache.set_coded_block_flags_8x8(blk.comp, nb.mb_x, blk.b8(), flag),
            _ => cache.set_coded_block_flag(blk.comp, nb.mb_x, blk.blk_x, blk.blk_y, flag),
        }
    }

    pub fn encode_coded_block_flag<E: BinEncoder>(
        &mut self,
        enc: &mut E,
        cur: &MbInfo,
        nb: &MbNeighbors,
        cache: &mut NeighborStateCache,
        blk: &ResidualBlock,
        flag: bool,
    ) {
        let ctx_inc = self.derive_ctx_inc_for_coded_block_flag(cur, nb, cache, blk);
        let ctx_idx = blk.block_type.params().coded_block_ctx_off + ctx_inc;
        self.encode_bin(enc, ctx_idx, flag);
        self.update_coded_block_flag(nb, cache, blk, flag);
    }

    pub fn decode_coded_block_flag<D: BinDecoder>(
        &mut self,
        dec: &mut D,
        cur: &MbInfo,
        nb: &MbNeighbors,
        cache: &mut NeighborStateCache,
        blk: &ResidualBlock,
    ) -> bool {
        let ctx_inc = self.derive_ctx_inc_for_coded_block_flag(cur, nb, cache, blk);
        let ctx_idx = blk.block_type.params().coded_block_ctx_off + ctx_inc;
        let flag = self.decode_bin(dec, ctx_idx);
        self.update_coded_block_flag(nb, cache, blk, flag);
        flag
    }

    /// Significance map followed by the levels in reverse scan order.
    /// `coeffs` holds the block in scan order and must contain at least one
    /// non-zero value. Returns the number of non-zero coefficients.
    pub fn encode_residual_block<E: BinEncoder>(&mut self, enc: &mut E, block_type: BlockType, coeffs: &[i32]) -> usize {
        let num = coeffs.len();
        let params = block_type.params();
        let last = match coeffs.iter().rposition(|c| *c != 0) {
            Some(last) => last,
            None => panic!("empty {:?} block must not be coded", block_type),
        };
        debug_eprintln!("residual {:?} num={} last={}", block_type, num, last);

        for (i, &c) in coeffs.iter().enumerate().take(num - 1) {
            let sig = c != 0;
            let sig_ctx = params.sig_coeff_flag_ctx_off + block_type.sig_ctx_inc(i, num);
            self.encode_bin(enc, sig_ctx, sig);
            if sig {
                let last_ctx = params.last_sig_coeff_ctx_off + block_type.last_ctx_inc(i, num);
                self.encode_bin(enc, last_ctx, i == last);
                if i == last {
                    break;
                }
            }
        }

        let mut num_decod_abs_level_gt1 = 0;
        let mut num_decod_abs_level_eq1 = 0;
        let mut num_coeff = 0;
        for &c in coeffs[..=last].iter().rev().filter(|c| **c != 0) {
            let abs_level_minus1 = c.unsigned_abs() - 1;
            let ctx_inc = if num_decod_abs_level_gt1 != 0 {
                0
            } else {
                (1 + num_decod_abs_level_eq1).min(4)
            };
            self.encode_bin(enc, params.coeff_abs_level_ctx_off + ctx_inc, abs_level_minus1 > 0);
            if abs_level_minus1 > 0 {
                let ctx_idx = params.coeff_abs_level_ctx_off
                    + 5
                    + num_decod_abs_level_gt1.min(4 - params.coeff_abs_level_adjust);
                let prefix = abs_level_minus1.min(COEFF_ABS_LEVEL_PREFIX_MAX);
                for _ in 1..prefix {
                    self.encode_bin(enc, ctx_idx, true);
                }
                if prefix < COEFF_ABS_LEVEL_PREFIX_MAX {
                    self.encode_bin(enc, ctx_idx, false);
                } else {
                    self.encode_kth_order_exp_golomb_bypass(enc, abs_level_minus1 - COEFF_ABS_LEVEL_PREFIX_MAX, 0);
                }
                num_decod_abs_level_gt1 += 1;
            } else {
                num_decod_abs_level_eq1 += 1;
            }
            self.encode_bin_bypass(enc, c < 0);
            num_coeff += 1;
        }
        num_coeff
    }

    /// Fills `coeffs` (scan order, `coeffs.len()` = maxNumCoeff) and returns
    /// the number of non-zero coefficients.
    pub fn decode_residual_block<D: BinDecoder>(
        &mut self,
        dec: &mut D,
        block_type: BlockType,
        coeffs: &mut [i32],
    ) -> usize {
        let num = coeffs.len();
        let params = block_type.params();
        let mut positions = [0usize; 64];
        let mut num_coeff = 0;
        let mut last_found = false;
        for i in 0..num - 1 {
            let sig_ctx = params.sig_coeff_flag_ctx_off + block_type.sig_ctx_inc(i, num);
            if self.decode_bin(dec, sig_ctx) {
                positions[num_coeff] = i;
                num_coeff += 1;
                let last_ctx = params.last_sig_coeff_ctx_off + block_type.last_ctx_inc(i, num);
                if self.decode_bin(dec, last_ctx) {
                    last_found = true;
                    break;
                }
            }
        }
        if !last_found {
            positions[num_coeff] = num - 1;
            num_coeff += 1;
        }

        coeffs.fill(0);
        let mut num_decod_abs_level_gt1 = 0;
        let mut num_decod_abs_level_eq1 = 0;
        for &pos in positions[..num_coeff].iter().rev() {
            let ctx_inc = if num_decod_abs_level_gt1 != 0 {
                0
            } else {
                (1 + num_decod_abs_level_eq1).min(4)
            };
            let mut abs_level_minus1 = 0u32;
            if self.decode_bin(dec, params.coeff_abs_level_ctx_off + ctx_inc) {
                let ctx_idx = params.coeff_abs_level_ctx_off
                    + 5
                    + num_decod_abs_level_gt1.min(4 - params.coeff_abs_level_adjust);
                abs_level_minus1 = 1;
                while abs_level_minus1 < COEFF_ABS_LEVEL_PREFIX_MAX && self.decode_bin(dec, ctx_idx) {
                    abs_level_minus1 += 1;
                }
                if abs_level_minus1 == COEFF_ABS_LEVEL_PREFIX_MAX {
                    abs_level_minus1 = abs_level_minus1.saturating_add(self.decode_kth_order_exp_golomb_bypass(dec, 0));
                }
                num_decod_abs_level_gt1 += 1;
            } else {
                num_decod_abs_level_eq1 += 1;
            }
            let level = abs_level_minus1.saturating_add(1).min(i32::MAX as u32) as i32;
            coeffs[pos] = if self.decode_bin_bypass(dec) { -level } else { level };
        }
        debug_eprintln!("residual {:?} num_coeff={}", block_type, num_coeff);
        num_coeff
    }
}
