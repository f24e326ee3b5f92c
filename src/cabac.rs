use super::bool_coder::*;
use super::cabac_contexts::*;
use super::common::*;
use super::context_table::ContextTable;
use super::neighbor_cache::NeighborStateCache;
use super::slice_header::SliceType;
use debug_print::*;

const MAX_REF_IDX_BINS: usize = 32;
const MAX_QP_DELTA_BINS: usize = 104;
const MAX_EXP_GOLOMB_PREFIX: usize = 31;

/// Contexts of the three-level intra mb_type tree, relative to the table
/// position used by a given slice type.
struct IntraMbTypeCtx {
    prefix: usize,
    base: usize,
    intra_slice: bool,
}

impl IntraMbTypeCtx {
    fn luma(&self) -> usize {
        self.base + 1
    }

    fn chroma(&self, bin_idx: usize) -> usize {
        self.base + 2 + (bin_idx > 0 && self.intra_slice) as usize
    }

    fn pred(&self, bin_idx: usize) -> usize {
        self.base + 3 + (1 + bin_idx) * self.intra_slice as usize
    }
}

/// One slice worth of CABAC state: the slice type that selects the
/// binarizations and the adaptive context table. The neighbour state lives in
/// a separate [`NeighborStateCache`] handed to every syntax element call.
#[derive(Clone)]
pub struct Cabac {
    pub slice_type: SliceType,
    pub contexts: ContextTable,
}

impl Cabac {
    pub fn new(slice_type: SliceType, cabac_init_idc: usize, slice_qp: isize) -> Cabac {
        let mut contexts = ContextTable::new();
        contexts.init_models(slice_type, cabac_init_idc, slice_qp);
        Cabac {
            slice_type,
            contexts,
        }
    }

    pub fn fork(&self) -> Cabac {
        self.clone()
    }

    #[inline(always)]
    pub fn decode_bin<D: BinDecoder>(&mut self, dec: &mut D, ctx_idx: usize) -> bool {
        let bin = dec.decode_decision(&mut self.contexts[ctx_idx]);
        debug_eprintln!("decode_bin ctx={} bin={}", ctx_idx, bin);
        bin
    }

    #[inline(always)]
    pub fn encode_bin<E: BinEncoder>(&mut self, enc: &mut E, ctx_idx: usize, bin: bool) {
        debug_eprintln!("encode_bin ctx={} bin={}", ctx_idx, bin);
        enc.encode_decision(&mut self.contexts[ctx_idx], bin);
    }

    #[inline(always)]
    pub fn decode_bin_bypass<D: BinDecoder>(&mut self, dec: &mut D) -> bool {
        dec.decode_bypass()
    }

    #[inline(always)]
    pub fn encode_bin_bypass<E: BinEncoder>(&mut self, enc: &mut E, bin: bool) {
        enc.encode_bypass(bin);
    }

    #[inline(always)]
    pub fn decode_final_bin<D: BinDecoder>(&mut self, dec: &mut D) -> bool {
        dec.decode_terminate()
    }

    #[inline(always)]
    pub fn encode_bin_final<E: BinEncoder>(&mut self, enc: &mut E, bin: bool) {
        enc.encode_terminate(bin);
    }

    pub fn encode_kth_order_exp_golomb_bypass<E: BinEncoder>(&mut self, enc: &mut E, symbol_val: u32, k: usize) {
        let mut abs_v = symbol_val;
        let mut k = k;
        loop {
            if abs_v >= 1 << k {
                self.encode_bin_bypass(enc, true);
                abs_v -= 1 << k;
                k += 1;
            } else {
                self.encode_bin_bypass(enc, false);
                while k > 0 {
                    k -= 1;
                    self.encode_bin_bypass(enc, (abs_v >> k) & 1 == 1);
                }
                break;
            }
        }
    }

    pub fn decode_kth_order_exp_golomb_bypass<D: BinDecoder>(&mut self, dec: &mut D, k: usize) -> u32 {
        let mut abs_v = 0u32;
        let mut k = k;
        while k < MAX_EXP_GOLOMB_PREFIX && self.decode_bin_bypass(dec) {
            abs_v += 1 << k;
            k += 1;
        }
        while k > 0 {
            k -= 1;
            abs_v += (self.decode_bin_bypass(dec) as u32) << k;
        }
        abs_v
    }

    /// condTermFlagN of the coded_block_flag family. `neighbor` is the type of
    /// the macroblock holding the neighbouring block, `None` if unavailable.
    pub fn cond_term(cur_is_intra: bool, neighbor: Option<MbType>, block_available: bool, cached: u8) -> usize {
        match neighbor {
            None => cur_is_intra as usize,
            Some(MbType::I_PCM) => 1,
            Some(_) if !block_available => 0,
            Some(_) => cached as usize,
        }
    }

    pub fn derive_ctx_inc_for_mb_skip_flag(&self, nb: &MbNeighbors, cache: &NeighborStateCache) -> usize {
        let cond_a = nb.left.is_some() && !cache.skip_left();
        let cond_b = nb.top.is_some() && !cache.skip_top(nb.mb_x);
        cond_a as usize + cond_b as usize
    }

    pub fn derive_ctx_inc_for_mb_type_si_prefix(&self, nb: &MbNeighbors) -> usize {
        let cond = |n: &Option<MbInfo>| matches!(n, Some(info) if info.mb_type != MbType::SI) as usize;
        cond(&nb.left) + cond(&nb.top)
    }

    pub fn derive_ctx_inc_for_mb_type_i(&self, nb: &MbNeighbors) -> usize {
        let cond = |n: &Option<MbInfo>| matches!(n, Some(info) if info.mb_type != MbType::I_NxN) as usize;
        cond(&nb.left) + cond(&nb.top)
    }

    pub fn derive_ctx_inc_for_mb_type_b(&self, nb: &MbNeighbors) -> usize {
        let cond = |n: &Option<MbInfo>| matches!(n, Some(info) if !info.mb_type.is_direct()) as usize;
        cond(&nb.left) + cond(&nb.top)
    }

    pub fn derive_ctx_inc_for_transform_size_8x8_flag(&self, nb: &MbNeighbors) -> usize {
        let cond = |n: &Option<MbInfo>| matches!(n, Some(info) if info.transform_8x8) as usize;
        cond(&nb.left) + cond(&nb.top)
    }

    pub fn derive_ctx_inc_for_intra_chroma_pred_mode(&self, nb: &MbNeighbors, cache: &NeighborStateCache) -> usize {
        let cond = |n: &Option<MbInfo>, mode: u8| {
            matches!(n, Some(info) if info.mb_type.is_intra() && !info.mb_type.is_pcm() && mode != 0) as usize
        };
        cond(&nb.left, cache.chroma_pred_mode_left()) + cond(&nb.top, cache.chroma_pred_mode_top(nb.mb_x))
    }

    pub fn derive_ctx_inc_for_mb_qp_delta(&self, cache: &NeighborStateCache) -> usize {
        match cache.prev_mb_type {
            None => 0,
            Some(t) if t.is_skip() || t.is_pcm() => 0,
            Some(t) if !t.is_i16x16() && cache.prev_cbp == 0 => 0,
            Some(_) => (cache.prev_mb_qp_delta != 0) as usize,
        }
    }

    /// `cbp` holds the luma bits already coded for the current macroblock.
    pub fn derive_ctx_inc_for_coded_block_pattern_luma(&self, nb: &MbNeighbors, b8: usize, cbp: usize) -> usize {
        let cond = |n: &Option<MbInfo>, b8n: usize| match n {
            None => 0,
            Some(info) if info.mb_type.is_pcm() => 0,
            Some(info) if !info.mb_type.is_skip() && (info.cbp_luma() >> b8n) & 1 != 0 => 0,
            Some(_) => 1,
        };
        let cond_a = if b8 & 1 == 1 {
            ((cbp >> (b8 - 1)) & 1 == 0) as usize
        } else {
            cond(&nb.left, b8 + 1)
        };
        let cond_b = if b8 >= 2 {
            ((cbp >> (b8 - 2)) & 1 == 0) as usize
        } else {
            cond(&nb.top, b8 + 2)
        };
        cond_a + 2 * cond_b
    }

    pub fn derive_ctx_inc_for_coded_block_pattern_chroma(&self, nb: &MbNeighbors, bin_idx: usize) -> usize {
        let cond = |n: &Option<MbInfo>| match n {
            None => 0,
            Some(info) if info.mb_type.is_pcm() => 1,
            Some(info) if info.mb_type.is_skip() => 0,
            Some(info) if bin_idx == 0 => (info.cbp_chroma() != 0) as usize,
            Some(info) => (info.cbp_chroma() == 2) as usize,
        };
        cond(&nb.left) + 2 * cond(&nb.top) + 4 * bin_idx
    }

    fn part_neighbor_usable(neighbor: &Option<PartNeighbor>, part: &InterPartition, list: usize) -> bool {
        match neighbor {
            Some(n) => !n.mb_type.is_intra() && !n.mb_type.is_skip() && pred_eq(n.pred, part.pred, list),
            None => false,
        }
    }

    pub fn derive_ctx_inc_for_ref_idx(&self, part: &InterPartition, list: usize, cache: &NeighborStateCache) -> usize {
        let cond_a = Self::part_neighbor_usable(&part.left, part, list) && cache.ref_idx_left(list, part.y) > 0;
        let cond_b = Self::part_neighbor_usable(&part.top, part, list)
            && cache.ref_idx_top(list, part.mb_x, part.x) > 0;
        cond_a as usize + 2 * cond_b as usize
    }

    pub fn derive_ctx_inc_for_mvd(
        &self,
        part: &InterPartition,
        list: usize,
        comp: usize,
        cache: &NeighborStateCache,
    ) -> usize {
        let mut abs_sum = 0;
        if Self::part_neighbor_usable(&part.left, part, list) {
            abs_sum += cache.mvd_left(list, comp, part.y);
        }
        if Self::part_neighbor_usable(&part.top, part, list) {
            abs_sum += cache.mvd_top(list, comp, part.mb_x, part.x);
        }
        if abs_sum < 3 {
            0
        } else if abs_sum > 32 {
            2
        } else {
            1
        }
    }

    fn intra_mb_type_ctx(&self, nb: &MbNeighbors) -> IntraMbTypeCtx {
        match self.slice_type {
            SliceType::I | SliceType::SI => IntraMbTypeCtx {
                prefix: CTX_MB_TYPE_I + self.derive_ctx_inc_for_mb_type_i(nb),
                base: CTX_MB_TYPE_I + 2,
                intra_slice: true,
            },
            SliceType::P | SliceType::SP => IntraMbTypeCtx {
                prefix: CTX_MB_TYPE_P_SUFFIX,
                base: CTX_MB_TYPE_P_SUFFIX,
                intra_slice: false,
            },
            SliceType::B => IntraMbTypeCtx {
                prefix: CTX_MB_TYPE_B_SUFFIX,
                base: CTX_MB_TYPE_B_SUFFIX,
                intra_slice: false,
            },
        }
    }

    /// Codes an I-slice style mb_type (0 = I_NxN, 1..=24 = I_16x16, 25 = I_PCM).
    fn encode_mb_type_intra<E: BinEncoder>(&mut self, enc: &mut E, ctx: &IntraMbTypeCtx, mb_type: usize) {
        assert!(mb_type <= 25, "invalid intra mb_type {mb_type}");
        if mb_type == 0 {
            self.encode_bin(enc, ctx.prefix, false);
            return;
        }
        self.encode_bin(enc, ctx.prefix, true);
        self.encode_bin_final(enc, mb_type == 25);
        if mb_type == 25 {
            return;
        }
        let v = mb_type - 1;
        let (luma, chroma, pred) = (v / 12, (v / 4) % 3, v % 4);
        self.encode_bin(enc, ctx.luma(), luma != 0);
        self.encode_bin(enc, ctx.chroma(0), chroma != 0);
        if chroma != 0 {
            self.encode_bin(enc, ctx.chroma(1), chroma == 2);
        }
        self.encode_bin(enc, ctx.pred(0), pred >> 1 == 1);
        self.encode_bin(enc, ctx.pred(1), pred & 1 == 1);
    }

    fn decode_mb_type_intra<D: BinDecoder>(&mut self, dec: &mut D, ctx: &IntraMbTypeCtx) -> usize {
        if !self.decode_bin(dec, ctx.prefix) {
            return 0;
        }
        if self.decode_final_bin(dec) {
            return 25;
        }
        let mut mb_type = 1;
        mb_type += 12 * self.decode_bin(dec, ctx.luma()) as usize;
        if self.decode_bin(dec, ctx.chroma(0)) {
            mb_type += 4 + 4 * self.decode_bin(dec, ctx.chroma(1)) as usize;
        }
        mb_type += 2 * self.decode_bin(dec, ctx.pred(0)) as usize;
        mb_type += self.decode_bin(dec, ctx.pred(1)) as usize;
        mb_type
    }

    /// `mb_type` is the raw value of the current slice type's table, e.g.
    /// 0..=25 in I slices and 0..=48 in B slices.
    pub fn encode_mb_type<E: BinEncoder>(&mut self, enc: &mut E, nb: &MbNeighbors, mb_type: usize) {
        debug_eprintln!("mb_type {} ({:?} slice)", mb_type, self.slice_type);
        let intra_offset = self.slice_type.intra_mb_type_offset();
        let intra_ctx = self.intra_mb_type_ctx(nb);
        match self.slice_type {
            SliceType::I => self.encode_mb_type_intra(enc, &intra_ctx, mb_type),
            SliceType::SI => {
                let prefix_ctx = CTX_MB_TYPE_SI_PREFIX + self.derive_ctx_inc_for_mb_type_si_prefix(nb);
                self.encode_bin(enc, prefix_ctx, mb_type != 0);
                if mb_type != 0 {
                    self.encode_mb_type_intra(enc, &intra_ctx, mb_type - intra_offset);
                }
            }
            SliceType::P | SliceType::SP => {
                if mb_type >= intra_offset {
                    self.encode_bin(enc, CTX_MB_TYPE_P_PREFIX, true);
                    self.encode_mb_type_intra(enc, &intra_ctx, mb_type - intra_offset);
                    return;
                }
                self.encode_bin(enc, CTX_MB_TYPE_P_PREFIX, false);
                match mb_type {
                    0 | 3 => {
                        self.encode_bin(enc, CTX_MB_TYPE_P_PREFIX + 1, false);
                        self.encode_bin(enc, CTX_MB_TYPE_P_PREFIX + 2, mb_type == 3);
                    }
                    1 | 2 => {
                        self.encode_bin(enc, CTX_MB_TYPE_P_PREFIX + 1, true);
                        self.encode_bin(enc, CTX_MB_TYPE_P_PREFIX + 3, mb_type == 1);
                    }
                    _ => panic!("P_8x8ref0 has no CABAC binarization"),
                }
            }
            SliceType::B => {
                let ctx_inc = self.derive_ctx_inc_for_mb_type_b(nb);
                if mb_type == 0 {
                    self.encode_bin(enc, CTX_MB_TYPE_B_PREFIX + ctx_inc, false);
                    return;
                }
                self.encode_bin(enc, CTX_MB_TYPE_B_PREFIX + ctx_inc, true);
                if mb_type <= 2 {
                    self.encode_bin(enc, CTX_MB_TYPE_B_PREFIX + 3, false);
                    self.encode_bin(enc, CTX_MB_TYPE_B_PREFIX + 5, mb_type == 2);
                    return;
                }
                self.encode_bin(enc, CTX_MB_TYPE_B_PREFIX + 3, true);
                let (bits, size) = match mb_type {
                    3..=10 => (mb_type - 3, 4),
                    11 => (14, 4),
                    12..=21 => (mb_type + 4, 5),
                    22 => (15, 4),
                    _ => (13, 4),
                };
                for i in (0..size).rev() {
                    let ctx_idx = if i == size - 1 { 4 } else { 5 };
                    self.encode_bin(enc, CTX_MB_TYPE_B_PREFIX + ctx_idx, (bits >> i) & 1 == 1);
                }
                if mb_type >= intra_offset {
                    self.encode_mb_type_intra(enc, &intra_ctx, mb_type - intra_offset);
                }
            }
        }
    }

    pub fn decode_mb_type<D: BinDecoder>(&mut self, dec: &mut D, nb: &MbNeighbors) -> usize {
        let intra_offset = self.slice_type.intra_mb_type_offset();
        let intra_ctx = self.intra_mb_type_ctx(nb);
        let mb_type = match self.slice_type {
            SliceType::I => self.decode_mb_type_intra(dec, &intra_ctx),
            SliceType::SI => {
                let prefix_ctx = CTX_MB_TYPE_SI_PREFIX + self.derive_ctx_inc_for_mb_type_si_prefix(nb);
                if self.decode_bin(dec, prefix_ctx) {
                    intra_offset + self.decode_mb_type_intra(dec, &intra_ctx)
                } else {
                    0
                }
            }
            SliceType::P | SliceType::SP => {
                if self.decode_bin(dec, CTX_MB_TYPE_P_PREFIX) {
                    intra_offset + self.decode_mb_type_intra(dec, &intra_ctx)
                } else if !self.decode_bin(dec, CTX_MB_TYPE_P_PREFIX + 1) {
                    3 * self.decode_bin(dec, CTX_MB_TYPE_P_PREFIX + 2) as usize
                } else {
                    2 - self.decode_bin(dec, CTX_MB_TYPE_P_PREFIX + 3) as usize
                }
            }
            SliceType::B => {
                let ctx_inc = self.derive_ctx_inc_for_mb_type_b(nb);
                if !self.decode_bin(dec, CTX_MB_TYPE_B_PREFIX + ctx_inc) {
                    0
                } else if !self.decode_bin(dec, CTX_MB_TYPE_B_PREFIX + 3) {
                    1 + self.decode_bin(dec, CTX_MB_TYPE_B_PREFIX + 5) as usize
                } else {
                    let mut bits = (self.decode_bin(dec, CTX_MB_TYPE_B_PREFIX + 4) as usize) << 3;
                    bits |= (self.decode_bin(dec, CTX_MB_TYPE_B_PREFIX + 5) as usize) << 2;
                    bits |= (self.decode_bin(dec, CTX_MB_TYPE_B_PREFIX + 5) as usize) << 1;
                    bits |= self.decode_bin(dec, CTX_MB_TYPE_B_PREFIX + 5) as usize;
                    match bits {
                        0..=7 => bits + 3,
                        13 => intra_offset + self.decode_mb_type_intra(dec, &intra_ctx),
                        14 => 11,
                        15 => 22,
                        _ => ((bits << 1) | self.decode_bin(dec, CTX_MB_TYPE_B_PREFIX + 5) as usize) - 4,
                    }
                }
            }
        };
        debug_eprintln!("mb_type {} ({:?} slice)", mb_type, self.slice_type);
        mb_type
    }

    pub fn encode_mb_skip_flag<E: BinEncoder>(
        &mut self,
        enc: &mut E,
        nb: &MbNeighbors,
        cache: &mut NeighborStateCache,
        mb_skip_flag: bool,
    ) {
        let ctx_offset = if self.slice_type == SliceType::B {
            CTX_MB_SKIP_FLAG_B
        } else {
            CTX_MB_SKIP_FLAG_P
        };
        let ctx_inc = self.derive_ctx_inc_for_mb_skip_flag(nb, cache);
        self.encode_bin(enc, ctx_offset + ctx_inc, mb_skip_flag);
        cache.set_skip_flag(nb.mb_x, mb_skip_flag);
    }

    pub fn decode_mb_skip_flag<D: BinDecoder>(
        &mut self,
        dec: &mut D,
        nb: &MbNeighbors,
        cache: &mut NeighborStateCache,
    ) -> bool {
        let ctx_offset = if self.slice_type == SliceType::B {
            CTX_MB_SKIP_FLAG_B
        } else {
            CTX_MB_SKIP_FLAG_P
        };
        let ctx_inc = self.derive_ctx_inc_for_mb_skip_flag(nb, cache);
        let mb_skip_flag = self.decode_bin(dec, ctx_offset + ctx_inc);
        cache.set_skip_flag(nb.mb_x, mb_skip_flag);
        mb_skip_flag
    }

    pub fn encode_sub_mb_type<E: BinEncoder>(&mut self, enc: &mut E, sub_mb_type: usize) {
        if self.slice_type == SliceType::B {
            assert!(sub_mb_type <= 12, "invalid B sub_mb_type {sub_mb_type}");
            let c = CTX_SUB_MB_TYPE_B;
            self.encode_bin(enc, c, sub_mb_type != 0);
            if sub_mb_type == 0 {
                return;
            }
            self.encode_bin(enc, c + 1, sub_mb_type > 2);
            if sub_mb_type <= 2 {
                self.encode_bin(enc, c + 3, sub_mb_type == 2);
                return;
            }
            self.encode_bin(enc, c + 2, sub_mb_type >= 7);
            if sub_mb_type >= 11 {
                self.encode_bin(enc, c + 3, true);
                self.encode_bin(enc, c + 3, sub_mb_type == 12);
                return;
            }
            let v = if sub_mb_type >= 7 {
                self.encode_bin(enc, c + 3, false);
                sub_mb_type - 7
            } else {
                sub_mb_type - 3
            };
            self.encode_bin(enc, c + 3, v >> 1 == 1);
            self.encode_bin(enc, c + 3, v & 1 == 1);
        } else {
            let c = CTX_SUB_MB_TYPE_P;
            match sub_mb_type {
                0 => self.encode_bin(enc, c, true),
                1 => {
                    self.encode_bin(enc, c, false);
                    self.encode_bin(enc, c + 1, false);
                }
                2 | 3 => {
                    self.encode_bin(enc, c, false);
                    self.encode_bin(enc, c + 1, true);
                    self.encode_bin(enc, c + 2, sub_mb_type == 2);
                }
                _ => panic!("invalid P sub_mb_type {sub_mb_type}"),
            }
        }
    }

    pub fn decode_sub_mb_type<D: BinDecoder>(&mut self, dec: &mut D) -> usize {
        if self.slice_type == SliceType::B {
            let c = CTX_SUB_MB_TYPE_B;
            if !self.decode_bin(dec, c) {
                return 0;
            }
            if !self.decode_bin(dec, c + 1) {
                return 1 + self.decode_bin(dec, c + 3) as usize;
            }
            let mut sub_mb_type = 3;
            if self.decode_bin(dec, c + 2) {
                if self.decode_bin(dec, c + 3) {
                    return 11 + self.decode_bin(dec, c + 3) as usize;
                }
                sub_mb_type += 4;
            }
            sub_mb_type += 2 * self.decode_bin(dec, c + 3) as usize;
            sub_mb_type += self.decode_bin(dec, c + 3) as usize;
            sub_mb_type
        } else {
            let c = CTX_SUB_MB_TYPE_P;
            if self.decode_bin(dec, c) {
                0
            } else if !self.decode_bin(dec, c + 1) {
                1
            } else if self.decode_bin(dec, c + 2) {
                2
            } else {
                3
            }
        }
    }

    pub fn encode_transform_size_8x8_flag<E: BinEncoder>(&mut self, enc: &mut E, nb: &MbNeighbors, flag: bool) {
        let ctx_inc = self.derive_ctx_inc_for_transform_size_8x8_flag(nb);
        self.encode_bin(enc, CTX_TRANSFORM_SIZE_8X8_FLAG + ctx_inc, flag);
    }

    pub fn decode_transform_size_8x8_flag<D: BinDecoder>(&mut self, dec: &mut D, nb: &MbNeighbors) -> bool {
        let ctx_inc = self.derive_ctx_inc_for_transform_size_8x8_flag(nb);
        self.decode_bin(dec, CTX_TRANSFORM_SIZE_8X8_FLAG + ctx_inc)
    }

    /// `None` signals prev_intra_pred_mode_flag, `Some(rem)` codes
    /// rem_intra_pred_mode.
    pub fn encode_intra_pred_mode<E: BinEncoder>(&mut self, enc: &mut E, rem_intra_pred_mode: Option<u8>) {
        match rem_intra_pred_mode {
            None => self.encode_bin(enc, CTX_PREV_INTRA_PRED_MODE_FLAG, true),
            Some(rem) => {
                assert!(rem < 8);
                self.encode_bin(enc, CTX_PREV_INTRA_PRED_MODE_FLAG, false);
                for i in 0..3 {
                    self.encode_bin(enc, CTX_REM_INTRA_PRED_MODE, (rem >> i) & 1 == 1);
                }
            }
        }
    }

    pub fn decode_intra_pred_mode<D: BinDecoder>(&mut self, dec: &mut D) -> Option<u8> {
        if self.decode_bin(dec, CTX_PREV_INTRA_PRED_MODE_FLAG) {
            None
        } else {
            let mut rem = 0;
            for i in 0..3 {
                rem |= (self.decode_bin(dec, CTX_REM_INTRA_PRED_MODE) as u8) << i;
            }
            Some(rem)
        }
    }

    pub fn encode_intra_chroma_pred_mode<E: BinEncoder>(
        &mut self,
        enc: &mut E,
        nb: &MbNeighbors,
        cache: &mut NeighborStateCache,
        mode: u8,
    ) {
        assert!(mode <= 3, "invalid intra_chroma_pred_mode {mode}");
        let ctx_inc = self.derive_ctx_inc_for_intra_chroma_pred_mode(nb, cache);
        self.encode_bin(enc, CTX_INTRA_CHROMA_PRED_MODE + ctx_inc, mode > 0);
        if mode > 0 {
            self.encode_bin(enc, CTX_INTRA_CHROMA_PRED_MODE + 3, mode > 1);
            if mode > 1 {
                self.encode_bin(enc, CTX_INTRA_CHROMA_PRED_MODE + 3, mode > 2);
            }
        }
        cache.set_chroma_pred_mode(nb.mb_x, mode);
    }

    pub fn decode_intra_chroma_pred_mode<D: BinDecoder>(
        &mut self,
        dec: &mut D,
        nb: &MbNeighbors,
        cache: &mut NeighborStateCache,
    ) -> u8 {
        let ctx_inc = self.derive_ctx_inc_for_intra_chroma_pred_mode(nb, cache);
        let mut mode = 0;
        if self.decode_bin(dec, CTX_INTRA_CHROMA_PRED_MODE + ctx_inc) {
            mode = 1;
            while mode < 3 && self.decode_bin(dec, CTX_INTRA_CHROMA_PRED_MODE + 3) {
                mode += 1;
            }
        }
        cache.set_chroma_pred_mode(nb.mb_x, mode);
        mode
    }

    pub fn encode_mb_qp_delta<E: BinEncoder>(&mut self, enc: &mut E, cache: &mut NeighborStateCache, mb_qp_delta: i32) {
        assert!((-26..=25).contains(&mb_qp_delta), "mb_qp_delta {mb_qp_delta} out of range");
        let k = (if mb_qp_delta > 0 {
            2 * mb_qp_delta - 1
        } else {
            -2 * mb_qp_delta
        }) as usize;
        let mut ctx_idx = CTX_MB_QP_DELTA + self.derive_ctx_inc_for_mb_qp_delta(cache);
        for i in 0..k {
            self.encode_bin(enc, ctx_idx, true);
            ctx_idx = CTX_MB_QP_DELTA + if i == 0 { 2 } else { 3 };
        }
        self.encode_bin(enc, ctx_idx, false);
        cache.prev_mb_qp_delta = mb_qp_delta;
    }

    pub fn decode_mb_qp_delta<D: BinDecoder>(&mut self, dec: &mut D, cache: &mut NeighborStateCache) -> i32 {
        let mut ctx_idx = CTX_MB_QP_DELTA + self.derive_ctx_inc_for_mb_qp_delta(cache);
        let mut k = 0;
        while k < MAX_QP_DELTA_BINS && self.decode_bin(dec, ctx_idx) {
            ctx_idx = CTX_MB_QP_DELTA + if k == 0 { 2 } else { 3 };
            k += 1;
        }
        let k = k as i32;
        let mb_qp_delta = if k & 1 == 1 { (k + 1) / 2 } else { -k / 2 };
        cache.prev_mb_qp_delta = mb_qp_delta;
        mb_qp_delta
    }

    pub fn encode_ref_idx<E: BinEncoder>(
        &mut self,
        enc: &mut E,
        part: &InterPartition,
        list: usize,
        cache: &mut NeighborStateCache,
        ref_idx: u8,
    ) {
        assert!((ref_idx as usize) < MAX_REF_IDX_BINS);
        let mut ctx_idx = CTX_REF_IDX + self.derive_ctx_inc_for_ref_idx(part, list, cache);
        for i in 0..ref_idx {
            self.encode_bin(enc, ctx_idx, true);
            ctx_idx = CTX_REF_IDX + if i == 0 { 4 } else { 5 };
        }
        self.encode_bin(enc, ctx_idx, false);
        cache.set_ref_idx(list, part, ref_idx);
    }

    pub fn decode_ref_idx<D: BinDecoder>(
        &mut self,
        dec: &mut D,
        part: &InterPartition,
        list: usize,
        cache: &mut NeighborStateCache,
    ) -> u8 {
        let mut ctx_idx = CTX_REF_IDX + self.derive_ctx_inc_for_ref_idx(part, list, cache);
        let mut ref_idx = 0;
        while (ref_idx as usize) < MAX_REF_IDX_BINS && self.decode_bin(dec, ctx_idx) {
            ctx_idx = CTX_REF_IDX + if ref_idx == 0 { 4 } else { 5 };
            ref_idx += 1;
        }
        cache.set_ref_idx(list, part, ref_idx);
        ref_idx
    }

    /// Both components of one mvd, horizontal first. Prefix is truncated
    /// unary with cut-off 9, suffix UEG3 in bypass mode.
    pub fn encode_mvd<E: BinEncoder>(
        &mut self,
        enc: &mut E,
        part: &InterPartition,
        list: usize,
        cache: &mut NeighborStateCache,
        mvd: [i32; 2],
    ) {
        for (comp, &v) in mvd.iter().enumerate() {
            let ctx_offset = if comp == 0 { CTX_MVD_X } else { CTX_MVD_Y };
            let mut ctx_idx = ctx_offset + self.derive_ctx_inc_for_mvd(part, list, comp, cache);
            let abs_v = v.unsigned_abs();
            let prefix = abs_v.min(9);
            for i in 0..prefix {
                self.encode_bin(enc, ctx_idx, true);
                ctx_idx = ctx_offset + (3 + i as usize).min(6);
            }
            if prefix < 9 {
                self.encode_bin(enc, ctx_idx, false);
            } else {
                self.encode_kth_order_exp_golomb_bypass(enc, abs_v - 9, 3);
            }
            if abs_v != 0 {
                self.encode_bin_bypass(enc, v < 0);
            }
        }
        cache.set_mvd(list, part, mvd);
    }

    pub fn decode_mvd<D: BinDecoder>(
        &mut self,
        dec: &mut D,
        part: &InterPartition,
        list: usize,
        cache: &mut NeighborStateCache,
    ) -> [i32; 2] {
        let mut mvd = [0; 2];
        for (comp, v) in mvd.iter_mut().enumerate() {
            let ctx_offset = if comp == 0 { CTX_MVD_X } else { CTX_MVD_Y };
            let mut ctx_idx = ctx_offset + self.derive_ctx_inc_for_mvd(part, list, comp, cache);
            let mut abs_v = 0u32;
            while abs_v < 9 && self.decode_bin(dec, ctx_idx) {
                ctx_idx = ctx_offset + (3 + abs_v as usize).min(6);
                abs_v += 1;
            }
            if abs_v == 9 {
                abs_v = abs_v.saturating_add(self.decode_kth_order_exp_golomb_bypass(dec, 3));
            }
            *v = abs_v.min(i32::MAX as u32) as i32;
            if abs_v != 0 && self.decode_bin_bypass(dec) {
                *v = -*v;
            }
        }
        cache.set_mvd(list, part, mvd);
        mvd
    }

    /// Four fixed-length luma bins followed by a truncated unary chroma part.
    pub fn encode_coded_block_pattern<E: BinEncoder>(&mut self, enc: &mut E, nb: &MbNeighbors, cbp: usize) {
        assert!(cbp < 48, "invalid coded_block_pattern {cbp}");
        for b8 in 0..4 {
            let ctx_inc = self.derive_ctx_inc_for_coded_block_pattern_luma(nb, b8, cbp);
            self.encode_bin(enc, CTX_CODED_BLOCK_PATTERN_LUMA + ctx_inc, (cbp >> b8) & 1 == 1);
        }
        let chroma = cbp >> 4;
        let ctx_inc = self.derive_ctx_inc_for_coded_block_pattern_chroma(nb, 0);
        self.encode_bin(enc, CTX_CODED_BLOCK_PATTERN_CHROMA + ctx_inc, chroma != 0);
        if chroma != 0 {
            let ctx_inc = self.derive_ctx_inc_for_coded_block_pattern_chroma(nb, 1);
            self.encode_bin(enc, CTX_CODED_BLOCK_PATTERN_CHROMA + ctx_inc, chroma == 2);
        }
    }

    pub fn decode_coded_block_pattern<D: BinDecoder>(&mut self, dec: &mut D, nb: &MbNeighbors) -> usize {
        let mut cbp = 0;
        for b8 in 0..4 {
            let ctx_inc = self.derive_ctx_inc_for_coded_block_pattern_luma(nb, b8, cbp);
            cbp |= (self.decode_bin(dec, CTX_CODED_BLOCK_PATTERN_LUMA + ctx_inc) as usize) << b8;
        }
        let ctx_inc = self.derive_ctx_inc_for_coded_block_pattern_chroma(nb, 0);
        if self.decode_bin(dec, CTX_CODED_BLOCK_PATTERN_CHROMA + ctx_inc) {
            let ctx_inc = self.derive_ctx_inc_for_coded_block_pattern_chroma(nb, 1);
            cbp |= (1 + self.decode_bin(dec, CTX_CODED_BLOCK_PATTERN_CHROMA + ctx_inc) as usize) << 4;
        }
        debug_eprintln!("coded_block_pattern {}", cbp);
        cbp
    }

    pub fn encode_end_of_slice_flag<E: BinEncoder>(&mut self, enc: &mut E, end_of_slice: bool) {
        self.encode_bin_final(enc, end_of_slice);
    }

    pub fn decode_end_of_slice_flag<D: BinDecoder>(&mut self, dec: &mut D) -> bool {
        self.decode_final_bin(dec)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::binary_reader::BinaryReader;
    use crate::neighbor_cache::MAX_CACHED_MVD;
    use rand::{prelude::StdRng, Rng, SeedableRng};

    pub const ALL_MB_TYPES: [MbType; 16] = [
        MbType::SI,
        MbType::I_NxN,
        MbType::I_16x16,
        MbType::I_PCM,
        MbType::P_L0_16x16,
        MbType::P_L0_L0_16x8,
        MbType::P_L0_L0_8x16,
        MbType::P_8x8,
        MbType::P_8x8ref0,
        MbType::P_Skip,
        MbType::B_Direct_16x16,
        MbType::B_16x16,
        MbType::B_16x8,
        MbType::B_8x16,
        MbType::B_8x8,
        MbType::B_Skip,
    ];

    /// Every neighbour a context derivation can see: unavailable, or any
    /// macroblock type with a few coded block patterns.
    pub fn neighbor_candidates() -> Vec<Option<MbInfo>> {
        let mut v = vec![None];
        for &mb_type in ALL_MB_TYPES.iter() {
            for &cbp in [0, 0x0f, 0x15, 0x2a, 0x2f].iter() {
                for transform_8x8 in [false, true] {
                    v.push(Some(MbInfo::new(mb_type, cbp, transform_8x8)));
                }
            }
        }
        v
    }

    pub fn finish(mut enc: BoolEncoder) -> Vec<u8> {
        enc.encode_terminate(true);
        enc.finish().bytes().collect()
    }

    #[test]
    fn cond_term_works() {
        assert_eq!(Cabac::cond_term(true, None, false, 0), 1);
        assert_eq!(Cabac::cond_term(false, None, true, 1), 0);
        assert_eq!(Cabac::cond_term(false, Some(MbType::I_PCM), false, 0), 1);
        assert_eq!(Cabac::cond_term(true, Some(MbType::P_L0_16x16), false, 1), 0);
        assert_eq!(Cabac::cond_term(false, Some(MbType::I_NxN), true, 1), 1);
        assert_eq!(Cabac::cond_term(false, Some(MbType::I_NxN), true, 0), 0);
    }

    #[test]
    fn mb_level_context_indices_are_bounded() {
        let cabac = Cabac::new(SliceType::B, 0, 26);
        let candidates = neighbor_candidates();
        let mut cache = NeighborStateCache::new(2);
        for left in candidates.iter() {
            for top in candidates.iter() {
                let nb = MbNeighbors::new(1, *left, *top);
                for skip in [false, true] {
                    cache.set_skip_flag(0, skip);
                    cache.set_skip_flag(1, !skip);
                    assert!(cabac.derive_ctx_inc_for_mb_skip_flag(&nb, &cache) <= 2);
                }
                for mode in 0..4 {
                    cache.set_chroma_pred_mode(0, mode);
                    cache.set_chroma_pred_mode(1, 3 - mode);
                    assert!(cabac.derive_ctx_inc_for_intra_chroma_pred_mode(&nb, &cache) <= 2);
                }
                assert!(cabac.derive_ctx_inc_for_mb_type_i(&nb) <= 2);
                assert!(cabac.derive_ctx_inc_for_mb_type_si_prefix(&nb) <= 2);
                assert!(cabac.derive_ctx_inc_for_mb_type_b(&nb) <= 2);
                assert!(cabac.derive_ctx_inc_for_transform_size_8x8_flag(&nb) <= 2);
                for b8 in 0..4 {
                    for cbp in 0..16 {
                        assert!(cabac.derive_ctx_inc_for_coded_block_pattern_luma(&nb, b8, cbp) <= 3);
                    }
                }
                assert!(cabac.derive_ctx_inc_for_coded_block_pattern_chroma(&nb, 0) <= 3);
                let inc = cabac.derive_ctx_inc_for_coded_block_pattern_chroma(&nb, 1);
                assert!((4..=7).contains(&inc));
            }
        }
    }

    #[test]
    fn unavailable_neighbors_select_first_context() {
        let cabac = Cabac::new(SliceType::P, 1, 30);
        let cache = NeighborStateCache::new(1);
        let nb = MbNeighbors::new(0, None, None);
        assert_eq!(cabac.derive_ctx_inc_for_mb_skip_flag(&nb, &cache), 0);
        assert_eq!(cabac.derive_ctx_inc_for_mb_type_i(&nb), 0);
        assert_eq!(cabac.derive_ctx_inc_for_intra_chroma_pred_mode(&nb, &cache), 0);
        assert_eq!(cabac.derive_ctx_inc_for_coded_block_pattern_luma(&nb, 0, 0), 0);
        // inside the macroblock an uncoded 8x8 counts
        assert_eq!(cabac.derive_ctx_inc_for_coded_block_pattern_luma(&nb, 3, 0), 3);
        assert_eq!(cabac.derive_ctx_inc_for_coded_block_pattern_luma(&nb, 3, 0b0110), 0);
        let pcm = Some(MbInfo::new(MbType::I_PCM, 0x2f, false));
        let nb = MbNeighbors::new(0, pcm, pcm);
        assert_eq!(cabac.derive_ctx_inc_for_coded_block_pattern_chroma(&nb, 1), 7);
        assert_eq!(cabac.derive_ctx_inc_for_coded_block_pattern_luma(&nb, 0, 0), 0);
        assert_eq!(cabac.derive_ctx_inc_for_mb_type_i(&nb), 2);
    }

    #[test]
    fn motion_context_indices_are_bounded() {
        let cabac = Cabac::new(SliceType::B, 2, 26);
        let mut cache = NeighborStateCache::new(2);
        let preds = [PartPred::Pred_L0, PartPred::Pred_L1, PartPred::BiPred, PartPred::Direct];
        let mut neighbors = vec![None];
        for &mb_type in ALL_MB_TYPES.iter() {
            for &pred in preds.iter() {
                neighbors.push(Some(PartNeighbor { mb_type, pred }));
            }
        }
        for &value in [0u8, 1, 5].iter() {
            let whole = InterPartition {
                mb_x: 0,
                x: 0,
                y: 0,
                width: 8,
                height: 4,
                pred: PartPred::BiPred,
                left: None,
                top: None,
            };
            for list in 0..2 {
                cache.set_ref_idx(list, &whole, value);
                cache.set_mvd(list, &whole, [value as i32 * 7, -(value as i32)]);
            }
            for left in neighbors.iter() {
                for top in neighbors.iter() {
                    for &pred in preds[..3].iter() {
                        let part = InterPartition {
                            mb_x: 1,
                            x: 0,
                            y: 0,
                            width: 4,
                            height: 2,
                            pred,
                            left: *left,
                            top: *top,
                        };
                        for list in 0..2 {
                            let inc = cabac.derive_ctx_inc_for_ref_idx(&part, list, &cache);
                            assert!(inc <= 3);
                            if value == 0 {
                                assert_eq!(inc, 0);
                            }
                            for comp in 0..2 {
                                assert!(cabac.derive_ctx_inc_for_mvd(&part, list, comp, &cache) <= 2);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn mvd_context_buckets_work() {
        let cabac = Cabac::new(SliceType::P, 0, 26);
        let mut cache = NeighborStateCache::new(1);
        let inter = Some(PartNeighbor {
            mb_type: MbType::P_L0_16x16,
            pred: PartPred::Pred_L0,
        });
        let part = InterPartition {
            mb_x: 0,
            x: 2,
            y: 2,
            width: 2,
            height: 2,
            pred: PartPred::Pred_L0,
            left: inter,
            top: inter,
        };
        let left_part = InterPartition { x: 0, ..part };
        let top_part = InterPartition { y: 0, ..part };
        for &(a, b, expected) in [(0, 2, 0), (1, 2, 1), (16, 16, 1), (16, 17, 2), (40, 0, 2)].iter() {
            cache.set_mvd(0, &left_part, [a, -a]);
            cache.set_mvd(0, &top_part, [-b, b]);
            assert_eq!(cabac.derive_ctx_inc_for_mvd(&part, 0, 0, &cache), expected);
            assert_eq!(cabac.derive_ctx_inc_for_mvd(&part, 0, 1, &cache), expected);
            // list 1 is not used by either partition
            assert_eq!(cabac.derive_ctx_inc_for_mvd(&part, 1, 0, &cache), 0);
        }
        let intra = Some(PartNeighbor {
            mb_type: MbType::I_NxN,
            pred: PartPred::Pred_L0,
        });
        let part = InterPartition {
            left: intra,
            top: intra,
            ..part
        };
        assert_eq!(cabac.derive_ctx_inc_for_mvd(&part, 0, 0, &cache), 0);
    }

    #[test]
    fn mb_qp_delta_round_trip_works() {
        let deltas = [0, 1, -1, 2, -2, 25, -26, 0, 3];
        let mut cabac = Cabac::new(SliceType::I, 0, 26);
        let mut cache = NeighborStateCache::new(1);
        let mut enc = BoolEncoder::new();
        for &d in deltas.iter() {
            cabac.encode_mb_qp_delta(&mut enc, &mut cache, d);
            cache.finish_mb(MbType::I_16x16, 0, d);
        }
        let bytes = finish(enc);

        let mut cabac = Cabac::new(SliceType::I, 0, 26);
        let mut cache = NeighborStateCache::new(1);
        let mut dec = BoolDecoder::new(BinaryReader::vec(&bytes));
        for &d in deltas.iter() {
            assert_eq!(cabac.decode_mb_qp_delta(&mut dec, &mut cache), d);
            cache.finish_mb(MbType::I_16x16, 0, d);
        }
        assert!(dec.decode_terminate());
    }

    #[test]
    fn mb_qp_delta_context_works() {
        let cabac = Cabac::new(SliceType::P, 0, 26);
        let mut cache = NeighborStateCache::new(1);
        assert_eq!(cabac.derive_ctx_inc_for_mb_qp_delta(&cache), 0);
        cache.finish_mb(MbType::I_16x16, 0, -3);
        assert_eq!(cabac.derive_ctx_inc_for_mb_qp_delta(&cache), 1);
        cache.finish_mb(MbType::P_L0_16x16, 0, -3);
        assert_eq!(cabac.derive_ctx_inc_for_mb_qp_delta(&cache), 0);
        cache.finish_mb(MbType::P_L0_16x16, 1, -3);
        assert_eq!(cabac.derive_ctx_inc_for_mb_qp_delta(&cache), 1);
        cache.finish_mb(MbType::P_L0_16x16, 1, 0);
        assert_eq!(cabac.derive_ctx_inc_for_mb_qp_delta(&cache), 0);
        cache.finish_mb(MbType::I_PCM, 0x2f, 2);
        assert_eq!(cabac.derive_ctx_inc_for_mb_qp_delta(&cache), 0);
        cache.finish_mb(MbType::P_Skip, 0, 0);
        assert_eq!(cabac.derive_ctx_inc_for_mb_qp_delta(&cache), 0);
    }

    fn mb_type_round_trip(slice_type: SliceType, mb_types: &[usize], rng: &mut StdRng) {
        let candidates = neighbor_candidates();
        let neighbors: Vec<MbNeighbors> = mb_types
            .iter()
            .map(|_| {
                let left = candidates[rng.gen_range(0..candidates.len())];
                let top = candidates[rng.gen_range(0..candidates.len())];
                MbNeighbors::new(0, left, top)
            })
            .collect();
        let mut cabac = Cabac::new(slice_type, 1, 33);
        let mut enc = BoolEncoder::new();
        for (&mb_type, nb) in mb_types.iter().zip(neighbors.iter()) {
            cabac.encode_mb_type(&mut enc, nb, mb_type);
            if mb_type == 25 + slice_type.intra_mb_type_offset() {
                // the terminate bin of I_PCM flushed the engine
                enc.encode_pcm_samples(&[0x80; 4]);
            }
        }
        let bytes = finish(enc);

        let mut cabac = Cabac::new(slice_type, 1, 33);
        let mut dec = BoolDecoder::new(BinaryReader::vec(&bytes));
        for (&mb_type, nb) in mb_types.iter().zip(neighbors.iter()) {
            assert_eq!(cabac.decode_mb_type(&mut dec, nb), mb_type, "{:?} slice", slice_type);
            if mb_type == 25 + slice_type.intra_mb_type_offset() {
                let mut samples = [0u8; 4];
                dec.decode_pcm_samples(&mut samples);
                assert_eq!(samples, [0x80; 4]);
            }
        }
        assert!(dec.decode_terminate());
    }

    #[test]
    fn mb_type_round_trip_works() {
        let mut rng: StdRng = SeedableRng::seed_from_u64(2);
        let i_types: Vec<usize> = (0..=25).collect();
        mb_type_round_trip(SliceType::I, &i_types, &mut rng);
        let si_types: Vec<usize> = (0..=26).collect();
        mb_type_round_trip(SliceType::SI, &si_types, &mut rng);
        let p_types: Vec<usize> = (0..=30).filter(|t| *t != 4).collect();
        mb_type_round_trip(SliceType::P, &p_types, &mut rng);
        mb_type_round_trip(SliceType::SP, &p_types, &mut rng);
        let b_types: Vec<usize> = (0..=48).collect();
        mb_type_round_trip(SliceType::B, &b_types, &mut rng);
        let random: Vec<usize> = (0..300).map(|_| rng.gen_range(0..=48)).collect();
        mb_type_round_trip(SliceType::B, &random, &mut rng);
    }

    #[test]
    #[should_panic]
    fn p_8x8ref0_cannot_be_coded() {
        let mut cabac = Cabac::new(SliceType::P, 0, 26);
        let mut enc = BoolEncoder::new();
        cabac.encode_mb_type(&mut enc, &MbNeighbors::new(0, None, None), 4);
    }

    #[test]
    fn sub_mb_type_round_trip_works() {
        let mut rng: StdRng = SeedableRng::seed_from_u64(2);
        for (slice_type, num_types) in [(SliceType::P, 4), (SliceType::B, 13)] {
            let values: Vec<usize> = (0..num_types).chain((0..100).map(|_| rng.gen_range(0..num_types))).collect();
            let mut cabac = Cabac::new(slice_type, 0, 20);
            let mut enc = BoolEncoder::new();
            for &v in values.iter() {
                cabac.encode_sub_mb_type(&mut enc, v);
            }
            let bytes = finish(enc);
            let mut cabac = Cabac::new(slice_type, 0, 20);
            let mut dec = BoolDecoder::new(BinaryReader::vec(&bytes));
            for &v in values.iter() {
                assert_eq!(cabac.decode_sub_mb_type(&mut dec), v);
            }
            assert!(dec.decode_terminate());
        }
    }

    #[test]
    fn small_elements_round_trip_works() {
        let mut rng: StdRng = SeedableRng::seed_from_u64(2);
        let candidates = neighbor_candidates();
        let mut ops = vec![];
        for _ in 0..500 {
            let left = candidates[rng.gen_range(0..candidates.len())];
            let top = candidates[rng.gen_range(0..candidates.len())];
            let nb = MbNeighbors::new(rng.gen_range(0..3), left, top);
            let kind = rng.gen_range(0..6);
            let value = match kind {
                0 | 1 | 5 => rng.gen_range(0..2),
                2 => rng.gen_range(0..4),
                3 => rng.gen_range(0..9),
                _ => rng.gen_range(0..48),
            };
            ops.push((nb, kind, value));
        }
        let code = |cabac: &mut Cabac, cache: &mut NeighborStateCache, enc: &mut BoolEncoder| {
            for &(nb, kind, value) in ops.iter() {
                match kind {
                    0 => cabac.encode_mb_skip_flag(enc, &nb, cache, value == 1),
                    1 => cabac.encode_transform_size_8x8_flag(enc, &nb, value == 1),
                    2 => cabac.encode_intra_chroma_pred_mode(enc, &nb, cache, value as u8),
                    3 => cabac.encode_intra_pred_mode(enc, if value == 8 { None } else { Some(value as u8) }),
                    4 => cabac.encode_coded_block_pattern(enc, &nb, value),
                    _ => cabac.encode_end_of_slice_flag(enc, false),
                }
            }
        };
        let mut cabac = Cabac::new(SliceType::P, 2, 40);
        let mut cache = NeighborStateCache::new(3);
        let mut enc = BoolEncoder::new();
        code(&mut cabac, &mut cache, &mut enc);
        let bytes = finish(enc);

        let mut cabac = Cabac::new(SliceType::P, 2, 40);
        let mut cache = NeighborStateCache::new(3);
        let mut dec = BoolDecoder::new(BinaryReader::vec(&bytes));
        for &(nb, kind, value) in ops.iter() {
            match kind {
                0 => assert_eq!(cabac.decode_mb_skip_flag(&mut dec, &nb, &mut cache), value == 1),
                1 => assert_eq!(cabac.decode_transform_size_8x8_flag(&mut dec, &nb), value == 1),
                2 => assert_eq!(
                    cabac.decode_intra_chroma_pred_mode(&mut dec, &nb, &mut cache),
                    value as u8
                ),
                3 => assert_eq!(
                    cabac.decode_intra_pred_mode(&mut dec),
                    if value == 8 { None } else { Some(value as u8) }
                ),
                4 => assert_eq!(cabac.decode_coded_block_pattern(&mut dec, &nb), value),
                _ => assert!(!cabac.decode_end_of_slice_flag(&mut dec)),
            }
        }
        assert!(cabac.decode_end_of_slice_flag(&mut dec));
    }

    #[test]
    fn motion_round_trip_works() {
        let mut rng: StdRng = SeedableRng::seed_from_u64(2);
        let inter = |pred| {
            Some(PartNeighbor {
                mb_type: MbType::B_16x16,
                pred,
            })
        };
        let mut parts = vec![];
        for _ in 0..300 {
            let (x, y) = (rng.gen_range(0..2) * 2, rng.gen_range(0..2) * 2);
            let pred = [PartPred::Pred_L0, PartPred::Pred_L1, PartPred::BiPred][rng.gen_range(0..3)];
            let part = InterPartition {
                mb_x: rng.gen_range(0..2),
                x,
                y,
                width: 2,
                height: 2,
                pred,
                left: if rng.gen_bool(0.8) { inter(pred) } else { None },
                top: if rng.gen_bool(0.8) { inter(PartPred::BiPred) } else { None },
            };
            let list = if pred == PartPred::Pred_L1 { 1 } else { 0 };
            let ref_idx = rng.gen_range(0..4u8);
            let mvd = match rng.gen_range(0..4) {
                0 => [0, 0],
                1 => [rng.gen_range(-8..=8), rng.gen_range(-8..=8)],
                2 => [rng.gen_range(-40..=40), rng.gen_range(-9..=9)],
                _ => [rng.gen_range(-5000..=5000), rng.gen_range(-1 << 14..1 << 14)],
            };
            parts.push((part, list, ref_idx, mvd));
        }
        let mut cabac = Cabac::new(SliceType::B, 0, 28);
        let mut cache = NeighborStateCache::new(2);
        let mut enc = BoolEncoder::new();
        for (part, list, ref_idx, mvd) in parts.iter() {
            cabac.encode_ref_idx(&mut enc, part, *list, &mut cache, *ref_idx);
            cabac.encode_mvd(&mut enc, part, *list, &mut cache, *mvd);
        }
        let bytes = finish(enc);

        let mut cabac = Cabac::new(SliceType::B, 0, 28);
        let mut cache = NeighborStateCache::new(2);
        let mut dec = BoolDecoder::new(BinaryReader::vec(&bytes));
        for (part, list, ref_idx, mvd) in parts.iter() {
            assert_eq!(cabac.decode_ref_idx(&mut dec, part, *list, &mut cache), *ref_idx);
            assert_eq!(cabac.decode_mvd(&mut dec, part, *list, &mut cache), *mvd);
        }
        assert!(dec.decode_terminate());
    }

    #[test]
    fn saturated_mvd_suffix_works() {
        let part = InterPartition {
            mb_x: 0,
            x: 0,
            y: 0,
            width: 4,
            height: 4,
            pred: PartPred::Pred_L0,
            left: None,
            top: None,
        };
        // full mvd prefix followed by a run of bypass ones
        let mut cabac = Cabac::new(SliceType::P, 1, 30);
        let mut enc = BoolEncoder::new();
        cabac.encode_bin(&mut enc, CTX_MVD_X, true);
        for i in 0..8 {
            cabac.encode_bin(&mut enc, CTX_MVD_X + (3 + i).min(6), true);
        }
        for _ in 0..70 {
            cabac.encode_bin_bypass(&mut enc, true);
        }
        let bytes = finish(enc);

        let mut cabac = Cabac::new(SliceType::P, 1, 30);
        let mut cache = NeighborStateCache::new(1);
        let mut dec = BoolDecoder::new(BinaryReader::vec(&bytes));
        let mvd = cabac.decode_mvd(&mut dec, &part, 0, &mut cache);
        assert_eq!(mvd[0], -i32::MAX);
        for y in 0..4 {
            assert_eq!(cache.mvd_left(0, 0, y), MAX_CACHED_MVD);
        }

        // both neighbours saturated still select the top bucket
        let inter = Some(PartNeighbor {
            mb_type: MbType::P_L0_16x16,
            pred: PartPred::Pred_L0,
        });
        let whole = |mb_x| InterPartition { mb_x, ..part };
        let mut cache = NeighborStateCache::new(2);
        cache.set_mvd(0, &whole(0), [i32::MIN, i32::MAX]);
        cache.set_mvd(0, &whole(1), [i32::MAX, i32::MIN]);
        let next = InterPartition {
            mb_x: 1,
            left: inter,
            top: inter,
            ..part
        };
        assert_eq!(cabac.derive_ctx_inc_for_mvd(&next, 0, 0, &cache), 2);
        assert_eq!(cabac.derive_ctx_inc_for_mvd(&next, 0, 1, &cache), 2);
    }

    #[test]
    fn exp_golomb_bypass_works() {
        let values = [0u32, 1, 2, 7, 8, 9, 100, 999_986, 1 << 20];
        for k in [0, 3] {
            let mut cabac = Cabac::new(SliceType::I, 0, 26);
            let mut enc = BoolEncoder::new();
            for &v in values.iter() {
                cabac.encode_kth_order_exp_golomb_bypass(&mut enc, v, k);
            }
            let bytes = finish(enc);
            let mut dec = BoolDecoder::new(BinaryReader::vec(&bytes));
            for &v in values.iter() {
                assert_eq!(cabac.decode_kth_order_exp_golomb_bypass(&mut dec, k), v);
            }
        }
    }

    #[test]
    fn fork_is_independent() {
        let mut cabac = Cabac::new(SliceType::P, 0, 26);
        let forked = cabac.fork();
        let mut enc = BoolEncoder::new();
        for _ in 0..20 {
            cabac.encode_bin(&mut enc, CTX_MB_SKIP_FLAG_P, true);
        }
        assert_ne!(cabac.contexts, forked.contexts);
        assert_eq!(forked.contexts, Cabac::new(SliceType::P, 0, 26).contexts);
    }
}
