use super::binary_reader::BinaryReader;
use super::bins::Bins;
use super::bool_coder::*;
use super::cabac::Cabac;
use super::cabac_contexts::BlockType;
use super::common::*;
use super::neighbor_cache::NeighborStateCache;
use super::residual::ResidualBlock;
use super::slice_header::*;
use debug_print::*;
use rand::Rng;
use std::collections::HashMap;

/// 256 luma and 2x64 chroma samples of an 8-bit 4:2:0 macroblock.
pub const PCM_SAMPLES_PER_MB: usize = 384;

/// One direction of the syntax element coder. Values are passed by mutable
/// reference so that a single macroblock walk serves both directions: the
/// writer reads them, the reader overwrites them.
pub trait SyntaxCoder {
    fn mb_skip_flag(&mut self, nb: &MbNeighbors, cache: &mut NeighborStateCache, v: &mut bool);
    fn mb_type(&mut self, nb: &MbNeighbors, v: &mut usize);
    fn pcm_samples(&mut self, v: &mut Vec<u8>);
    fn transform_size_8x8_flag(&mut self, nb: &MbNeighbors, v: &mut bool);
    fn intra_pred_mode(&mut self, v: &mut Option<u8>);
    fn intra_chroma_pred_mode(&mut self, nb: &MbNeighbors, cache: &mut NeighborStateCache, v: &mut u8);
    fn sub_mb_type(&mut self, v: &mut usize);
    fn ref_idx(&mut self, part: &InterPartition, list: usize, cache: &mut NeighborStateCache, v: &mut u8);
    fn mvd(&mut self, part: &InterPartition, list: usize, cache: &mut NeighborStateCache, v: &mut [i32; 2]);
    fn coded_block_pattern(&mut self, nb: &MbNeighbors, v: &mut usize);
    fn mb_qp_delta(&mut self, cache: &mut NeighborStateCache, v: &mut i32);
    fn coded_block_flag(
        &mut self,
        cur: &MbInfo,
        nb: &MbNeighbors,
        cache: &mut NeighborStateCache,
        blk: &ResidualBlock,
        v: &mut bool,
    );
    fn residual_block(&mut self, block_type: BlockType, coeffs: &mut [i32]);
    fn end_of_slice_flag(&mut self, v: &mut bool);
}

pub struct SyntaxWriter<E: BinEncoder> {
    pub cabac: Cabac,
    pub enc: E,
}

impl<E: BinEncoder> SyntaxWriter<E> {
    pub fn new(cabac: Cabac, enc: E) -> SyntaxWriter<E> {
        SyntaxWriter { cabac, enc }
    }
}

impl<E: BinEncoder> SyntaxCoder for SyntaxWriter<E> {
    fn mb_skip_flag(&mut self, nb: &MbNeighbors, cache: &mut NeighborStateCache, v: &mut bool) {
        self.cabac.encode_mb_skip_flag(&mut self.enc, nb, cache, *v);
    }

    fn mb_type(&mut self, nb: &MbNeighbors, v: &mut usize) {
        self.cabac.encode_mb_type(&mut self.enc, nb, *v);
    }

    fn pcm_samples(&mut self, v: &mut Vec<u8>) {
        assert_eq!(v.len(), PCM_SAMPLES_PER_MB, "I_PCM macroblock needs {} samples", PCM_SAMPLES_PER_MB);
        self.enc.encode_pcm_samples(v);
    }

    fn transform_size_8x8_flag(&mut self, nb: &MbNeighbors, v: &mut bool) {
        self.cabac.encode_transform_size_8x8_flag(&mut self.enc, nb, *v);
    }

    fn intra_pred_mode(&mut self, v: &mut Option<u8>) {
        self.cabac.encode_intra_pred_mode(&mut self.enc, *v);
    }

    fn intra_chroma_pred_mode(&mut self, nb: &MbNeighbors, cache: &mut NeighborStateCache, v: &mut u8) {
        self.cabac.encode_intra_chroma_pred_mode(&mut self.enc, nb, cache, *v);
    }

    fn sub_mb_type(&mut self, v: &mut usize) {
        self.cabac.encode_sub_mb_type(&mut self.enc, *v);
    }

    fn ref_idx(&mut self, part: &InterPartition, list: usize, cache: &mut NeighborStateCache, v: &mut u8) {
        self.cabac.encode_ref_idx(&mut self.enc, part, list, cache, *v);
    }

    fn mvd(&mut self, part: &InterPartition, list: usize, cache: &mut NeighborStateCache, v: &mut [i32; 2]) {
        self.cabac.encode_mvd(&mut self.enc, part, list, cache, *v);
    }

    fn coded_block_pattern(&mut self, nb: &MbNeighbors, v: &mut usize) {
        self.cabac.encode_coded_block_pattern(&mut self.enc, nb, *v);
    }

    fn mb_qp_delta(&mut self, cache: &mut NeighborStateCache, v: &mut i32) {
        self.cabac.encode_mb_qp_delta(&mut self.enc, cache, *v);
    }

    fn coded_block_flag(
        &mut self,
        cur: &MbInfo,
        nb: &MbNeighbors,
        cache: &mut NeighborStateCache,
        blk: &ResidualBlock,
        v: &mut bool,
    ) {
        self.cabac.encode_coded_block_flag(&mut self.enc, cur, nb, cache, blk, *v);
    }

    fn residual_block(&mut self, block_type: BlockType, coeffs: &mut [i32]) {
        self.cabac.encode_residual_block(&mut self.enc, block_type, coeffs);
    }

    fn end_of_slice_flag(&mut self, v: &mut bool) {
        self.cabac.encode_end_of_slice_flag(&mut self.enc, *v);
    }
}

pub struct SyntaxReader<D: BinDecoder> {
    pub cabac: Cabac,
    pub dec: D,
}

impl<D: BinDecoder> SyntaxReader<D> {
    pub fn new(cabac: Cabac, dec: D) -> SyntaxReader<D> {
        SyntaxReader { cabac, dec }
    }
}

impl<D: BinDecoder> SyntaxCoder for SyntaxReader<D> {
    fn mb_skip_flag(&mut self, nb: &MbNeighbors, cache: &mut NeighborStateCache, v: &mut bool) {
        *v = self.cabac.decode_mb_skip_flag(&mut self.dec, nb, cache);
    }

    fn mb_type(&mut self, nb: &MbNeighbors, v: &mut usize) {
        *v = self.cabac.decode_mb_type(&mut self.dec, nb);
    }

    fn pcm_samples(&mut self, v: &mut Vec<u8>) {
        v.resize(PCM_SAMPLES_PER_MB, 0);
        self.dec.decode_pcm_samples(v);
    }

    fn transform_size_8x8_flag(&mut self, nb: &MbNeighbors, v: &mut bool) {
        *v = self.cabac.decode_transform_size_8x8_flag(&mut self.dec, nb);
    }

    fn intra_pred_mode(&mut self, v: &mut Option<u8>) {
        *v = self.cabac.decode_intra_pred_mode(&mut self.dec);
    }

    fn intra_chroma_pred_mode(&mut self, nb: &MbNeighbors, cache: &mut NeighborStateCache, v: &mut u8) {
        *v = self.cabac.decode_intra_chroma_pred_mode(&mut self.dec, nb, cache);
    }

    fn sub_mb_type(&mut self, v: &mut usize) {
        *v = self.cabac.decode_sub_mb_type(&mut self.dec);
    }

    fn ref_idx(&mut self, part: &InterPartition, list: usize, cache: &mut NeighborStateCache, v: &mut u8) {
        *v = self.cabac.decode_ref_idx(&mut self.dec, part, list, cache);
    }

    fn mvd(&mut self, part: &InterPartition, list: usize, cache: &mut NeighborStateCache, v: &mut [i32; 2]) {
        *v = self.cabac.decode_mvd(&mut self.dec, part, list, cache);
    }

    fn coded_block_pattern(&mut self, nb: &MbNeighbors, v: &mut usize) {
        *v = self.cabac.decode_coded_block_pattern(&mut self.dec, nb);
    }

    fn mb_qp_delta(&mut self, cache: &mut NeighborStateCache, v: &mut i32) {
        *v = self.cabac.decode_mb_qp_delta(&mut self.dec, cache);
    }

    fn coded_block_flag(
        &mut self,
        cur: &MbInfo,
        nb: &MbNeighbors,
        cache: &mut NeighborStateCache,
        blk: &ResidualBlock,
        v: &mut bool,
    ) {
        *v = self.cabac.decode_coded_block_flag(&mut self.dec, cur, nb, cache, blk);
    }

    fn residual_block(&mut self, block_type: BlockType, coeffs: &mut [i32]) {
        self.cabac.decode_residual_block(&mut self.dec, block_type, coeffs);
    }

    fn end_of_slice_flag(&mut self, v: &mut bool) {
        *v = self.cabac.decode_end_of_slice_flag(&mut self.dec);
    }
}

/// Syntax element values of one macroblock. Elements that are not present
/// in the bitstream keep their `new()` values. Residual blocks are stored in
/// scan order; luma 4x4 blocks are indexed by luma4x4BlkIdx, and AC-only
/// blocks (Intra16x16 AC, chroma AC) leave position 0 unused.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Macroblock {
    pub mb_skip_flag: bool,
    pub mb_type: usize,
    pub transform_size_8x8_flag: bool,
    pub intra_pred_modes: [Option<u8>; 16],
    pub intra_chroma_pred_mode: u8,
    pub sub_mb_types: [usize; 4],
    pub ref_idx: [[u8; 4]; 2],
    // [list][mbPartIdx * 4 + subMbPartIdx]
    pub mvd: [[[i32; 2]; 16]; 2],
    pub coded_block_pattern: usize,
    pub mb_qp_delta: i32,
    pub pcm_samples: Vec<u8>,
    pub luma_dc: [i32; 16],
    pub luma_4x4: [[i32; 16]; 16],
    pub luma_8x8: [[i32; 64]; 4],
    pub chroma_dc: [[i32; 4]; 2],
    pub chroma_ac: [[[i32; 16]; 4]; 2],
}

impl Macroblock {
    pub fn new() -> Macroblock {
        Macroblock {
            mb_skip_flag: false,
            mb_type: 0,
            transform_size_8x8_flag: false,
            intra_pred_modes: [None; 16],
            intra_chroma_pred_mode: 0,
            sub_mb_types: [0; 4],
            ref_idx: [[0; 4]; 2],
            mvd: [[[0; 2]; 16]; 2],
            coded_block_pattern: 0,
            mb_qp_delta: 0,
            pcm_samples: vec![],
            luma_dc: [0; 16],
            luma_4x4: [[0; 16]; 16],
            luma_8x8: [[0; 64]; 4],
            chroma_dc: [[0; 4]; 2],
            chroma_ac: [[[0; 16]; 4]; 2],
        }
    }
}

impl Default for Macroblock {
    fn default() -> Self {
        Self::new()
    }
}

/// Rectangle in 4x4 block units inside the macroblock.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PartGeom {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
    pub pred: PartPred,
}

fn geom(x: usize, y: usize, width: usize, height: usize, pred: PartPred) -> PartGeom {
    PartGeom {
        x,
        y,
        width,
        height,
        pred,
    }
}

/// A macroblock partition or 8x8 sub-macroblock, which carries one ref_idx
/// per list, together with the partitions carrying its mvds.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MotionPart {
    pub area: PartGeom,
    pub mvd_parts: Vec<PartGeom>,
}

/// Prediction mode and shape (0: 8x8, 1: 8x4, 2: 4x8, 3: 4x4) of a
/// sub_mb_type.
pub fn sub_mb_type_info(slice_type: SliceType, sub_mb_type: usize) -> (PartPred, usize) {
    use PartPred::*;
    const B_SUB_MB_TYPES: [(PartPred, usize); 13] = [
        (Direct, 0),
        (Pred_L0, 0),
        (Pred_L1, 0),
        (BiPred, 0),
        (Pred_L0, 1),
        (Pred_L0, 2),
        (Pred_L1, 1),
        (Pred_L1, 2),
        (BiPred, 1),
        (BiPred, 2),
        (Pred_L0, 3),
        (Pred_L1, 3),
        (BiPred, 3),
    ];
    if slice_type == SliceType::B {
        B_SUB_MB_TYPES[sub_mb_type]
    } else {
        (Pred_L0, sub_mb_type)
    }
}

fn sub_partitions(x0: usize, y0: usize, shape: usize, pred: PartPred) -> Vec<PartGeom> {
    match shape {
        0 => vec![geom(x0, y0, 2, 2, pred)],
        1 => vec![geom(x0, y0, 2, 1, pred), geom(x0, y0 + 1, 2, 1, pred)],
        2 => vec![geom(x0, y0, 1, 2, pred), geom(x0 + 1, y0, 1, 2, pred)],
        _ => (0..4).map(|i| geom(x0 + i % 2, y0 + i / 2, 1, 1, pred)).collect(),
    }
}

fn b_partition_preds(mb_type: usize) -> [PartPred; 2] {
    use PartPred::*;
    const PAIRS: [[PartPred; 2]; 9] = [
        [Pred_L0, Pred_L0],
        [Pred_L1, Pred_L1],
        [Pred_L0, Pred_L1],
        [Pred_L1, Pred_L0],
        [Pred_L0, BiPred],
        [Pred_L1, BiPred],
        [BiPred, Pred_L0],
        [BiPred, Pred_L1],
        [BiPred, BiPred],
    ];
    PAIRS[(mb_type - 4) / 2]
}

/// Partitions of an inter macroblock in syntax order. Empty for intra and
/// B_Direct_16x16 macroblocks.
pub fn motion_parts(slice_type: SliceType, mb_type: usize, sub_mb_types: &[usize; 4]) -> Vec<MotionPart> {
    use PartPred::*;
    let whole = |g: PartGeom| MotionPart {
        area: g,
        mvd_parts: vec![g],
    };
    match MbType::from_slice_mb_type(slice_type, mb_type) {
        MbType::P_L0_16x16 => vec![whole(geom(0, 0, 4, 4, Pred_L0))],
        MbType::P_L0_L0_16x8 => vec![whole(geom(0, 0, 4, 2, Pred_L0)), whole(geom(0, 2, 4, 2, Pred_L0))],
        MbType::P_L0_L0_8x16 => vec![whole(geom(0, 0, 2, 4, Pred_L0)), whole(geom(2, 0, 2, 4, Pred_L0))],
        MbType::B_16x16 => vec![whole(geom(0, 0, 4, 4, [Pred_L0, Pred_L1, BiPred][mb_type - 1]))],
        MbType::B_16x8 => {
            let p = b_partition_preds(mb_type);
            vec![whole(geom(0, 0, 4, 2, p[0])), whole(geom(0, 2, 4, 2, p[1]))]
        }
        MbType::B_8x16 => {
            let p = b_partition_preds(mb_type);
            vec![whole(geom(0, 0, 2, 4, p[0])), whole(geom(2, 0, 2, 4, p[1]))]
        }
        MbType::P_8x8 | MbType::P_8x8ref0 | MbType::B_8x8 => (0..4)
            .map(|b8| {
                let (pred, shape) = sub_mb_type_info(slice_type, sub_mb_types[b8]);
                let (x0, y0) = ((b8 % 2) * 2, (b8 / 2) * 2);
                MotionPart {
                    area: geom(x0, y0, 2, 2, pred),
                    mvd_parts: sub_partitions(x0, y0, shape, pred),
                }
            })
            .collect(),
        _ => vec![],
    }
}

/// Prediction mode of every 4x4 block in raster order.
fn partition_preds(parts: &[MotionPart]) -> [PartPred; 16] {
    let mut preds = [PartPred::Direct; 16];
    for g in parts.iter().flat_map(|p| p.mvd_parts.iter()) {
        for y in g.y..g.y + g.height {
            for x in g.x..g.x + g.width {
                preds[y * 4 + x] = g.pred;
            }
        }
    }
    preds
}

pub fn num_intra_pred_modes(mb_type: MbType, transform_8x8: bool) -> usize {
    match mb_type {
        MbType::I_NxN if transform_8x8 => 4,
        MbType::I_NxN | MbType::SI => 16,
        _ => 0,
    }
}

/// coded_block_pattern implied by an Intra16x16 `mb_type` (1..=24 in the I
/// slice numbering).
pub fn i16x16_cbp(i_mb_type: usize) -> usize {
    let luma = if i_mb_type >= 13 { 15 } else { 0 };
    let chroma = ((i_mb_type - 1) / 4) % 3;
    (chroma << 4) | luma
}

/// Whether transform_size_8x8_flag follows coded_block_pattern of a
/// non-intra macroblock.
pub fn inter_transform_8x8_allowed(
    params: &SliceParams,
    mb_type: MbType,
    sub_mb_types: &[usize; 4],
    cbp: usize,
) -> bool {
    if !params.transform_8x8_mode || cbp & 15 == 0 || mb_type.is_intra() {
        return false;
    }
    match mb_type {
        MbType::B_Direct_16x16 => params.direct_8x8_inference,
        t if t.has_sub_mb_partitions() => sub_mb_types.iter().all(|&s| {
            let (pred, shape) = sub_mb_type_info(params.slice_type, s);
            if pred == PartPred::Direct {
                params.direct_8x8_inference
            } else {
                shape == 0
            }
        }),
        _ => true,
    }
}

#[derive(Clone, Copy, Debug)]
struct CodedMb {
    info: MbInfo,
    preds: [PartPred; 16],
}

/// Walks the macroblock layer of one slice in 4:2:0 frame coding, keeping
/// the neighbour state that context selection depends on.
pub struct MbCoder {
    params: SliceParams,
    cache: NeighborStateCache,
    // macroblocks of the current row left of mb_x, of the row above from mb_x on
    row: Vec<Option<CodedMb>>,
}

impl MbCoder {
    pub fn new(params: SliceParams) -> MbCoder {
        MbCoder {
            params,
            cache: NeighborStateCache::new(params.mb_width),
            row: vec![None; params.mb_width],
        }
    }

    fn neighbors(&self, mb_x: usize) -> MbNeighbors {
        let left = if mb_x > 0 {
            self.row[mb_x - 1].map(|m| m.info)
        } else {
            None
        };
        MbNeighbors::new(mb_x, left, self.row[mb_x].map(|m| m.info))
    }

    fn inter_partition(&self, mb_x: usize, mb_type: MbType, preds: &[PartPred; 16], g: &PartGeom) -> InterPartition {
        let left = if g.x > 0 {
            Some(PartNeighbor {
                mb_type,
                pred: preds[g.y * 4 + g.x - 1],
            })
        } else if mb_x > 0 {
            self.row[mb_x - 1].map(|m| PartNeighbor {
                mb_type: m.info.mb_type,
                pred: m.preds[g.y * 4 + 3],
            })
        } else {
            None
        };
        let top = if g.y > 0 {
            Some(PartNeighbor {
                mb_type,
                pred: preds[(g.y - 1) * 4 + g.x],
            })
        } else {
            self.row[mb_x].map(|m| PartNeighbor {
                mb_type: m.info.mb_type,
                pred: m.preds[12 + g.x],
            })
        };
        InterPartition {
            mb_x,
            x: g.x,
            y: g.y,
            width: g.width,
            height: g.height,
            pred: g.pred,
            left,
            top,
        }
    }

    /// Codes one macroblock and the end_of_slice_flag after it. Returns the
    /// flag, which is `end_of_slice` when writing.
    pub fn code_macroblock<C: SyntaxCoder>(
        &mut self,
        coder: &mut C,
        mb: &mut Macroblock,
        mb_addr: usize,
        end_of_slice: bool,
    ) -> bool {
        let slice_type = self.params.slice_type;
        let mb_x = mb_addr % self.params.mb_width;
        let nb = self.neighbors(mb_x);
        if !slice_type.is_intra() {
            coder.mb_skip_flag(&nb, &mut self.cache, &mut mb.mb_skip_flag);
        }
        let coded = if mb.mb_skip_flag {
            let (mb_type, pred) = if slice_type == SliceType::B {
                (MbType::B_Skip, PartPred::Direct)
            } else {
                (MbType::P_Skip, PartPred::Pred_L0)
            };
            debug_eprintln!("mb {} {:?}", mb_addr, mb_type);
            self.cache.mark_skipped(mb_x);
            self.cache.finish_mb(mb_type, 0, 0);
            CodedMb {
                info: MbInfo::new(mb_type, 0, false),
                preds: [pred; 16],
            }
        } else {
            self.code_macroblock_layer(coder, mb, &nb)
        };
        self.row[mb_x] = Some(coded);

        let mut end_of_slice = end_of_slice;
        coder.end_of_slice_flag(&mut end_of_slice);
        end_of_slice
    }

    fn code_macroblock_layer<C: SyntaxCoder>(
        &mut self,
        coder: &mut C,
        mb: &mut Macroblock,
        nb: &MbNeighbors,
    ) -> CodedMb {
        let params = self.params;
        let mb_x = nb.mb_x;
        coder.mb_type(nb, &mut mb.mb_type);
        let mb_type = MbType::from_slice_mb_type(params.slice_type, mb.mb_type);
        debug_eprintln!("mb {} {:?}", mb_x, mb_type);
        if mb_type.is_intra() || mb_type == MbType::B_Direct_16x16 {
            self.cache.clear_motion(mb_x);
        }
        if !mb_type.is_intra() {
            self.cache.set_chroma_pred_mode(mb_x, 0);
        }

        if mb_type.is_pcm() {
            coder.pcm_samples(&mut mb.pcm_samples);
            let info = MbInfo::new(mb_type, 0x2f, false);
            self.cache.finish_mb(mb_type, info.cbp, 0);
            return CodedMb {
                info,
                preds: [PartPred::Direct; 16],
            };
        }

        if mb_type.has_sub_mb_partitions() {
            for sub_mb_type in mb.sub_mb_types.iter_mut() {
                coder.sub_mb_type(sub_mb_type);
            }
        } else if mb_type == MbType::I_NxN && params.transform_8x8_mode {
            coder.transform_size_8x8_flag(nb, &mut mb.transform_size_8x8_flag);
        }
        let parts = motion_parts(params.slice_type, mb.mb_type, &mb.sub_mb_types);
        let preds = partition_preds(&parts);

        if mb_type.is_intra() {
            let n = num_intra_pred_modes(mb_type, mb.transform_size_8x8_flag);
            for mode in mb.intra_pred_modes.iter_mut().take(n) {
                coder.intra_pred_mode(mode);
            }
            coder.intra_chroma_pred_mode(nb, &mut self.cache, &mut mb.intra_chroma_pred_mode);
        } else {
            self.code_motion(coder, mb, mb_x, mb_type, &preds, &parts);
        }

        let cbp = if mb_type.is_i16x16() {
            mb.coded_block_pattern = i16x16_cbp(mb.mb_type - params.slice_type.intra_mb_type_offset());
            mb.coded_block_pattern
        } else {
            coder.coded_block_pattern(nb, &mut mb.coded_block_pattern);
            if inter_transform_8x8_allowed(&params, mb_type, &mb.sub_mb_types, mb.coded_block_pattern) {
                coder.transform_size_8x8_flag(nb, &mut mb.transform_size_8x8_flag);
            }
            mb.coded_block_pattern
        };

        let info = MbInfo::new(mb_type, cbp, mb.transform_size_8x8_flag);
        if cbp > 0 || mb_type.is_i16x16() {
            coder.mb_qp_delta(&mut self.cache, &mut mb.mb_qp_delta);
            self.code_residual(coder, mb, &info, nb);
        }
        self.cache.finish_mb(mb_type, cbp, mb.mb_qp_delta);
        CodedMb { info, preds }
    }

    /// ref_idx of every partition for list 0 then list 1, followed by the
    /// mvds in the same order. Positions without coded values are cleared in
    /// the neighbour state.
    fn code_motion<C: SyntaxCoder>(
        &mut self,
        coder: &mut C,
        mb: &mut Macroblock,
        mb_x: usize,
        mb_type: MbType,
        preds: &[PartPred; 16],
        parts: &[MotionPart],
    ) {
        for list in 0..2 {
            for (i, part) in parts.iter().enumerate() {
                let ipart = self.inter_partition(mb_x, mb_type, preds, &part.area);
                if part.area.pred.uses_list(list) && self.params.num_ref_idx_active[list] > 1 {
                    coder.ref_idx(&ipart, list, &mut self.cache, &mut mb.ref_idx[list][i]);
                } else {
                    self.cache.set_ref_idx(list, &ipart, 0);
                }
            }
        }
        for list in 0..2 {
            for (i, part) in parts.iter().enumerate() {
                for (j, g) in part.mvd_parts.iter().enumerate() {
                    let ipart = self.inter_partition(mb_x, mb_type, preds, g);
                    if g.pred.uses_list(list) {
                        coder.mvd(&ipart, list, &mut self.cache, &mut mb.mvd[list][i * 4 + j]);
                    } else {
                        self.cache.set_mvd(list, &ipart, [0, 0]);
                    }
                }
            }
        }
    }

    fn code_residual<C: SyntaxCoder>(&mut self, coder: &mut C, mb: &mut Macroblock, info: &MbInfo, nb: &MbNeighbors) {
        let i16x16 = info.mb_type.is_i16x16();
        if i16x16 {
            self.code_block(coder, info, nb, ResidualBlock::luma_dc(), &mut mb.luma_dc);
        }
        for b8 in 0..4 {
            if (info.cbp_luma() >> b8) & 1 == 0 {
                continue;
            }
            if info.transform_8x8 {
                // 4:2:0 8x8 blocks carry no coded_block_flag
                let blk = ResidualBlock::luma_8x8(b8);
                self.cache.set_coded_block_flags_8x8(blk.comp, nb.mb_x, b8, true);
                coder.residual_block(blk.block_type, &mut mb.luma_8x8[b8]);
                continue;
            }
            for b4 in 0..4 {
                let (blk_x, blk_y) = ((b8 % 2) * 2 + b4 % 2, (b8 / 2) * 2 + b4 / 2);
                let coeffs = &mut mb.luma_4x4[b8 * 4 + b4];
                if i16x16 {
                    self.code_block(coder, info, nb, ResidualBlock::luma_ac(blk_x, blk_y), &mut coeffs[1..]);
                } else {
                    self.code_block(coder, info, nb, ResidualBlock::luma_4x4(blk_x, blk_y), coeffs);
                }
            }
        }
        if info.cbp_chroma() != 0 {
            for (c, coeffs) in mb.chroma_dc.iter_mut().enumerate() {
                self.code_block(coder, info, nb, ResidualBlock::chroma_dc(c + 1), coeffs);
            }
        }
        if info.cbp_chroma() == 2 {
            for (c, blocks) in mb.chroma_ac.iter_mut().enumerate() {
                for (b4, coeffs) in blocks.iter_mut().enumerate() {
                    let blk = ResidualBlock::chroma_ac(c + 1, b4 % 2, b4 / 2);
                    self.code_block(coder, info, nb, blk, &mut coeffs[1..]);
                }
            }
        }
    }

    fn code_block<C: SyntaxCoder>(
        &mut self,
        coder: &mut C,
        info: &MbInfo,
        nb: &MbNeighbors,
        blk: ResidualBlock,
        coeffs: &mut [i32],
    ) {
        debug_assert_eq!(coeffs.len(), blk.num_coeffs());
        let mut coded = coeffs.iter().any(|c| *c != 0);
        coder.coded_block_flag(info, nb, &mut self.cache, &blk, &mut coded);
        if coded {
            coder.residual_block(blk.block_type, coeffs);
        }
    }
}

/// Codes the macroblocks of one slice into a byte-aligned payload ending
/// with the rbsp stop bit.
pub fn encode_slice(params: &SliceParams, mbs: &[Macroblock]) -> Bins {
    assert!(!mbs.is_empty(), "slice must contain at least one macroblock");
    assert_eq!(mbs.len(), params.num_mbs);
    let cabac = Cabac::new(params.slice_type, params.cabac_init_idc, params.slice_qp);
    let mut writer = SyntaxWriter::new(cabac, BoolEncoder::new());
    let mut mb_coder = MbCoder::new(*params);
    for (i, mb) in mbs.iter().enumerate() {
        let mut mb = mb.clone();
        let mb_addr = params.first_mb_addr + i;
        mb_coder.code_macroblock(&mut writer, &mut mb, mb_addr, i + 1 == mbs.len());
    }
    writer.enc.finish()
}

/// Decodes macroblocks until end_of_slice_flag is set. Damaged input never
/// yields more than `num_mbs` macroblocks.
pub fn decode_slice(params: &SliceParams, payload: &[u8]) -> Vec<Macroblock> {
    let cabac = Cabac::new(params.slice_type, params.cabac_init_idc, params.slice_qp);
    let mut reader = SyntaxReader::new(cabac, BoolDecoder::new(BinaryReader::vec(payload)));
    let mut mb_coder = MbCoder::new(*params);
    let mut mbs = vec![];
    for mb_addr in params.first_mb_addr..params.first_mb_addr + params.num_mbs {
        let mut mb = Macroblock::new();
        let end_of_slice = mb_coder.code_macroblock(&mut reader, &mut mb, mb_addr, false);
        mbs.push(mb);
        if end_of_slice {
            break;
        }
    }
    debug_eprintln!("decoded {} macroblocks", mbs.len());
    mbs
}

/// Probabilities steering `random_macroblock`.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct SynthParams {
    pub skip_prob: f64,
    pub intra_prob: f64,
    pub pcm_prob: f64,
    pub empty_block_prob: f64,
}

impl SynthParams {
    pub fn new() -> SynthParams {
        SynthParams {
            skip_prob: 0.2,
            intra_prob: 0.2,
            pcm_prob: 0.03,
            empty_block_prob: 0.3,
        }
    }

    /// Overrides the defaults with `skip_prob`, `intra_prob`, `pcm_prob` and
    /// `empty_block_prob` entries.
    pub fn from_extra_params(extra_params: &HashMap<String, String>) -> Result<SynthParams, String> {
        let mut synth = SynthParams::new();
        for (key, val) in extra_params.iter() {
            let prob = match val.parse::<f64>() {
                Ok(p) if (0.0..=1.0).contains(&p) => p,
                _ => return Err(format!("invalid probability {key}={val}")),
            };
            match key.as_str() {
                "skip_prob" => synth.skip_prob = prob,
                "intra_prob" => synth.intra_prob = prob,
                "pcm_prob" => synth.pcm_prob = prob,
                "empty_block_prob" => synth.empty_block_prob = prob,
                _ => return Err(format!("unknown extra param {key}")),
            }
        }
        Ok(synth)
    }
}

impl Default for SynthParams {
    fn default() -> Self {
        Self::new()
    }
}

fn random_level<R: Rng>(rng: &mut R) -> i32 {
    let abs = if rng.gen_bool(0.05) {
        rng.gen_range(15..3000)
    } else {
        rng.gen_range(1..6)
    };
    if rng.gen_bool(0.5) {
        -abs
    } else {
        abs
    }
}

fn random_coeffs<R: Rng>(rng: &mut R, coeffs: &mut [i32], empty_block_prob: f64) {
    if rng.gen_bool(empty_block_prob) {
        return;
    }
    let last = rng.gen_range(0..coeffs.len());
    for c in coeffs[..last].iter_mut() {
        if rng.gen_bool(0.4) {
            *c = random_level(rng);
        }
    }
    coeffs[last] = random_level(rng);
}

fn random_mvd<R: Rng>(rng: &mut R) -> i32 {
    if rng.gen_bool(0.1) {
        rng.gen_range(-2048..2048)
    } else {
        rng.gen_range(-12..=12)
    }
}

/// A syntactically valid macroblock for the slice described by `params`.
pub fn random_macroblock<R: Rng>(rng: &mut R, params: &SliceParams, synth: &SynthParams) -> Macroblock {
    let slice_type = params.slice_type;
    let mut mb = Macroblock::new();
    if !slice_type.is_intra() && rng.gen_bool(synth.skip_prob) {
        mb.mb_skip_flag = true;
        return mb;
    }

    let offset = slice_type.intra_mb_type_offset();
    mb.mb_type = if slice_type.is_intra() || rng.gen_bool(synth.intra_prob) {
        if rng.gen_bool(synth.pcm_prob) {
            offset + 25
        } else if slice_type == SliceType::SI && rng.gen_bool(0.5) {
            0
        } else {
            offset + rng.gen_range(0..25)
        }
    } else if slice_type == SliceType::B {
        rng.gen_range(0..23)
    } else {
        // P_8x8ref0 is not codable with CABAC
        rng.gen_range(0..4)
    };
    let mb_type = MbType::from_slice_mb_type(slice_type, mb.mb_type);
    if mb_type.is_pcm() {
        mb.pcm_samples = (0..PCM_SAMPLES_PER_MB).map(|_| rng.gen()).collect();
        return mb;
    }

    if mb_type.has_sub_mb_partitions() {
        let num_sub_mb_types = if slice_type == SliceType::B { 13 } else { 4 };
        for sub_mb_type in mb.sub_mb_types.iter_mut() {
            *sub_mb_type = rng.gen_range(0..num_sub_mb_types);
        }
    }
    if mb_type == MbType::I_NxN && params.transform_8x8_mode {
        mb.transform_size_8x8_flag = rng.gen_bool(0.5);
    }
    if mb_type.is_intra() {
        let n = num_intra_pred_modes(mb_type, mb.transform_size_8x8_flag);
        for mode in mb.intra_pred_modes.iter_mut().take(n) {
            *mode = if rng.gen_bool(0.5) {
                None
            } else {
                Some(rng.gen_range(0..8))
            };
        }
        mb.intra_chroma_pred_mode = rng.gen_range(0..4);
    } else {
        for (i, part) in motion_parts(slice_type, mb.mb_type, &mb.sub_mb_types).iter().enumerate() {
            for list in 0..2 {
                if !part.area.pred.uses_list(list) {
                    continue;
                }
                mb.ref_idx[list][i] = rng.gen_range(0..params.num_ref_idx_active[list]) as u8;
                for j in 0..part.mvd_parts.len() {
                    mb.mvd[list][i * 4 + j] = [random_mvd(rng), random_mvd(rng)];
                }
            }
        }
    }

    mb.coded_block_pattern = if mb_type.is_i16x16() {
        i16x16_cbp(mb.mb_type - offset)
    } else {
        rng.gen_range(0..48)
    };
    let cbp = mb.coded_block_pattern;
    if inter_transform_8x8_allowed(params, mb_type, &mb.sub_mb_types, cbp) {
        mb.transform_size_8x8_flag = rng.gen_bool(0.5);
    }
    if cbp == 0 && !mb_type.is_i16x16() {
        return mb;
    }

    mb.mb_qp_delta = if rng.gen_bool(0.2) {
        rng.gen_range(-26..=25)
    } else {
        rng.gen_range(-2..=2)
    };
    let empty = synth.empty_block_prob;
    if mb_type.is_i16x16() {
        random_coeffs(rng, &mut mb.luma_dc, empty);
    }
    for b8 in 0..4 {
        if (cbp >> b8) & 1 == 0 {
            continue;
        }
        if mb.transform_size_8x8_flag {
            random_coeffs(rng, &mut mb.luma_8x8[b8], 0.0);
            continue;
        }
        for b4 in 0..4 {
            let coeffs = &mut mb.luma_4x4[b8 * 4 + b4];
            if mb_type.is_i16x16() {
                random_coeffs(rng, &mut coeffs[1..], empty);
            } else {
                random_coeffs(rng, coeffs, empty);
            }
        }
    }
    if cbp >> 4 != 0 {
        for coeffs in mb.chroma_dc.iter_mut() {
            random_coeffs(rng, coeffs, empty);
        }
    }
    if cbp >> 4 == 2 {
        for coeffs in mb.chroma_ac.iter_mut().flat_map(|c| c.iter_mut()) {
            random_coeffs(rng, &mut coeffs[1..], empty);
        }
    }
    mb
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{prelude::StdRng, Rng, SeedableRng};

    fn round_trip(params: &SliceParams, synth: &SynthParams, num_slices: usize, seed: u64) -> usize {
        let mut rng: StdRng = SeedableRng::seed_from_u64(seed);
        let mut total_bytes = 0;
        for slice in params.split(num_slices) {
            let mbs: Vec<Macroblock> = (0..slice.num_mbs)
                .map(|_| random_macroblock(&mut rng, &slice, synth))
                .collect();
            let payload: Vec<u8> = encode_slice(&slice, &mbs).bytes().collect();
            total_bytes += payload.len();
            let decoded = decode_slice(&slice, &payload);
            assert_eq!(decoded.len(), mbs.len());
            for (i, (expected, actual)) in mbs.iter().zip(decoded.iter()).enumerate() {
                assert_eq!(
                    expected,
                    actual,
                    "slice starting at {}, mb {}",
                    slice.first_mb_addr,
                    slice.first_mb_addr + i
                );
            }
        }
        total_bytes
    }

    #[test]
    fn i_slice_round_trip_works() {
        let synth = SynthParams::new();
        let mut params = SliceParams::new(SliceType::I, 30, 5, 4);
        round_trip(&params, &synth, 1, 2);
        params.transform_8x8_mode = true;
        params.slice_qp = 12;
        round_trip(&params, &synth, 3, 3);
    }

    #[test]
    fn p_slice_round_trip_works() {
        let synth = SynthParams::new();
        let mut params = SliceParams::new(SliceType::P, 26, 6, 4);
        for cabac_init_idc in 0..3 {
            params.cabac_init_idc = cabac_init_idc;
            params.num_ref_idx_active = [cabac_init_idc + 1, 1];
            params.transform_8x8_mode = cabac_init_idc != 1;
            round_trip(&params, &synth, 2, cabac_init_idc as u64);
        }
    }

    #[test]
    fn b_slice_round_trip_works() {
        let synth = SynthParams::new();
        let mut params = SliceParams::new(SliceType::B, 35, 6, 5);
        params.cabac_init_idc = 2;
        params.num_ref_idx_active = [3, 2];
        params.transform_8x8_mode = true;
        round_trip(&params, &synth, 2, 2);
        params.direct_8x8_inference = false;
        params.num_ref_idx_active = [1, 4];
        round_trip(&params, &synth, 1, 5);
    }

    #[test]
    fn switching_slice_round_trip_works() {
        let synth = SynthParams::new();
        round_trip(&SliceParams::new(SliceType::SI, 20, 4, 3), &synth, 2, 2);
        let mut params = SliceParams::new(SliceType::SP, 40, 4, 3);
        params.num_ref_idx_active = [2, 1];
        round_trip(&params, &synth, 1, 2);
    }

    #[test]
    fn all_skipped_slice_works() {
        let synth = SynthParams {
            skip_prob: 1.0,
            ..SynthParams::new()
        };
        let params = SliceParams::new(SliceType::B, 26, 8, 2);
        let bytes = round_trip(&params, &synth, 1, 2);
        // 16 highly probable skip flags and end_of_slice_flags
        assert!(bytes < 8, "{} bytes", bytes);
    }

    #[test]
    fn pcm_macroblocks_round_trip_works() {
        let synth = SynthParams {
            intra_prob: 1.0,
            pcm_prob: 0.7,
            ..SynthParams::new()
        };
        let params = SliceParams::new(SliceType::P, 26, 3, 3);
        let bytes = round_trip(&params, &synth, 1, 2);
        assert!(bytes > PCM_SAMPLES_PER_MB);
        round_trip(&SliceParams::new(SliceType::I, 26, 3, 3), &synth, 3, 3);
    }

    #[test]
    fn dense_residual_round_trip_works() {
        let synth = SynthParams {
            skip_prob: 0.0,
            empty_block_prob: 0.0,
            ..SynthParams::new()
        };
        let mut params = SliceParams::new(SliceType::P, 0, 3, 2);
        params.transform_8x8_mode = true;
        round_trip(&params, &synth, 1, 2);
    }

    #[test]
    fn damaged_payload_decodes() {
        let mut rng: StdRng = SeedableRng::seed_from_u64(2);
        for slice_type in [SliceType::I, SliceType::P, SliceType::B, SliceType::SP, SliceType::SI] {
            for cabac_init_idc in 0..3 {
                let mut params = SliceParams::new(slice_type, rng.gen_range(0..52), 5, 3);
                params.cabac_init_idc = cabac_init_idc;
                params.num_ref_idx_active = [rng.gen_range(1..5), rng.gen_range(1..5)];
                params.transform_8x8_mode = rng.gen_bool(0.5);
                for slice in params.split(2) {
                    let mut payloads = vec![vec![], vec![0xff; 64], vec![0xff; 4096]];
                    for _ in 0..20 {
                        let len = rng.gen_range(1..2048);
                        payloads.push((0..len).map(|_| rng.gen::<u8>()).collect());
                    }
                    for payload in payloads.iter() {
                        let decoded = decode_slice(&slice, payload);
                        assert!(!decoded.is_empty());
                        assert!(decoded.len() <= slice.num_mbs);
                    }
                }
            }
        }
    }

    #[test]
    fn motion_parts_cover_macroblock() {
        let mut rng: StdRng = SeedableRng::seed_from_u64(2);
        for (slice_type, num_mb_types, num_sub_mb_types) in [(SliceType::P, 4, 4), (SliceType::B, 23, 13)] {
            for mb_type in 0..num_mb_types {
                let sub_mb_types = [(); 4].map(|_| rng.gen_range(0..num_sub_mb_types));
                let parts = motion_parts(slice_type, mb_type, &sub_mb_types);
                if MbType::from_slice_mb_type(slice_type, mb_type) == MbType::B_Direct_16x16 {
                    assert!(parts.is_empty());
                    continue;
                }
                let mut covered = [0; 16];
                for (i, part) in parts.iter().enumerate() {
                    assert!(part.mvd_parts.len() <= 4);
                    for g in part.mvd_parts.iter() {
                        assert_eq!(g.pred, part.area.pred, "mb_type {} part {}", mb_type, i);
                        for y in g.y..g.y + g.height {
                            for x in g.x..g.x + g.width {
                                covered[y * 4 + x] += 1;
                            }
                        }
                    }
                }
                assert_eq!(covered, [1; 16], "{:?} mb_type {}", slice_type, mb_type);
            }
        }
    }

    #[test]
    fn i16x16_cbp_works() {
        assert_eq!(i16x16_cbp(1), 0);
        assert_eq!(i16x16_cbp(5), 0x10);
        assert_eq!(i16x16_cbp(12), 0x20);
        assert_eq!(i16x16_cbp(13), 0x0f);
        assert_eq!(i16x16_cbp(24), 0x2f);
    }

    #[test]
    fn inter_transform_8x8_rules_work() {
        let mut params = SliceParams::new(SliceType::B, 26, 1, 1);
        params.transform_8x8_mode = true;
        let b_8x8 = MbType::B_8x8;
        assert!(inter_transform_8x8_allowed(&params, MbType::B_16x8, &[0; 4], 1));
        assert!(!inter_transform_8x8_allowed(&params, MbType::B_16x8, &[0; 4], 0x20));
        assert!(inter_transform_8x8_allowed(&params, b_8x8, &[0, 1, 2, 3], 1));
        assert!(!inter_transform_8x8_allowed(&params, b_8x8, &[0, 1, 4, 3], 1));
        assert!(!inter_transform_8x8_allowed(&params, MbType::I_NxN, &[0; 4], 15));
        params.direct_8x8_inference = false;
        assert!(!inter_transform_8x8_allowed(&params, b_8x8, &[0, 1, 2, 3], 1));
        assert!(!inter_transform_8x8_allowed(&params, MbType::B_Direct_16x16, &[0; 4], 1));
        params.transform_8x8_mode = false;
        assert!(!inter_transform_8x8_allowed(&params, MbType::B_16x16, &[0; 4], 15));
    }
}
