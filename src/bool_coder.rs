use super::binary_reader::BinaryReader;
use super::bins::*;
use super::cabac_contexts::*;
use super::context_table::ContextState;
use debug_print::*;

/// Decoding side of the binary arithmetic engine. The adaptive state of the
/// selected context is handed in by the caller, which owns the context table.
pub trait BinDecoder {
    fn decode_decision(&mut self, ctx: &mut ContextState) -> bool;
    fn decode_bypass(&mut self) -> bool;
    fn decode_terminate(&mut self) -> bool;
    /// Reads byte-aligned raw samples following an I_PCM mb_type and restarts
    /// the engine.
    fn decode_pcm_samples(&mut self, samples: &mut [u8]);
}

pub trait BinEncoder {
    fn encode_decision(&mut self, ctx: &mut ContextState, bin: bool);
    fn encode_bypass(&mut self, bin: bool);
    /// A terminating bin of 1 flushes the engine.
    fn encode_terminate(&mut self, bin: bool);
    fn encode_pcm_samples(&mut self, samples: &[u8]);
}

#[inline(always)]
fn transition_state(ctx: &mut ContextState, bin_is_mps: bool) {
    if bin_is_mps {
        ctx.state = TRANS_IDX_MPS[ctx.state as usize];
    } else {
        if ctx.state == 0 {
            ctx.mps = !ctx.mps;
        }
        ctx.state = TRANS_IDX_LPS[ctx.state as usize];
    }
}

#[derive(Clone, Debug)]
pub struct BoolEncoder {
    pub out_bins: Bins,
    pub cabac_ivl_curr_range: u16,
    pub cabac_ivl_low: u16,
    pub cabac_first_bit_flag: bool,
    pub cabac_bits_outstanding: usize,
}

impl BoolEncoder {
    pub fn new() -> BoolEncoder {
        let mut enc = BoolEncoder {
            out_bins: Bins::new(),
            cabac_ivl_curr_range: 0,
            cabac_ivl_low: 0,
            cabac_first_bit_flag: true,
            cabac_bits_outstanding: 0,
        };
        enc.init_arithmetic_engine();
        enc
    }

    pub fn init_arithmetic_engine(&mut self) {
        self.cabac_ivl_low = 0;
        self.cabac_ivl_curr_range = 510;
        self.cabac_first_bit_flag = true;
        self.cabac_bits_outstanding = 0;
    }

    #[inline(always)]
    fn renorm_cabac_encode_engine(&mut self) {
        while self.cabac_ivl_curr_range < 256 {
            if self.cabac_ivl_low < 256 {
                self.put_bit(false);
            } else if self.cabac_ivl_low >= 512 {
                self.cabac_ivl_low -= 512;
                self.put_bit(true);
            } else {
                self.cabac_ivl_low -= 256;
                self.cabac_bits_outstanding += 1;
            }
            self.cabac_ivl_curr_range <<= 1;
            self.cabac_ivl_low <<= 1;
        }
    }

    #[inline(always)]
    fn put_bit(&mut self, bin: bool) {
        if !self.cabac_first_bit_flag {
            self.out_bins.push_bin(bin);
        }
        self.cabac_first_bit_flag = false;
        while self.cabac_bits_outstanding > 0 {
            self.out_bins.push_bin(!bin);
            self.cabac_bits_outstanding -= 1;
        }
    }

    fn flush_cabac_engine(&mut self) {
        self.cabac_ivl_curr_range = 2;
        self.renorm_cabac_encode_engine();
        self.put_bit((self.cabac_ivl_low >> 9) & 1 > 0);
        // the final 1 doubles as rbsp_stop_one_bit
        let ex_2bins = ((self.cabac_ivl_low >> 7) & 3) | 1;
        self.out_bins.push_bins_with_size(ex_2bins as u64, 2);
    }

    /// Consumes the encoder, returning the byte-aligned payload.
    pub fn finish(mut self) -> Bins {
        self.out_bins.byte_align();
        self.out_bins
    }
}

impl Default for BoolEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BinEncoder for BoolEncoder {
    fn encode_decision(&mut self, ctx: &mut ContextState, bin: bool) {
        let q_range_idx = (self.cabac_ivl_curr_range >> 6) & 3;
        let lps_range = RANGE_TAB_LPS[ctx.state as usize][q_range_idx as usize] as u16;
        debug_eprintln!(
            "enc state={}, mps={}, bin={}, low={}, range={}, lps_range={}",
            ctx.state,
            ctx.mps,
            bin,
            self.cabac_ivl_low,
            self.cabac_ivl_curr_range,
            lps_range
        );
        self.cabac_ivl_curr_range -= lps_range;
        let bin_is_mps = bin == ctx.mps;
        if !bin_is_mps {
            self.cabac_ivl_low += self.cabac_ivl_curr_range;
            self.cabac_ivl_curr_range = lps_range;
        }
        transition_state(ctx, bin_is_mps);
        self.renorm_cabac_encode_engine();
    }

    fn encode_bypass(&mut self, bin: bool) {
        self.cabac_ivl_low <<= 1;
        if bin {
            self.cabac_ivl_low += self.cabac_ivl_curr_range;
        }
        if self.cabac_ivl_low >= 1024 {
            self.put_bit(true);
            self.cabac_ivl_low -= 1024;
        } else if self.cabac_ivl_low < 512 {
            self.put_bit(false);
        } else {
            self.cabac_ivl_low -= 512;
            self.cabac_bits_outstanding += 1;
        }
    }

    fn encode_terminate(&mut self, bin: bool) {
        self.cabac_ivl_curr_range -= 2;
        if bin {
            self.cabac_ivl_low += self.cabac_ivl_curr_range;
            self.flush_cabac_engine();
        } else {
            self.renorm_cabac_encode_engine();
        }
    }

    fn encode_pcm_samples(&mut self, samples: &[u8]) {
        // pcm_alignment_zero_bit
        self.out_bins.byte_align();
        for &sample in samples.iter() {
            self.out_bins.push_byte(sample);
        }
        self.init_arithmetic_engine();
    }
}

pub struct BoolDecoder<'a> {
    reader: BinaryReader<'a>,
    pub cabac_ivl_curr_range: u16,
    pub cabac_ivl_offset: u16,
}

impl<'a> BoolDecoder<'a> {
    pub fn new(reader: BinaryReader<'a>) -> BoolDecoder<'a> {
        let mut dec = BoolDecoder {
            reader,
            cabac_ivl_curr_range: 0,
            cabac_ivl_offset: 0,
        };
        dec.init_arithmetic_engine();
        dec
    }

    pub fn init_arithmetic_engine(&mut self) {
        self.cabac_ivl_curr_range = 510;
        self.cabac_ivl_offset = self.reader.read_bits(9) as u16;
    }

    #[inline(always)]
    fn renorm_cabac_decode_engine(&mut self) {
        while self.cabac_ivl_curr_range < 256 {
            self.cabac_ivl_curr_range <<= 1;
            self.cabac_ivl_offset = (self.cabac_ivl_offset << 1) | self.reader.read_bit() as u16;
        }
    }

    pub fn bits_read(&self) -> usize {
        self.reader.bits_read()
    }
}

impl<'a> BinDecoder for BoolDecoder<'a> {
    fn decode_decision(&mut self, ctx: &mut ContextState) -> bool {
        let q_range_idx = (self.cabac_ivl_curr_range >> 6) & 3;
        let lps_range = RANGE_TAB_LPS[ctx.state as usize][q_range_idx as usize] as u16;
        self.cabac_ivl_curr_range -= lps_range;
        let bin = if self.cabac_ivl_offset >= self.cabac_ivl_curr_range {
            self.cabac_ivl_offset -= self.cabac_ivl_curr_range;
            self.cabac_ivl_curr_range = lps_range;
            let bin = !ctx.mps;
            transition_state(ctx, false);
            bin
        } else {
            let bin = ctx.mps;
            transition_state(ctx, true);
            bin
        };
        debug_eprintln!(
            "dec bin={}, offset={}, range={}",
            bin,
            self.cabac_ivl_offset,
            self.cabac_ivl_curr_range
        );
        self.renorm_cabac_decode_engine();
        bin
    }

    fn decode_bypass(&mut self) -> bool {
        self.cabac_ivl_offset = (self.cabac_ivl_offset << 1) | self.reader.read_bit() as u16;
        if self.cabac_ivl_offset >= self.cabac_ivl_curr_range {
            self.cabac_ivl_offset -= self.cabac_ivl_curr_range;
            true
        } else {
            false
        }
    }

    fn decode_terminate(&mut self) -> bool {
        self.cabac_ivl_curr_range -= 2;
        if self.cabac_ivl_offset >= self.cabac_ivl_curr_range {
            true
        } else {
            self.renorm_cabac_decode_engine();
            false
        }
    }

    fn decode_pcm_samples(&mut self, samples: &mut [u8]) {
        self.reader.byte_align();
        for sample in samples.iter_mut() {
            *sample = self.reader.read_byte();
        }
        self.init_arithmetic_engine();
    }
}
