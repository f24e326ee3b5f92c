use debug_print::*;
use std::fs::File;
use std::io::{self, BufRead, Read};

/// MSB-first bit reader. Reads past the end of the input yield zero bits.
pub struct BinaryReader<'a> {
    input: Box<dyn BufRead + 'a>,
    buffer: u8,
    bit_offset: usize,
    bits_read: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn file(path: &str) -> io::Result<BinaryReader<'a>> {
        File::open(path).map(|file| BinaryReader {
            input: Box::new(io::BufReader::new(file)),
            buffer: 0,
            bit_offset: 0,
            bits_read: 0,
        })
    }

    pub fn vec(v: &'a [u8]) -> BinaryReader<'a> {
        BinaryReader {
            input: Box::new(v),
            buffer: 0,
            bit_offset: 0,
            bits_read: 0,
        }
    }

    fn next_byte(&mut self) -> u8 {
        let mut tmp = [0u8; 1];
        match self.input.read(&mut tmp[..]) {
            Ok(1) => tmp[0],
            _ => 0,
        }
    }

    pub fn read_bit(&mut self) -> bool {
        if self.bit_offset == 0 {
            self.buffer = self.next_byte();
        }
        let bit = (self.buffer >> (7 - self.bit_offset)) & 1 > 0;
        self.bit_offset = (self.bit_offset + 1) % 8;
        self.bits_read += 1;
        bit
    }

    pub fn read_bits(&mut self, n_bits: usize) -> u32 {
        debug_assert!(n_bits <= 32);
        let mut bits = 0;
        for _ in 0..n_bits {
            bits = (bits << 1) | self.read_bit() as u32;
        }
        bits
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.bit_offset == 0
    }

    /// Skips to the next byte boundary and returns the skipped bits.
    pub fn byte_align(&mut self) -> u32 {
        let mut skipped = 0;
        while !self.is_byte_aligned() {
            skipped = (skipped << 1) | self.read_bit() as u32;
        }
        skipped
    }

    pub fn read_byte(&mut self) -> u8 {
        if self.is_byte_aligned() {
            self.bits_read += 8;
            self.next_byte()
        } else {
            self.read_bits(8) as u8
        }
    }

    pub fn bits_read(&self) -> usize {
        self.bits_read
    }

    /// Reads a payload written by `BinaryWriter::write_payload`, or `None` at
    /// the end of the input.
    pub fn read_payload(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.byte_align();
        if self.is_eof() {
            return Ok(None);
        }
        let len = self.read_bits(32) as usize;
        debug_eprintln!("payload len = {}", len);
        // the length is untrusted, grow with the data actually present
        let mut payload = vec![];
        let n = self.input.by_ref().take(len as u64).read_to_end(&mut payload)?;
        self.bits_read += n * 8;
        if n < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("payload truncated: {} of {} bytes", n, len),
            ));
        }
        Ok(Some(payload))
    }

    /// True when no further byte can be read.
    pub fn is_eof(&mut self) -> bool {
        self.bit_offset == 0 && matches!(self.input.fill_buf(), Ok(buf) if buf.is_empty())
    }
}
