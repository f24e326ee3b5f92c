use super::bins::Bins;
use std::fs::File;
use std::io::{self, Write};

pub struct BinaryWriter<'a> {
    output: Box<dyn Write + 'a>,
    buf: u8,
    index: usize,
}

impl<'a> BinaryWriter<'a> {
    pub fn standard(stdout: &'a io::Stdout) -> BinaryWriter<'a> {
        BinaryWriter {
            output: Box::new(stdout.lock()),
            buf: 0,
            index: 0,
        }
    }

    pub fn file(path: &str) -> io::Result<BinaryWriter<'a>> {
        File::create(path).map(|file| BinaryWriter {
            output: Box::new(io::BufWriter::new(file)),
            buf: 0,
            index: 0,
        })
    }

    pub fn memory(v: &'a mut Vec<u8>) -> BinaryWriter<'a> {
        BinaryWriter {
            output: Box::new(v),
            buf: 0,
            index: 0,
        }
    }

    pub fn write_bit(&mut self, bit: bool) -> io::Result<()> {
        self.buf = (self.buf << 1) | bit as u8;
        self.index += 1;
        if self.index == 8 {
            self.index = 0;
            let tmp = [self.buf];
            self.buf = 0;
            self.output.write_all(&tmp)?;
        }
        Ok(())
    }

    pub fn write_bits(&mut self, bits: u32, n_bits: usize) -> io::Result<()> {
        for i in (0..n_bits).rev() {
            self.write_bit((bits >> i) & 1 > 0)?;
        }
        Ok(())
    }

    pub fn byte_align(&mut self) -> io::Result<()> {
        while self.index > 0 {
            self.write_bit(false)?;
        }
        Ok(())
    }

    /// Writes a coded payload preceded by its byte length as a 32-bit
    /// big-endian value.
    pub fn write_payload(&mut self, bins: &Bins) -> io::Result<usize> {
        self.byte_align()?;
        let bytes: Vec<u8> = bins.bytes().collect();
        self.write_bits(bytes.len() as u32, 32)?;
        self.output.write_all(&bytes)?;
        Ok(bytes.len() + 4)
    }
}

impl<'a> Write for BinaryWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}
