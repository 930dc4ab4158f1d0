//! Bit-level codec utilities.
//!
//! MSB-first bit cursor, exp-Golomb codes, the MPEG-2 CRC and the
//! EBSP/RBSP emulation-prevention transform used by the parameter-set
//! parsers.

use crate::error::{Error, Result};
use crc::{Crc, CRC_32_MPEG_2};

/// CRC-32/MPEG-2: polynomial 0x04C11DB7, init 0xFFFFFFFF, no reflection,
/// no final XOR. PSI sections append this CRC, so a checksum over
/// `section || crc` is zero for an intact section.
const CRC32_MPEG2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Compute CRC-32/MPEG-2 over `data`.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    CRC32_MPEG2.checksum(data)
}

/// MSB-first bit reader over a byte slice.
///
/// Every read is bounds-checked; reads past the end fail with
/// [`Error::BitstreamOverrun`] carrying the `context` the reader was
/// created with.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8], context: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            context,
        }
    }

    /// Bit position of the cursor.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn overrun(&self) -> Error {
        Error::BitstreamOverrun(self.context)
    }

    /// Read a single bit.
    pub fn read_bit(&mut self) -> Result<u32> {
        let byte = self.data.get(self.pos >> 3).ok_or_else(|| self.overrun())?;
        let bit = (byte >> (7 - (self.pos & 7))) & 1;
        self.pos += 1;
        Ok(u32::from(bit))
    }

    /// Read a single bit as a flag.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_bit()? != 0)
    }

    /// Read `n` bits (n <= 32), MSB first.
    pub fn read_bits(&mut self, n: u32) -> Result<u32> {
        debug_assert!(n <= 32);
        let mut r = 0u32;
        for _ in 0..n {
            r = (r << 1) | self.read_bit()?;
        }
        Ok(r)
    }

    /// Advance the cursor by `n` bits without reading.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        let end = self.pos + n;
        if end > self.data.len() * 8 {
            return Err(self.overrun());
        }
        self.pos = end;
        Ok(())
    }

    /// Unsigned exp-Golomb code: up to 31 leading zeros, then that many
    /// bits. A run of 31 zero flags decodes to 0, matching the reference
    /// parser this is modeled on.
    pub fn ue(&mut self) -> Result<u32> {
        for n in 0..31 {
            if self.read_bool()? {
                return Ok((1u32 << n) - 1 + self.read_bits(n)?);
            }
        }
        Ok(0)
    }

    /// Signed exp-Golomb code.
    pub fn se(&mut self) -> Result<i32> {
        let r = self.ue()?;
        Ok((r >> 1) as i32 + if r & 1 == 1 { 1 } else { -(r as i32) })
    }
}

/// Strip emulation-prevention bytes: drop a 0x03 that is immediately
/// preceded by two zero bytes and followed by a byte <= 3. A 0x03 as the
/// very last byte is kept.
pub fn ebsp_to_rbsp(src: &[u8]) -> Vec<u8> {
    let mut dest = Vec::with_capacity(src.len());
    for i in 0..src.len() {
        if i < 2
            || i + 1 == src.len()
            || src[i - 2] != 0
            || src[i - 1] != 0
            || src[i] != 3
            || src[i + 1] > 3
        {
            dest.push(src[i]);
        }
    }
    dest
}
