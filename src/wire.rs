//! Little-endian primitives on top of `byteorder`, plus the Bitcoin
//! variable length integer and length-prefixed byte strings.
//!
//! Every multi-byte integer on the wire is little-endian, except the port
//! inside an address record (see [`crate::address`]).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use super::errors::{BTCNetError, Result};

/// Largest value encodable with the 2 byte form (prefix `0xfd`).
const VAR_INT_U16_MAX: u64 = 0xffff;

/// Largest value encodable with the 4 byte form (prefix `0xfe`).
const VAR_INT_U32_MAX: u64 = 0xffff_ffff;

pub trait ReadWireExt: Read {
    fn read_u16_le(&mut self) -> Result<u16> {
        Ok(self.read_u16::<LittleEndian>()?)
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        Ok(self.read_u32::<LittleEndian>()?)
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        Ok(self.read_u64::<LittleEndian>()?)
    }

    fn read_i64_le(&mut self) -> Result<i64> {
        Ok(self.read_i64::<LittleEndian>()?)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads a variable length integer. The 8 byte form is rejected.
    fn read_var_int(&mut self) -> Result<u64> {
        match self.read_u8()? {
            0xff => Err(BTCNetError::VarIntTooLarge(u64::MAX)),
            0xfe => Ok(self.read_u32::<LittleEndian>()? as u64),
            0xfd => Ok(self.read_u16::<LittleEndian>()? as u64),
            n => Ok(n as u64),
        }
    }

    /// Reads a var-int count and rejects anything above `max`.
    fn read_count(&mut self, max: u64) -> Result<usize> {
        let count = self.read_var_int()?;
        if count > max {
            return Err(BTCNetError::OversizedCount { count, max });
        }
        Ok(count as usize)
    }

    /// Reads a length-prefixed byte string. Short input is a decode error,
    /// never a partial result.
    fn read_var_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_var_int()?;
        let mut buf = Vec::new();
        Read::take(&mut *self, len).read_to_end(&mut buf)?;
        if (buf.len() as u64) < len {
            return Err(BTCNetError::Truncated);
        }
        Ok(buf)
    }

    /// Reads a length-prefixed string. Invalid UTF-8 is replaced rather than
    /// rejected, peers put arbitrary bytes in free-form fields.
    fn read_var_string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.read_var_bytes()?).into_owned())
    }
}

impl<R: Read + ?Sized> ReadWireExt for R {}

pub trait WriteWireExt: Write {
    fn write_u16_le(&mut self, n: u16) -> Result<()> {
        Ok(self.write_u16::<LittleEndian>(n)?)
    }

    fn write_u32_le(&mut self, n: u32) -> Result<()> {
        Ok(self.write_u32::<LittleEndian>(n)?)
    }

    fn write_u64_le(&mut self, n: u64) -> Result<()> {
        Ok(self.write_u64::<LittleEndian>(n)?)
    }

    fn write_i64_le(&mut self, n: i64) -> Result<()> {
        Ok(self.write_i64::<LittleEndian>(n)?)
    }

    /// Writes a variable length integer. Values that need the 8 byte form
    /// fail instead of being truncated.
    fn write_var_int(&mut self, n: u64) -> Result<()> {
        if n < 0xfd {
            self.write_u8(n as u8)?;
        } else if n <= VAR_INT_U16_MAX {
            self.write_u8(0xfd)?;
            self.write_u16::<LittleEndian>(n as u16)?;
        } else if n <= VAR_INT_U32_MAX {
            self.write_u8(0xfe)?;
            self.write_u32::<LittleEndian>(n as u32)?;
        } else {
            return Err(BTCNetError::VarIntTooLarge(n));
        }
        Ok(())
    }

    fn write_var_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_var_int(bytes.len() as u64)?;
        Ok(self.write_all(bytes)?)
    }

    fn write_var_string(&mut self, s: &str) -> Result<()> {
        self.write_var_bytes(s.as_bytes())
    }
}

impl<W: Write + ?Sized> WriteWireExt for W {}

/// Number of bytes `write_var_int(n)` produces.
pub fn var_int_size(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=VAR_INT_U16_MAX => 3,
        _ => 5,
    }
}
