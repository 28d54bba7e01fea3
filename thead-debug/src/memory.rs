use scroll::Pread;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Byte order of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Endian {
    /// Little endian.
    #[default]
    Little,
    /// Big endian (C-SKY ABI v1 layout).
    BigV1,
    /// Big endian (C-SKY ABI v2 layout).
    BigV2,
}

impl Endian {
    fn scroll(self) -> scroll::Endian {
        match self {
            Endian::Little => scroll::LE,
            Endian::BigV1 | Endian::BigV2 => scroll::BE,
        }
    }

    /// Encodes the low `len` bytes of `value` in this byte order.
    pub fn encode(self, value: u64, len: usize) -> Vec<u8> {
        let bytes = match self {
            Endian::Little => value.to_le_bytes(),
            Endian::BigV1 | Endian::BigV2 => value.to_be_bytes(),
        };
        match self {
            Endian::Little => bytes[..len].to_vec(),
            Endian::BigV1 | Endian::BigV2 => bytes[8 - len..].to_vec(),
        }
    }
}

/// An interface to be implemented for anything that allows target memory access.
///
/// Only byte-granular block transfers are required; word helpers are derived from them and
/// honour [`MemoryInterface::endian`].
pub trait MemoryInterface {
    /// Read a block of bytes at `address`.
    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error>;

    /// Write a block of bytes at `address`.
    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), Error>;

    /// Byte order used by the word helpers.
    fn endian(&self) -> Endian {
        Endian::Little
    }

    /// Read an 8bit word at `address`.
    fn read_word_8(&mut self, address: u64) -> Result<u8, Error> {
        let mut word = 0;
        self.read_8(address, std::slice::from_mut(&mut word))?;
        Ok(word)
    }

    /// Read a 16bit word at `address`.
    fn read_word_16(&mut self, address: u64) -> Result<u16, Error> {
        let mut buffer = [0u8; 2];
        self.read_8(address, &mut buffer)?;
        Ok(buffer
            .as_slice()
            .pread_with::<u16>(0, self.endian().scroll())
            .map_err(anyhow::Error::from)?)
    }

    /// Read a 32bit word at `address`.
    fn read_word_32(&mut self, address: u64) -> Result<u32, Error> {
        let mut buffer = [0u8; 4];
        self.read_8(address, &mut buffer)?;
        Ok(buffer
            .as_slice()
            .pread_with::<u32>(0, self.endian().scroll())
            .map_err(anyhow::Error::from)?)
    }

    /// Read a 64bit word at `address`.
    fn read_word_64(&mut self, address: u64) -> Result<u64, Error> {
        let mut buffer = [0u8; 8];
        self.read_8(address, &mut buffer)?;
        Ok(buffer
            .as_slice()
            .pread_with::<u64>(0, self.endian().scroll())
            .map_err(anyhow::Error::from)?)
    }

    /// Write a 16bit word at `address`.
    fn write_word_16(&mut self, address: u64, data: u16) -> Result<(), Error> {
        let bytes = self.endian().encode(data.into(), 2);
        self.write_8(address, &bytes)
    }

    /// Write a 32bit word at `address`.
    fn write_word_32(&mut self, address: u64, data: u32) -> Result<(), Error> {
        let bytes = self.endian().encode(data.into(), 4);
        self.write_8(address, &bytes)
    }

    /// Write a 64bit word at `address`.
    fn write_word_64(&mut self, address: u64, data: u64) -> Result<(), Error> {
        let bytes = self.endian().encode(data, 8);
        self.write_8(address, &bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Ram {
        bytes: Vec<u8>,
        endian: Endian,
    }

    impl MemoryInterface for Ram {
        fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
            let start = address as usize;
            data.copy_from_slice(&self.bytes[start..start + data.len()]);
            Ok(())
        }

        fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
            let start = address as usize;
            self.bytes[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn endian(&self) -> Endian {
            self.endian
        }
    }

    #[test]
    fn words_follow_endianness() {
        let mut little = Ram {
            bytes: vec![0x78, 0x56, 0x34, 0x12],
            endian: Endian::Little,
        };
        assert_eq!(little.read_word_32(0).unwrap(), 0x1234_5678);
        assert_eq!(little.read_word_16(2).unwrap(), 0x1234);

        let mut big = Ram {
            bytes: vec![0x12, 0x34, 0x56, 0x78],
            endian: Endian::BigV2,
        };
        assert_eq!(big.read_word_32(0).unwrap(), 0x1234_5678);

        big.write_word_16(0, 0xbeef).unwrap();
        assert_eq!(big.bytes, vec![0xbe, 0xef, 0x56, 0x78]);
    }
}
