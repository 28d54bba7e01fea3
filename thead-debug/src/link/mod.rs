//! The contract between the target layer and the physical debug link.
//!
//! A [`Link`] moves bytes: memory blocks, CPU registers, debug-module registers and a small
//! set of enumerated configuration keys. Everything that needs to know about HAD or the
//! RISC-V debug module lives above this trait.

pub mod fake;
mod selector;

use std::fmt;

use enum_primitive_derive::Primitive;
use serde::{Deserialize, Serialize};

pub use selector::{LinkSelector, LinkSelectorParseError};

/// USB vendor id of CKLink adapters.
pub const CKLINK_VENDOR_ID: u16 = 0xc510;
/// USB vendor id of T-HEAD branded adapters.
pub const THEAD_VENDOR_ID: u16 = 0x32bf;

/// Errors reported by a link implementation.
#[derive(thiserror::Error, Debug, docsplay::Display, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// No debug adapter is connected.
    NoDevice,
    /// An I/O error occurred while talking to the debug adapter.
    Io,
    /// The debug adapter does not support this operation.
    Unsupported,
    /// The debug adapter did not answer in time.
    Timeout,
    /// The debug adapter reported an unknown error ({0:#010x}).
    Unknown(u32),
}

impl LinkError {
    /// Translates a raw adapter status word. `None` means success.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => None,
            0x8000_0001 => Some(LinkError::NoDevice),
            0x8000_0002 => Some(LinkError::Io),
            0x8000_0003 => Some(LinkError::Unsupported),
            other => Some(LinkError::Unknown(other)),
        }
    }
}

/// The physical wire protocol between adapter and chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    /// Five wire JTAG.
    #[default]
    Jtag,
    /// Two wire serial debug.
    Swd,
}

impl WireProtocol {
    /// The value written with [`LinkConfigKey::Cdi`].
    pub fn cdi_value(self) -> u32 {
        match self {
            WireProtocol::Jtag => 0,
            WireProtocol::Swd => 1,
        }
    }
}

/// Configuration keys understood by [`Link::config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
pub enum LinkConfigKey {
    /// TCK frequency in kHz.
    Clock = 0,
    /// Enable (1) or disable (0) direct download channel for continuous transfers.
    Ddc = 1,
    /// Delay after MTCR operations.
    MtcrDelay = 2,
    /// Select the wire protocol, see [`WireProtocol::cdi_value`].
    Cdi = 3,
    /// Pulse TRST.
    Treset = 4,
    /// ISA version: 2 and 3 for C-SKY, 4 for RV32, 5 for RV64.
    IsaVersion = 5,
    /// HACR (instruction register) length in bits, 8 or 16.
    HacrLength = 6,
    /// Select the CPU behind a HAD top module.
    CpuSelect = 7,
    /// Write the DM configuration word.
    SetDm = 8,
    /// Read back the DM configuration word.
    GetDm = 9,
    /// Set the base address of the RISC-V debug module.
    SetDmBase = 10,
    /// Park the TAP in Test-Logic-Reset.
    ToResetState = 11,
    /// Ask whether the adapter supports PC sampling.
    GetPcSamplingSupport = 12,
    /// Read the actual TCK frequency.
    GetLinkClock = 13,
    /// Number of TCK cycles spent in Run-Test/Idle.
    SetIdleDelay = 14,
    /// DMI address bits.
    SetAbits = 15,
    /// Enable DMI access.
    SetDmiacc = 16,
    /// Program buffer size.
    SetProgbufSize = 17,
    /// Implicit ebreak after the program buffer.
    SetImpebreak = 18,
    /// Enable `abstractauto`.
    SetAbstractAuto = 19,
    /// XLEN of the selected hart.
    SetXlen = 20,
    /// Memory access strategy of the debug module, see [`crate::config::MemAccessMode`].
    SetMemAccessMode = 21,
}

/// Width of a single bus transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Primitive)]
pub enum AccessWidth {
    /// 8 bit transfers.
    Byte = 1,
    /// 16 bit transfers.
    HalfWord = 2,
    /// 32 bit transfers.
    Word = 4,
    /// 64 bit transfers.
    DoubleWord = 6,
}

impl AccessWidth {
    /// Number of bytes moved per transfer.
    pub fn bytes(self) -> usize {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::HalfWord => 2,
            AccessWidth::Word => 4,
            AccessWidth::DoubleWord => 8,
        }
    }

    /// The widest access usable for `address` and `len`, capped at `max`.
    pub fn widest_for(address: u64, len: usize, max: AccessWidth) -> AccessWidth {
        [
            AccessWidth::DoubleWord,
            AccessWidth::Word,
            AccessWidth::HalfWord,
        ]
        .into_iter()
        .filter(|width| *width <= max)
        .find(|width| {
            let bytes = width.bytes();
            address % bytes as u64 == 0 && len % bytes == 0
        })
        .unwrap_or(AccessWidth::Byte)
    }
}

/// Address width of the selected CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Xlen {
    /// 32 bit addresses.
    #[default]
    X32,
    /// 64 bit addresses.
    X64,
}

impl Xlen {
    /// The width in bits.
    pub fn bits(self) -> u32 {
        match self {
            Xlen::X32 => 32,
            Xlen::X64 => 64,
        }
    }

    /// The width in bytes.
    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }
}

/// Register spaces reachable through a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterSpace {
    /// CPU registers, addressed by their debugger register number.
    Cpu,
    /// Registers of the debug adapter itself.
    Ice,
    /// HAD registers. The number is a [`crate::core::had::HadAccess`] word.
    Had,
    /// RISC-V debug module registers, addressed by DMI address.
    Dm,
}

/// Availability of an enumerated debug adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// The adapter is free to be opened.
    Idle,
    /// The adapter does not respond.
    Broken,
    /// The adapter is in use by another session.
    Busy,
    /// The state could not be determined.
    Unknown,
}

/// Information about a debug adapter found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDevice {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// USB `bcdDevice`, the hardware revision.
    pub bcd_device: u16,
    /// Human readable product string.
    pub description: String,
    /// Serial number, if the adapter reports one.
    pub serial_number: Option<String>,
    /// Whether the adapter can be opened.
    pub state: LinkState,
}

impl fmt::Display for LinkDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -- {:04x}:{:04x}",
            self.description, self.vendor_id, self.product_id
        )?;
        if let Some(serial) = &self.serial_number {
            write!(f, ":{serial}")?;
        }
        write!(f, " ({:?})", self.state)
    }
}

/// A debug transport between the host and the on-chip debug module.
///
/// Implementations are expected to apply their own bounded retry and timeout policy; every
/// call either completes or returns a [`LinkError`].
pub trait Link: fmt::Debug + Send {
    /// A short name of the adapter driver.
    fn name(&self) -> &str;

    /// Applies a configuration key and returns the value reported back by the adapter.
    fn config(&mut self, key: LinkConfigKey, value: u32) -> Result<u32, LinkError>;

    /// Reads `data.len()` bytes starting at `address`.
    fn read_memory(
        &mut self,
        address: u64,
        xlen: Xlen,
        data: &mut [u8],
        width: AccessWidth,
    ) -> Result<(), LinkError>;

    /// Writes `data` starting at `address`.
    fn write_memory(
        &mut self,
        address: u64,
        xlen: Xlen,
        data: &[u8],
        width: AccessWidth,
    ) -> Result<(), LinkError>;

    /// Reads a register in `space`. `data.len()` is the register size in bytes, little endian.
    fn read_register(
        &mut self,
        space: RegisterSpace,
        number: u16,
        data: &mut [u8],
    ) -> Result<(), LinkError>;

    /// Writes a register in `space`, little endian.
    fn write_register(
        &mut self,
        space: RegisterSpace,
        number: u16,
        data: &[u8],
    ) -> Result<(), LinkError>;

    /// Resets the target. `hard` drives the nRESET line, otherwise a system reset is
    /// requested through the debug module.
    fn reset(&mut self, hard: bool) -> Result<(), LinkError>;

    /// Lists the adapters this driver can reach.
    fn devices(&mut self) -> Result<Vec<LinkDevice>, LinkError>;

    /// Releases the adapter.
    fn close(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    /// Reads a 32 bit register.
    fn read_register_u32(&mut self, space: RegisterSpace, number: u16) -> Result<u32, LinkError> {
        let mut buffer = [0u8; 4];
        self.read_register(space, number, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Writes a 32 bit register.
    fn write_register_u32(
        &mut self,
        space: RegisterSpace,
        number: u16,
        value: u32,
    ) -> Result<(), LinkError> {
        self.write_register(space, number, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn error_codes() {
        assert_eq!(LinkError::from_code(0), None);
        assert_eq!(LinkError::from_code(0x8000_0001), Some(LinkError::NoDevice));
        assert_eq!(LinkError::from_code(0x8000_0003), Some(LinkError::Unsupported));
        assert_eq!(
            LinkError::from_code(0x8000_0fff),
            Some(LinkError::Unknown(0x8000_0fff))
        );
    }

    #[test_case(0x1000, 8, AccessWidth::DoubleWord, AccessWidth::DoubleWord)]
    #[test_case(0x1004, 8, AccessWidth::DoubleWord, AccessWidth::Word)]
    #[test_case(0x1000, 8, AccessWidth::Word, AccessWidth::Word)]
    #[test_case(0x1002, 2, AccessWidth::DoubleWord, AccessWidth::HalfWord)]
    #[test_case(0x1001, 4, AccessWidth::DoubleWord, AccessWidth::Byte)]
    fn widest_access(address: u64, len: usize, max: AccessWidth, expected: AccessWidth) {
        assert_eq!(AccessWidth::widest_for(address, len, max), expected);
    }
}
