//! Run control through the HAD debug module of C-SKY cores.

use std::time::Duration;

use bitfield::bitfield;
use enum_primitive_derive::Primitive;

use super::{CoreInterface, CoreStatus, ResetMethod, StopCause, StopEvent};
use crate::config::DebugArch;
use crate::link::{AccessWidth, Link, RegisterSpace, Xlen};
use crate::memory::{Endian, MemoryInterface};
use crate::registers::csky::{self, had};
use crate::registers::{RegisterDescriptor, RegisterLocation, RegisterValue};
use crate::watchpoint::AccessKind;
use crate::Error;

/// Width of the HAD instruction register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HacrWidth {
    #[default]
    Bits8,
    Bits16,
}

impl HacrWidth {
    /// Parses a width in bits.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(HacrWidth::Bits8),
            16 => Some(HacrWidth::Bits16),
            _ => None,
        }
    }

    /// The width in bits.
    pub fn bits(self) -> u8 {
        match self {
            HacrWidth::Bits8 => 8,
            HacrWidth::Bits16 => 16,
        }
    }
}

bitfield! {
    /// The 8 bit HACR. Banked registers need a prior `BSEL` write.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Hacr8(u16);
    impl Debug;

    pub u8, rs, set_rs: 4, 0;
    pub ex, set_ex: 5;
    pub go, set_go: 6;
    pub read, set_read: 7;
}

bitfield! {
    /// The 16 bit HACR, which carries the bank itself.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Hacr16(u16);
    impl Debug;

    pub u8, bank, set_bank: 6, 4;
    pub u8, rs, set_rs: 12, 8;
    pub ex, set_ex: 13;
    pub go, set_go: 14;
    pub read, set_read: 15;
}

/// One HAD register access, before it is encoded into a HACR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HadAccess {
    /// Bank encoded register select, bank in bits 7:5.
    pub select: u8,
    pub read: bool,
    pub go: bool,
    pub ex: bool,
}

impl HadAccess {
    pub fn read(select: u8) -> Self {
        HadAccess {
            select,
            read: true,
            go: false,
            ex: false,
        }
    }

    pub fn write(select: u8) -> Self {
        HadAccess {
            select,
            read: false,
            go: false,
            ex: false,
        }
    }

    /// A write that makes the CPU leave debug mode afterwards.
    pub fn exit(select: u8) -> Self {
        HadAccess {
            select,
            read: false,
            go: true,
            ex: true,
        }
    }

    /// The bank of the selected register.
    pub fn bank(&self) -> u8 {
        self.select >> 5
    }

    /// The HACR value. With an 8 bit HACR the bank bits are dropped.
    pub fn encode(&self, width: HacrWidth) -> u16 {
        match width {
            HacrWidth::Bits8 => {
                let mut hacr = Hacr8(0);
                hacr.set_rs(self.select & 0x1f);
                hacr.set_ex(self.ex);
                hacr.set_go(self.go);
                hacr.set_read(self.read);
                hacr.0
            }
            HacrWidth::Bits16 => {
                let mut hacr = Hacr16(0);
                hacr.set_bank(self.bank());
                hacr.set_rs(self.select & 0x1f);
                hacr.set_ex(self.ex);
                hacr.set_go(self.go);
                hacr.set_read(self.read);
                hacr.0
            }
        }
    }

    /// Decodes a HACR value. `bank` is the current `BSEL` value, used for 8 bit HACRs.
    pub fn decode(value: u16, width: HacrWidth, bank: u8) -> Self {
        match width {
            HacrWidth::Bits8 => {
                let hacr = Hacr8(value);
                HadAccess {
                    select: (bank << 5) | hacr.rs(),
                    read: hacr.read(),
                    go: hacr.go(),
                    ex: hacr.ex(),
                }
            }
            HacrWidth::Bits16 => {
                let hacr = Hacr16(value);
                HadAccess {
                    select: (hacr.bank() << 5) | hacr.rs(),
                    read: hacr.read(),
                    go: hacr.go(),
                    ex: hacr.ex(),
                }
            }
        }
    }
}

bitfield! {
    /// HAD status register.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Hsr(u32);
    impl Debug;

    /// 0 normal, 1 low power, 2 debug mode.
    pub u8, pm, set_pm: 1, 0;
    /// Trace counter overflow, a finished step.
    pub to, set_to: 5;
    /// Software breakpoint.
    pub swo, set_swo: 6;
    /// Memory breakpoint, one of the comparators.
    pub mbo, set_mbo: 7;
    /// Debug request.
    pub dro, set_dro: 8;
    /// Hardware debug request.
    pub hdro, set_hdro: 9;
    /// Debug request after reset.
    pub adro, set_adro: 10;
    /// External debug request.
    pub ebro, set_ebro: 11;
    /// Debug entry requested by a peer core.
    pub pro, set_pro: 16;
}

raw_register!(Hsr, u32);

impl Hsr {
    /// Value of [`Hsr::pm`] while in debug mode.
    pub const DEBUG_MODE: u8 = 2;

    /// All cause bits cleared, everything else kept.
    pub fn without_causes(self) -> Self {
        Hsr(self.0 & 0x3)
    }

    fn cause(&self) -> StopCause {
        if self.pro() {
            StopCause::Peer
        } else if self.swo() {
            StopCause::Software
        } else if self.mbo() {
            StopCause::Hardware
        } else if self.to() {
            StopCause::Step
        } else if self.dro() || self.hdro() || self.adro() || self.ebro() {
            StopCause::Request
        } else {
            StopCause::Unknown
        }
    }
}

/// Match modes of the A and B comparators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
pub enum MatchMode {
    Disabled = 0,
    Instruction = 1,
    Store = 2,
    Load = 3,
    Access = 4,
}

impl From<AccessKind> for MatchMode {
    fn from(access: AccessKind) -> Self {
        match access {
            AccessKind::Write => MatchMode::Store,
            AccessKind::Read => MatchMode::Load,
            AccessKind::Access => MatchMode::Access,
        }
    }
}

bitfield! {
    /// HAD control register.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Hcr(u32);
    impl Debug;

    pub u8, mode_a, set_mode_a: 4, 0;
    pub u8, mode_b, set_mode_b: 9, 5;
    /// Trace mode, the CPU stops after `HTCR` instructions.
    pub tme, set_tme: 13;
    /// Debug request.
    pub dr, set_dr: 15;
    /// Direct download channel enable.
    pub ddc, set_ddc: 20;
    /// Enter debug mode right after reset.
    pub adr, set_adr: 21;
    /// Enable bits of comparators C to I.
    pub u8, extra_units, set_extra_units: 28, 22;
}

bitfield! {
    /// The control state register of the CPU scan chain.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Scrcsr(u32);
    impl Debug;

    /// Breakpoint instructions enter debug mode instead of raising an exception.
    pub fdb, set_fdb: 7;
    pub ffy, set_ffy: 8;
    pub tpend, set_tpend: 10;
}

raw_register!(Hcr, u32);
raw_register!(Scrcsr, u32);

/// Comparators A and B plus C to I.
pub const MAX_UNITS: usize = 9;
/// Comparators A and B are the only ones that match data accesses.
pub const DATA_MATCH_UNITS: usize = 2;

const PSR_RESET_VALUE: u32 = 0x8000_0000;
const CFR: u16 = csky::CR_BASE + 17;
const CFR_INVALIDATE_ALL: u32 = 0x33;

/// Parameters of a CPU behind a HAD module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HadParams {
    pub hacr_width: HacrWidth,
    /// HAD version, 1 to 7.
    pub had_version: u8,
    /// Number of hardware comparators.
    pub units: usize,
    /// Let breakpoint instructions raise an exception in the target instead of halting.
    pub bkpt_exception: bool,
    pub endian: Endian,
    pub max_access: AccessWidth,
}

impl Default for HadParams {
    fn default() -> Self {
        HadParams {
            hacr_width: HacrWidth::Bits8,
            had_version: 1,
            units: crate::identity::had_id::DEFAULT_BREAKPOINT_UNITS,
            bkpt_exception: false,
            endian: Endian::Little,
            max_access: AccessWidth::Word,
        }
    }
}

/// A C-SKY CPU reached through HAD.
pub struct HadCore<'a> {
    link: &'a mut dyn Link,
    params: HadParams,
}

impl<'a> HadCore<'a> {
    pub fn new(link: &'a mut dyn Link, params: HadParams) -> Self {
        HadCore { link, params }
    }

    fn with_bank<T>(
        &mut self,
        select: u8,
        access: impl FnOnce(&mut dyn Link, HacrWidth) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let width = self.params.hacr_width;
        let bank = select >> 5;
        if width == HacrWidth::Bits8 && bank != 0 {
            let bsel = HadAccess::write(had::BSEL).encode(width);
            self.link
                .write_register_u32(RegisterSpace::Had, bsel, bank.into())?;
            let result = access(&mut *self.link, width);
            self.link.write_register_u32(RegisterSpace::Had, bsel, 0)?;
            result
        } else {
            access(&mut *self.link, width)
        }
    }

    /// Reads a HAD register.
    pub fn read_had(&mut self, select: u8) -> Result<u32, Error> {
        self.with_bank(select, |link, width| {
            let number = HadAccess::read(select).encode(width);
            Ok(link.read_register_u32(RegisterSpace::Had, number)?)
        })
    }

    /// Writes a HAD register.
    pub fn write_had(&mut self, select: u8, value: u32) -> Result<(), Error> {
        self.with_bank(select, |link, width| {
            let number = HadAccess::write(select).encode(width);
            Ok(link.write_register_u32(RegisterSpace::Had, number, value)?)
        })
    }

    fn exit_debug(&mut self, hcr: Hcr) -> Result<(), Error> {
        let number = HadAccess::exit(had::HCR).encode(self.params.hacr_width);
        self.link
            .write_register_u32(RegisterSpace::Had, number, hcr.0)?;
        Ok(())
    }

    fn hcr(&mut self) -> Result<Hcr, Error> {
        Ok(Hcr(self.read_had(had::HCR)?))
    }

    fn set_fdb(&mut self) -> Result<(), Error> {
        let mut csr = Scrcsr(self.read_had(had::SCRCSR)?);
        csr.set_fdb(!self.params.bkpt_exception);
        self.write_had(had::SCRCSR, csr.0)
    }

    fn unit_registers(unit: usize) -> Result<(u8, u8), Error> {
        match unit {
            0 => Ok((had::BABA, had::BAMA)),
            1 => Ok((had::BABB, had::BAMB)),
            2..=8 => {
                let offset = (unit as u8 - 2) * 2;
                Ok((had::BABC + offset, had::BAMC + offset))
            }
            _ => Err(Error::NoHardwareSlot),
        }
    }

    fn set_mode(&mut self, unit: usize, mode: MatchMode) -> Result<(), Error> {
        let mut hcr = self.hcr()?;
        match unit {
            0 => hcr.set_mode_a(mode as u8),
            1 => hcr.set_mode_b(mode as u8),
            _ => {
                let bit = 1u8 << (unit - 2);
                let enabled = hcr.extra_units();
                hcr.set_extra_units(if mode == MatchMode::Disabled {
                    enabled & !bit
                } else {
                    enabled | bit
                });
            }
        }
        self.write_had(had::HCR, hcr.0)
    }

    fn soft_reset(&mut self) -> Result<(), Error> {
        let entry = self.read_word_32(0)?;
        tracing::debug!("Soft reset, entry point {entry:#010x}");
        self.link
            .write_register_u32(RegisterSpace::Cpu, csky::PSR, PSR_RESET_VALUE)?;
        self.link
            .write_register_u32(RegisterSpace::Cpu, csky::VBR, 0)?;
        self.link
            .write_register_u32(RegisterSpace::Cpu, csky::PC, entry)?;
        Ok(())
    }
}

impl MemoryInterface for HadCore<'_> {
    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        let width = AccessWidth::widest_for(address, data.len(), self.params.max_access);
        self.link.read_memory(address, Xlen::X32, data, width)?;
        Ok(())
    }

    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let width = AccessWidth::widest_for(address, data.len(), self.params.max_access);
        self.link.write_memory(address, Xlen::X32, data, width)?;
        Ok(())
    }

    fn endian(&self) -> Endian {
        self.params.endian
    }
}

impl CoreInterface for HadCore<'_> {
    fn debug_arch(&self) -> DebugArch {
        DebugArch::Had
    }

    fn status(&mut self) -> Result<CoreStatus, Error> {
        let hsr = Hsr(self.read_had(had::HSR)?);
        tracing::trace!("{hsr:?}");

        Ok(match hsr.pm() {
            Hsr::DEBUG_MODE => {
                let status2 = if self.params.had_version >= 3 {
                    self.read_had(had::HSR2)?
                } else {
                    0
                };
                CoreStatus::Halted(StopEvent {
                    cause: hsr.cause(),
                    status: hsr.0,
                    status2,
                })
            }
            1 => CoreStatus::Sleeping,
            0 => CoreStatus::Running,
            _ => CoreStatus::Unknown,
        })
    }

    fn halt(&mut self, timeout: Duration) -> Result<(), Error> {
        let mut hcr = self.hcr()?;
        hcr.set_dr(true);
        self.write_had(had::HCR, hcr.0)?;

        self.wait_for_core_halted(timeout)?;

        hcr.set_dr(false);
        self.write_had(had::HCR, hcr.0)
    }

    fn run(&mut self) -> Result<(), Error> {
        self.set_fdb()?;

        let mut hcr = self.hcr()?;
        hcr.set_dr(false);
        hcr.set_tme(false);
        self.exit_debug(hcr)
    }

    fn step(&mut self, timeout: Duration) -> Result<(), Error> {
        self.set_fdb()?;
        self.write_had(had::HTCR, 1)?;

        let mut hcr = self.hcr()?;
        hcr.set_dr(false);
        hcr.set_tme(true);
        self.exit_debug(hcr)?;

        self.wait_for_core_halted(timeout)?;

        hcr.set_tme(false);
        self.write_had(had::HCR, hcr.0)
    }

    fn reset(&mut self, method: ResetMethod, halt: bool, timeout: Duration) -> Result<(), Error> {
        if method == ResetMethod::Soft {
            if !self.core_halted()? {
                self.halt(timeout)?;
            }
            self.soft_reset()?;
            return if halt { Ok(()) } else { self.run() };
        }

        let mut hcr = self.hcr()?;
        if halt {
            hcr.set_adr(true);
            self.write_had(had::HCR, hcr.0)?;
        }

        self.link.reset(method == ResetMethod::Line)?;

        if halt {
            self.wait_for_core_halted(timeout)?;
            hcr.set_adr(false);
            self.write_had(had::HCR, hcr.0)?;
        }
        Ok(())
    }

    fn read_core_reg(&mut self, register: &RegisterDescriptor) -> Result<RegisterValue, Error> {
        let mut buffer = vec![0u8; register.size_in_bytes()];
        match register.location {
            RegisterLocation::Cpu(number) => {
                self.link
                    .read_register(RegisterSpace::Cpu, number, &mut buffer)?;
            }
            RegisterLocation::Had(select) => {
                self.with_bank(select, |link, width| {
                    let number = HadAccess::read(select).encode(width);
                    Ok(link.read_register(RegisterSpace::Had, number, &mut buffer)?)
                })?;
            }
            _ => return Err(Error::InvalidRegister(register.id)),
        }
        Ok(register.value_from_le_bytes(&buffer))
    }

    fn write_core_reg(
        &mut self,
        register: &RegisterDescriptor,
        value: &RegisterValue,
    ) -> Result<(), Error> {
        register.check(value)?;
        let bytes = value.to_le_bytes(register.size_in_bytes());
        match register.location {
            RegisterLocation::Cpu(number) => {
                self.link.write_register(RegisterSpace::Cpu, number, &bytes)?;
            }
            RegisterLocation::Had(select) => {
                self.with_bank(select, |link, width| {
                    let number = HadAccess::write(select).encode(width);
                    Ok(link.write_register(RegisterSpace::Had, number, &bytes)?)
                })?;
            }
            _ => return Err(Error::InvalidRegister(register.id)),
        }
        Ok(())
    }

    fn available_breakpoint_units(&mut self) -> Result<usize, Error> {
        Ok(self.params.units.min(MAX_UNITS))
    }

    fn supports_data_match(&self, unit: usize) -> bool {
        unit < DATA_MATCH_UNITS
    }

    fn set_hw_breakpoint(&mut self, unit: usize, address: u64) -> Result<(), Error> {
        let (bab, bam) = Self::unit_registers(unit)?;
        self.write_had(bab, address as u32)?;
        self.write_had(bam, 0)?;
        self.set_mode(unit, MatchMode::Instruction)
    }

    fn set_hw_watchpoint(
        &mut self,
        unit: usize,
        address: u64,
        mask: u64,
        access: AccessKind,
    ) -> Result<(), Error> {
        if !self.supports_data_match(unit) {
            return Err(Error::NoHardwareSlot);
        }
        let (bab, bam) = Self::unit_registers(unit)?;
        self.write_had(bab, address as u32)?;
        self.write_had(bam, mask as u32)?;
        self.set_mode(unit, access.into())
    }

    fn clear_hw_unit(&mut self, unit: usize) -> Result<(), Error> {
        Self::unit_registers(unit)?;
        self.set_mode(unit, MatchMode::Disabled)
    }

    fn flush_cache(&mut self) -> Result<(), Error> {
        self.link
            .write_register_u32(RegisterSpace::Cpu, CFR, CFR_INVALIDATE_ALL)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(HadAccess::read(had::HSR), HacrWidth::Bits8, 0x8e; "read hsr")]
    #[test_case(HadAccess::exit(had::HCR), HacrWidth::Bits8, 0x6d; "go ex hcr")]
    #[test_case(HadAccess::read(had::HSR), HacrWidth::Bits16, 0x8e00; "read hsr wide")]
    #[test_case(HadAccess::write(had::BAMC), HacrWidth::Bits16, 0x0110; "bank 1 wide")]
    #[test_case(HadAccess::exit(had::HCR), HacrWidth::Bits16, 0x6d00; "go ex wide")]
    fn hacr_encoding(access: HadAccess, width: HacrWidth, expected: u16) {
        assert_eq!(access.encode(width), expected);
        let bank = access.bank();
        assert_eq!(HadAccess::decode(expected, width, bank), access);
    }

    #[test]
    fn hsr_causes() {
        let mut hsr = Hsr(0);
        hsr.set_pm(Hsr::DEBUG_MODE);
        hsr.set_mbo(true);
        assert_eq!(hsr.cause(), StopCause::Hardware);

        hsr.set_swo(true);
        assert_eq!(hsr.cause(), StopCause::Software);

        assert_eq!(hsr.without_causes().cause(), StopCause::Unknown);
        assert_eq!(hsr.without_causes().pm(), Hsr::DEBUG_MODE);
    }

    #[test]
    fn unit_register_layout() {
        assert_eq!(HadCore::unit_registers(1).unwrap(), (had::BABB, had::BAMB));
        assert_eq!(HadCore::unit_registers(8).unwrap(), (0x2c, 0x2d));
        assert!(matches!(
            HadCore::unit_registers(9),
            Err(Error::NoHardwareSlot)
        ));
    }
}
