//! Run control through the RISC-V debug module (External Debug Support 0.13).

use std::time::{Duration, Instant};

use bitfield::bitfield;

use super::{CoreInterface, CoreStatus, ResetMethod, StopCause, StopEvent};
use crate::config::DebugArch;
use crate::link::{AccessWidth, Link, RegisterSpace, Xlen};
use crate::memory::MemoryInterface;
use crate::registers::riscv::{csr, dm, ABSTRACT_GPR_BASE};
use crate::registers::{RegisterCategory, RegisterDescriptor, RegisterLocation, RegisterValue};
use crate::watchpoint::AccessKind;
use crate::Error;

/// A register of the debug module with a fixed DMI address.
pub trait DebugRegister: Into<u32> + From<u32> {
    const ADDRESS: u8;
    const NAME: &'static str;
}

macro_rules! debug_register {
    ($name:ident, $address:expr, $display:literal) => {
        impl DebugRegister for $name {
            const ADDRESS: u8 = $address;
            const NAME: &'static str = $display;
        }

        impl From<$name> for u32 {
            fn from(register: $name) -> Self {
                register.0
            }
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }
    };
}

bitfield! {
    /// `dmcontrol` register, located at address 0x10
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Dmcontrol(u32);
    impl Debug;

    pub haltreq, set_haltreq: 31;
    pub resumereq, set_resumereq: 30;
    pub hartreset, set_hartreset: 29;
    pub ackhavereset, set_ackhavereset: 28;
    pub hasel, set_hasel: 26;
    pub hartsello, set_hartsello: 25, 16;
    pub hartselhi, set_hartselhi: 15, 6;
    pub setresethaltreq, set_setresethaltreq: 3;
    pub clrresethaltreq, set_clrresethaltreq: 2;
    pub ndmreset, set_ndmreset: 1;
    pub dmactive, set_dmactive: 0;
}

debug_register!(Dmcontrol, dm::DMCONTROL, "dmcontrol");

impl Dmcontrol {
    /// The selected hart index.
    pub fn hartsel(&self) -> usize {
        ((self.hartselhi() << 10) | self.hartsello()) as usize
    }
}

bitfield! {
    /// `dmstatus` register, located at address 0x11
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Dmstatus(u32);
    impl Debug;

    pub impebreak, set_impebreak: 22;
    pub allhavereset, set_allhavereset: 19;
    pub anyhavereset, set_anyhavereset: 18;
    pub allresumeack, set_allresumeack: 17;
    pub anyresumeack, set_anyresumeack: 16;
    pub allnonexistent, set_allnonexistent: 15;
    pub anynonexistent, set_anynonexistent: 14;
    pub allunavail, set_allunavail: 13;
    pub anyunavail, set_anyunavail: 12;
    pub allrunning, set_allrunning: 11;
    pub anyrunning, set_anyrunning: 10;
    pub allhalted, set_allhalted: 9;
    pub anyhalted, set_anyhalted: 8;
    pub authenticated, set_authenticated: 7;
    pub authbusy, set_authbusy: 6;
    pub hasresethaltreq, set_hasresethaltreq: 5;
    pub confstrptrvalid, set_confstrptrvalid: 4;
    pub version, set_version: 3, 0;
}

debug_register!(Dmstatus, dm::DMSTATUS, "dmstatus");

bitfield! {
    /// `abstractcs` register, located at address 0x16
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Abstractcs(u32);
    impl Debug;

    pub progbufsize, set_progbufsize: 28, 24;
    pub busy, set_busy: 12;
    pub u8, cmderr, set_cmderr: 10, 8;
    pub datacount, set_datacount: 3, 0;
}

debug_register!(Abstractcs, dm::ABSTRACTCS, "abstractcs");

bitfield! {
    /// Access register abstract command, written to `command`.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct AccessRegisterCommand(u32);
    impl Debug;

    pub u8, cmd_type, set_cmd_type: 31, 24;
    pub u8, aarsize, set_aarsize: 22, 20;
    pub postincrement, set_postincrement: 19;
    pub postexec, set_postexec: 18;
    pub transfer_bit, set_transfer: 17;
    pub write, set_write: 16;
    pub u16, regno, set_regno: 15, 0;
}

debug_register!(AccessRegisterCommand, dm::COMMAND, "command");

impl AccessRegisterCommand {
    /// A transfer of `bits` wide register `regno`.
    pub fn transfer(regno: u16, bits: u32, write: bool) -> Result<Self, Error> {
        let mut command = AccessRegisterCommand(0);
        command.set_aarsize(aarsize(bits)?);
        command.set_transfer(true);
        command.set_write(write);
        command.set_regno(regno);
        Ok(command)
    }

    /// Size of the transfer in bits.
    pub fn size_in_bits(&self) -> u32 {
        8 << self.aarsize()
    }
}

fn aarsize(bits: u32) -> Result<u8, Error> {
    match bits {
        32 => Ok(2),
        64 => Ok(3),
        128 => Ok(4),
        other => Err(anyhow::anyhow!("unsupported abstract access size of {other} bits").into()),
    }
}

bitfield! {
    /// The `dcsr` CSR.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Dcsr(u32);
    impl Debug;

    pub u8, xdebugver, set_xdebugver: 31, 28;
    pub ebreakm, set_ebreakm: 15;
    pub ebreaks, set_ebreaks: 13;
    pub ebreaku, set_ebreaku: 12;
    pub stepie, set_stepie: 11;
    pub u8, cause, set_cause: 8, 6;
    pub step, set_step: 2;
    pub u8, prv, set_prv: 1, 0;
}

raw_register!(Dcsr, u32);

impl Dcsr {
    /// Why the hart entered debug mode.
    pub fn stop_cause(&self) -> StopCause {
        match self.cause() {
            1 => StopCause::Software,
            2 => StopCause::Hardware,
            3 | 5 => StopCause::Request,
            4 => StopCause::Step,
            6 => StopCause::Peer,
            _ => StopCause::Unknown,
        }
    }
}

bitfield! {
    /// The xlen independent part of an address match trigger in `tdata1`.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Mcontrol(u64);
    impl Debug;

    pub u8, action, set_action: 15, 12;
    pub u8, match_mode, set_match_mode: 10, 7;
    pub m, set_m: 6;
    pub s, set_s: 4;
    pub u, set_u: 3;
    pub execute, set_execute: 2;
    pub store, set_store: 1;
    pub load, set_load: 0;
}

raw_register!(Mcontrol, u64);

impl Mcontrol {
    const TYPE_MCONTROL: u64 = 2;
    const ACTION_DEBUG_MODE: u8 = 1;
    const MATCH_EQUAL: u8 = 0;
    const MATCH_NAPOT: u8 = 1;

    /// A trigger entering debug mode in every privilege mode.
    pub fn new(xlen: Xlen, access: Option<AccessKind>, napot: bool) -> Self {
        let bits = xlen.bits();
        let mut mcontrol = Mcontrol(
            (Self::TYPE_MCONTROL << (bits - 4)) | (1 << (bits - 5)),
        );
        mcontrol.set_action(Self::ACTION_DEBUG_MODE);
        mcontrol.set_match_mode(if napot {
            Self::MATCH_NAPOT
        } else {
            Self::MATCH_EQUAL
        });
        mcontrol.set_m(true);
        mcontrol.set_s(true);
        mcontrol.set_u(true);
        match access {
            None => mcontrol.set_execute(true),
            Some(AccessKind::Write) => mcontrol.set_store(true),
            Some(AccessKind::Read) => mcontrol.set_load(true),
            Some(AccessKind::Access) => {
                mcontrol.set_load(true);
                mcontrol.set_store(true);
            }
        }
        mcontrol
    }

    /// The `type` field of a `tdata1` value.
    pub fn trigger_type(tdata1: u64, xlen: Xlen) -> u8 {
        ((tdata1 >> (xlen.bits() - 4)) & 0xf) as u8
    }
}

/// Errors reported in `abstractcs.cmderr`.
#[derive(thiserror::Error, Debug, docsplay::Display, Clone, Copy, PartialEq, Eq)]
pub enum AbstractCommandError {
    /// An abstract command was issued while another one was running.
    Busy,
    /// The abstract command is not supported.
    NotSupported,
    /// An exception occurred while executing the abstract command.
    Exception,
    /// The hart was not in the required halt or run state.
    HaltResume,
    /// A bus error occurred during the abstract command.
    Bus,
    /// The abstract command failed for an unspecified reason.
    Other,
}

impl AbstractCommandError {
    /// Decodes `cmderr`, `None` when no error is pending.
    pub fn from_cmderr(cmderr: u8) -> Option<Self> {
        match cmderr {
            0 => None,
            1 => Some(AbstractCommandError::Busy),
            2 => Some(AbstractCommandError::NotSupported),
            3 => Some(AbstractCommandError::Exception),
            4 => Some(AbstractCommandError::HaltResume),
            5 => Some(AbstractCommandError::Bus),
            _ => Some(AbstractCommandError::Other),
        }
    }
}

#[derive(Debug)]
enum AbstractFailure {
    Command(AbstractCommandError),
    Other(Error),
}

impl From<Error> for AbstractFailure {
    fn from(error: Error) -> Self {
        AbstractFailure::Other(error)
    }
}

impl From<AbstractFailure> for Error {
    fn from(failure: AbstractFailure) -> Self {
        match failure {
            AbstractFailure::Command(error) => anyhow::Error::from(error).into(),
            AbstractFailure::Other(error) => error,
        }
    }
}

/// The most triggers probed by [`DmCore::count_triggers`].
pub const MAX_TRIGGERS: usize = 16;

const ABSTRACT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);
const MCOR_INVALIDATE_ALL: u32 = 0x33;
const S0: u16 = ABSTRACT_GPR_BASE + 8;
const EBREAK: u32 = 0x0010_0073;

/// Parameters of a hart behind a RISC-V debug module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmParams {
    pub xlen: Xlen,
    /// Number of trigger modules.
    pub triggers: usize,
    /// Let `ebreak` raise an exception in the target instead of halting.
    pub bkpt_exception: bool,
    pub max_access: AccessWidth,
    /// Hart index written to `dmcontrol.hartsel`.
    pub hart: usize,
}

impl Default for DmParams {
    fn default() -> Self {
        DmParams {
            xlen: Xlen::X32,
            triggers: 0,
            bkpt_exception: false,
            max_access: AccessWidth::Word,
            hart: 0,
        }
    }
}

/// A RISC-V hart reached through the debug module.
pub struct DmCore<'a> {
    link: &'a mut dyn Link,
    params: DmParams,
}

impl<'a> DmCore<'a> {
    pub fn new(link: &'a mut dyn Link, params: DmParams) -> Self {
        DmCore { link, params }
    }

    /// Reads a debug module register by DMI address.
    pub fn read_dm(&mut self, address: u8) -> Result<u32, Error> {
        Ok(self
            .link
            .read_register_u32(RegisterSpace::Dm, address.into())?)
    }

    /// Writes a debug module register by DMI address.
    pub fn write_dm(&mut self, address: u8, value: u32) -> Result<(), Error> {
        tracing::trace!("DM write {address:#04x} = {value:#010x}");
        Ok(self
            .link
            .write_register_u32(RegisterSpace::Dm, address.into(), value)?)
    }

    pub fn read_dm_register<R: DebugRegister>(&mut self) -> Result<R, Error> {
        let value = self.read_dm(R::ADDRESS)?;
        tracing::trace!("Read {} = {value:#010x}", R::NAME);
        Ok(R::from(value))
    }

    pub fn write_dm_register<R: DebugRegister>(&mut self, register: R) -> Result<(), Error> {
        self.write_dm(R::ADDRESS, register.into())
    }

    /// Points `dmcontrol.hartsel` at this hart. Status queries report the selected hart.
    pub fn select_hart(&mut self) -> Result<(), Error> {
        let dmcontrol = self.dmcontrol();
        self.write_dm_register(dmcontrol)
    }

    /// `dmcontrol` with `dmactive` set and the hart of this core selected.
    fn dmcontrol(&self) -> Dmcontrol {
        let hart = self.params.hart as u32;
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_hartsello(hart & 0x3ff);
        dmcontrol.set_hartselhi((hart >> 10) & 0x3ff);
        dmcontrol
    }

    fn execute_abstract_command(&mut self, command: u32) -> Result<(), AbstractFailure> {
        let mut clear = Abstractcs(0);
        clear.set_cmderr(0x7);
        self.write_dm_register(clear)?;

        self.write_dm(dm::COMMAND, command)?;

        let start = Instant::now();
        let abstractcs = loop {
            let abstractcs: Abstractcs = self.read_dm_register()?;
            if !abstractcs.busy() {
                break abstractcs;
            }
            if start.elapsed() > ABSTRACT_COMMAND_TIMEOUT {
                return Err(AbstractFailure::Other(Error::Timeout));
            }
        };

        match AbstractCommandError::from_cmderr(abstractcs.cmderr()) {
            None => Ok(()),
            Some(error) => {
                tracing::debug!("Abstract command {command:#010x} failed: {error}");
                self.write_dm_register(clear)?;
                Err(AbstractFailure::Command(error))
            }
        }
    }

    fn try_read_abstract(&mut self, regno: u16, bits: u32) -> Result<Vec<u8>, AbstractFailure> {
        let command = AccessRegisterCommand::transfer(regno, bits, false)?;
        self.execute_abstract_command(command.0)?;

        let mut bytes = Vec::with_capacity(bits as usize / 8);
        for n in 0..bits / 32 {
            let word = self.read_dm(dm::DATA0 + n as u8)?;
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        Ok(bytes)
    }

    fn try_write_abstract(
        &mut self,
        regno: u16,
        bits: u32,
        bytes: &[u8],
    ) -> Result<(), AbstractFailure> {
        let mut padded = bytes.to_vec();
        padded.resize(bits as usize / 8, 0);
        for (n, chunk) in padded.chunks_exact(4).enumerate() {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.write_dm(dm::DATA0 + n as u8, word)?;
        }

        let command = AccessRegisterCommand::transfer(regno, bits, true)?;
        self.execute_abstract_command(command.0)
    }

    /// Reads a register with the access register command. CSRs the debug module cannot
    /// transfer directly are read through the program buffer.
    pub fn read_abstract(&mut self, regno: u16, bits: u32) -> Result<Vec<u8>, Error> {
        match self.try_read_abstract(regno, bits) {
            Err(AbstractFailure::Command(AbstractCommandError::NotSupported))
                if regno < ABSTRACT_GPR_BASE =>
            {
                let value = self.read_csr_progbuf(regno)?;
                let mut bytes = value.to_le_bytes().to_vec();
                bytes.resize(bits as usize / 8, 0);
                Ok(bytes)
            }
            other => Ok(other?),
        }
    }

    /// Writes a register with the access register command, see [`DmCore::read_abstract`].
    pub fn write_abstract(&mut self, regno: u16, bits: u32, bytes: &[u8]) -> Result<(), Error> {
        match self.try_write_abstract(regno, bits, bytes) {
            Err(AbstractFailure::Command(AbstractCommandError::NotSupported))
                if regno < ABSTRACT_GPR_BASE =>
            {
                let mut word = [0u8; 8];
                let len = bytes.len().min(8);
                word[..len].copy_from_slice(&bytes[..len]);
                self.write_csr_progbuf(regno, u64::from_le_bytes(word))
            }
            other => Ok(other?),
        }
    }

    fn read_xlen_register(&mut self, regno: u16) -> Result<u64, Error> {
        let bits = self.params.xlen.bits();
        let bytes = self.read_abstract(regno, bits)?;
        let mut word = [0u8; 8];
        word[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
        Ok(u64::from_le_bytes(word))
    }

    fn write_xlen_register(&mut self, regno: u16, value: u64) -> Result<(), Error> {
        let bits = self.params.xlen.bits();
        let bytes = value.to_le_bytes();
        self.write_abstract(regno, bits, &bytes[..bits as usize / 8])
    }

    fn run_progbuf(&mut self, instruction: u32) -> Result<(), Error> {
        self.write_dm(dm::PROGBUF0, instruction)?;
        self.write_dm(dm::PROGBUF0 + 1, EBREAK)?;

        let mut postexec = AccessRegisterCommand(0);
        postexec.set_postexec(true);
        Ok(self.execute_abstract_command(postexec.0)?)
    }

    fn read_csr_progbuf(&mut self, address: u16) -> Result<u64, Error> {
        tracing::debug!("Reading CSR {address:#05x} through the program buffer");
        let s0 = self.read_xlen_register(S0)?;

        // csrrs s0, <csr>, x0
        let csrrs = 0b_00000_010_01000_1110011 | ((u32::from(address) & 0xfff) << 20);
        let result = self
            .run_progbuf(csrrs)
            .and_then(|_| self.read_xlen_register(S0));

        self.write_xlen_register(S0, s0)?;
        result
    }

    fn write_csr_progbuf(&mut self, address: u16, value: u64) -> Result<(), Error> {
        tracing::debug!("Writing CSR {address:#05x} through the program buffer");
        let s0 = self.read_xlen_register(S0)?;
        self.write_xlen_register(S0, value)?;

        // csrrw x0, <csr>, s0
        let csrrw = 0b_01000_001_00000_1110011 | ((u32::from(address) & 0xfff) << 20);
        let result = self.run_progbuf(csrrw);

        self.write_xlen_register(S0, s0)?;
        result
    }

    fn read_csr32(&mut self, address: u16) -> Result<u32, Error> {
        let bytes = self.read_abstract(address, 32)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn write_csr32(&mut self, address: u16, value: u32) -> Result<(), Error> {
        self.write_abstract(address, 32, &value.to_le_bytes())
    }

    fn dcsr(&mut self) -> Result<Dcsr, Error> {
        Ok(Dcsr(self.read_csr32(csr::DCSR)?))
    }

    /// Transfer size for `register`. Integer registers wider than XLEN are capped.
    fn access_bits(&self, register: &RegisterDescriptor) -> u32 {
        let width = u32::from(register.width).max(32);
        if register.id.category == RegisterCategory::Float {
            width
        } else {
            width.min(self.params.xlen.bits())
        }
    }

    /// Probes the address width by reading `s0` with a 64 bit transfer.
    pub fn detect_xlen(&mut self) -> Result<Xlen, Error> {
        match self.try_read_abstract(S0, 64) {
            Ok(_) => Ok(Xlen::X64),
            Err(AbstractFailure::Command(_)) => Ok(Xlen::X32),
            Err(AbstractFailure::Other(error)) => Err(error),
        }
    }

    /// Counts the address match triggers by walking `tselect`.
    pub fn count_triggers(&mut self) -> Result<usize, Error> {
        let xlen = self.params.xlen;
        let mut count = 0;
        for index in 0..MAX_TRIGGERS as u64 {
            self.write_xlen_register(csr::TSELECT, index)?;
            if self.read_xlen_register(csr::TSELECT)? != index {
                break;
            }
            let tdata1 = self.read_xlen_register(csr::TDATA1)?;
            if Mcontrol::trigger_type(tdata1, xlen) == 0 {
                break;
            }
            count += 1;
        }
        tracing::debug!("Found {count} triggers");
        Ok(count)
    }

    fn program_trigger(&mut self, unit: usize, tdata1: u64, tdata2: u64) -> Result<(), Error> {
        if unit >= self.params.triggers {
            return Err(Error::NoHardwareSlot);
        }
        self.write_xlen_register(csr::TSELECT, unit as u64)?;
        // Disable first so a half written trigger never fires.
        self.write_xlen_register(csr::TDATA1, 0)?;
        self.write_xlen_register(csr::TDATA2, tdata2)?;
        self.write_xlen_register(csr::TDATA1, tdata1)
    }

    fn pulse_reset(&mut self, halt: bool) -> Result<(), Error> {
        let mut dmcontrol = self.dmcontrol();
        dmcontrol.set_haltreq(halt);
        dmcontrol.set_ndmreset(true);
        self.write_dm_register(dmcontrol)?;

        let mut release = self.dmcontrol();
        release.set_haltreq(halt);
        self.write_dm_register(release)
    }
}

impl MemoryInterface for DmCore<'_> {
    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        let width = AccessWidth::widest_for(address, data.len(), self.params.max_access);
        self.link
            .read_memory(address, self.params.xlen, data, width)?;
        Ok(())
    }

    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let width = AccessWidth::widest_for(address, data.len(), self.params.max_access);
        self.link
            .write_memory(address, self.params.xlen, data, width)?;
        Ok(())
    }
}

impl CoreInterface for DmCore<'_> {
    fn debug_arch(&self) -> DebugArch {
        DebugArch::Dm
    }

    fn status(&mut self) -> Result<CoreStatus, Error> {
        let dmstatus: Dmstatus = self.read_dm_register()?;
        tracing::trace!("{dmstatus:?}");

        if dmstatus.allhalted() {
            let dcsr = self.dcsr()?;
            return Ok(CoreStatus::Halted(StopEvent {
                cause: dcsr.stop_cause(),
                status: dcsr.0,
                status2: dmstatus.0,
            }));
        }
        if dmstatus.allrunning() {
            return Ok(CoreStatus::Running);
        }
        Ok(CoreStatus::Unknown)
    }

    fn halt(&mut self, timeout: Duration) -> Result<(), Error> {
        let mut dmcontrol = self.dmcontrol();
        dmcontrol.set_haltreq(true);
        self.write_dm_register(dmcontrol)?;

        let result = self.wait_for_core_halted(timeout);

        // clear the halt request
        let dmcontrol = self.dmcontrol();
        self.write_dm_register(dmcontrol)?;

        result
    }

    fn run(&mut self) -> Result<(), Error> {
        let mut dcsr = self.dcsr()?;
        let ebreak_halts = !self.params.bkpt_exception;
        dcsr.set_ebreakm(ebreak_halts);
        dcsr.set_ebreaks(ebreak_halts);
        dcsr.set_ebreaku(ebreak_halts);
        dcsr.set_step(false);
        self.write_csr32(csr::DCSR, dcsr.0)?;

        let mut dmcontrol = self.dmcontrol();
        dmcontrol.set_resumereq(true);
        self.write_dm_register(dmcontrol)?;

        let status: Dmstatus = self.read_dm_register()?;

        // clear resume request
        let dmcontrol = self.dmcontrol();
        self.write_dm_register(dmcontrol)?;

        if !status.allresumeack() {
            return Err(anyhow::anyhow!("the hart did not acknowledge the resume request").into());
        }
        Ok(())
    }

    fn step(&mut self, timeout: Duration) -> Result<(), Error> {
        let mut dcsr = self.dcsr()?;
        let ebreak_halts = !self.params.bkpt_exception;
        dcsr.set_ebreakm(ebreak_halts);
        dcsr.set_ebreaks(ebreak_halts);
        dcsr.set_ebreaku(ebreak_halts);
        dcsr.set_step(true);
        self.write_csr32(csr::DCSR, dcsr.0)?;

        let mut dmcontrol = self.dmcontrol();
        dmcontrol.set_resumereq(true);
        self.write_dm_register(dmcontrol)?;
        let dmcontrol = self.dmcontrol();
        self.write_dm_register(dmcontrol)?;

        self.wait_for_core_halted(timeout)?;

        let mut dcsr = self.dcsr()?;
        dcsr.set_step(false);
        self.write_csr32(csr::DCSR, dcsr.0)
    }

    fn reset(&mut self, method: ResetMethod, halt: bool, timeout: Duration) -> Result<(), Error> {
        match method {
            ResetMethod::Soft => {
                tracing::debug!("Resetting hart, setting hartreset bit");
                let mut dmcontrol = self.dmcontrol();
                dmcontrol.set_haltreq(halt);
                dmcontrol.set_hartreset(true);
                self.write_dm_register(dmcontrol)?;

                // Read back register to verify reset is supported
                let readback: Dmcontrol = self.read_dm_register()?;
                if readback.hartreset() {
                    let mut release = self.dmcontrol();
                    release.set_haltreq(halt);
                    self.write_dm_register(release)?;
                } else {
                    tracing::debug!("Hartreset bit not supported, using ndmreset");
                    self.pulse_reset(halt)?;
                }
            }
            ResetMethod::System => self.pulse_reset(halt)?,
            ResetMethod::Line => {
                if halt {
                    let mut dmcontrol = self.dmcontrol();
                    dmcontrol.set_haltreq(true);
                    self.write_dm_register(dmcontrol)?;
                }
                self.link.reset(true)?;
            }
        }

        let result = if halt {
            self.wait_for_core_halted(timeout)
        } else {
            Ok(())
        };

        // acknowledge the reset, clear the halt request
        let mut dmcontrol = self.dmcontrol();
        dmcontrol.set_ackhavereset(true);
        self.write_dm_register(dmcontrol)?;

        result
    }

    fn read_core_reg(&mut self, register: &RegisterDescriptor) -> Result<RegisterValue, Error> {
        match register.location {
            RegisterLocation::Abstract(regno) => {
                let bits = self.access_bits(register);
                let bytes = self.read_abstract(regno, bits)?;
                Ok(register.value_from_le_bytes(&bytes))
            }
            RegisterLocation::Privilege => Ok(RegisterValue::U8(self.dcsr()?.prv())),
            RegisterLocation::Dm(address) => {
                let value = self.read_dm(address)?;
                Ok(register.value_from_le_bytes(&value.to_le_bytes()))
            }
            RegisterLocation::Cpu(number) => {
                let mut buffer = vec![0u8; register.size_in_bytes()];
                self.link
                    .read_register(RegisterSpace::Cpu, number, &mut buffer)?;
                Ok(register.value_from_le_bytes(&buffer))
            }
            RegisterLocation::Had(_) => Err(Error::InvalidRegister(register.id)),
        }
    }

    fn write_core_reg(
        &mut self,
        register: &RegisterDescriptor,
        value: &RegisterValue,
    ) -> Result<(), Error> {
        register.check(value)?;
        match register.location {
            RegisterLocation::Abstract(regno) => {
                let bits = self.access_bits(register);
                let bytes = value.to_le_bytes(bits as usize / 8);
                self.write_abstract(regno, bits, &bytes)
            }
            RegisterLocation::Privilege => {
                let mut dcsr = self.dcsr()?;
                dcsr.set_prv(value.as_u64().unwrap_or_default() as u8);
                self.write_csr32(csr::DCSR, dcsr.0)
            }
            RegisterLocation::Dm(address) => {
                let bytes = value.to_le_bytes(4);
                self.write_dm(
                    address,
                    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                )
            }
            RegisterLocation::Cpu(number) => {
                let bytes = value.to_le_bytes(register.size_in_bytes());
                self.link.write_register(RegisterSpace::Cpu, number, &bytes)?;
                Ok(())
            }
            RegisterLocation::Had(_) => Err(Error::InvalidRegister(register.id)),
        }
    }

    fn available_breakpoint_units(&mut self) -> Result<usize, Error> {
        Ok(self.params.triggers)
    }

    fn supports_data_match(&self, unit: usize) -> bool {
        unit < self.params.triggers
    }

    fn set_hw_breakpoint(&mut self, unit: usize, address: u64) -> Result<(), Error> {
        let mcontrol = Mcontrol::new(self.params.xlen, None, false);
        self.program_trigger(unit, mcontrol.0, address)
    }

    fn set_hw_watchpoint(
        &mut self,
        unit: usize,
        address: u64,
        mask: u64,
        access: AccessKind,
    ) -> Result<(), Error> {
        let napot = mask != 0;
        let mcontrol = Mcontrol::new(self.params.xlen, Some(access), napot);
        let tdata2 = if napot {
            (address & !mask) | (mask >> 1)
        } else {
            address
        };
        self.program_trigger(unit, mcontrol.0, tdata2)
    }

    fn clear_hw_unit(&mut self, unit: usize) -> Result<(), Error> {
        if unit >= self.params.triggers {
            return Err(Error::NoHardwareSlot);
        }
        self.write_xlen_register(csr::TSELECT, unit as u64)?;
        self.write_xlen_register(csr::TDATA1, 0)
    }

    fn flush_cache(&mut self) -> Result<(), Error> {
        self.write_xlen_register(csr::MCOR, MCOR_INVALIDATE_ALL.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn access_register_command_encoding() {
        let command = AccessRegisterCommand::transfer(S0, 64, false).unwrap();
        assert_eq!(command.0, 0x0032_1008);
        assert_eq!(command.size_in_bits(), 64);
        assert!(command.transfer_bit());
        assert!(!command.write());

        let command = AccessRegisterCommand::transfer(csr::DCSR, 32, true).unwrap();
        assert_eq!(command.0, 0x0023_07b0);

        assert!(AccessRegisterCommand::transfer(S0, 16, false).is_err());
    }

    #[test_case(Xlen::X32, None, false, 0x2800_105c; "execute rv32")]
    #[test_case(Xlen::X32, Some(AccessKind::Write), true, 0x2800_10da; "store napot rv32")]
    #[test_case(Xlen::X64, Some(AccessKind::Access), false, 0x2800_0000_0000_105b; "access rv64")]
    fn mcontrol_encoding(xlen: Xlen, access: Option<AccessKind>, napot: bool, expected: u64) {
        let mcontrol = Mcontrol::new(xlen, access, napot);
        assert_eq!(mcontrol.0, expected);
        assert_eq!(Mcontrol::trigger_type(mcontrol.0, xlen), 2);
    }

    #[test_case(1, StopCause::Software)]
    #[test_case(2, StopCause::Hardware)]
    #[test_case(3, StopCause::Request)]
    #[test_case(4, StopCause::Step)]
    #[test_case(5, StopCause::Request)]
    #[test_case(6, StopCause::Peer)]
    #[test_case(0, StopCause::Unknown)]
    fn dcsr_causes(cause: u8, expected: StopCause) {
        let mut dcsr = Dcsr(0x4000_0003);
        dcsr.set_cause(cause);
        assert_eq!(dcsr.stop_cause(), expected);
        assert_eq!(dcsr.prv(), 3);
    }

    #[test]
    fn cmderr_decoding() {
        assert_eq!(AbstractCommandError::from_cmderr(0), None);
        assert_eq!(
            AbstractCommandError::from_cmderr(2),
            Some(AbstractCommandError::NotSupported)
        );
        assert_eq!(
            AbstractCommandError::from_cmderr(7),
            Some(AbstractCommandError::Other)
        );
    }

    #[test]
    fn hart_selection_spans_both_fields() {
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_hartsello(0x3ff);
        dmcontrol.set_hartselhi(0x1);
        assert_eq!(dmcontrol.hartsel(), 0x7ff);
    }
}
