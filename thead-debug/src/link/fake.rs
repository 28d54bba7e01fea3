#![allow(missing_docs)] // Don't require docs for test code
//! An in-memory [`Link`] that emulates a HAD or RISC-V debug module in front of a very small
//! CPU model. The CPU does not execute code; tests move it with [`FakeLink::execute_to`] and
//! [`FakeLink::access`], and the fake decides whether a trap or comparator stops it there.
//!
//! Clones share their state, so a test can keep a handle while the link is borrowed by a core.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::dm::{AccessRegisterCommand, Dcsr, Dmcontrol, Dmstatus, Mcontrol};
use crate::core::had::{HacrWidth, HadAccess, Hcr, Hsr, MatchMode, Scrcsr, MAX_UNITS};
use crate::core::CoreInterface;
use crate::flash::{FlashAlgorithm, FlashError, MemoryRegion, Sector};
use crate::identity::system_description::{
    SD_ADDRESS_REGISTER, SD_DATA_REGISTER, SD_ID_CPU_INFO, SD_MAGIC, T_HEAD_JEP106,
};
use crate::instruction::InstructionSet;
use crate::link::{
    AccessWidth, Link, LinkConfigKey, LinkDevice, LinkError, LinkState, RegisterSpace, Xlen,
    CKLINK_VENDOR_ID,
};
use crate::registers::riscv::{csr, dm, ABSTRACT_GPR_BASE};
use crate::registers::{csky, csky::had, RegisterDescriptor, RegisterValue};

/// `HID` of a single-core HAD v4 with four comparators.
pub const DEFAULT_HID: u32 = 0x0400_4231;
/// CPU select value that addresses the HAD top module.
pub const TOP_SELECT: u32 = crate::session::HAD_TOP_SELECT;
pub const DEFAULT_TRIGGERS: usize = 4;

const EBREAK: u32 = 0x0010_0073;
const C_EBREAK: u16 = 0x9002;
const CSKY_BKPT: [u8; 2] = [0x00, 0x00];

/// A single call into the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ReadMemory { address: u64, len: usize },
    WriteMemory { address: u64, data: Vec<u8> },
    ReadRegister { space: RegisterSpace, number: u16 },
    WriteRegister { space: RegisterSpace, number: u16, value: u64 },
    Reset { hard: bool },
    Config { key: LinkConfigKey, value: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    None,
    Request,
    Reset,
    Software,
    Hardware,
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Module {
    Had,
    Dm(Xlen),
}

#[derive(Debug, Clone)]
struct FakeCore {
    halted: bool,
    cause: Cause,
    pc: u64,
    gprs: [u64; 32],
    registers: BTreeMap<u16, u64>,
    cpuid: Vec<u32>,
    cpuid_index: usize,

    hcr: Hcr,
    htcr: u32,
    scrcsr: Scrcsr,
    /// `(bab, bam)` per comparator.
    comparators: [(u32, u32); MAX_UNITS],

    dcsr: Dcsr,
    tselect: u64,
    /// `(tdata1, tdata2)` per trigger.
    triggers: Vec<(u64, u64)>,
    resumeack: bool,
    havereset: bool,
}

impl FakeCore {
    fn new(cpuid: Vec<u32>, triggers: usize, xlen: Xlen) -> Self {
        let idle_trigger = 2u64 << (xlen.bits() - 4);
        let mut dcsr = Dcsr::from(0x4000_0003);
        dcsr.set_ebreakm(true);
        FakeCore {
            halted: false,
            cause: Cause::None,
            pc: 0,
            gprs: [0; 32],
            registers: BTreeMap::new(),
            cpuid,
            cpuid_index: 0,
            hcr: Hcr::from(0),
            htcr: 0,
            scrcsr: Scrcsr::from(0),
            comparators: [(0, 0); MAX_UNITS],
            dcsr,
            tselect: 0,
            triggers: vec![(idle_trigger, 0); triggers],
            resumeack: false,
            havereset: false,
        }
    }

    fn next_cpuid(&mut self) -> u32 {
        if self.cpuid.is_empty() {
            return 0;
        }
        let word = self.cpuid[self.cpuid_index % self.cpuid.len()];
        self.cpuid_index += 1;
        word
    }

    fn stop(&mut self, cause: Cause) {
        self.halted = true;
        self.cause = cause;
        self.resumeack = false;
        let dcsr_cause = match cause {
            Cause::Software => 1,
            Cause::Hardware => 2,
            Cause::Request => 3,
            Cause::Step => 4,
            Cause::Reset => 5,
            Cause::None => 0,
        };
        self.dcsr.set_cause(dcsr_cause);
    }

    fn hsr(&self) -> Hsr {
        let mut hsr = Hsr::from(0);
        if !self.halted {
            return hsr;
        }
        hsr.set_pm(Hsr::DEBUG_MODE);
        match self.cause {
            Cause::Request => hsr.set_dro(true),
            Cause::Reset => hsr.set_adro(true),
            Cause::Software => hsr.set_swo(true),
            Cause::Hardware => hsr.set_mbo(true),
            Cause::Step => hsr.set_to(true),
            Cause::None => {}
        }
        hsr
    }

    fn had_mode(&self, unit: usize) -> u8 {
        match unit {
            0 => self.hcr.mode_a(),
            1 => self.hcr.mode_b(),
            _ if self.hcr.extra_units() & (1 << (unit - 2)) != 0 => MatchMode::Instruction as u8,
            _ => MatchMode::Disabled as u8,
        }
    }

    fn reset(&mut self, halt: bool) {
        self.pc = 0;
        self.gprs = [0; 32];
        self.hcr.set_mode_a(0);
        self.hcr.set_mode_b(0);
        self.hcr.set_extra_units(0);
        for trigger in &mut self.triggers {
            trigger.0 &= !0xfff;
        }
        self.havereset = true;
        if halt {
            self.stop(Cause::Reset);
        } else {
            self.halted = false;
            self.cause = Cause::None;
        }
    }
}

/// Comparator select values of the HAD register file.
fn had_comparator(select: u8) -> Option<(usize, bool)> {
    match select {
        had::BABA => Some((0, false)),
        had::BAMA => Some((0, true)),
        had::BABB => Some((1, false)),
        had::BAMB => Some((1, true)),
        _ if select >= had::BABC && select < had::BABC + 2 * (MAX_UNITS as u8 - 2) => {
            let offset = select - had::BABC;
            Some((2 + usize::from(offset / 2), offset % 2 == 1))
        }
        _ => None,
    }
}

fn napot_range(tdata2: u64) -> Range<u64> {
    let ones = tdata2.trailing_ones();
    let size = 1u64 << (ones + 1).min(63);
    let base = tdata2 & !(size - 1);
    base..base + size
}

fn overlaps(range: &Range<u64>, address: u64, len: u32) -> bool {
    range.start < address + u64::from(len) && address < range.end
}

#[derive(Debug)]
struct FakeState {
    module: Module,
    memory: BTreeMap<u64, u8>,
    cores: Vec<FakeCore>,
    focus: usize,
    operations: Vec<Operation>,
    fail_next: Option<LinkError>,
    devices: Vec<LinkDevice>,
    clock: u32,

    hid: u32,
    hacr_width: HacrWidth,
    bsel: u8,
    top: Option<u32>,
    top_selected: bool,
    sd_table: Vec<u32>,
    sd_address: u32,

    dmcontrol: Dmcontrol,
    hart_valid: bool,
    cmderr: u8,
    data: [u32; 4],
    progbuf: [u32; 2],
}

impl FakeState {
    fn new(module: Module, cores: Vec<FakeCore>) -> Self {
        FakeState {
            module,
            memory: BTreeMap::new(),
            cores,
            focus: 0,
            operations: Vec::new(),
            fail_next: None,
            devices: vec![LinkDevice {
                vendor_id: CKLINK_VENDOR_ID,
                product_id: 0xb210,
                bcd_device: 0x0100,
                description: "CKLink-Lite".to_string(),
                serial_number: Some("FAKE0001".to_string()),
                state: LinkState::Idle,
            }],
            clock: 12_000,
            hid: DEFAULT_HID,
            hacr_width: HacrWidth::Bits8,
            bsel: 0,
            top: None,
            top_selected: false,
            sd_table: Vec::new(),
            sd_address: 0,
            dmcontrol: Dmcontrol::from(0),
            hart_valid: true,
            cmderr: 0,
            data: [0; 4],
            progbuf: [0; 2],
        }
    }

    fn check_failure(&mut self) -> Result<(), LinkError> {
        match self.fail_next.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn isa(&self) -> InstructionSet {
        match self.module {
            Module::Had => InstructionSet::CskyV2,
            Module::Dm(_) => InstructionSet::RiscV,
        }
    }

    fn xlen(&self) -> Xlen {
        match self.module {
            Module::Had => Xlen::X32,
            Module::Dm(xlen) => xlen,
        }
    }

    fn peek(&self, address: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|offset| {
                let address = address.wrapping_add(offset);
                self.memory.get(&address).copied().unwrap_or(0xff)
            })
            .collect()
    }

    fn poke(&mut self, address: u64, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            self.memory.insert(address.wrapping_add(offset as u64), *byte);
        }
    }

    fn core(&mut self) -> &mut FakeCore {
        let focus = self.focus.min(self.cores.len() - 1);
        &mut self.cores[focus]
    }

    fn instruction_length(&self, pc: u64) -> u64 {
        let parcel = self.peek(pc, 2);
        let parcel = u16::from_le_bytes([parcel[0], parcel[1]]);
        self.isa().instruction_length(parcel).into()
    }

    /// Decides whether the focused core stops when it reaches `pc`.
    fn arrive(&mut self, pc: u64) {
        let xlen = self.xlen();
        let trap = match self.module {
            Module::Had => self.peek(pc, 2) == CSKY_BKPT,
            Module::Dm(_) => {
                let bytes = self.peek(pc, 4);
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == EBREAK
                    || u16::from_le_bytes([bytes[0], bytes[1]]) == C_EBREAK
            }
        };
        let module = self.module;
        let core = self.core();
        core.pc = pc;
        if core.halted {
            return;
        }

        let trap_halts = match module {
            Module::Had => core.scrcsr.fdb(),
            Module::Dm(_) => core.dcsr.ebreakm(),
        };
        if trap && trap_halts {
            core.stop(Cause::Software);
            return;
        }

        let matched = match module {
            Module::Had => (0..MAX_UNITS).any(|unit| {
                core.had_mode(unit) == MatchMode::Instruction as u8
                    && u64::from(core.comparators[unit].0) == pc
            }),
            Module::Dm(_) => core.triggers.iter().any(|(tdata1, tdata2)| {
                let mcontrol = Mcontrol::from(*tdata1);
                Mcontrol::trigger_type(*tdata1, xlen) == 2
                    && mcontrol.execute()
                    && mcontrol.match_mode() == 0
                    && *tdata2 == pc
            }),
        };
        if matched {
            core.stop(Cause::Hardware);
        }
    }

    /// Decides whether a data access by the focused core hits a comparator.
    fn data_access(&mut self, pc: u64, address: u64, len: u32, is_store: bool) {
        let module = self.module;
        let xlen = self.xlen();
        let core = self.core();
        core.pc = pc;
        if core.halted {
            return;
        }

        let matched = match module {
            Module::Had => (0..2).any(|unit| {
                let (bab, bam) = core.comparators[unit];
                let mode = core.had_mode(unit);
                let kind_matches = mode == MatchMode::Access as u8
                    || (mode == MatchMode::Store as u8 && is_store)
                    || (mode == MatchMode::Load as u8 && !is_store);
                let mask = u64::from(bam);
                let base = u64::from(bab) & !mask;
                kind_matches && overlaps(&(base..base + mask + 1), address, len)
            }),
            Module::Dm(_) => core.triggers.iter().any(|(tdata1, tdata2)| {
                let mcontrol = Mcontrol::from(*tdata1);
                let kind_matches =
                    (mcontrol.store() && is_store) || (mcontrol.load() && !is_store);
                let range = if mcontrol.match_mode() == 1 {
                    napot_range(*tdata2)
                } else {
                    *tdata2..*tdata2 + 1
                };
                Mcontrol::trigger_type(*tdata1, xlen) == 2
                    && kind_matches
                    && overlaps(&range, address, len)
            }),
        };
        if matched {
            core.stop(Cause::Hardware);
        }
    }

    fn resume(&mut self) {
        let core = self.core();
        if !core.halted {
            return;
        }
        core.halted = false;
        core.cause = Cause::None;
        core.resumeack = true;
        let pc = core.pc;
        self.arrive(pc);
    }

    fn step(&mut self) {
        let pc = self.core().pc;
        let next = pc + self.instruction_length(pc);
        let core = self.core();
        core.pc = next;
        core.resumeack = true;
        core.stop(Cause::Step);
    }

    fn cpu_register(&mut self, number: u16) -> u64 {
        let core = self.core();
        match number {
            0..=15 => core.gprs[usize::from(number)],
            csky::PC => core.pc,
            csky::CPUID_REGISTER => core.next_cpuid().into(),
            _ => core.registers.get(&number).copied().unwrap_or_default(),
        }
    }

    fn set_cpu_register(&mut self, number: u16, value: u64) {
        let core = self.core();
        match number {
            0..=15 => core.gprs[usize::from(number)] = value,
            csky::PC => core.pc = value,
            _ => {
                core.registers.insert(number, value);
            }
        }
    }

    fn read_had(&mut self, number: u16) -> u32 {
        let access = HadAccess::decode(number, self.hacr_width, self.bsel);
        if access.select & 0x1f == had::BSEL {
            return self.bsel.into();
        }

        if self.top_selected {
            return match access.select {
                had::HID => self.top.unwrap_or(self.hid),
                SD_DATA_REGISTER => self
                    .sd_table
                    .get(self.sd_address as usize)
                    .copied()
                    .unwrap_or_default(),
                SD_ADDRESS_REGISTER => self.sd_address,
                _ => 0,
            };
        }

        let hid = self.hid;
        let core = self.core();
        match access.select {
            had::HID => hid,
            had::HSR => core.hsr().into(),
            had::HSR2 => 0,
            had::HCR => core.hcr.into(),
            had::HTCR => core.htcr,
            had::SCRCSR => core.scrcsr.into(),
            select => match had_comparator(select) {
                Some((unit, false)) => core.comparators[unit].0,
                Some((unit, true)) => core.comparators[unit].1,
                None => 0,
            },
        }
    }

    fn write_had(&mut self, number: u16, value: u32) {
        let access = HadAccess::decode(number, self.hacr_width, self.bsel);
        if access.select & 0x1f == had::BSEL && self.hacr_width == HacrWidth::Bits8 {
            self.bsel = value as u8;
            return;
        }

        if self.top_selected {
            if access.select == SD_ADDRESS_REGISTER {
                self.sd_address = value;
            }
            return;
        }

        let core = self.core();
        match access.select {
            had::HCR => {
                core.hcr = Hcr::from(value);
                if access.ex && access.go {
                    if core.hcr.tme() {
                        self.step();
                    } else {
                        self.resume();
                    }
                } else if core.hcr.dr() && !core.halted {
                    core.stop(Cause::Request);
                }
            }
            had::HTCR => core.htcr = value,
            had::SCRCSR => core.scrcsr = Scrcsr::from(value),
            select => match had_comparator(select) {
                Some((unit, false)) => core.comparators[unit].0 = value,
                Some((unit, true)) => core.comparators[unit].1 = value,
                None => {}
            },
        }
    }

    fn read_csr(&mut self, regno: u16) -> u64 {
        let core = self.core();
        match regno {
            regno if (ABSTRACT_GPR_BASE..ABSTRACT_GPR_BASE + 32).contains(&regno) => {
                core.gprs[usize::from(regno - ABSTRACT_GPR_BASE)]
            }
            csr::DPC => core.pc,
            csr::DCSR => u32::from(core.dcsr).into(),
            csr::TSELECT => core.tselect,
            csr::TDATA1 => core
                .triggers
                .get(core.tselect as usize)
                .map(|trigger| trigger.0)
                .unwrap_or_default(),
            csr::TDATA2 => core
                .triggers
                .get(core.tselect as usize)
                .map(|trigger| trigger.1)
                .unwrap_or_default(),
            csr::CPUID => core.next_cpuid().into(),
            csr::MVENDORID => T_HEAD_JEP106.into(),
            regno => core.registers.get(&regno).copied().unwrap_or_default(),
        }
    }

    fn write_csr(&mut self, regno: u16, value: u64) {
        let core = self.core();
        match regno {
            regno if regno == ABSTRACT_GPR_BASE => {}
            regno if (ABSTRACT_GPR_BASE..ABSTRACT_GPR_BASE + 32).contains(&regno) => {
                core.gprs[usize::from(regno - ABSTRACT_GPR_BASE)] = value;
            }
            csr::DPC => core.pc = value,
            csr::DCSR => {
                let cause = core.dcsr.cause();
                core.dcsr = Dcsr::from(value as u32);
                core.dcsr.set_cause(cause);
            }
            csr::TSELECT => {
                core.tselect = value.min(core.triggers.len().saturating_sub(1) as u64);
            }
            csr::TDATA1 => {
                if let Some(trigger) = core.triggers.get_mut(core.tselect as usize) {
                    trigger.0 = value;
                }
            }
            csr::TDATA2 => {
                if let Some(trigger) = core.triggers.get_mut(core.tselect as usize) {
                    trigger.1 = value;
                }
            }
            regno => {
                core.registers.insert(regno, value);
            }
        }
    }

    fn abstract_command(&mut self, value: u32) {
        if self.cmderr != 0 {
            return;
        }
        if !self.hart_valid || !self.core().halted {
            self.cmderr = 4;
            return;
        }

        let command = AccessRegisterCommand::from(value);
        if command.transfer_bit() {
            let bits = command.size_in_bits();
            if bits > self.xlen().bits() {
                self.cmderr = 2;
                return;
            }
            let regno = command.regno();
            if command.write() {
                let mut word = u64::from(self.data[0]);
                if bits == 64 {
                    word |= u64::from(self.data[1]) << 32;
                }
                self.write_csr(regno, word);
            } else {
                let word = self.read_csr(regno);
                self.data[0] = word as u32;
                if bits == 64 {
                    self.data[1] = (word >> 32) as u32;
                }
            }
        }

        if command.postexec() {
            self.execute_progbuf();
        }
    }

    /// Supports the two CSR transfers through `s0` the debug module driver emits.
    fn execute_progbuf(&mut self) {
        let instruction = self.progbuf[0];
        let address = (instruction >> 20) as u16;
        let s0 = ABSTRACT_GPR_BASE + 8;
        match instruction & 0x000f_ffff {
            // csrrs s0, csr, x0
            0x0000_2473 => {
                let value = self.read_csr(address);
                self.write_csr(s0, value);
            }
            // csrrw x0, csr, s0
            0x0004_1073 => {
                let value = self.read_csr(s0);
                self.write_csr(address, value);
            }
            _ => self.cmderr = 3,
        }
    }

    fn write_dmcontrol(&mut self, value: u32) {
        let dmcontrol = Dmcontrol::from(value);
        self.dmcontrol = dmcontrol;
        self.hart_valid = dmcontrol.hartsel() < self.cores.len();
        if self.hart_valid {
            self.focus = dmcontrol.hartsel();
        }
        if !dmcontrol.dmactive() {
            return;
        }

        if dmcontrol.ackhavereset() {
            self.core().havereset = false;
        }
        if dmcontrol.ndmreset() {
            for core in &mut self.cores {
                core.reset(dmcontrol.haltreq());
            }
            return;
        }
        if dmcontrol.hartreset() {
            self.core().reset(dmcontrol.haltreq());
            return;
        }
        if !self.hart_valid {
            return;
        }

        if dmcontrol.haltreq() {
            let core = self.core();
            if !core.halted {
                core.stop(Cause::Request);
            }
        } else if dmcontrol.resumereq() && self.core().halted {
            if self.core().dcsr.step() {
                self.step();
            } else {
                self.resume();
            }
        }
    }

    fn dmstatus(&mut self) -> u32 {
        let mut status = Dmstatus::from(0);
        status.set_version(2);
        status.set_authenticated(true);
        if !self.hart_valid {
            status.set_allnonexistent(true);
            status.set_anynonexistent(true);
            return status.into();
        }
        let core = self.core();
        status.set_allhalted(core.halted);
        status.set_anyhalted(core.halted);
        status.set_allrunning(!core.halted);
        status.set_anyrunning(!core.halted);
        status.set_allresumeack(core.resumeack);
        status.set_anyresumeack(core.resumeack);
        status.set_allhavereset(core.havereset);
        status.set_anyhavereset(core.havereset);
        status.into()
    }

    fn read_dm(&mut self, address: u8) -> u32 {
        match address {
            dm::DMCONTROL => self.dmcontrol.into(),
            dm::DMSTATUS => self.dmstatus(),
            dm::ABSTRACTCS => (2 << 24) | (u32::from(self.cmderr) << 8) | 2,
            address if (dm::DATA0..dm::DATA0 + 4).contains(&address) => {
                self.data[usize::from(address - dm::DATA0)]
            }
            _ => 0,
        }
    }

    fn write_dm(&mut self, address: u8, value: u32) {
        match address {
            dm::DMCONTROL => self.write_dmcontrol(value),
            dm::ABSTRACTCS => self.cmderr &= !((value >> 8) & 0x7) as u8,
            dm::COMMAND => self.abstract_command(value),
            address if (dm::DATA0..dm::DATA0 + 4).contains(&address) => {
                self.data[usize::from(address - dm::DATA0)] = value;
            }
            address if (dm::PROGBUF0..dm::PROGBUF0 + 2).contains(&address) => {
                self.progbuf[usize::from(address - dm::PROGBUF0)] = value;
            }
            _ => {}
        }
    }
}

/// A fake debug link for tests.
#[derive(Debug, Clone)]
pub struct FakeLink {
    state: Arc<Mutex<FakeState>>,
}

impl FakeLink {
    fn with_state(state: FakeState) -> Self {
        FakeLink {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A single C-SKY core behind HAD, identifying itself with `cpuid`.
    pub fn had(cpuid: u32) -> Self {
        Self::with_state(FakeState::new(
            Module::Had,
            vec![FakeCore::new(vec![cpuid], 0, Xlen::X32)],
        ))
    }

    /// Several C-SKY cores behind a HAD top module with a 16 bit HACR.
    pub fn had_top(cpuids: &[u32]) -> Self {
        let count = cpuids.len() as u32;
        let cores = cpuids
            .iter()
            .map(|cpuid| FakeCore::new(vec![*cpuid], 0, Xlen::X32))
            .collect();
        let mut state = FakeState::new(Module::Had, cores);
        state.top = Some((1 << 24) | (1 << 18) | (count << 8) | 0x31);
        state.top_selected = true;

        let header = (u32::from(SD_MAGIC) << 28)
            | (u32::from(T_HEAD_JEP106) << 16)
            | (u32::from(SD_ID_CPU_INFO) << 4)
            | 1;
        state.sd_table = vec![header, (4 << 4) | 1, 0, 0];
        for index in 0..count {
            let cpu_num = if index == 0 { count - 1 } else { index };
            let info = (cpu_num << 27) | (index << 23) | ((index / 2) << 15) | (1 << 8);
            state.sd_table.push(info);
        }
        Self::with_state(state)
    }

    /// A single RISC-V hart behind a debug module.
    pub fn dm(xlen: Xlen) -> Self {
        Self::dm_harts(xlen, 1)
    }

    pub fn dm_harts(xlen: Xlen, harts: usize) -> Self {
        let cores = (0..harts)
            .map(|_| FakeCore::new(Vec::new(), DEFAULT_TRIGGERS, xlen))
            .collect();
        Self::with_state(FakeState::new(Module::Dm(xlen), cores))
    }

    /// Replaces the trigger modules of every hart.
    pub fn with_triggers(self, triggers: usize) -> Self {
        {
            let mut state = self.lock();
            let xlen = state.xlen();
            for core in &mut state.cores {
                core.triggers = vec![(2u64 << (xlen.bits() - 4), 0); triggers];
            }
        }
        self
    }

    /// Sets the words returned by successive reads of the CPU id register of core `core`.
    pub fn set_cpuid(&self, core: usize, words: &[u32]) {
        let mut state = self.lock();
        state.cores[core].cpuid = words.to_vec();
        state.cores[core].cpuid_index = 0;
    }

    pub fn set_hid(&self, hid: u32) {
        self.lock().hid = hid;
    }

    /// Clears the JTAG enable bit of core `core` in the system description.
    pub fn disable_jtag(&self, core: usize) {
        let mut state = self.lock();
        if let Some(info) = state.sd_table.get_mut(4 + core) {
            *info &= !(1 << 8);
        }
    }

    /// Directs the test helpers below to core `core`.
    pub fn focus(&self, core: usize) {
        self.lock().focus = core;
    }

    pub fn poke(&self, address: u64, data: &[u8]) {
        self.lock().poke(address, data);
    }

    /// Reads memory. Unwritten bytes read as `0xff`.
    pub fn peek(&self, address: u64, len: usize) -> Vec<u8> {
        self.lock().peek(address, len)
    }

    pub fn pc(&self) -> u64 {
        self.lock().core().pc
    }

    pub fn set_pc(&self, pc: u64) {
        self.lock().core().pc = pc;
    }

    pub fn gpr(&self, n: usize) -> u64 {
        self.lock().core().gprs[n]
    }

    pub fn set_gpr(&self, n: usize, value: u64) {
        self.lock().core().gprs[n] = value;
    }

    pub fn is_halted(&self) -> bool {
        self.lock().core().halted
    }

    /// Lets the running core reach `pc`.
    pub fn execute_to(&self, pc: u64) {
        self.lock().arrive(pc);
    }

    /// Lets the running core execute a load or store at `pc` touching `len` bytes at
    /// `address`.
    pub fn access(&self, pc: u64, address: u64, len: u32, is_store: bool) {
        self.lock().data_access(pc, address, len, is_store);
    }

    /// Makes the next link call fail with `error`.
    pub fn fail_next(&self, error: LinkError) {
        self.lock().fail_next = Some(error);
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    pub fn set_devices(&self, devices: Vec<LinkDevice>) {
        self.lock().devices = devices;
    }
}

impl Link for FakeLink {
    fn name(&self) -> &str {
        "fake"
    }

    fn config(&mut self, key: LinkConfigKey, value: u32) -> Result<u32, LinkError> {
        let mut state = self.lock();
        state.check_failure()?;
        state.operations.push(Operation::Config { key, value });

        Ok(match key {
            LinkConfigKey::Clock => {
                state.clock = value;
                value
            }
            LinkConfigKey::GetLinkClock => state.clock,
            LinkConfigKey::HacrLength => {
                state.hacr_width = HacrWidth::from_bits(value as u8).ok_or(LinkError::Unsupported)?;
                value
            }
            LinkConfigKey::CpuSelect => {
                if value == TOP_SELECT {
                    state.top_selected = state.top.is_some();
                } else if (value as usize) < state.cores.len() {
                    state.top_selected = false;
                    state.focus = value as usize;
                } else {
                    return Err(LinkError::Unsupported);
                }
                value
            }
            _ => value,
        })
    }

    fn read_memory(
        &mut self,
        address: u64,
        _xlen: Xlen,
        data: &mut [u8],
        _width: AccessWidth,
    ) -> Result<(), LinkError> {
        let mut state = self.lock();
        state.check_failure()?;
        state.operations.push(Operation::ReadMemory {
            address,
            len: data.len(),
        });
        data.copy_from_slice(&state.peek(address, data.len()));
        Ok(())
    }

    fn write_memory(
        &mut self,
        address: u64,
        _xlen: Xlen,
        data: &[u8],
        _width: AccessWidth,
    ) -> Result<(), LinkError> {
        let mut state = self.lock();
        state.check_failure()?;
        state.operations.push(Operation::WriteMemory {
            address,
            data: data.to_vec(),
        });
        state.poke(address, data);
        Ok(())
    }

    fn read_register(
        &mut self,
        space: RegisterSpace,
        number: u16,
        data: &mut [u8],
    ) -> Result<(), LinkError> {
        let mut state = self.lock();
        state.check_failure()?;
        state
            .operations
            .push(Operation::ReadRegister { space, number });

        let value: u64 = match (space, state.module) {
            (RegisterSpace::Had, Module::Had) => state.read_had(number).into(),
            (RegisterSpace::Dm, Module::Dm(_)) => state.read_dm(number as u8).into(),
            (RegisterSpace::Cpu, _) => state.cpu_register(number),
            _ => return Err(LinkError::Unsupported),
        };
        let bytes = value.to_le_bytes();
        let len = data.len().min(8);
        data[..len].copy_from_slice(&bytes[..len]);
        Ok(())
    }

    fn write_register(
        &mut self,
        space: RegisterSpace,
        number: u16,
        data: &[u8],
    ) -> Result<(), LinkError> {
        let mut state = self.lock();
        state.check_failure()?;
        let mut bytes = [0u8; 8];
        let len = data.len().min(8);
        bytes[..len].copy_from_slice(&data[..len]);
        let value = u64::from_le_bytes(bytes);
        state.operations.push(Operation::WriteRegister {
            space,
            number,
            value,
        });

        match (space, state.module) {
            (RegisterSpace::Had, Module::Had) => state.write_had(number, value as u32),
            (RegisterSpace::Dm, Module::Dm(_)) => state.write_dm(number as u8, value as u32),
            (RegisterSpace::Cpu, _) => state.set_cpu_register(number, value),
            _ => return Err(LinkError::Unsupported),
        }
        Ok(())
    }

    fn reset(&mut self, hard: bool) -> Result<(), LinkError> {
        let mut state = self.lock();
        state.check_failure()?;
        state.operations.push(Operation::Reset { hard });

        let halt = match state.module {
            Module::Had => state.cores.first().is_some_and(|core| core.hcr.adr()),
            Module::Dm(_) => state.dmcontrol.haltreq(),
        };
        for core in &mut state.cores {
            core.reset(halt);
        }
        Ok(())
    }

    fn devices(&mut self) -> Result<Vec<LinkDevice>, LinkError> {
        let mut state = self.lock();
        state.check_failure()?;
        Ok(state.devices.clone())
    }
}

/// A flash algorithm that erases and programs through plain memory writes.
#[derive(Debug, Clone, Default)]
pub struct FakeFlash {
    regions: Vec<MemoryRegion>,
    erased: Vec<u64>,
    programmed: Vec<(u64, usize)>,
    loads: usize,
    pc: Option<RegisterDescriptor>,
}

impl FakeFlash {
    pub fn new(regions: Vec<MemoryRegion>) -> Self {
        FakeFlash {
            regions,
            ..FakeFlash::default()
        }
    }

    /// Lets the algorithm simulate instructions by advancing `pc` past them.
    pub fn simulating(mut self, pc: RegisterDescriptor) -> Self {
        self.pc = Some(pc);
        self
    }

    /// Sector addresses in erase order.
    pub fn erased(&self) -> Vec<u64> {
        self.erased.clone()
    }

    pub fn programmed(&self) -> Vec<(u64, usize)> {
        self.programmed.clone()
    }

    pub fn loads(&self) -> usize {
        self.loads
    }
}

impl FlashAlgorithm for FakeFlash {
    fn memory_map(&self) -> &[MemoryRegion] {
        &self.regions
    }

    fn destroyed_memory(&self) -> Option<Range<u64>> {
        None
    }

    fn destroyed_registers(&self) -> Vec<u16> {
        Vec::new()
    }

    fn load(&mut self, _core: &mut dyn CoreInterface) -> Result<(), FlashError> {
        self.loads += 1;
        Ok(())
    }

    fn erase_sector(
        &mut self,
        core: &mut dyn CoreInterface,
        sector: Sector,
    ) -> Result<(), FlashError> {
        core.write_8(sector.address, &vec![0xff; sector.size as usize])
            .map_err(|_| FlashError::Erase {
                address: sector.address,
                code: -1,
            })?;
        self.erased.push(sector.address);
        Ok(())
    }

    fn program(
        &mut self,
        core: &mut dyn CoreInterface,
        address: u64,
        data: &[u8],
    ) -> Result<(), FlashError> {
        core.write_8(address, data)
            .map_err(|_| FlashError::Program {
                address,
                length: data.len(),
                code: -1,
            })?;
        self.programmed.push((address, data.len()));
        Ok(())
    }

    fn can_simulate(&self, _instruction: &[u8]) -> bool {
        self.pc.is_some()
    }

    fn simulate_instruction(
        &mut self,
        core: &mut dyn CoreInterface,
        address: u64,
        instruction: &[u8],
    ) -> Result<bool, FlashError> {
        let Some(pc) = &self.pc else {
            return Ok(false);
        };
        let next = address + instruction.len() as u64;
        core.write_core_reg(pc, &RegisterValue::from(next as u32))
            .map_err(|_| FlashError::Simulation(address))?;
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn clones_share_memory() {
        let link = FakeLink::had(0x0480_0003);
        let handle = link.clone();
        link.poke(0x100, &[1, 2]);
        assert_eq!(handle.peek(0x100, 3), vec![1, 2, 0xff]);
    }

    #[test]
    fn failures_are_one_shot() {
        let mut link = FakeLink::dm(Xlen::X32);
        link.fail_next(LinkError::Timeout);
        assert_eq!(link.devices(), Err(LinkError::Timeout));
        assert_eq!(link.devices().unwrap().len(), 1);
    }

    #[test]
    fn operations_are_recorded() {
        let mut link = FakeLink::had(0x0480_0003);
        let mut data = [0u8; 2];
        link.read_memory(0x10, Xlen::X32, &mut data, AccessWidth::HalfWord)
            .unwrap();
        link.reset(true).unwrap();
        assert_eq!(
            link.operations(),
            vec![
                Operation::ReadMemory {
                    address: 0x10,
                    len: 2
                },
                Operation::Reset { hard: true },
            ]
        );
    }

    #[test]
    fn napot_ranges() {
        assert_eq!(napot_range(0x2001), 0x2000..0x2004);
        assert_eq!(napot_range(0x2003), 0x2000..0x2008);
        assert_eq!(napot_range(0x2000), 0x2000..0x2002);
    }
}
