//! The run control state machine of one CPU.
//!
//! [`CpuSessionState`] is everything the session remembers about a CPU between operations:
//! its identity, register catalog, breakpoints, watchpoints and the last known run state.
//! A [`Target`] borrows that record together with the link for the duration of one call and
//! drives the debug module through it.
//!
//! ```text
//!            halt                     resume
//! Unknown ---------> Halted <----------------------> Running
//!    ^                 |  ^   halt / trap / step
//!    |                 |  |
//!    |   reset         |  +---- DebugRunning (flash algorithm runs)
//!    +---------- Reset <+
//! ```

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::breakpoint::{Breakpoint, BreakpointKind, BreakpointManager};
use crate::config::TargetSettings;
use crate::core::{CoreInterface, CoreStatus, DebugModule, ResetMethod, StopCause, StopEvent};
use crate::fileio::{self, FileIoOperation, FileIoRequest};
use crate::flash::FlashAlgorithm;
use crate::identity::CpuIdentity;
use crate::instruction::InstructionSet;
use crate::link::{Link, Xlen};
use crate::memory::Endian;
use crate::registers::{
    RegisterCatalog, RegisterCategory, RegisterDescriptor, RegisterId, RegisterLocation,
    RegisterValue,
};
use crate::slots::SlotAllocator;
use crate::watchpoint::{AccessKind, TrappedAccess, Watchpoint, WatchpointManager};
use crate::Error;

/// How long run control operations wait for the core to enter debug mode.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// The run state of a CPU as tracked by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    /// No status has been read since connecting.
    Unknown,
    Running,
    Halted,
    /// A reset was issued and the core has not been seen since.
    Reset,
    /// The debugger is running a flash algorithm on the core.
    DebugRunning,
}

/// Why a CPU stopped, as reported to the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaltReason {
    /// The debugger asked for the halt.
    Request,
    Breakpoint,
    Watchpoint,
    SingleStep,
    /// The CPU is not halted.
    Running,
    /// The program asked the host for a file operation.
    FileIo,
    /// Another CPU of the same group halted.
    Peer,
    /// A flash breakpoint the flash algorithm can step over without rewriting the sector.
    SimulatedFlashBreakpoint,
    Undefined,
}

/// A snapshot describing a halt, produced by every status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HaltInfo {
    pub reason: HaltReason,
    pub pc: u64,
    pub xlen: Xlen,
    /// Index of the CPU that reported the halt.
    pub cpu: usize,
    /// HSR on HAD, `dcsr` on the RISC-V debug module.
    pub status: u32,
    /// HSR2 on HAD, `dmstatus` on the RISC-V debug module.
    pub status2: u32,
    /// Only set when `reason` is [`HaltReason::FileIo`].
    pub fileio: Option<FileIoRequest>,
    /// The address of the watchpoint that triggered, for [`HaltReason::Watchpoint`].
    pub watchpoint: Option<u64>,
}

impl HaltInfo {
    fn new(reason: HaltReason, pc: u64, xlen: Xlen, cpu: usize, event: Option<StopEvent>) -> Self {
        HaltInfo {
            reason,
            pc,
            xlen,
            cpu,
            status: event.map(|event| event.status).unwrap_or_default(),
            status2: event.map(|event| event.status2).unwrap_or_default(),
            fileio: None,
            watchpoint: None,
        }
    }

    /// The answer for a CPU that is executing code.
    pub fn running(cpu: usize, xlen: Xlen) -> Self {
        HaltInfo::new(HaltReason::Running, 0, xlen, cpu, None)
    }
}

/// The resets a front end can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetKind {
    /// Reset the CPU state through the debug module and run.
    Soft,
    /// System reset through the debug module and run.
    Hard,
    /// Pulse the nRESET line and run.
    NReset,
    /// Like [`ResetKind::Soft`], then stay halted.
    SoftHalt,
    /// Like [`ResetKind::Hard`], then stay halted.
    HardHalt,
}

impl ResetKind {
    /// How the debug module carries out this reset.
    pub fn method(self) -> ResetMethod {
        match self {
            ResetKind::Soft | ResetKind::SoftHalt => ResetMethod::Soft,
            ResetKind::Hard | ResetKind::HardHalt => ResetMethod::System,
            ResetKind::NReset => ResetMethod::Line,
        }
    }

    /// `true` if the CPU is caught in debug mode right after the reset.
    pub fn halts(self) -> bool {
        matches!(self, ResetKind::SoftHalt | ResetKind::HardHalt)
    }
}

/// Everything the session keeps about one CPU.
#[derive(Debug, Clone)]
pub struct CpuSessionState {
    index: usize,
    identity: CpuIdentity,
    debug: DebugModule,
    isa: InstructionSet,
    endian: Endian,
    xlen: Xlen,
    catalog: RegisterCatalog,
    run_state: RunState,
    last_halt: Option<HaltInfo>,
    tdesc: Option<Vec<u8>>,
    available: bool,
    ctrl_c_pending: bool,
    fileio_errno: i64,
    breakpoints: BreakpointManager,
    watchpoints: WatchpointManager,
    slots: SlotAllocator,
}

impl CpuSessionState {
    /// Creates the record of a reachable CPU.
    ///
    /// RISC-V harts are always little endian, `endian` only applies to C-SKY cores.
    pub fn new(
        index: usize,
        identity: CpuIdentity,
        debug: DebugModule,
        xlen: Xlen,
        endian: Endian,
    ) -> Self {
        let isa = if identity.arch.is_riscv() {
            InstructionSet::RiscV
        } else if identity.arch.is_abiv1() {
            InstructionSet::CskyV1
        } else {
            InstructionSet::CskyV2
        };
        let endian = if isa == InstructionSet::RiscV {
            Endian::Little
        } else {
            endian
        };
        let catalog = RegisterCatalog::build(&identity, xlen);

        CpuSessionState {
            index,
            identity,
            debug,
            isa,
            endian,
            xlen,
            catalog,
            run_state: RunState::Unknown,
            last_halt: None,
            tdesc: None,
            available: true,
            ctrl_c_pending: false,
            fileio_errno: 0,
            breakpoints: BreakpointManager::new(),
            watchpoints: WatchpointManager::new(),
            slots: SlotAllocator::new(debug.units()),
        }
    }

    /// Creates the record of a CPU that cannot be reached, so CPU numbering stays stable.
    pub fn unavailable(index: usize, debug: DebugModule) -> Self {
        let mut state = CpuSessionState::new(
            index,
            CpuIdentity::decode(&[]),
            debug,
            Xlen::X32,
            Endian::Little,
        );
        state.available = false;
        state.slots.reset(0);
        state
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn identity(&self) -> &CpuIdentity {
        &self.identity
    }

    pub fn debug_module(&self) -> &DebugModule {
        &self.debug
    }

    pub(crate) fn debug_module_mut(&mut self) -> &mut DebugModule {
        &mut self.debug
    }

    pub fn isa(&self) -> InstructionSet {
        self.isa
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn xlen(&self) -> Xlen {
        self.xlen
    }

    pub fn catalog(&self) -> &RegisterCatalog {
        &self.catalog
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// The halt reported by the last status query, `None` while running.
    pub fn last_halt(&self) -> Option<&HaltInfo> {
        self.last_halt.as_ref()
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// The target description override, if one was supplied.
    pub fn tdesc(&self) -> Option<&[u8]> {
        self.tdesc.as_deref()
    }

    pub fn set_tdesc(&mut self, tdesc: Option<Vec<u8>>) {
        self.tdesc = tdesc;
    }

    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    pub fn watchpoints(&self) -> &WatchpointManager {
        &self.watchpoints
    }

    /// Comparators not claimed by a breakpoint or watchpoint.
    pub fn free_hardware_units(&self) -> usize {
        self.slots.available()
    }

    /// Number of comparators of the debug module.
    pub fn hardware_units(&self) -> usize {
        self.slots.capacity()
    }

    fn pc_register(&self) -> Result<RegisterDescriptor, Error> {
        self.catalog
            .pc()
            .cloned()
            .ok_or_else(|| Error::RegisterNotFound("pc".to_string()))
    }

    fn read_u64(
        core: &mut dyn CoreInterface,
        register: &RegisterDescriptor,
    ) -> Result<u64, Error> {
        core.read_core_reg(register)?
            .as_u64()
            .ok_or(Error::InvalidRegister(register.id))
    }

    fn read_pc(&self, core: &mut dyn CoreInterface) -> Result<u64, Error> {
        Self::read_u64(core, &self.pc_register()?)
    }

    fn read_gpr(&self, core: &mut dyn CoreInterface, number: u8) -> Result<u64, Error> {
        let register = self
            .catalog
            .resolve(RegisterId::new(RegisterCategory::General, number.into()))?;
        Self::read_u64(core, &register)
    }

    fn halt_info(&self, reason: HaltReason, pc: u64, event: Option<StopEvent>) -> HaltInfo {
        HaltInfo::new(reason, pc, self.xlen, self.index, event)
    }

    fn enter_halted(&mut self, info: HaltInfo) -> HaltInfo {
        self.run_state = RunState::Halted;
        self.last_halt = Some(info.clone());
        info
    }

    /// Works out why the core stopped.
    fn classify(
        &mut self,
        core: &mut dyn CoreInterface,
        event: StopEvent,
    ) -> Result<HaltInfo, Error> {
        let pc = self.read_pc(core)?;
        let mut info = self.halt_info(HaltReason::Undefined, pc, Some(event));
        let breakpoint = self.breakpoints.find(pc).map(|b| b.kind);

        info.reason = match event.cause {
            StopCause::Request => HaltReason::Request,
            StopCause::Step => HaltReason::SingleStep,
            StopCause::Peer => HaltReason::Peer,
            StopCause::Software => {
                let request = if self.isa == InstructionSet::RiscV {
                    fileio::check_for_file_io(core, &self.catalog, pc, self.xlen)?
                } else {
                    None
                };
                match (request, breakpoint) {
                    (Some(request), _) => {
                        info.fileio = Some(request);
                        HaltReason::FileIo
                    }
                    (None, Some(BreakpointKind::Simulated)) => HaltReason::SimulatedFlashBreakpoint,
                    (None, _) => HaltReason::Breakpoint,
                }
            }
            StopCause::Hardware => {
                let hardware_hit = self
                    .breakpoints
                    .find(pc)
                    .is_some_and(|b| b.kind == BreakpointKind::Hardware && b.set);
                match self.trapped_watchpoint(core, pc, hardware_hit)? {
                    Some(address) => {
                        info.watchpoint = Some(address);
                        HaltReason::Watchpoint
                    }
                    None => HaltReason::Breakpoint,
                }
            }
            StopCause::Unknown if breakpoint.is_some() => HaltReason::Breakpoint,
            StopCause::Unknown => HaltReason::Undefined,
        };

        tracing::debug!(
            "CPU {} halted at {pc:#010x}: {:?} ({:?})",
            self.index,
            info.reason,
            event.cause
        );
        Ok(info)
    }

    /// Finds the watchpoint behind a comparator match, if the match was not the hardware
    /// breakpoint at `pc`.
    fn trapped_watchpoint(
        &self,
        core: &mut dyn CoreInterface,
        pc: u64,
        hardware_hit: bool,
    ) -> Result<Option<u64>, Error> {
        if hardware_hit || !self.watchpoints.iter().any(|w| w.set) {
            return Ok(None);
        }

        let access = self.decode_access(core, pc)?;
        let watchpoint = self
            .watchpoints
            .find_unique(access)
            .or_else(|| self.watchpoints.find_unique(None));
        Ok(watchpoint.map(|watchpoint| watchpoint.address))
    }

    /// Decodes the load or store at `pc` into the access it performed.
    fn decode_access(
        &self,
        core: &mut dyn CoreInterface,
        pc: u64,
    ) -> Result<Option<TrappedAccess>, Error> {
        let mut bytes = [0u8; 4];
        core.read_8(pc, &mut bytes)?;
        self.breakpoints.overlay(pc, &mut bytes);

        let Some(access) = self
            .isa
            .decode(&bytes, self.endian)
            .and_then(|(insn, length)| self.isa.decode_load_store(insn, length))
        else {
            tracing::debug!("No load or store at {pc:#010x}");
            return Ok(None);
        };

        let base = self.read_gpr(core, access.base)?;
        let index = match access.index {
            Some((register, _)) => self.read_gpr(core, register)?,
            None => 0,
        };
        let address = access.effective_address(base, index);
        tracing::trace!(
            "Trapped {} of {} bytes at {address:#010x}",
            if access.is_store { "store" } else { "load" },
            access.size
        );

        Ok(Some(TrappedAccess {
            address,
            length: access.size,
            is_store: access.is_store,
        }))
    }

    /// Registers a flash algorithm run clobbers, plus the program counter.
    fn clobbered_registers(
        &self,
        flash: &dyn FlashAlgorithm,
    ) -> Result<Vec<RegisterDescriptor>, Error> {
        let mut registers = flash
            .destroyed_registers()
            .into_iter()
            .map(|number| self.catalog.resolve_number(number))
            .collect::<Result<Vec<_>, _>>()?;
        registers.push(self.pc_register()?);
        Ok(registers)
    }

    fn sync_flash(
        &mut self,
        core: &mut dyn CoreInterface,
        flash: Option<&mut dyn FlashAlgorithm>,
        exclude: Option<u64>,
    ) -> Result<(), Error> {
        let flash = flash.ok_or(Error::FlashUnavailable)?;
        let registers = self.clobbered_registers(flash)?;

        let previous = self.run_state;
        self.run_state = RunState::DebugRunning;
        let result = tracing::debug_span!("flash_sync", cpu = self.index).in_scope(|| {
            self.breakpoints
                .sync_flash(core, flash, &registers, self.isa, exclude)
        });
        self.run_state = previous;
        result
    }

    /// Moves the core past a breakpoint or watchpoint at `pc` without re-triggering it.
    /// Returns `true` if the core executed an instruction.
    fn step_off(
        &mut self,
        core: &mut dyn CoreInterface,
        mut flash: Option<&mut dyn FlashAlgorithm>,
        pc: u64,
    ) -> Result<bool, Error> {
        let breakpoint: Option<Breakpoint> = self.breakpoints.find(pc).cloned();

        let stepped = match breakpoint {
            Some(breakpoint) if breakpoint.kind == BreakpointKind::Simulated && breakpoint.set => {
                let original = breakpoint.original.unwrap_or_default();
                let simulated = match flash.as_deref_mut() {
                    Some(flash) => flash.simulate_instruction(core, pc, &original)?,
                    None => false,
                };
                if !simulated {
                    tracing::debug!("Could not simulate the instruction at {pc:#010x}");
                    self.sync_flash(core, flash, Some(pc))?;
                    core.step(DEFAULT_TIMEOUT)?;
                }
                true
            }
            Some(breakpoint) if breakpoint.kind == BreakpointKind::Flash && breakpoint.set => {
                self.sync_flash(core, flash, Some(pc))?;
                core.step(DEFAULT_TIMEOUT)?;
                true
            }
            Some(breakpoint) if breakpoint.kind == BreakpointKind::Software && breakpoint.set => {
                let lifted = self.breakpoints.lift(core, pc, self.isa)?;
                match lifted {
                    Some(mut lifted) => {
                        lifted.step(DEFAULT_TIMEOUT)?;
                        lifted.finish()?;
                        true
                    }
                    None => false,
                }
            }
            Some(breakpoint) if breakpoint.kind == BreakpointKind::Hardware => {
                if self.breakpoints.suspend_hardware(core, pc)? {
                    core.step(DEFAULT_TIMEOUT)?;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        let after_watchpoint = self
            .last_halt
            .as_ref()
            .is_some_and(|info| info.reason == HaltReason::Watchpoint);
        if after_watchpoint {
            self.watchpoints.suspend(core)?;
            if !stepped {
                core.step(DEFAULT_TIMEOUT)?;
            }
            return Ok(true);
        }

        Ok(stepped)
    }

    /// Writes every breakpoint and watchpoint that is not yet in place.
    fn install(
        &mut self,
        core: &mut dyn CoreInterface,
        flash: Option<&mut dyn FlashAlgorithm>,
    ) -> Result<(), Error> {
        if self.breakpoints.needs_flash_sync() {
            self.sync_flash(core, flash, None)?;
        }
        self.breakpoints.install_software(core, self.isa)?;
        self.breakpoints.install_hardware(core)?;
        self.watchpoints.install(core)
    }

    /// The halt already reported for this stop, with the program counter and status words
    /// read again. The reason is kept, the hardware cause may be gone by now.
    fn refresh_last_halt(
        &mut self,
        core: &mut dyn CoreInterface,
        event: StopEvent,
    ) -> Result<Option<HaltInfo>, Error> {
        if self.run_state != RunState::Halted || self.last_halt.is_none() {
            return Ok(None);
        }
        let pc = self.read_pc(core)?;
        Ok(self.last_halt.as_mut().map(|info| {
            info.pc = pc;
            info.status = event.status;
            info.status2 = event.status2;
            info.clone()
        }))
    }

    fn require_halted(&self, operation: &'static str) -> Result<(), Error> {
        match self.run_state {
            RunState::Halted => Ok(()),
            state => Err(Error::InvalidState { operation, state }),
        }
    }

    fn poll(
        &mut self,
        core: &mut dyn CoreInterface,
        flash: Option<&mut dyn FlashAlgorithm>,
        settings: &TargetSettings,
    ) -> Result<HaltInfo, Error> {
        if self.ctrl_c_pending {
            self.ctrl_c_pending = false;
            let pc = self.read_pc(core)?;
            let info = self.halt_info(HaltReason::Request, pc, None);
            return Ok(self.enter_halted(info));
        }

        match core.status()? {
            CoreStatus::Running | CoreStatus::Sleeping => {
                if self.run_state != RunState::DebugRunning {
                    self.run_state = RunState::Running;
                }
                self.last_halt = None;
                Ok(HaltInfo::running(self.index, self.xlen))
            }
            CoreStatus::Unknown => {
                self.run_state = RunState::Unknown;
                self.last_halt = None;
                Ok(self.halt_info(HaltReason::Undefined, 0, None))
            }
            CoreStatus::Halted(event) => {
                if let Some(info) = self.refresh_last_halt(core, event)? {
                    return Ok(info);
                }

                let info = self.classify(core, event)?;
                let info = self.enter_halted(info);

                match info.fileio {
                    Some(request) if request.operation == FileIoOperation::Errno => {
                        tracing::debug!("Answering errno request with {}", self.fileio_errno);
                        fileio::complete(core, &self.catalog, info.pc, self.fileio_errno, self.xlen)?;
                        self.resume(core, flash, settings)?;
                        Ok(HaltInfo::running(self.index, self.xlen))
                    }
                    _ => Ok(info),
                }
            }
        }
    }

    fn halt(&mut self, core: &mut dyn CoreInterface) -> Result<HaltInfo, Error> {
        if self.run_state == RunState::Halted {
            if let CoreStatus::Halted(event) = core.status()? {
                if let Some(info) = self.refresh_last_halt(core, event)? {
                    return Ok(info);
                }
            }
        }

        core.halt(DEFAULT_TIMEOUT)?;

        match core.status()? {
            CoreStatus::Halted(event) => {
                let info = self.classify(core, event)?;
                Ok(self.enter_halted(info))
            }
            _ => Err(Error::Timeout),
        }
    }

    fn resume(
        &mut self,
        core: &mut dyn CoreInterface,
        mut flash: Option<&mut dyn FlashAlgorithm>,
        settings: &TargetSettings,
    ) -> Result<(), Error> {
        self.require_halted("resume")?;

        let pc = self.read_pc(core)?;
        self.step_off(core, reborrow(&mut flash), pc)?;
        self.install(core, flash)?;

        if settings.cache_flush {
            core.flush_cache()?;
        }
        core.run()?;

        self.run_state = RunState::Running;
        self.last_halt = None;
        Ok(())
    }

    fn single_step(
        &mut self,
        core: &mut dyn CoreInterface,
        flash: Option<&mut dyn FlashAlgorithm>,
    ) -> Result<HaltInfo, Error> {
        self.require_halted("step")?;

        let pc = self.read_pc(core)?;
        if !self.step_off(core, flash, pc)? {
            core.step(DEFAULT_TIMEOUT)?;
        }

        let event = match core.status()? {
            CoreStatus::Halted(event) => Some(event),
            _ => None,
        };
        let pc = self.read_pc(core)?;
        let info = self.halt_info(HaltReason::SingleStep, pc, event);
        Ok(self.enter_halted(info))
    }

    fn reset(
        &mut self,
        core: &mut dyn CoreInterface,
        kind: ResetKind,
    ) -> Result<Option<HaltInfo>, Error> {
        self.run_state = RunState::Reset;
        self.last_halt = None;
        self.ctrl_c_pending = false;

        tracing::debug_span!("reset", cpu = self.index, ?kind)
            .in_scope(|| core.reset(kind.method(), kind.halts(), DEFAULT_TIMEOUT))?;

        self.breakpoints.mark_comparators_cleared();
        self.watchpoints.mark_unset();

        if !kind.halts() {
            return Ok(None);
        }

        let event = match core.status()? {
            CoreStatus::Halted(event) => event,
            _ => return Err(Error::Timeout),
        };
        let pc = self.read_pc(core)?;
        let info = self.halt_info(HaltReason::Request, pc, Some(event));
        Ok(Some(self.enter_halted(info)))
    }

    fn check_register_access(
        &self,
        operation: &'static str,
        register: &RegisterDescriptor,
    ) -> Result<(), Error> {
        match (register.location, self.run_state) {
            (RegisterLocation::Had(_) | RegisterLocation::Dm(_), _) => Ok(()),
            (_, state @ (RunState::Running | RunState::DebugRunning | RunState::Reset)) => {
                Err(Error::InvalidState { operation, state })
            }
            _ => Ok(()),
        }
    }
}

fn reborrow<'s>(
    flash: &'s mut Option<&mut dyn FlashAlgorithm>,
) -> Option<&'s mut dyn FlashAlgorithm> {
    flash.as_mut().map(|flash| &mut **flash as &mut dyn FlashAlgorithm)
}

/// One CPU together with the link, borrowed for a sequence of operations.
pub struct Target<'a> {
    link: &'a mut dyn Link,
    cpu: &'a mut CpuSessionState,
    flash: Option<&'a mut dyn FlashAlgorithm>,
    settings: &'a TargetSettings,
}

impl<'a> Target<'a> {
    pub fn new(
        link: &'a mut dyn Link,
        cpu: &'a mut CpuSessionState,
        flash: Option<&'a mut dyn FlashAlgorithm>,
        settings: &'a TargetSettings,
    ) -> Self {
        Target {
            link,
            cpu,
            flash,
            settings,
        }
    }

    /// The session record of this CPU.
    pub fn state(&self) -> &CpuSessionState {
        self.cpu
    }

    pub fn run_state(&self) -> RunState {
        self.cpu.run_state
    }

    fn unavailable(&self) -> Result<(), Error> {
        if self.cpu.available {
            Ok(())
        } else {
            Err(Error::CpuUnavailable(self.cpu.index))
        }
    }

    /// Queries the core and reports why it is halted, or that it is running.
    ///
    /// A halt that was already reported is returned again without re-reading registers.
    #[tracing::instrument(skip_all, fields(cpu = self.cpu.index))]
    pub fn poll(&mut self) -> Result<HaltInfo, Error> {
        self.unavailable()?;
        let mut core = self.cpu.debug.attach(&mut *self.link);
        self.cpu
            .poll(&mut *core, reborrow(&mut self.flash), self.settings)
    }

    /// Polls until the core halts, failing with [`Error::Timeout`] after `timeout`.
    pub fn wait_for_halt(&mut self, timeout: Duration) -> Result<HaltInfo, Error> {
        let start = Instant::now();
        loop {
            let info = self.poll()?;
            if info.reason != HaltReason::Running {
                return Ok(info);
            }
            if start.elapsed() >= timeout {
                return Err(Error::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stops the core. Halting a halted core reports the existing halt.
    ///
    /// A link failure leaves the tracked state unchanged.
    #[tracing::instrument(skip_all, fields(cpu = self.cpu.index))]
    pub fn halt(&mut self) -> Result<HaltInfo, Error> {
        self.unavailable()?;
        let mut core = self.cpu.debug.attach(&mut *self.link);
        self.cpu.halt(&mut *core)
    }

    /// Installs pending breakpoints and watchpoints, then lets the core run.
    ///
    /// A core halted on a breakpoint is stepped past it first, with the breakpoint
    /// temporarily lifted.
    #[tracing::instrument(skip_all, fields(cpu = self.cpu.index))]
    pub fn resume(&mut self) -> Result<(), Error> {
        self.unavailable()?;
        let mut core = self.cpu.debug.attach(&mut *self.link);
        self.cpu
            .resume(&mut *core, reborrow(&mut self.flash), self.settings)
    }

    /// Executes one instruction.
    #[tracing::instrument(skip_all, fields(cpu = self.cpu.index))]
    pub fn single_step(&mut self) -> Result<HaltInfo, Error> {
        self.unavailable()?;
        let mut core = self.cpu.debug.attach(&mut *self.link);
        self.cpu.single_step(&mut *core, reborrow(&mut self.flash))
    }

    /// Resets the core. For the halting kinds the halt is returned.
    #[tracing::instrument(skip_all, fields(cpu = self.cpu.index, ?kind))]
    pub fn reset(&mut self, kind: ResetKind) -> Result<Option<HaltInfo>, Error> {
        self.unavailable()?;
        let mut core = self.cpu.debug.attach(&mut *self.link);
        self.cpu.reset(&mut *core, kind)
    }

    /// Reads a register. CPU registers need a halted core, debug module registers do not.
    pub fn read_register(&mut self, register: &RegisterDescriptor) -> Result<RegisterValue, Error> {
        self.unavailable()?;
        self.cpu.check_register_access("read register", register)?;
        let mut core = self.cpu.debug.attach(&mut *self.link);
        core.read_core_reg(register)
    }

    /// Writes a register, see [`Target::read_register`].
    pub fn write_register(
        &mut self,
        register: &RegisterDescriptor,
        value: &RegisterValue,
    ) -> Result<(), Error> {
        self.unavailable()?;
        self.cpu.check_register_access("write register", register)?;
        let mut core = self.cpu.debug.attach(&mut *self.link);
        core.write_core_reg(register, value)
    }

    /// Reads memory. Installed breakpoint traps read as the original instructions.
    pub fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        let mut core = self.cpu.debug.attach(&mut *self.link);
        core.read_8(address, data)?;
        self.cpu.breakpoints.overlay(address, data);
        Ok(())
    }

    /// Writes memory. Bytes under a breakpoint become its new original contents; installed
    /// traps stay in place.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let patched =
            self.cpu
                .breakpoints
                .patch_write(address, data, self.cpu.isa, self.cpu.endian)?;
        let mut core = self.cpu.debug.attach(&mut *self.link);
        core.write_8(address, &patched)
    }

    /// Adds a breakpoint. It is written to the target on the next resume.
    pub fn add_breakpoint(
        &mut self,
        address: u64,
        length: u32,
        kind: BreakpointKind,
    ) -> Result<Breakpoint, Error> {
        self.unavailable()?;
        let mut core = self.cpu.debug.attach(&mut *self.link);
        self.cpu
            .breakpoints
            .add(
                &mut self.cpu.slots,
                &mut *core,
                self.flash.as_deref().map(|flash| flash as &dyn FlashAlgorithm),
                address,
                length,
                kind,
            )
            .cloned()
    }

    pub fn remove_breakpoint(&mut self, address: u64) -> Result<(), Error> {
        let mut core = self.cpu.debug.attach(&mut *self.link);
        self.cpu
            .breakpoints
            .remove(&mut self.cpu.slots, &mut *core, address)
    }

    pub fn clear_breakpoints(&mut self) -> Result<(), Error> {
        let mut core = self.cpu.debug.attach(&mut *self.link);
        self.cpu.breakpoints.clear(&mut self.cpu.slots, &mut *core)
    }

    /// Adds a watchpoint on a comparator that can match data accesses.
    pub fn add_watchpoint(
        &mut self,
        address: u64,
        length: u32,
        access: AccessKind,
    ) -> Result<Watchpoint, Error> {
        self.unavailable()?;
        let core = self.cpu.debug.attach(&mut *self.link);
        self.cpu
            .watchpoints
            .add(
                &mut self.cpu.slots,
                |unit| core.supports_data_match(unit),
                address,
                length,
                access,
            )
            .cloned()
    }

    pub fn remove_watchpoint(&mut self, address: u64) -> Result<(), Error> {
        let mut core = self.cpu.debug.attach(&mut *self.link);
        self.cpu
            .watchpoints
            .remove(&mut self.cpu.slots, &mut *core, address)
    }

    pub fn clear_watchpoints(&mut self) -> Result<(), Error> {
        let mut core = self.cpu.debug.attach(&mut *self.link);
        self.cpu.watchpoints.clear(&mut self.cpu.slots, &mut *core)
    }

    /// Completes the file-I/O request the core is halted on.
    ///
    /// `retcode` is written to the return register and `errno` kept for a later errno
    /// request. With `ctrl_c` the core stays halted and the next poll reports a debug
    /// request; otherwise it resumes.
    #[tracing::instrument(skip(self))]
    pub fn fileio_end(&mut self, retcode: i64, errno: i64, ctrl_c: bool) -> Result<(), Error> {
        self.unavailable()?;
        let pc = match &self.cpu.last_halt {
            Some(info) if info.reason == HaltReason::FileIo => info.pc,
            _ => {
                return Err(Error::InvalidState {
                    operation: "fileio_end",
                    state: self.cpu.run_state,
                })
            }
        };

        let mut core = self.cpu.debug.attach(&mut *self.link);
        fileio::complete(&mut *core, &self.cpu.catalog, pc, retcode, self.cpu.xlen)?;
        self.cpu.fileio_errno = errno;

        if ctrl_c {
            self.cpu.ctrl_c_pending = true;
            self.cpu.last_halt = None;
            return Ok(());
        }
        self.cpu
            .resume(&mut *core, reborrow(&mut self.flash), self.settings)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::{DmParams, HadParams};
    use crate::identity::CpuArch;
    use crate::link::fake::FakeLink;
    use crate::link::LinkError;
    use pretty_assertions::assert_eq;

    const CK803: u32 = 0x0480_0003;

    fn had_cpu() -> CpuSessionState {
        CpuSessionState::new(
            0,
            CpuIdentity::decode(&[CK803]),
            DebugModule::Had(HadParams {
                units: 4,
                ..HadParams::default()
            }),
            Xlen::X32,
            Endian::Little,
        )
    }

    fn dm_cpu() -> CpuSessionState {
        CpuSessionState::new(
            0,
            CpuIdentity::riscv(CpuArch::Rv32, &[]),
            DebugModule::Dm(DmParams {
                triggers: 4,
                ..DmParams::default()
            }),
            Xlen::X32,
            Endian::Little,
        )
    }

    fn words(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    #[test]
    fn resume_then_halt_is_a_request() {
        let mut link = FakeLink::had(CK803);
        let settings = TargetSettings::default();
        let mut cpu = had_cpu();
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);

        assert_eq!(target.run_state(), RunState::Unknown);
        let info = target.halt().unwrap();
        assert_eq!(target.run_state(), RunState::Halted);

        target.resume().unwrap();
        assert_eq!(target.run_state(), RunState::Running);
        assert_eq!(target.poll().unwrap().reason, HaltReason::Running);

        let info2 = target.halt().unwrap();
        assert_eq!(info2.reason, HaltReason::Request);
        assert_eq!(info2.pc, info.pc);
        assert_eq!(target.run_state(), RunState::Halted);
        // halting again reports the same halt
        assert_eq!(target.halt().unwrap(), info2);
    }

    #[test]
    fn software_breakpoint_scenario() {
        let mut link = FakeLink::had(CK803);
        let handle = link.clone();
        handle.poke(0x1000, &[0x12, 0x34]);
        let settings = TargetSettings::default();
        let mut cpu = had_cpu();
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);
        target.halt().unwrap();

        let breakpoint = target
            .add_breakpoint(0x1000, 2, BreakpointKind::Software)
            .unwrap();
        assert_eq!(breakpoint.kind, BreakpointKind::Software);
        assert!(!breakpoint.set);

        let mut memory = [0u8; 2];
        target.read_memory(0x1000, &mut memory).unwrap();
        assert_eq!(memory, [0x12, 0x34]);

        target.resume().unwrap();
        assert_ne!(handle.peek(0x1000, 2), vec![0x12, 0x34]);
        // installed traps stay hidden
        target.read_memory(0x1000, &mut memory).unwrap();
        assert_eq!(memory, [0x12, 0x34]);

        handle.execute_to(0x1000);
        let info = target.poll().unwrap();
        assert_eq!(info.reason, HaltReason::Breakpoint);
        assert_eq!(info.pc, 0x1000);

        target.remove_breakpoint(0x1000).unwrap();
        assert_eq!(handle.peek(0x1000, 2), vec![0x12, 0x34]);
    }

    #[test]
    fn stepping_off_a_software_breakpoint() {
        let mut link = FakeLink::had(CK803);
        let handle = link.clone();
        handle.poke(0x1000, &[0x12, 0x34, 0x56, 0x78]);
        let settings = TargetSettings::default();
        let mut cpu = had_cpu();
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);
        target.halt().unwrap();

        target
            .add_breakpoint(0x1000, 2, BreakpointKind::Software)
            .unwrap();
        target.resume().unwrap();
        handle.execute_to(0x1000);
        assert_eq!(target.poll().unwrap().reason, HaltReason::Breakpoint);

        let info = target.single_step().unwrap();
        assert_eq!(info.reason, HaltReason::SingleStep);
        assert_eq!(info.pc, 0x1002);
        assert_eq!(handle.peek(0x1000, 2), vec![0x00, 0x00]);

        // resuming from the next instruction does not trap again
        target.resume().unwrap();
        assert!(!handle.is_halted());
    }

    #[test]
    fn resume_steps_over_the_breakpoint_it_stopped_at() {
        let mut link = FakeLink::had(CK803);
        let handle = link.clone();
        handle.poke(0x1000, &[0x12, 0x34]);
        let settings = TargetSettings::default();
        let mut cpu = had_cpu();
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);
        target.halt().unwrap();

        target
            .add_breakpoint(0x1000, 2, BreakpointKind::Hardware)
            .unwrap();
        target.resume().unwrap();
        handle.execute_to(0x1000);
        assert_eq!(target.poll().unwrap().reason, HaltReason::Breakpoint);

        target.resume().unwrap();
        assert!(!handle.is_halted());
        assert_eq!(handle.pc(), 0x1002);
        assert!(target.state().breakpoints().find(0x1000).unwrap().set);
    }

    #[test]
    fn watchpoint_hit_is_resolved_from_the_store() {
        let mut link = FakeLink::dm(Xlen::X32);
        let handle = link.clone();
        // sw a1, 4(a0)
        handle.poke(0x400, &0x00b5_2223u32.to_le_bytes());
        handle.set_gpr(10, 0x2000);
        let settings = TargetSettings::default();
        let mut cpu = dm_cpu();
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);
        target.halt().unwrap();

        target
            .add_watchpoint(0x2000, 4, AccessKind::Write)
            .unwrap();
        target
            .add_watchpoint(0x2004, 4, AccessKind::Write)
            .unwrap();
        target.resume().unwrap();

        handle.access(0x400, 0x2004, 4, true);
        let info = target.poll().unwrap();
        assert_eq!(info.reason, HaltReason::Watchpoint);
        assert_eq!(info.watchpoint, Some(0x2004));
        assert_eq!(info.pc, 0x400);

        target.resume().unwrap();
        assert_eq!(handle.pc(), 0x404);
        assert!(!handle.is_halted());
        assert!(target.state().watchpoints().iter().all(|w| w.set));
    }

    #[test]
    fn file_io_round_trip() {
        let mut link = FakeLink::dm(Xlen::X32);
        let handle = link.clone();
        let sequence = words(&[
            fileio::SEMIHOSTING_ENTRY,
            0x0010_0073,
            fileio::SEMIHOSTING_EXIT,
        ]);
        handle.poke(0x0ffc, &sequence);
        handle.poke(0x1ffc, &sequence);
        handle.poke(0x3000, &words(&[1, 0x4000, 5, 0]));
        let settings = TargetSettings::default();
        let mut cpu = dm_cpu();
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);
        target.halt().unwrap();
        target.resume().unwrap();

        handle.set_gpr(10, 0x05);
        handle.set_gpr(11, 0x3000);
        handle.execute_to(0x1000);
        let info = target.poll().unwrap();
        assert_eq!(info.reason, HaltReason::FileIo);
        let request = info.fileio.unwrap();
        assert_eq!(request.identifier(), "write");
        assert_eq!(request.params, [1, 0x4000, 5, 0]);

        target.fileio_end(-1, 9, false).unwrap();
        assert_eq!(handle.gpr(10), 0xffff_ffff);
        assert_eq!(handle.pc(), 0x1008);
        assert_eq!(target.run_state(), RunState::Running);

        // errno requests are answered without a round trip
        handle.set_gpr(10, 0x13);
        handle.execute_to(0x2000);
        assert_eq!(target.poll().unwrap().reason, HaltReason::Running);
        assert_eq!(handle.gpr(10), 9);
        assert_eq!(handle.pc(), 0x2008);
    }

    #[test]
    fn ctrl_c_turns_into_a_request() {
        let mut link = FakeLink::dm(Xlen::X32);
        let handle = link.clone();
        handle.poke(
            0x0ffc,
            &words(&[fileio::SEMIHOSTING_ENTRY, 0x0010_0073, fileio::SEMIHOSTING_EXIT]),
        );
        handle.set_gpr(10, 0x02);
        let settings = TargetSettings::default();
        let mut cpu = dm_cpu();
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);
        target.halt().unwrap();
        target.resume().unwrap();
        handle.execute_to(0x1000);
        assert_eq!(target.poll().unwrap().reason, HaltReason::FileIo);

        target.fileio_end(0, 0, true).unwrap();
        let info = target.poll().unwrap();
        assert_eq!(info.reason, HaltReason::Request);
        assert_eq!(info.pc, 0x1008);
        assert!(matches!(
            target.fileio_end(0, 0, false),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn reset_and_halt() {
        let mut link = FakeLink::had(CK803);
        let handle = link.clone();
        handle.poke(0x1000, &[0x12, 0x34]);
        let settings = TargetSettings::default();
        let mut cpu = had_cpu();
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);
        target.halt().unwrap();
        target
            .add_breakpoint(0x1000, 2, BreakpointKind::Software)
            .unwrap();
        target
            .add_breakpoint(0x2000, 2, BreakpointKind::Hardware)
            .unwrap();
        target.resume().unwrap();

        let info = target.reset(ResetKind::HardHalt).unwrap().unwrap();
        assert_eq!(info.reason, HaltReason::Request);
        assert_eq!(target.run_state(), RunState::Halted);
        // the comparators were cleared, the trap in memory was not
        assert!(!target.state().breakpoints().find(0x2000).unwrap().set);
        assert!(target.state().breakpoints().find(0x1000).unwrap().set);
        assert_eq!(handle.peek(0x1000, 2), vec![0x00, 0x00]);

        assert_eq!(target.reset(ResetKind::Hard).unwrap(), None);
        assert_eq!(target.run_state(), RunState::Reset);
        assert_eq!(target.poll().unwrap().reason, HaltReason::Running);
        assert_eq!(target.run_state(), RunState::Running);
    }

    #[test]
    fn software_breakpoint_survives_a_reset() {
        let mut link = FakeLink::had(CK803);
        let handle = link.clone();
        handle.poke(0x1000, &[0x12, 0x34]);
        let settings = TargetSettings::default();
        let mut cpu = had_cpu();
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);
        target.halt().unwrap();

        target
            .add_breakpoint(0x1000, 2, BreakpointKind::Software)
            .unwrap();
        target.resume().unwrap();
        target.reset(ResetKind::SoftHalt).unwrap();

        let mut memory = [0u8; 2];
        target.read_memory(0x1000, &mut memory).unwrap();
        assert_eq!(memory, [0x12, 0x34]);

        target.resume().unwrap();
        assert_eq!(handle.peek(0x1000, 2), vec![0x00, 0x00]);
        target.halt().unwrap();

        target.remove_breakpoint(0x1000).unwrap();
        assert_eq!(handle.peek(0x1000, 2), vec![0x12, 0x34]);
    }

    #[test]
    fn halt_info_follows_register_writes() {
        let mut link = FakeLink::had(CK803);
        let handle = link.clone();
        let settings = TargetSettings::default();
        let mut cpu = had_cpu();
        let pc = cpu.catalog().pc().cloned().unwrap();
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);

        let first = target.halt().unwrap();
        assert_eq!(first.reason, HaltReason::Request);

        target
            .write_register(&pc, &RegisterValue::U32(0x2468))
            .unwrap();
        assert_eq!(handle.pc(), 0x2468);

        let info = target.poll().unwrap();
        assert_eq!(info.reason, HaltReason::Request);
        assert_eq!(info.pc, 0x2468);
        assert_eq!(target.halt().unwrap().pc, 0x2468);
    }

    #[test]
    fn cpu_registers_need_a_halted_core() {
        let mut link = FakeLink::had(CK803);
        let settings = TargetSettings::default();
        let mut cpu = had_cpu();
        let pc = cpu.catalog().pc().cloned().unwrap();
        let hsr = cpu.catalog().resolve_name("hsr").unwrap();
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);
        target.halt().unwrap();
        target
            .write_register(&pc, &RegisterValue::U32(0x2000))
            .unwrap();
        target.resume().unwrap();

        assert!(matches!(
            target.read_register(&pc),
            Err(Error::InvalidState {
                state: RunState::Running,
                ..
            })
        ));
        assert!(target.read_register(&hsr).is_ok());
        assert!(matches!(
            target.resume(),
            Err(Error::InvalidState {
                operation: "resume",
                ..
            })
        ));
    }

    #[test]
    fn link_failure_keeps_the_state() {
        let mut link = FakeLink::had(CK803);
        let handle = link.clone();
        let settings = TargetSettings::default();
        let mut cpu = had_cpu();
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);
        target.halt().unwrap();
        target.resume().unwrap();

        handle.fail_next(LinkError::Io);
        assert!(matches!(
            target.halt(),
            Err(Error::Link(LinkError::Io))
        ));
        assert_eq!(target.run_state(), RunState::Running);
        assert_eq!(target.halt().unwrap().reason, HaltReason::Request);
    }

    #[test]
    fn unavailable_cpu_is_rejected() {
        let mut link = FakeLink::had(CK803);
        let settings = TargetSettings::default();
        let mut cpu = CpuSessionState::unavailable(3, DebugModule::Had(HadParams::default()));
        let mut target = Target::new(&mut link, &mut cpu, None, &settings);

        assert!(matches!(target.halt(), Err(Error::CpuUnavailable(3))));
    }
}
