//! Debug module drivers.
//!
//! A core driver is created per operation from the link and a copy of the per-CPU debug
//! parameters, then dropped again. All state that has to survive between operations lives in
//! [`crate::target::CpuSessionState`].

/// Conversions between a register layout and its raw value.
macro_rules! raw_register {
    ($name:ident, $raw:ty) => {
        impl From<$raw> for $name {
            fn from(value: $raw) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $raw {
            fn from(register: $name) -> Self {
                register.0
            }
        }
    };
}

pub mod dm;
pub mod had;

use std::time::{Duration, Instant};

use crate::config::DebugArch;
use crate::link::Link;
use crate::memory::MemoryInterface;
use crate::registers::{RegisterDescriptor, RegisterValue};
use crate::watchpoint::AccessKind;
use crate::Error;

pub use dm::{DmCore, DmParams};
pub use had::{HadCore, HadParams};

/// Why a core entered debug mode, as far as the debug module can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// The debugger asked for the halt.
    Request,
    /// A trap instruction was executed.
    Software,
    /// A hardware comparator matched. Breakpoint and watchpoint matches are not distinguished.
    Hardware,
    /// A single step finished.
    Step,
    /// Another core of the same group halted.
    Peer,
    /// The debug module did not report a cause.
    Unknown,
}

/// A halt as reported by the debug module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopEvent {
    pub cause: StopCause,
    /// HSR on HAD, `dcsr` on the debug module.
    pub status: u32,
    /// HSR2 on HAD, `dmstatus` on the debug module.
    pub status2: u32,
}

/// The status of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStatus {
    /// The core is executing code.
    Running,
    /// The core is in debug mode.
    Halted(StopEvent),
    /// The core is in a low power mode.
    Sleeping,
    /// The status could not be determined.
    Unknown,
}

impl CoreStatus {
    /// Returns `true` if the core is currently halted.
    pub fn is_halted(&self) -> bool {
        matches!(self, CoreStatus::Halted(_))
    }

    /// Returns `true` if the core is currently running.
    pub fn is_running(&self) -> bool {
        matches!(self, CoreStatus::Running | CoreStatus::Sleeping)
    }
}

/// How a reset is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMethod {
    /// Reset the CPU state only, through the debug module.
    Soft,
    /// System reset requested through the debug module.
    System,
    /// Drive the nRESET line.
    Line,
}

/// Run control and register access of one CPU.
pub trait CoreInterface: MemoryInterface {
    /// The debug module generation behind this driver.
    fn debug_arch(&self) -> DebugArch;

    /// Queries the current status from the debug module.
    fn status(&mut self) -> Result<CoreStatus, Error>;

    /// Returns `true` if the core is in debug mode.
    fn core_halted(&mut self) -> Result<bool, Error> {
        Ok(self.status()?.is_halted())
    }

    /// Waits until the core is halted, failing with [`Error::Timeout`] after `timeout`.
    fn wait_for_core_halted(&mut self, timeout: Duration) -> Result<(), Error> {
        let start = Instant::now();

        while !self.core_halted()? {
            if start.elapsed() >= timeout {
                return Err(Error::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        Ok(())
    }

    /// Requests debug mode and waits until it is entered.
    fn halt(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Leaves debug mode.
    fn run(&mut self) -> Result<(), Error>;

    /// Executes exactly one instruction and waits for the core to halt again.
    fn step(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Resets the core. With `halt`, the core is caught in debug mode right after the reset.
    fn reset(&mut self, method: ResetMethod, halt: bool, timeout: Duration) -> Result<(), Error>;

    /// Reads a register of the CPU or of its debug module.
    fn read_core_reg(&mut self, register: &RegisterDescriptor) -> Result<RegisterValue, Error>;

    /// Writes a register of the CPU or of its debug module.
    fn write_core_reg(
        &mut self,
        register: &RegisterDescriptor,
        value: &RegisterValue,
    ) -> Result<(), Error>;

    /// Number of hardware comparators.
    fn available_breakpoint_units(&mut self) -> Result<usize, Error>;

    /// `true` if comparator `unit` can match data accesses.
    fn supports_data_match(&self, unit: usize) -> bool;

    /// Programs comparator `unit` to halt on execution of `address`.
    fn set_hw_breakpoint(&mut self, unit: usize, address: u64) -> Result<(), Error>;

    /// Programs comparator `unit` to halt on accesses to `address`, ignoring the bits in `mask`.
    fn set_hw_watchpoint(
        &mut self,
        unit: usize,
        address: u64,
        mask: u64,
        access: AccessKind,
    ) -> Result<(), Error>;

    /// Disables comparator `unit`.
    fn clear_hw_unit(&mut self, unit: usize) -> Result<(), Error>;

    /// Invalidates and cleans the caches before the core is resumed.
    fn flush_cache(&mut self) -> Result<(), Error>;
}

/// The debug module of a CPU and the parameters needed to drive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugModule {
    Had(HadParams),
    Dm(DmParams),
}

impl DebugModule {
    /// Creates a driver borrowing `link`.
    pub fn attach<'a>(&self, link: &'a mut dyn Link) -> Box<dyn CoreInterface + 'a> {
        match *self {
            DebugModule::Had(params) => Box::new(HadCore::new(link, params)),
            DebugModule::Dm(params) => Box::new(DmCore::new(link, params)),
        }
    }

    /// The debug module generation.
    pub fn arch(&self) -> DebugArch {
        match self {
            DebugModule::Had(_) => DebugArch::Had,
            DebugModule::Dm(_) => DebugArch::Dm,
        }
    }

    /// Number of hardware comparators.
    pub fn units(&self) -> usize {
        match self {
            DebugModule::Had(params) => params.units,
            DebugModule::Dm(params) => params.triggers,
        }
    }

    /// Number of comparators that can match data accesses.
    pub fn data_units(&self) -> usize {
        match self {
            DebugModule::Had(params) => params.units.min(had::DATA_MATCH_UNITS),
            DebugModule::Dm(params) => params.triggers,
        }
    }

    /// HAD version, `None` for the RISC-V debug module.
    pub fn had_version(&self) -> Option<u8> {
        match self {
            DebugModule::Had(params) => Some(params.had_version),
            DebugModule::Dm(_) => None,
        }
    }

    pub(crate) fn set_bkpt_exception(&mut self, enabled: bool) {
        match self {
            DebugModule::Had(params) => params.bkpt_exception = enabled,
            DebugModule::Dm(params) => params.bkpt_exception = enabled,
        }
    }

    pub(crate) fn set_max_access(&mut self, width: crate::link::AccessWidth) {
        match self {
            DebugModule::Had(params) => params.max_access = width,
            DebugModule::Dm(params) => params.max_access = width,
        }
    }

    pub(crate) fn set_hacr_width(&mut self, width: had::HacrWidth) {
        if let DebugModule::Had(params) = self {
            params.hacr_width = width;
        }
    }
}
