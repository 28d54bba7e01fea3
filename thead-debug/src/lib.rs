//! # Target layer for T-HEAD and C-SKY debug probes
//!
//! Talks to C-SKY cores through their HAD debug module and to T-HEAD RISC-V cores through
//! the RISC-V debug module, both reached over a [`link::Link`] to a CKLink style adapter.
//!
//! # Examples
//!
//! ## Stopping at a breakpoint
//!
//! ```no_run
//! # use thead_debug::Error;
//! use thead_debug::breakpoint::BreakpointKind;
//! use thead_debug::config::SessionConfig;
//! use thead_debug::link::fake::FakeLink;
//! use thead_debug::Session;
//!
//! let link = FakeLink::had(0x0480_0003);
//! let mut session = Session::open(Box::new(link), SessionConfig::default())?;
//!
//! let mut target = session.target()?;
//! target.add_breakpoint(0x2000_0100, 2, BreakpointKind::Hardware)?;
//! target.resume()?;
//! let info = target.wait_for_halt(std::time::Duration::from_millis(100))?;
//! println!("halted at {:#010x}: {:?}", info.pc, info.reason);
//! # Ok::<(), Error>(())
//! ```
//!
//! ## Working with several CPUs
//!
//! ```no_run
//! # use thead_debug::Error;
//! use thead_debug::config::SessionConfig;
//! use thead_debug::link::fake::FakeLink;
//! use thead_debug::Session;
//!
//! let link = FakeLink::had_top(&[0x0480_0003, 0x049c_0003]);
//! let mut session = Session::open(Box::new(link), SessionConfig::default())?;
//!
//! for n in 0..session.cpu_count() {
//!     let mut cpu = session.scoped_cpu(n)?;
//!     let mut buffer = [0u8; 16];
//!     cpu.read_memory(0x0, &mut buffer)?;
//! }
//! # Ok::<(), Error>(())
//! ```
//!
//! The layer is built around the [`Session`], which hands out a [`target::Target`] per CPU.

pub mod breakpoint;
pub mod config;
pub mod core;
mod error;
pub mod fileio;
pub mod flash;
pub mod identity;
pub mod instruction;
pub mod link;
pub mod memory;
pub mod registers;
pub mod session;
pub mod slots;
pub mod target;
pub mod watchpoint;

pub use crate::error::Error;
pub use crate::session::Session;
