use crate::config::ConfigError;
use crate::flash::FlashError;
use crate::link::LinkError;
use crate::registers::RegisterId;
use crate::target::RunState;

/// The overarching error type which contains all possible errors as variants.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum Error {
    /// An error occurred on the link to the debug probe.
    Link(#[from] LinkError),

    /// The identification word {0:#010x} does not match any known CPU.
    UnrecognizedIdentity(u32),

    /// Register {0} does not exist on the selected CPU.
    InvalidRegister(RegisterId),

    /// No register named `{0}` exists on the selected CPU.
    RegisterNotFound(String),

    /// The value written to register {register} does not fit into {width} bits.
    ValueTooWide {
        /// The register that was written.
        register: RegisterId,
        /// The declared width of the register in bits.
        width: u16,
    },

    /// All hardware comparators are in use.
    NoHardwareSlot,

    /// A breakpoint or watchpoint of a different kind already exists at {address:#010x}.
    AddressConflict {
        /// The address of the existing entry.
        address: u64,
    },

    /// The original contents at {address:#010x} could not be restored.
    RestoreFailed {
        /// The address of the patched location.
        address: u64,
        /// The error that prevented the restore.
        source: Box<Error>,
    },

    /// CPU {0} does not exist or is not available.
    CpuUnavailable(usize),

    /// `{operation}` is not possible while the target is {state:?}.
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The run state at the time of the request.
        state: RunState,
    },

    /// A breakpoint or watchpoint length of {0} bytes is not supported.
    InvalidLength(u32),

    /// No breakpoint or watchpoint exists at {0:#010x}.
    NotFound(u64),

    /// A flash breakpoint was requested but no flash algorithm is attached.
    FlashUnavailable,

    /// The flash algorithm failed.
    Flash(#[from] FlashError),

    /// Not all entries could be removed cleanly: {display_list(_0)}
    ClearIncomplete(Vec<Error>),

    /// The configuration is invalid.
    Config(#[from] ConfigError),

    /// The session is not connected to a target.
    NotConnected,

    /// Timeout while waiting for the target to halt.
    Timeout,

    /// {0}
    Other(#[from] anyhow::Error),
}

fn display_list(list: &[Error]) -> String {
    list.iter()
        .map(|error| error.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Returns `true` if this error was caused by the link rather than by the request.
    pub fn is_link_error(&self) -> bool {
        matches!(self, Error::Link(_))
    }
}
