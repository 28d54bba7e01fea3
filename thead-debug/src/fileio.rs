//! File-I/O requests of RISC-V targets.
//!
//! A target asks the debugger to perform a host system call by executing the semihosting
//! sequence
//!
//! ```text
//! slli x0, x0, 0x1f
//! ebreak
//! srai x0, x0, 7
//! ```
//!
//! with the operation number in `a0` and the address of a parameter block in `a1`. The halt is
//! reported with a [`FileIoRequest`]; once the host has carried it out the result is handed
//! back with [`complete`], which also moves the program counter past the sequence.

use serde::Serialize;

use crate::core::CoreInterface;
use crate::link::Xlen;
use crate::registers::{RegisterCatalog, RegisterValue};
use crate::Error;

/// `slli x0, x0, 0x1f`, the instruction in front of the trap.
pub const SEMIHOSTING_ENTRY: u32 = 0x01f0_1013;
/// `srai x0, x0, 7`, the instruction after the trap.
pub const SEMIHOSTING_EXIT: u32 = 0x4070_5013;
const EBREAK: u32 = 0x0010_0073;

/// Bytes from the trap to the instruction following the sequence.
pub const SEQUENCE_TAIL: u64 = 8;

/// A host operation requested by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileIoOperation {
    Open,
    Close,
    WriteChar,
    WriteString,
    Write,
    Read,
    IsTty,
    Seek,
    FileLength,
    Remove,
    Rename,
    Clock,
    Time,
    System,
    /// The error number of the last failed request. Answered by the debugger itself.
    Errno,
    Exit,
    Unknown(u32),
}

impl FileIoOperation {
    /// Decodes the operation number passed in `a0`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0x01 => FileIoOperation::Open,
            0x02 => FileIoOperation::Close,
            0x03 => FileIoOperation::WriteChar,
            0x04 => FileIoOperation::WriteString,
            0x05 => FileIoOperation::Write,
            0x06 => FileIoOperation::Read,
            0x09 => FileIoOperation::IsTty,
            0x0a => FileIoOperation::Seek,
            0x0c => FileIoOperation::FileLength,
            0x0e => FileIoOperation::Remove,
            0x0f => FileIoOperation::Rename,
            0x10 => FileIoOperation::Clock,
            0x11 => FileIoOperation::Time,
            0x12 => FileIoOperation::System,
            0x13 => FileIoOperation::Errno,
            0x18 => FileIoOperation::Exit,
            other => FileIoOperation::Unknown(other),
        }
    }

    /// The name of the matching host call, as used by the GDB File-I/O protocol.
    pub fn identifier(self) -> &'static str {
        match self {
            FileIoOperation::Open => "open",
            FileIoOperation::Close => "close",
            FileIoOperation::WriteChar | FileIoOperation::WriteString | FileIoOperation::Write => {
                "write"
            }
            FileIoOperation::Read => "read",
            FileIoOperation::IsTty => "isatty",
            FileIoOperation::Seek => "lseek",
            FileIoOperation::FileLength => "fstat",
            FileIoOperation::Remove => "unlink",
            FileIoOperation::Rename => "rename",
            FileIoOperation::Clock | FileIoOperation::Time => "gettimeofday",
            FileIoOperation::System => "system",
            FileIoOperation::Errno => "errno",
            FileIoOperation::Exit => "exit",
            FileIoOperation::Unknown(_) => "unknown",
        }
    }
}

/// A decoded file-I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileIoRequest {
    pub operation: FileIoOperation,
    /// The first four words of the parameter block.
    pub params: [u64; 4],
}

impl FileIoRequest {
    pub fn identifier(&self) -> &'static str {
        self.operation.identifier()
    }
}

fn word(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn argument(
    core: &mut dyn CoreInterface,
    catalog: &RegisterCatalog,
    name: &str,
) -> Result<u64, Error> {
    let register = catalog.resolve_name(name)?;
    core.read_core_reg(&register)?
        .as_u64()
        .ok_or(Error::InvalidRegister(register.id))
}

/// Checks whether the core stopped at a semihosting trap at `pc` and decodes the request.
pub fn check_for_file_io(
    core: &mut dyn CoreInterface,
    catalog: &RegisterCatalog,
    pc: u64,
    xlen: Xlen,
) -> Result<Option<FileIoRequest>, Error> {
    let Some(start) = pc.checked_sub(4) else {
        return Ok(None);
    };
    let mut sequence = [0u8; 12];
    core.read_8(start, &mut sequence)?;

    if word(&sequence, 0) != SEMIHOSTING_ENTRY
        || word(&sequence, 4) != EBREAK
        || word(&sequence, 8) != SEMIHOSTING_EXIT
    {
        return Ok(None);
    }

    let operation = FileIoOperation::from_code(argument(core, catalog, "a0")? as u32);
    let block = argument(core, catalog, "a1")?;
    tracing::debug!("File-I/O request {operation:?}, parameters at {block:#010x}");

    let mut params = [0u64; 4];
    if operation != FileIoOperation::Errno {
        let size = xlen.bytes();
        let mut raw = vec![0u8; size * params.len()];
        core.read_8(block, &mut raw)?;
        for (param, chunk) in params.iter_mut().zip(raw.chunks_exact(size)) {
            let mut bytes = [0u8; 8];
            bytes[..size].copy_from_slice(chunk);
            *param = u64::from_le_bytes(bytes);
        }
    }

    Ok(Some(FileIoRequest { operation, params }))
}

/// Writes the result of a request to `a0` and moves the program counter past the sequence
/// whose trap is at `pc`.
pub fn complete(
    core: &mut dyn CoreInterface,
    catalog: &RegisterCatalog,
    pc: u64,
    result: i64,
    xlen: Xlen,
) -> Result<(), Error> {
    let a0 = catalog.resolve_name("a0")?;
    let value = match xlen {
        Xlen::X32 => RegisterValue::from(result as u32),
        Xlen::X64 => RegisterValue::from(result as u64),
    };
    core.write_core_reg(&a0, &value)?;

    let pc_register = catalog
        .pc()
        .cloned()
        .ok_or_else(|| Error::RegisterNotFound("pc".to_string()))?;
    let next = pc + SEQUENCE_TAIL;
    let next = match xlen {
        Xlen::X32 => RegisterValue::from(next as u32),
        Xlen::X64 => RegisterValue::from(next),
    };
    core.write_core_reg(&pc_register, &next)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::{DebugModule, DmParams};
    use crate::identity::{CpuArch, CpuIdentity};
    use crate::link::fake::FakeLink;
    use crate::target::DEFAULT_TIMEOUT;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn sequence() -> Vec<u8> {
        [SEMIHOSTING_ENTRY, EBREAK, SEMIHOSTING_EXIT]
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect()
    }

    #[test_case(0x01, "open")]
    #[test_case(0x05, "write")]
    #[test_case(0x0a, "lseek")]
    #[test_case(0x0e, "unlink")]
    #[test_case(0x42, "unknown")]
    fn identifiers(code: u32, identifier: &str) {
        assert_eq!(FileIoOperation::from_code(code).identifier(), identifier);
    }

    #[test]
    fn decodes_and_completes_a_write() {
        let mut link = FakeLink::dm(Xlen::X32);
        let handle = link.clone();
        handle.poke(0x0ffc, &sequence());
        handle.set_gpr(10, 0x05);
        handle.set_gpr(11, 0x2000);
        let block: Vec<u8> = [1u32, 0x3000, 12, 0]
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect();
        handle.poke(0x2000, &block);

        let catalog = RegisterCatalog::build(&CpuIdentity::riscv(CpuArch::Rv32, &[]), Xlen::X32);
        let mut core = DebugModule::Dm(DmParams::default()).attach(&mut link);
        core.halt(DEFAULT_TIMEOUT).unwrap();

        let request = check_for_file_io(&mut *core, &catalog, 0x1000, Xlen::X32)
            .unwrap()
            .unwrap();
        assert_eq!(request.operation, FileIoOperation::Write);
        assert_eq!(request.identifier(), "write");
        assert_eq!(request.params, [1, 0x3000, 12, 0]);

        complete(&mut *core, &catalog, 0x1000, -1, Xlen::X32).unwrap();
        drop(core);
        assert_eq!(handle.gpr(10), 0xffff_ffff);
        assert_eq!(handle.pc(), 0x1008);
    }

    #[test]
    fn plain_ebreak_is_not_a_request() {
        let mut link = FakeLink::dm(Xlen::X32);
        link.poke(0x1000, &EBREAK.to_le_bytes());

        let catalog = RegisterCatalog::build(&CpuIdentity::riscv(CpuArch::Rv32, &[]), Xlen::X32);
        let mut core = DebugModule::Dm(DmParams::default()).attach(&mut link);

        assert_eq!(
            check_for_file_io(&mut *core, &catalog, 0x1000, Xlen::X32).unwrap(),
            None
        );
        assert_eq!(
            check_for_file_io(&mut *core, &catalog, 0x2, Xlen::X32).unwrap(),
            None
        );
    }
}
