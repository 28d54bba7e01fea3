//! The register catalog.
//!
//! Every register is identified by a [`RegisterId`], a category tag plus the debugger register
//! number. The catalog is built once per connected CPU from its [`CpuIdentity`] and resolves
//! names and numbers to a [`RegisterDescriptor`], which also carries the physical access path.

pub mod csky;
pub mod riscv;

use std::borrow::Cow;
use std::fmt;

use serde::Serialize;

use crate::identity::CpuIdentity;
use crate::link::Xlen;
use crate::Error;

/// The largest register value in bytes.
pub const MAX_REGISTER_BYTES: usize = 128;

/// Register categories. Numbers of CPU registers never overlap between categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegisterCategory {
    /// General purpose registers and the program counter.
    General,
    /// C-SKY control registers.
    ControlStatus,
    /// Floating point registers.
    Float,
    /// Vector registers.
    Vector,
    /// Registers of the HAD debug module.
    Had,
    /// RISC-V control and status registers, including the privilege pseudo register.
    Csr,
    /// Registers of the RISC-V debug module.
    Dm,
}

impl fmt::Display for RegisterCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterCategory::General => "general",
            RegisterCategory::ControlStatus => "control-status",
            RegisterCategory::Float => "float",
            RegisterCategory::Vector => "vector",
            RegisterCategory::Had => "had",
            RegisterCategory::Csr => "csr",
            RegisterCategory::Dm => "dm",
        };
        f.write_str(name)
    }
}

/// The logical identity of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RegisterId {
    pub category: RegisterCategory,
    pub number: u16,
}

impl RegisterId {
    pub const fn new(category: RegisterCategory, number: u16) -> Self {
        RegisterId { category, number }
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.category, self.number)
    }
}

/// Where a register physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterLocation {
    /// The link's CPU register space, by debugger register number.
    Cpu(u16),
    /// A HAD register, by bank encoded register select.
    Had(u8),
    /// A RISC-V abstract command register number.
    Abstract(u16),
    /// The privilege level, held in `dcsr.prv`.
    Privilege,
    /// A RISC-V debug module register, by DMI address.
    Dm(u8),
}

/// Special purpose of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegisterRole {
    ProgramCounter,
    StackPointer,
    FramePointer,
    ReturnAddress,
}

/// A register of the connected CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDescriptor {
    pub name: Cow<'static, str>,
    pub id: RegisterId,
    /// Declared width in bits.
    pub width: u16,
    pub location: RegisterLocation,
    pub role: Option<RegisterRole>,
}

impl RegisterDescriptor {
    pub(crate) fn new(
        name: impl Into<Cow<'static, str>>,
        category: RegisterCategory,
        number: u16,
        width: u16,
        location: RegisterLocation,
    ) -> Self {
        RegisterDescriptor {
            name: name.into(),
            id: RegisterId::new(category, number),
            width,
            location,
            role: None,
        }
    }

    pub(crate) fn with_role(mut self, role: RegisterRole) -> Self {
        self.role = Some(role);
        self
    }

    /// Size of the register in bytes, rounded up.
    pub fn size_in_bytes(&self) -> usize {
        (self.width as usize + 7) / 8
    }

    /// Fails with [`Error::ValueTooWide`] if `value` does not fit into this register.
    pub fn check(&self, value: &RegisterValue) -> Result<(), Error> {
        if value.significant_bits() > u32::from(self.width) {
            return Err(Error::ValueTooWide {
                register: self.id,
                width: self.width,
            });
        }
        Ok(())
    }

    /// Decodes a little endian buffer read from the link.
    pub fn value_from_le_bytes(&self, bytes: &[u8]) -> RegisterValue {
        RegisterValue::from_le_bytes(bytes, self.width)
    }
}

/// The value of a register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RegisterValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    /// Registers wider than 64 bits, little endian.
    Block(Vec<u8>),
}

impl RegisterValue {
    /// Builds the smallest variant able to hold a register of `width` bits.
    pub fn from_le_bytes(bytes: &[u8], width: u16) -> RegisterValue {
        let mut word = [0u8; 8];
        let len = bytes.len().min(8);
        word[..len].copy_from_slice(&bytes[..len]);
        let value = u64::from_le_bytes(word);

        match width {
            0..=8 => RegisterValue::U8(value as u8),
            9..=16 => RegisterValue::U16(value as u16),
            17..=32 => RegisterValue::U32(value as u32),
            33..=64 => RegisterValue::U64(value),
            _ => {
                let len = bytes.len().min(MAX_REGISTER_BYTES);
                RegisterValue::Block(bytes[..len].to_vec())
            }
        }
    }

    /// The value as little endian bytes, `len` bytes long.
    pub fn to_le_bytes(&self, len: usize) -> Vec<u8> {
        let mut bytes = match self {
            RegisterValue::U8(v) => v.to_le_bytes().to_vec(),
            RegisterValue::U16(v) => v.to_le_bytes().to_vec(),
            RegisterValue::U32(v) => v.to_le_bytes().to_vec(),
            RegisterValue::U64(v) => v.to_le_bytes().to_vec(),
            RegisterValue::Block(bytes) => bytes.clone(),
        };
        bytes.resize(len, 0);
        bytes
    }

    /// Number of bits needed to represent the value.
    pub fn significant_bits(&self) -> u32 {
        match self {
            RegisterValue::U8(v) => u8::BITS - v.leading_zeros(),
            RegisterValue::U16(v) => u16::BITS - v.leading_zeros(),
            RegisterValue::U32(v) => u32::BITS - v.leading_zeros(),
            RegisterValue::U64(v) => u64::BITS - v.leading_zeros(),
            RegisterValue::Block(bytes) => bytes.len() as u32 * 8,
        }
    }

    /// The value as integer, `None` for blocks.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            RegisterValue::U8(v) => Some(v.into()),
            RegisterValue::U16(v) => Some(v.into()),
            RegisterValue::U32(v) => Some(v.into()),
            RegisterValue::U64(v) => Some(v),
            RegisterValue::Block(_) => None,
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::U8(v) => write!(f, "{v:#04x}"),
            RegisterValue::U16(v) => write!(f, "{v:#06x}"),
            RegisterValue::U32(v) => write!(f, "{v:#010x}"),
            RegisterValue::U64(v) => write!(f, "{v:#018x}"),
            RegisterValue::Block(bytes) => {
                f.write_str("0x")?;
                for byte in bytes.iter().rev() {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<u8> for RegisterValue {
    fn from(value: u8) -> Self {
        RegisterValue::U8(value)
    }
}

impl From<u16> for RegisterValue {
    fn from(value: u16) -> Self {
        RegisterValue::U16(value)
    }
}

impl From<u32> for RegisterValue {
    fn from(value: u32) -> Self {
        RegisterValue::U32(value)
    }
}

impl From<u64> for RegisterValue {
    fn from(value: u64) -> Self {
        RegisterValue::U64(value)
    }
}

/// Debugger register numbers of the registers with a special role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameRegisters {
    pub pc: u16,
    pub sp: u16,
    pub fp: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Csky,
    RiscV,
}

/// The register catalog of one CPU.
#[derive(Debug, Clone)]
pub struct RegisterCatalog {
    family: Family,
    registers: Vec<RegisterDescriptor>,
    debug_registers: Vec<RegisterDescriptor>,
}

impl RegisterCatalog {
    /// Builds the register list for a decoded CPU.
    ///
    /// `xlen` only matters for RISC-V harts; C-SKY registers are always 32 bit wide.
    pub fn build(identity: &CpuIdentity, xlen: Xlen) -> RegisterCatalog {
        let catalog = if identity.arch.is_riscv() {
            RegisterCatalog {
                family: Family::RiscV,
                registers: riscv::build(identity, xlen),
                debug_registers: riscv::dm_registers(),
            }
        } else {
            RegisterCatalog {
                family: Family::Csky,
                registers: csky::build(identity),
                debug_registers: csky::had_registers(),
            }
        };

        tracing::debug!(
            "Built register catalog for {}: {} cpu registers, {} debug registers",
            identity.name(),
            catalog.registers.len(),
            catalog.debug_registers.len()
        );

        catalog
    }

    /// The CPU registers, in debugger numbering order.
    pub fn registers(&self) -> &[RegisterDescriptor] {
        &self.registers
    }

    /// The registers of the debug module (HAD or DM).
    pub fn debug_registers(&self) -> &[RegisterDescriptor] {
        &self.debug_registers
    }

    fn all(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.registers.iter().chain(self.debug_registers.iter())
    }

    /// Resolves a register by name. A leading `$` is ignored, matching is case insensitive.
    pub fn resolve_name(&self, name: &str) -> Result<RegisterDescriptor, Error> {
        let wanted = name.trim_start_matches('$').to_ascii_lowercase();

        if let Some(register) = self.all().find(|r| r.name == wanted.as_str()) {
            return Ok(register.clone());
        }

        let role = match wanted.as_str() {
            "pc" => Some(RegisterRole::ProgramCounter),
            "sp" => Some(RegisterRole::StackPointer),
            "fp" => Some(RegisterRole::FramePointer),
            "lr" | "ra" => Some(RegisterRole::ReturnAddress),
            _ => None,
        };
        if let Some(register) = role.and_then(|role| self.role(role)) {
            return Ok(register.clone());
        }

        let alias = match self.family {
            Family::Csky => csky::alias(&wanted),
            Family::RiscV => riscv::alias(&wanted),
        };

        alias
            .and_then(|id| self.resolve(id).ok())
            .ok_or_else(|| Error::RegisterNotFound(name.to_string()))
    }

    /// Resolves a register by category and number.
    pub fn resolve(&self, id: RegisterId) -> Result<RegisterDescriptor, Error> {
        if let Some(register) = self.all().find(|r| r.id == id) {
            return Ok(register.clone());
        }

        if self.family == Family::RiscV {
            if let Some(register) = riscv::any_csr(id) {
                return Ok(register);
            }
        }

        Err(Error::InvalidRegister(id))
    }

    /// Resolves a CPU register by debugger number alone.
    pub fn resolve_number(&self, number: u16) -> Result<RegisterDescriptor, Error> {
        if let Some(register) = self.registers.iter().find(|r| r.id.number == number) {
            return Ok(register.clone());
        }

        let id = match self.family {
            Family::Csky => RegisterId::new(RegisterCategory::ControlStatus, number),
            Family::RiscV => RegisterId::new(RegisterCategory::Csr, number),
        };
        self.resolve(id)
    }

    fn role(&self, role: RegisterRole) -> Option<&RegisterDescriptor> {
        self.registers.iter().find(|r| r.role == Some(role))
    }

    /// The program counter.
    pub fn pc(&self) -> Option<&RegisterDescriptor> {
        self.role(RegisterRole::ProgramCounter)
    }

    /// The stack pointer.
    pub fn sp(&self) -> Option<&RegisterDescriptor> {
        self.role(RegisterRole::StackPointer)
    }

    /// The frame pointer.
    pub fn fp(&self) -> Option<&RegisterDescriptor> {
        self.role(RegisterRole::FramePointer)
    }

    /// Register numbers of pc, sp and fp.
    pub fn frame_registers(&self) -> Option<FrameRegisters> {
        Some(FrameRegisters {
            pc: self.pc()?.id.number,
            sp: self.sp()?.id.number,
            fp: self.fp()?.id.number,
        })
    }
}

/// Parses a decimal or `0x` prefixed hexadecimal number.
pub(crate) fn parse_number(text: &str) -> Option<u16> {
    match text.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identity::CpuArch;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn summary(catalog: &RegisterCatalog) -> String {
        let mut ranges: BTreeMap<RegisterCategory, (u16, u16, usize)> = BTreeMap::new();
        for register in catalog.registers() {
            let entry = ranges
                .entry(register.id.category)
                .or_insert((u16::MAX, 0, 0));
            entry.0 = entry.0.min(register.id.number);
            entry.1 = entry.1.max(register.id.number);
            entry.2 += 1;
        }
        ranges
            .iter()
            .map(|(category, (low, high, count))| format!("{category}: {count} in {low}..={high}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn ck803_layout() {
        let identity = CpuIdentity::decode(&[0x0480_0003]);
        let catalog = RegisterCatalog::build(&identity, Xlen::X32);

        insta::assert_snapshot!(summary(&catalog), @r###"
        general: 19 in 0..=72
        control-status: 32 in 89..=120
        "###);
    }

    #[test]
    fn ck860_with_float_and_vector() {
        // model bits 0x44: float and vector unit
        let identity = CpuIdentity::decode(&[0x049c_4403]);
        let catalog = RegisterCatalog::build(&identity, Xlen::X32);

        insta::assert_snapshot!(summary(&catalog), @r###"
        general: 19 in 0..=72
        control-status: 43 in 89..=135
        float: 16 in 40..=55
        vector: 16 in 56..=71
        "###);
    }

    #[test]
    fn rv64_layout() {
        let identity = CpuIdentity::riscv(CpuArch::Rv64, &[]);
        let catalog = RegisterCatalog::build(&identity, Xlen::X64);

        let pc = catalog.pc().unwrap();
        assert_eq!(pc.id.number, 32);
        assert_eq!(pc.width, 64);
        assert_eq!(
            catalog.frame_registers(),
            Some(FrameRegisters {
                pc: 32,
                sp: 2,
                fp: 8
            })
        );
    }

    #[test]
    fn resolution_is_injective_within_a_category() {
        for identity in [
            CpuIdentity::decode(&[0x049c_4403]),
            CpuIdentity::decode(&[0x4000_0001]),
            CpuIdentity::riscv(CpuArch::Rv32, &[]),
        ] {
            let catalog = RegisterCatalog::build(&identity, Xlen::X32);
            let mut seen = std::collections::HashSet::new();
            for register in catalog.registers() {
                assert!(seen.insert(register.id), "{} listed twice", register.id);
            }

            let mut locations = std::collections::HashSet::new();
            for register in catalog.registers() {
                assert!(
                    locations.insert(register.location),
                    "{} aliases {:?}",
                    register.name,
                    register.location
                );
            }
        }
    }

    #[test]
    fn names_and_aliases() {
        let catalog = RegisterCatalog::build(&CpuIdentity::decode(&[0x0480_0003]), Xlen::X32);

        assert_eq!(catalog.resolve_name("$r5").unwrap().id.number, 5);
        assert_eq!(catalog.resolve_name("SP").unwrap().id.number, 14);
        assert_eq!(catalog.resolve_name("pc").unwrap().id.number, 72);
        assert_eq!(catalog.resolve_name("cr13").unwrap().id.number, 102);
        assert_eq!(catalog.resolve_name("hcr").unwrap().id.category, RegisterCategory::Had);
        assert!(matches!(
            catalog.resolve_name("x10"),
            Err(Error::RegisterNotFound(_))
        ));

        let catalog =
            RegisterCatalog::build(&CpuIdentity::riscv(CpuArch::Rv32, &[]), Xlen::X32);
        assert_eq!(catalog.resolve_name("x10").unwrap().name, "a0");
        assert_eq!(catalog.resolve_name("csr0x300").unwrap().id.number, 0x300 + 65);
        assert_eq!(catalog.resolve_name("fp").unwrap().id.number, 8);
        assert_eq!(
            catalog.resolve_name("dmcontrol").unwrap().location,
            RegisterLocation::Dm(0x10)
        );
    }

    #[test]
    fn rejects_numbers_outside_known_ranges() {
        let catalog = RegisterCatalog::build(&CpuIdentity::decode(&[0x0480_0003]), Xlen::X32);
        let id = RegisterId::new(RegisterCategory::General, 30);
        assert!(matches!(catalog.resolve(id), Err(Error::InvalidRegister(i)) if i == id));
        // no float unit on this CK803
        assert!(catalog.resolve_number(40).is_err());

        let catalog =
            RegisterCatalog::build(&CpuIdentity::riscv(CpuArch::Rv32, &[]), Xlen::X32);
        // any CSR address is accepted
        let csr = catalog.resolve_number(0x7c0 + 65).unwrap();
        assert_eq!(csr.location, RegisterLocation::Abstract(0x7c0));
        assert!(catalog.resolve_number(5000).is_err());
        assert!(catalog
            .resolve(RegisterId::new(RegisterCategory::Csr, 64))
            .is_err());
    }

    #[test]
    fn value_width_is_checked() {
        let catalog = RegisterCatalog::build(&CpuIdentity::decode(&[0x0480_0003]), Xlen::X32);
        let r0 = catalog.resolve_number(0).unwrap();

        assert!(r0.check(&RegisterValue::U32(u32::MAX)).is_ok());
        assert!(r0.check(&RegisterValue::U64(0xffff_ffff)).is_ok());
        assert!(matches!(
            r0.check(&RegisterValue::U64(0x1_0000_0000)),
            Err(Error::ValueTooWide { width: 32, .. })
        ));
    }

    #[test]
    fn value_bytes() {
        let value = RegisterValue::from_le_bytes(&[0x78, 0x56, 0x34, 0x12], 32);
        assert_eq!(value, RegisterValue::U32(0x1234_5678));
        assert_eq!(value.to_le_bytes(8), vec![0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0]);

        let block = RegisterValue::from_le_bytes(&[1; 16], 128);
        assert_eq!(block.significant_bits(), 128);
        assert_eq!(block.as_u64(), None);
    }
}
