//! RISC-V register numbering.
//!
//! General registers use `x0..x31` (0 to 31), the program counter is 32 and `f0..f31` follow
//! from 33. CSRs are numbered `65 + address`, followed by the privilege pseudo register and
//! the vector registers.

use super::{
    parse_number, RegisterCategory, RegisterDescriptor, RegisterId, RegisterLocation, RegisterRole,
};
use crate::identity::CpuIdentity;
use crate::link::Xlen;
use std::borrow::Cow;

/// Debugger number of the program counter.
pub const PC: u16 = 32;
/// Debugger number of `f0`.
pub const FPR_BASE: u16 = 33;
/// Offset of CSR numbers over the CSR address.
pub const CSR_BASE: u16 = 65;
/// Number of CSR addresses.
pub const CSR_COUNT: u16 = 4096;
/// Debugger number of the privilege level pseudo register.
pub const PRIV: u16 = CSR_BASE + CSR_COUNT;
/// Debugger number of `v0`.
pub const VR_BASE: u16 = PRIV + 1;

/// Abstract command register number of `x0`.
pub const ABSTRACT_GPR_BASE: u16 = 0x1000;
/// Abstract command register number of `f0`.
pub const ABSTRACT_FPR_BASE: u16 = 0x1020;

/// CSR addresses used by the debug core.
pub mod csr {
    pub const FFLAGS: u16 = 0x001;
    pub const FRM: u16 = 0x002;
    pub const FCSR: u16 = 0x003;
    pub const MSTATUS: u16 = 0x300;
    pub const MISA: u16 = 0x301;
    pub const MIE: u16 = 0x304;
    pub const MTVEC: u16 = 0x305;
    pub const MSCRATCH: u16 = 0x340;
    pub const MEPC: u16 = 0x341;
    pub const MCAUSE: u16 = 0x342;
    pub const MTVAL: u16 = 0x343;
    pub const MIP: u16 = 0x344;
    pub const TSELECT: u16 = 0x7a0;
    pub const TDATA1: u16 = 0x7a1;
    pub const TDATA2: u16 = 0x7a2;
    pub const TDATA3: u16 = 0x7a3;
    pub const TINFO: u16 = 0x7a4;
    pub const DCSR: u16 = 0x7b0;
    pub const DPC: u16 = 0x7b1;
    pub const DSCRATCH0: u16 = 0x7b2;
    pub const DSCRATCH1: u16 = 0x7b3;
    pub const MXSTATUS: u16 = 0x7c0;
    pub const MHCR: u16 = 0x7c1;
    pub const MCOR: u16 = 0x7c2;
    pub const MCCR2: u16 = 0x7c3;
    pub const MHINT: u16 = 0x7c5;
    pub const MRVBR: u16 = 0x7c7;
    pub const MCYCLE: u16 = 0xb00;
    pub const MINSTRET: u16 = 0xb02;
    pub const MCYCLEH: u16 = 0xb80;
    pub const MINSTRETH: u16 = 0xb82;
    pub const MVENDORID: u16 = 0xf11;
    pub const MARCHID: u16 = 0xf12;
    pub const MIMPID: u16 = 0xf13;
    pub const MHARTID: u16 = 0xf14;
    pub const CPUID: u16 = 0xfc0;
    pub const VSTART: u16 = 0x008;
    pub const VXSAT: u16 = 0x009;
    pub const VXRM: u16 = 0x00a;
    pub const VL: u16 = 0xc20;
    pub const VTYPE: u16 = 0xc21;
    pub const VLENB: u16 = 0xc22;
}

const GPR_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

/// The debugger number of the CSR at `address`.
pub const fn csr_number(address: u16) -> u16 {
    CSR_BASE + address
}

fn csr_descriptor(
    name: impl Into<Cow<'static, str>>,
    address: u16,
    width: u16,
) -> RegisterDescriptor {
    RegisterDescriptor::new(
        name,
        RegisterCategory::Csr,
        csr_number(address),
        width,
        RegisterLocation::Abstract(address),
    )
}

/// Builds the CPU register list of a RISC-V hart.
pub(super) fn build(identity: &CpuIdentity, xlen: Xlen) -> Vec<RegisterDescriptor> {
    let bits = xlen.bits() as u16;
    let mut registers = Vec::new();

    for (n, name) in GPR_NAMES.iter().enumerate() {
        let n = n as u16;
        let register = RegisterDescriptor::new(
            *name,
            RegisterCategory::General,
            n,
            bits,
            RegisterLocation::Abstract(ABSTRACT_GPR_BASE + n),
        );
        registers.push(match n {
            1 => register.with_role(RegisterRole::ReturnAddress),
            2 => register.with_role(RegisterRole::StackPointer),
            8 => register.with_role(RegisterRole::FramePointer),
            _ => register,
        });
    }

    registers.push(
        RegisterDescriptor::new(
            "pc",
            RegisterCategory::General,
            PC,
            bits,
            RegisterLocation::Abstract(csr::DPC),
        )
        .with_role(RegisterRole::ProgramCounter),
    );

    if identity.features.float {
        for n in 0..32u16 {
            registers.push(RegisterDescriptor::new(
                format!("f{n}"),
                RegisterCategory::Float,
                FPR_BASE + n,
                64,
                RegisterLocation::Abstract(ABSTRACT_FPR_BASE + n),
            ));
        }
        registers.push(csr_descriptor("fflags", csr::FFLAGS, 32));
        registers.push(csr_descriptor("frm", csr::FRM, 32));
        registers.push(csr_descriptor("fcsr", csr::FCSR, 32));
    }

    let machine = [
        ("mstatus", csr::MSTATUS),
        ("misa", csr::MISA),
        ("mie", csr::MIE),
        ("mtvec", csr::MTVEC),
        ("mscratch", csr::MSCRATCH),
        ("mepc", csr::MEPC),
        ("mcause", csr::MCAUSE),
        ("mtval", csr::MTVAL),
        ("mip", csr::MIP),
        ("tselect", csr::TSELECT),
        ("tdata1", csr::TDATA1),
        ("tdata2", csr::TDATA2),
        ("tdata3", csr::TDATA3),
        ("tinfo", csr::TINFO),
        ("dcsr", csr::DCSR),
        ("dscratch0", csr::DSCRATCH0),
        ("dscratch1", csr::DSCRATCH1),
        ("mxstatus", csr::MXSTATUS),
        ("mhcr", csr::MHCR),
        ("mcor", csr::MCOR),
        ("mccr2", csr::MCCR2),
        ("mhint", csr::MHINT),
        ("mrvbr", csr::MRVBR),
        ("mcycle", csr::MCYCLE),
        ("minstret", csr::MINSTRET),
    ];
    for (name, address) in machine {
        registers.push(csr_descriptor(name, address, bits));
    }

    if xlen == Xlen::X32 {
        registers.push(csr_descriptor("mcycleh", csr::MCYCLEH, 32));
        registers.push(csr_descriptor("minstreth", csr::MINSTRETH, 32));
    }

    for (name, address) in [
        ("mvendorid", csr::MVENDORID),
        ("marchid", csr::MARCHID),
        ("mimpid", csr::MIMPID),
        ("mhartid", csr::MHARTID),
        ("cpuid", csr::CPUID),
    ] {
        registers.push(csr_descriptor(name, address, bits));
    }

    if identity.features.vector {
        for (name, address) in [
            ("vstart", csr::VSTART),
            ("vxsat", csr::VXSAT),
            ("vxrm", csr::VXRM),
            ("vl", csr::VL),
            ("vtype", csr::VTYPE),
            ("vlenb", csr::VLENB),
        ] {
            registers.push(csr_descriptor(name, address, bits));
        }
    }

    registers.push(RegisterDescriptor::new(
        "priv",
        RegisterCategory::Csr,
        PRIV,
        8,
        RegisterLocation::Privilege,
    ));

    if identity.features.vector {
        for n in 0..32u16 {
            registers.push(RegisterDescriptor::new(
                format!("v{n}"),
                RegisterCategory::Vector,
                VR_BASE + n,
                128,
                RegisterLocation::Cpu(VR_BASE + n),
            ));
        }
    }

    registers
}

/// Synthesizes a descriptor for any CSR in the architectural address space.
///
/// The program counter alias `dpc` is not reachable this way.
pub(super) fn any_csr(id: RegisterId) -> Option<RegisterDescriptor> {
    if id.category != RegisterCategory::Csr {
        return None;
    }
    let address = id.number.checked_sub(CSR_BASE)?;
    if address >= CSR_COUNT || address == csr::DPC {
        return None;
    }
    // Width is not known for arbitrary CSRs, assume the widest.
    Some(csr_descriptor(format!("csr{address:#05x}"), address, 64))
}

/// `x<n>` and `csr<address>` style names.
pub(super) fn alias(name: &str) -> Option<RegisterId> {
    if let Some(n) = name.strip_prefix('x').and_then(parse_number) {
        return (n < 32).then(|| RegisterId::new(RegisterCategory::General, n));
    }
    if let Some(address) = name.strip_prefix("csr").and_then(parse_number) {
        return (address < CSR_COUNT)
            .then(|| RegisterId::new(RegisterCategory::Csr, csr_number(address)));
    }
    None
}

/// DMI addresses of the debug module registers.
pub mod dm {
    pub const DATA0: u8 = 0x04;
    pub const DMCONTROL: u8 = 0x10;
    pub const DMSTATUS: u8 = 0x11;
    pub const HARTINFO: u8 = 0x12;
    pub const HALTSUM1: u8 = 0x13;
    pub const ABSTRACTCS: u8 = 0x16;
    pub const COMMAND: u8 = 0x17;
    pub const ABSTRACTAUTO: u8 = 0x18;
    pub const NEXTDM: u8 = 0x1d;
    pub const PROGBUF0: u8 = 0x20;
    pub const AUTHDATA: u8 = 0x30;
    pub const HALTSUM2: u8 = 0x34;
    pub const HALTSUM3: u8 = 0x35;
    pub const SBCS: u8 = 0x38;
    pub const SBADDRESS0: u8 = 0x39;
    pub const SBDATA0: u8 = 0x3c;
    pub const HALTSUM0: u8 = 0x40;
}

/// The debug module registers shown to users.
pub(super) fn dm_registers() -> Vec<RegisterDescriptor> {
    let mut list: Vec<(String, u8)> = Vec::new();

    for n in 0..12u8 {
        list.push((format!("data{n}"), dm::DATA0 + n));
    }
    for (name, address) in [
        ("dmcontrol", dm::DMCONTROL),
        ("dmstatus", dm::DMSTATUS),
        ("hartinfo", dm::HARTINFO),
        ("haltsum1", dm::HALTSUM1),
        ("abstractcs", dm::ABSTRACTCS),
        ("command", dm::COMMAND),
        ("abstractauto", dm::ABSTRACTAUTO),
        ("nextdm", dm::NEXTDM),
    ] {
        list.push((name.to_string(), address));
    }
    for n in 0..16u8 {
        list.push((format!("progbuf{n}"), dm::PROGBUF0 + n));
    }
    for (name, address) in [
        ("authdata", dm::AUTHDATA),
        ("haltsum2", dm::HALTSUM2),
        ("haltsum3", dm::HALTSUM3),
        ("sbcs", dm::SBCS),
        ("sbaddress0", dm::SBADDRESS0),
        ("sbaddress1", dm::SBADDRESS0 + 1),
        ("sbdata0", dm::SBDATA0),
        ("sbdata1", dm::SBDATA0 + 1),
        ("haltsum0", dm::HALTSUM0),
    ] {
        list.push((name.to_string(), address));
    }

    list.into_iter()
        .map(|(name, address)| {
            RegisterDescriptor::new(
                name,
                RegisterCategory::Dm,
                u16::from(address),
                32,
                RegisterLocation::Dm(address),
            )
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identity::{CpuArch, CpuIdentity};
    use pretty_assertions::assert_eq;

    #[test]
    fn numbering() {
        assert_eq!(PRIV, 4161);
        assert_eq!(VR_BASE, 4162);
        assert_eq!(csr_number(csr::DCSR), 0x7b0 + 65);
    }

    #[test]
    fn float_and_vector_are_optional() {
        let mut identity = CpuIdentity::riscv(CpuArch::Rv64, &[]);
        let plain = build(&identity, Xlen::X64);
        assert!(!plain.iter().any(|r| r.name == "f0"));

        identity.features.float = true;
        identity.features.vector = true;
        let full = build(&identity, Xlen::X64);
        let f31 = full.iter().find(|r| r.name == "f31").unwrap();
        assert_eq!(f31.id.number, 64);
        let v31 = full.iter().find(|r| r.name == "v31").unwrap();
        assert_eq!(v31.id.number, 4193);
        assert!(!full.iter().any(|r| r.name == "mcycleh"));
    }

    #[test]
    fn synthesized_csr() {
        let id = RegisterId::new(RegisterCategory::Csr, csr_number(0x7d2));
        let register = any_csr(id).unwrap();
        assert_eq!(register.name, "csr0x7d2");
        assert_eq!(
            any_csr(RegisterId::new(RegisterCategory::Csr, csr_number(csr::DPC))),
            None
        );
    }
}
