//! C-SKY register numbering, for both ABI v1 and ABI v2 cores.

use super::{
    parse_number, RegisterCategory, RegisterDescriptor, RegisterId, RegisterLocation, RegisterRole,
};
use crate::identity::{CpuArch, CpuIdentity};
use std::borrow::Cow;

/// Debugger number of `r0`.
pub const GR_BASE: u16 = 0;
/// Debugger number of `hi`.
pub const HI: u16 = 20;
/// Debugger number of `lo`.
pub const LO: u16 = 21;
/// Debugger number of `fr0` on ABI v1 cores.
pub const FR_BASE_V1: u16 = 24;
/// Debugger number of `fr0` on ABI v2 cores.
pub const FR_BASE_V2: u16 = 40;
/// Debugger number of `vr0` on ABI v2 cores.
pub const VR_BASE_V2: u16 = 56;
/// Debugger number of the program counter.
pub const PC: u16 = 72;
/// Debugger number of `cr0` (`psr`).
pub const CR_BASE: u16 = 89;
/// Debugger number of the first float control register.
pub const FCR_BASE: u16 = 121;
/// Debugger number of the first MMU register.
pub const MMU_BASE: u16 = 128;
/// Debugger number of the first profiling control register.
pub const PROFCR_BASE: u16 = 140;
/// Debugger number of the first profiling general register.
pub const PROFGR_BASE: u16 = 144;

/// The control register holding the CPUID.
pub const CPUID_REGISTER: u16 = CR_BASE + 13;
/// `psr`.
pub const PSR: u16 = CR_BASE;
/// `vbr`.
pub const VBR: u16 = CR_BASE + 1;

const CR_NAMES: [&str; 14] = [
    "psr", "vbr", "epsr", "fpsr", "epc", "fpc", "ss0", "ss1", "ss2", "ss3", "ss4", "gcr", "gsr",
    "cpidr",
];

const FCR_NAMES: [&str; 3] = ["fid", "fcr", "fesr"];

const MMU_NAMES: [&str; 8] = ["mir", "mrr", "mel0", "mel1", "meh", "mcr", "mpr", "mwr"];

fn has_mmu(arch: CpuArch) -> bool {
    matches!(
        arch,
        CpuArch::Ck610 | CpuArch::Ck807 | CpuArch::Ck810 | CpuArch::Ck820 | CpuArch::Ck860
    )
}

fn cpu(
    name: impl Into<Cow<'static, str>>,
    category: RegisterCategory,
    number: u16,
    width: u16,
) -> RegisterDescriptor {
    RegisterDescriptor::new(name, category, number, width, RegisterLocation::Cpu(number))
}

/// Builds the CPU register list of a C-SKY core.
pub(super) fn build(identity: &CpuIdentity) -> Vec<RegisterDescriptor> {
    let abiv1 = identity.arch.is_abiv1();
    let sp = if abiv1 { 0 } else { 14 };
    let mut registers = Vec::new();

    for n in 0..16u16 {
        let mut register = cpu(format!("r{n}"), RegisterCategory::General, GR_BASE + n, 32);
        register = match n {
            n if n == sp => register.with_role(RegisterRole::StackPointer),
            8 => register.with_role(RegisterRole::FramePointer),
            15 => register.with_role(RegisterRole::ReturnAddress),
            _ => register,
        };
        registers.push(register);
    }
    registers.push(cpu("hi", RegisterCategory::General, HI, 32));
    registers.push(cpu("lo", RegisterCategory::General, LO, 32));

    if identity.features.float {
        let base = if abiv1 { FR_BASE_V1 } else { FR_BASE_V2 };
        for n in 0..16u16 {
            registers.push(cpu(format!("fr{n}"), RegisterCategory::Float, base + n, 64));
        }
    }

    if identity.features.vector && !abiv1 {
        for n in 0..16u16 {
            registers.push(cpu(format!("vr{n}"), RegisterCategory::Vector, VR_BASE_V2 + n, 128));
        }
    }

    registers.push(
        cpu("pc", RegisterCategory::General, PC, 32).with_role(RegisterRole::ProgramCounter),
    );

    for n in 0..32u16 {
        let name: Cow<'static, str> = match CR_NAMES.get(n as usize) {
            Some(name) => Cow::Borrowed(*name),
            None => Cow::Owned(format!("cr{n}")),
        };
        registers.push(cpu(name, RegisterCategory::ControlStatus, CR_BASE + n, 32));
    }

    if identity.features.float {
        for (n, name) in FCR_NAMES.iter().enumerate() {
            registers.push(cpu(*name, RegisterCategory::ControlStatus, FCR_BASE + n as u16, 32));
        }
    }

    if has_mmu(identity.arch) {
        for (n, name) in MMU_NAMES.iter().enumerate() {
            registers.push(cpu(*name, RegisterCategory::ControlStatus, MMU_BASE + n as u16, 32));
        }
    }

    if identity.features.profiling && !abiv1 {
        for n in 0..4u16 {
            registers.push(cpu(
                format!("profcr{n}"),
                RegisterCategory::ControlStatus,
                PROFCR_BASE + n,
                32,
            ));
        }
        for n in 0..8u16 {
            registers.push(cpu(
                format!("profgr{n}"),
                RegisterCategory::ControlStatus,
                PROFGR_BASE + n,
                32,
            ));
        }
    }

    registers
}

/// HAD register selects. Banks 1 to 3 are reached through `BSEL`.
pub mod had {
    pub const HID: u8 = 0x02;
    pub const HTCR: u8 = 0x03;
    pub const MBCA: u8 = 0x04;
    pub const MBCB: u8 = 0x05;
    pub const PCFIFO: u8 = 0x06;
    pub const BABA: u8 = 0x07;
    pub const BABB: u8 = 0x08;
    pub const BAMA: u8 = 0x09;
    pub const BAMB: u8 = 0x0a;
    pub const CPUSCR: u8 = 0x0b;
    pub const HCR: u8 = 0x0d;
    pub const HSR: u8 = 0x0e;
    pub const HSR2: u8 = 0x0f;
    pub const SCRWBBR: u8 = 0x11;
    pub const SCRPSR: u8 = 0x12;
    pub const SCRPC: u8 = 0x13;
    pub const SCRIR: u8 = 0x14;
    pub const SCRCSR: u8 = 0x15;
    pub const DCCDATA: u8 = 0x16;
    pub const DDCADDR: u8 = 0x18;
    pub const DDCDATA: u8 = 0x19;
    pub const CPUSEL: u8 = 0x1a;
    pub const CPUST: u8 = 0x1b;
    pub const BSEL: u8 = 0x1e;
    pub const HCDI: u8 = 0x1f;
    pub const BABC: u8 = 0x20;
    pub const BAMC: u8 = 0x21;
    pub const DACSR: u8 = 0x38;
    pub const EDCR: u8 = 0x40;
    pub const DPCR: u8 = 0x41;
    pub const RESET_STATUS: u8 = 0x61;
}

/// The HAD registers shown to users.
pub(super) fn had_registers() -> Vec<RegisterDescriptor> {
    use had::*;

    let mut list: Vec<(String, u8, u16)> = [
        ("hid", HID, 32),
        ("htcr", HTCR, 16),
        ("mbca", MBCA, 16),
        ("mbcb", MBCB, 16),
        ("pcfifo", PCFIFO, 32),
        ("baba", BABA, 32),
        ("babb", BABB, 32),
        ("bama", BAMA, 32),
        ("bamb", BAMB, 32),
        ("cpuscr", CPUSCR, 128),
        ("hcr", HCR, 32),
        ("hsr", HSR, 32),
        ("hsr2", HSR2, 32),
        ("scrwbbr", SCRWBBR, 32),
        ("scrpsr", SCRPSR, 32),
        ("scrpc", SCRPC, 32),
        ("scrir", SCRIR, 32),
        ("scrcsr", SCRCSR, 32),
        ("dccdata", DCCDATA, 32),
        ("ddcaddr", DDCADDR, 32),
        ("ddcdata", DDCDATA, 32),
        ("cpusel", CPUSEL, 32),
        ("cpust", CPUST, 32),
        ("bsel", BSEL, 32),
        ("hcdi", HCDI, 32),
    ]
    .into_iter()
    .map(|(name, select, width)| (name.to_string(), select, width))
    .collect();

    // Breakpoint units C to I, address and mask registers interleaved.
    for (unit, letter) in ('c'..='i').enumerate() {
        let unit = unit as u8;
        list.push((format!("bab{letter}"), BABC + unit * 2, 32));
        list.push((format!("bam{letter}"), BAMC + unit * 2, 32));
    }

    list.extend(
        [
            ("dacsr", DACSR, 32),
            ("datr", DACSR + 1, 32),
            ("darwr", DACSR + 2, 32),
            ("mbir", DACSR + 3, 32),
            ("mbee", DACSR + 4, 32),
            ("mbse", DACSR + 5, 32),
            ("edcr", EDCR, 32),
            ("dpcr", DPCR, 32),
            ("reset_status", RESET_STATUS, 32),
        ]
        .into_iter()
        .map(|(name, select, width)| (name.to_string(), select, width)),
    );

    list.into_iter()
        .map(|(name, select, width)| {
            RegisterDescriptor::new(
                name,
                RegisterCategory::Had,
                u16::from(select),
                width,
                RegisterLocation::Had(select),
            )
        })
        .collect()
}

/// Names that are not listed verbatim: `r<n>` for ABI v1 style access and `cr<n>`.
pub(super) fn alias(name: &str) -> Option<RegisterId> {
    if let Some(n) = name.strip_prefix("cr").and_then(parse_number) {
        return (n < 32).then(|| RegisterId::new(RegisterCategory::ControlStatus, CR_BASE + n));
    }
    if let Some(n) = name.strip_prefix('r').and_then(parse_number) {
        return (n < 16).then(|| RegisterId::new(RegisterCategory::General, GR_BASE + n));
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn abiv1_stack_pointer_is_r0() {
        let identity = CpuIdentity::decode(&[0x4000_0001]);
        let registers = build(&identity);

        let sp = registers
            .iter()
            .find(|r| r.role == Some(RegisterRole::StackPointer))
            .unwrap();
        assert_eq!(sp.name, "r0");
        // CK610 has an MMU
        assert!(registers.iter().any(|r| r.name == "mcr"));
    }

    #[test]
    fn had_units_follow_bank_layout() {
        let registers = had_registers();
        let bami = registers.iter().find(|r| r.name == "bami").unwrap();
        assert_eq!(bami.location, RegisterLocation::Had(0x2d));
    }

    #[test]
    fn control_registers_fall_back_to_numbered_names() {
        let registers = build(&CpuIdentity::decode(&[0x0480_0003]));
        let name_of = |number: u16| {
            registers
                .iter()
                .find(|r| r.id == RegisterId::new(RegisterCategory::ControlStatus, number))
                .map(|r| r.name.to_string())
        };

        assert_eq!(name_of(CR_BASE).as_deref(), Some("psr"));
        assert_eq!(name_of(CPUID_REGISTER).as_deref(), Some("cpidr"));
        assert_eq!(name_of(CR_BASE + 20).as_deref(), Some("cr20"));
    }

    #[test]
    fn cpuid_register_number() {
        assert_eq!(CPUID_REGISTER, 102);
        assert_eq!(
            alias("cr13"),
            Some(RegisterId::new(RegisterCategory::ControlStatus, 102))
        );
        assert_eq!(alias("cr32"), None);
    }
}
