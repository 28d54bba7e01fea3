//! Decoding of the C-SKY / T-HEAD CPUID words.
//!
//! The CPUID register comes in five layouts. The version field selects the layout, except for
//! a handful of literal values that some parts report on one of their two CPUID registers.

use bitfield::bitfield;
use serde::Serialize;

/// CPUID words that do not follow any layout.
pub const SPECIAL_VALUES: [u32; 4] = [0, 0x0202_5a60, 0x00ca_52a9, 0x55aa_00ff];

/// Mask applied to a version 3 word before comparing it against the model table.
pub const MODEL_MASK_V3: u32 = 0xfffc_000f;
/// Mask applied to a version 4 word before comparing it against the model table.
pub const MODEL_MASK_V4: u32 = 0xfffc_0007;

/// Returns `true` for the literal CPUID values which carry no information.
pub fn is_special(word: u32) -> bool {
    SPECIAL_VALUES.contains(&word)
}

bitfield! {
    /// CPUID version 1, used by CK5xx and early CK6xx cores.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct CpuIdV1(u32);
    impl Debug;
    pub u8, family, _: 31, 28;
    pub u8, model, _: 27, 24;
    pub u8, icache, _: 23, 20;
    pub u8, dcache, _: 19, 16;
    pub u8, foundry, _: 15, 12;
    pub ispm, _: 11;
    pub dspm, _: 10;
    pub u8, process, _: 9, 8;
    pub u8, revision, _: 7, 4;
    pub u8, version, _: 3, 0;
}

bitfield! {
    /// CPUID version 2.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct CpuIdV2(u32);
    impl Debug;
    pub u8, family, _: 31, 28;
    pub u16, model, _: 27, 16;
    pub fpu, _: 20;
    pub u8, foundry, _: 15, 12;
    pub u8, process, _: 11, 8;
    pub u8, revision, _: 7, 4;
    pub u8, version, _: 3, 0;
}

bitfield! {
    /// Index 0 word of CPUID version 3, used by the CK80x family.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct CpuIdV3(u32);
    impl Debug;
    pub u8, index, _: 31, 28;
    pub u8, arch, _: 27, 26;
    pub u8, family, _: 25, 22;
    pub u8, class, _: 21, 18;
    pub u16, model, _: 17, 8;
    pub ck810, _: 18;
    pub u8, revision, _: 7, 4;
    pub u8, version, _: 3, 0;
}

bitfield! {
    /// Index 0 word of CPUID version 4 and 5.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct CpuIdV4(u32);
    impl Debug;
    pub u8, index, _: 31, 28;
    pub u8, arch, _: 27, 26;
    pub u8, family, _: 25, 22;
    pub u8, class, _: 21, 18;
    pub u16, model, _: 17, 8;
    pub u8, isa_revision, _: 7, 3;
    pub u8, version, _: 2, 0;
}

/// A single CPUID word, classified by layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuId {
    /// One of the [`SPECIAL_VALUES`].
    Special(u32),
    /// Version 1 layout.
    V1(CpuIdV1),
    /// Version 2 layout.
    V2(CpuIdV2),
    /// Version 3 layout.
    V3(CpuIdV3),
    /// Version 4 layout.
    V4(CpuIdV4),
    /// Version 5 layout, field-compatible with version 4 at index 0.
    V5(CpuIdV4),
    /// No layout matches.
    Unknown(u32),
}

impl CpuId {
    /// Classifies a raw CPUID word. Every input maps to some variant.
    pub fn decode(word: u32) -> CpuId {
        if is_special(word) {
            return CpuId::Special(word);
        }
        match word & 0xf {
            1 => CpuId::V1(CpuIdV1(word)),
            2 => CpuId::V2(CpuIdV2(word)),
            3 => CpuId::V3(CpuIdV3(word)),
            _ => match word & 0x7 {
                4 => CpuId::V4(CpuIdV4(word)),
                5 => CpuId::V5(CpuIdV4(word)),
                _ => CpuId::Unknown(word),
            },
        }
    }

    /// The raw word.
    pub fn raw(&self) -> u32 {
        match *self {
            CpuId::Special(word) | CpuId::Unknown(word) => word,
            CpuId::V1(id) => id.0,
            CpuId::V2(id) => id.0,
            CpuId::V3(id) => id.0,
            CpuId::V4(id) | CpuId::V5(id) => id.0,
        }
    }

    /// The layout version, `None` for special and unknown words.
    pub fn version(&self) -> Option<u8> {
        match self {
            CpuId::V1(_) => Some(1),
            CpuId::V2(_) => Some(2),
            CpuId::V3(_) => Some(3),
            CpuId::V4(_) => Some(4),
            CpuId::V5(_) => Some(5),
            CpuId::Special(_) | CpuId::Unknown(_) => None,
        }
    }

    /// The index nibble of multi-word layouts (v3 and newer).
    pub fn index(&self) -> Option<u8> {
        match self {
            CpuId::V3(id) => Some(id.index()),
            CpuId::V4(id) | CpuId::V5(id) => Some(id.index()),
            _ => None,
        }
    }
}

/// The processor architecture, as far as the debugger cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CpuArch {
    Ck510,
    Ck610,
    Ck803,
    Ck810,
    Ck802,
    Ck807,
    Ck803s,
    Ck820,
    Ck801,
    Ck860,
    Ck804,
    Ck805,
    Rv32,
    Rv64,
    Unknown,
}

impl CpuArch {
    /// Returns `true` for the RISC-V variants.
    pub fn is_riscv(self) -> bool {
        matches!(self, CpuArch::Rv32 | CpuArch::Rv64)
    }

    /// Returns `true` for cores using the C-SKY ABI v1 instruction set.
    pub fn is_abiv1(self) -> bool {
        matches!(self, CpuArch::Ck510 | CpuArch::Ck610)
    }

    /// The base name of the core, without series prefix.
    pub fn name(self) -> &'static str {
        match self {
            CpuArch::Ck510 => "CK510",
            CpuArch::Ck610 => "CK610",
            CpuArch::Ck803 => "CK803",
            CpuArch::Ck810 => "CK810",
            CpuArch::Ck802 => "CK802",
            CpuArch::Ck807 => "CK807",
            CpuArch::Ck803s => "CK803S",
            CpuArch::Ck820 => "CK820",
            CpuArch::Ck801 => "CK801",
            CpuArch::Ck860 => "CK860",
            CpuArch::Ck804 => "CK804",
            CpuArch::Ck805 => "CK805",
            CpuArch::Rv32 => "RV32",
            CpuArch::Rv64 => "RV64",
            CpuArch::Unknown => "unknown",
        }
    }
}

/// The product series of newer T-HEAD cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CpuSeries {
    E,
    R,
    I,
    S,
    C,
    Unknown,
}

impl CpuSeries {
    fn prefix(self) -> Option<char> {
        match self {
            CpuSeries::E => Some('E'),
            CpuSeries::R => Some('R'),
            CpuSeries::I => Some('I'),
            CpuSeries::S => Some('S'),
            CpuSeries::C => Some('C'),
            CpuSeries::Unknown => None,
        }
    }
}

struct Model {
    pattern: u32,
    arch: CpuArch,
    series: CpuSeries,
    number: &'static str,
}

const fn model(pattern: u32, arch: CpuArch, series: CpuSeries, number: &'static str) -> Model {
    Model {
        pattern,
        arch,
        series,
        number,
    }
}

static MODELS_V3: &[Model] = &[
    model(0x04a4_0003, CpuArch::Ck805, CpuSeries::Unknown, "805"),
    model(0x04a0_0003, CpuArch::Ck804, CpuSeries::Unknown, "804"),
    model(0x040c_0003, CpuArch::Ck804, CpuSeries::E, "804"),
    model(0x049c_0003, CpuArch::Ck860, CpuSeries::Unknown, "860"),
    model(0x0490_0003, CpuArch::Ck803s, CpuSeries::Unknown, "803S"),
    model(0x0480_0003, CpuArch::Ck803, CpuSeries::Unknown, "803"),
    model(0x0488_0003, CpuArch::Ck802, CpuSeries::Unknown, "802"),
    model(0x0498_0003, CpuArch::Ck801, CpuSeries::Unknown, "801"),
];

static MODELS_V4: &[Model] = &[
    model(0x0480_0004, CpuArch::Ck805, CpuSeries::I, "805"),
    model(0x0508_0004, CpuArch::Ck860, CpuSeries::C, "860"),
    model(0x0408_0004, CpuArch::Ck803, CpuSeries::E, "803"),
    model(0x04b4_0004, CpuArch::Ck803, CpuSeries::S, "803"),
    model(0x0404_0004, CpuArch::Ck802, CpuSeries::E, "802"),
    model(0x04b0_0004, CpuArch::Ck802, CpuSeries::S, "802"),
    model(0x0400_0004, CpuArch::Ck801, CpuSeries::E, "801"),
];

fn lookup(table: &'static [Model], word: u32, mask: u32) -> Option<&'static Model> {
    table.iter().find(|m| word & mask == m.pattern)
}

/// Optional capabilities derived from the CPUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Features {
    /// A vector unit is present.
    pub vector: bool,
    /// A floating point unit is present.
    pub float: bool,
    /// Profiling registers are present.
    pub profiling: bool,
}

/// Cache and memory layout from the v3/v4 index words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryLayout {
    pub icache: u8,
    pub dcache: u8,
    pub isram: u8,
    pub dsram: u8,
    pub l2cache: u8,
    pub ibus_if: u8,
    pub dbus_if: u8,
}

/// The fully decoded identity of one CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuIdentity {
    /// The raw words, index 0 first.
    pub words: Vec<u32>,
    /// The index 0 word, classified.
    pub id: CpuId,
    pub arch: CpuArch,
    pub series: CpuSeries,
    pub features: Features,
    pub memory: MemoryLayout,
    /// Number of cores sharing this CPUID, at least 1.
    pub core_count: u32,
    /// Core revision or ISA revision, depending on the layout.
    pub revision: u8,
    model_number: Option<&'static str>,
}

impl CpuIdentity {
    /// Decodes a set of CPUID words as read from the CPUID register.
    ///
    /// Special words are skipped. For multi-word layouts the words are sorted by their index
    /// nibble; the index 0 word determines the layout. An empty or all-special input yields an
    /// identity with [`CpuArch::Unknown`].
    pub fn decode(words: &[u32]) -> CpuIdentity {
        let mut words: Vec<u32> = words.iter().copied().filter(|w| !is_special(*w)).collect();
        let first = words.first().copied();

        let primary = words
            .iter()
            .copied()
            .find(|w| CpuId::decode(*w).index() == Some(0))
            .or(first);

        let Some(primary) = primary else {
            return CpuIdentity::unknown(CpuId::Special(0));
        };

        let id = CpuId::decode(primary);
        if id.index().is_some() {
            words.sort_by_key(|w| (*w >> 28, *w));
            words.dedup_by_key(|w| *w >> 28);
        }

        let mut identity = CpuIdentity::unknown(id);
        identity.words = words;

        match id {
            CpuId::V1(v1) => {
                identity.arch = if v1.family() >= 4 {
                    CpuArch::Ck610
                } else {
                    CpuArch::Ck510
                };
                identity.revision = v1.revision();
                identity.memory.icache = v1.icache();
                identity.memory.dcache = v1.dcache();
            }
            CpuId::V2(v2) => {
                identity.arch = if v2.family() == 1 {
                    CpuArch::Ck610
                } else {
                    CpuArch::Ck510
                };
                identity.revision = v2.revision();
                identity.features.float = v2.fpu();
            }
            CpuId::V3(v3) => {
                let model = lookup(MODELS_V3, primary, MODEL_MASK_V3);
                identity.arch = match model {
                    Some(model) => model.arch,
                    None if v3.ck810() => CpuArch::Ck810,
                    None => CpuArch::Unknown,
                };
                if let Some(model) = model {
                    identity.series = model.series;
                    identity.model_number = Some(model.number);
                }
                identity.revision = v3.revision();
                identity.features.vector = v3.model() & 0x40 != 0;
                identity.features.float = v3.model() & 0x4 != 0;
                identity.decode_v3_indices();
            }
            CpuId::V4(v4) => {
                if let Some(model) = lookup(MODELS_V4, primary, MODEL_MASK_V4) {
                    identity.arch = model.arch;
                    identity.series = model.series;
                    identity.model_number = Some(model.number);
                }
                identity.revision = v4.isa_revision();
                identity.features.vector = v4.model() & 0x8 != 0;
                identity.features.float = v4.model() & 0x1 != 0;
                identity.decode_v4_indices();
            }
            CpuId::V5(v5) => {
                // RV32 or RV64 is settled by the debug module, not by the CPUID.
                identity.revision = v5.isa_revision();
                identity.decode_v4_indices();
            }
            CpuId::Special(_) | CpuId::Unknown(_) => {}
        }

        identity
    }

    fn unknown(id: CpuId) -> CpuIdentity {
        CpuIdentity {
            words: vec![],
            id,
            arch: CpuArch::Unknown,
            series: CpuSeries::Unknown,
            features: Features::default(),
            memory: MemoryLayout::default(),
            core_count: 1,
            revision: 0,
            model_number: None,
        }
    }

    /// An identity for a RISC-V hart, whose width is known from the debug module.
    pub fn riscv(arch: CpuArch, words: &[u32]) -> CpuIdentity {
        let mut identity = CpuIdentity::decode(words);
        identity.arch = arch;
        identity
    }

    fn word(&self, index: u32) -> Option<u32> {
        self.words.iter().copied().find(|w| *w >> 28 == index)
    }

    fn decode_v3_indices(&mut self) {
        if let Some(word) = self.word(1) {
            // coprocessor field, bit 0 is the profiling unit
            self.features.profiling = word & 0xffff & 0x1 != 0;
        }
        if let Some(word) = self.word(3) {
            self.memory.dbus_if = ((word >> 26) & 0x3) as u8;
            self.memory.ibus_if = ((word >> 24) & 0x3) as u8;
            self.memory.dsram = ((word >> 12) & 0xf) as u8;
            self.memory.isram = ((word >> 8) & 0xf) as u8;
            self.memory.dcache = ((word >> 4) & 0xf) as u8;
            self.memory.icache = (word & 0xf) as u8;
        }
        if let Some(word) = self.word(4) {
            self.memory.l2cache = (word & 0xf) as u8;
        }
        if let Some(word) = self.word(5) {
            self.core_count = (word & 0xf) + 1;
        }
    }

    fn decode_v4_indices(&mut self) {
        if let Some(word) = self.word(1) {
            self.memory.dcache = ((word >> 4) & 0xf) as u8;
            self.memory.icache = (word & 0xf) as u8;
        }
        if let Some(word) = self.word(2) {
            self.memory.l2cache = (word & 0xf) as u8;
        }
        if let Some(word) = self.word(5) {
            self.core_count = (word & 0x7) + 1;
        }
    }

    /// `true` if the index 0 word matched a known model.
    pub fn is_known(&self) -> bool {
        self.arch != CpuArch::Unknown
    }

    /// Fails with [`crate::Error::UnrecognizedIdentity`] for unknown CPUs.
    pub fn require_known(&self) -> Result<(), crate::Error> {
        if self.is_known() {
            Ok(())
        } else {
            Err(crate::Error::UnrecognizedIdentity(self.id.raw()))
        }
    }

    /// The CPU name as shown to users, e.g. `CK803` or `E902`-style series names.
    pub fn name(&self) -> String {
        match (self.series.prefix(), self.model_number) {
            (Some(prefix), Some(number)) => format!("{prefix}{number}"),
            _ => self.arch.name().to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(0x0480_0003, CpuArch::Ck803, "CK803"; "ck803")]
    #[test_case(0x0488_0003, CpuArch::Ck802, "CK802"; "ck802")]
    #[test_case(0x049c_0003, CpuArch::Ck860, "CK860"; "ck860")]
    #[test_case(0x040c_0003, CpuArch::Ck804, "E804"; "e804")]
    #[test_case(0x0484_0003, CpuArch::Ck810, "CK810"; "ck810 class bit")]
    #[test_case(0x0408_0004, CpuArch::Ck803, "E803"; "e803")]
    #[test_case(0x04b4_0004, CpuArch::Ck803, "S803"; "s803")]
    #[test_case(0x0480_0004, CpuArch::Ck805, "I805"; "i805")]
    #[test_case(0x0508_0004, CpuArch::Ck860, "C860"; "c860")]
    #[test_case(0x4000_0001, CpuArch::Ck610, "CK610"; "v1 ck6xx")]
    #[test_case(0x1000_0001, CpuArch::Ck510, "CK510"; "v1 ck5xx")]
    #[test_case(0x1000_0002, CpuArch::Ck610, "CK610"; "v2 ck6xx")]
    fn classify(word: u32, arch: CpuArch, name: &str) {
        let identity = CpuIdentity::decode(&[word]);

        assert_eq!(identity.arch, arch);
        assert_eq!(identity.name(), name);
    }

    #[test]
    fn unassigned_version_is_unknown() {
        for word in [0x0480_0006, 0x0480_0008, 0x0480_000f] {
            let identity = CpuIdentity::decode(&[word]);
            assert_eq!(identity.id, CpuId::Unknown(word));
            assert_eq!(identity.arch, CpuArch::Unknown);
            assert!(identity.require_known().is_err());
        }
    }

    #[test]
    fn special_values_decode() {
        for word in SPECIAL_VALUES {
            assert_eq!(CpuId::decode(word), CpuId::Special(word));
        }

        // A CK802 reports a special value next to its real CPUID.
        let identity = CpuIdentity::decode(&[0x0202_5a60, 0x0488_0003]);
        assert_eq!(identity.arch, CpuArch::Ck802);
        assert_eq!(identity.words, vec![0x0488_0003]);
    }

    #[test]
    fn every_version_decodes() {
        assert_eq!(CpuId::decode(0x0000_0011).version(), Some(1));
        assert_eq!(CpuId::decode(0x0000_0012).version(), Some(2));
        assert_eq!(CpuId::decode(0x0000_0013).version(), Some(3));
        assert_eq!(CpuId::decode(0x0000_000c).version(), Some(4));
        assert_eq!(CpuId::decode(0x0000_000d).version(), Some(5));
    }

    #[test]
    fn random_words_never_panic() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let word: u32 = rng.gen();
            let identity = CpuIdentity::decode(&[word]);
            if identity.arch == CpuArch::Unknown {
                assert_eq!(identity.name(), "unknown");
            }
        }
    }

    #[test]
    fn v3_index_words() {
        let identity = CpuIdentity::decode(&[
            0x5000_0003, // core count 1 + 3
            0x0480_4403, // ck803 with float and vector model bits
            0x1000_0001,
            0x3500_1234,
            0x4000_0002,
        ]);

        assert_eq!(identity.arch, CpuArch::Ck803);
        assert_eq!(identity.core_count, 4);
        assert_eq!(identity.memory.l2cache, 2);
        assert_eq!(identity.memory.ibus_if, 1);
        assert_eq!(identity.memory.dbus_if, 1);
        assert_eq!(identity.memory.dsram, 1);
        assert_eq!(identity.memory.isram, 2);
        assert_eq!(identity.memory.dcache, 3);
        assert_eq!(identity.memory.icache, 4);
        assert!(identity.features.float);
        assert!(identity.features.vector);
        assert!(identity.features.profiling);
        assert_eq!(identity.words[0], 0x0480_4403);
    }

    #[test]
    fn v5_leaves_arch_to_the_debug_module() {
        let identity = CpuIdentity::decode(&[0x0000_000d]);
        assert_eq!(identity.arch, CpuArch::Unknown);

        let identity = CpuIdentity::riscv(CpuArch::Rv64, &[0x0000_000d]);
        assert_eq!(identity.arch, CpuArch::Rv64);
        assert_eq!(identity.name(), "RV64");
    }
}
