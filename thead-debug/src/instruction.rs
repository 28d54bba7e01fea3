//! The small amount of instruction decoding the target layer needs: instruction lengths,
//! trap encodings for software breakpoints, and load/store recognition for watchpoint
//! resolution.

use serde::{Deserialize, Serialize};

use crate::memory::Endian;
use crate::Error;

/// Instruction set of a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionSet {
    /// C-SKY ABI v1 (CK510/CK610): fixed 16-bit instructions.
    CskyV1,
    /// C-SKY ABI v2 (CK8xx): mixed 16/32-bit instructions.
    CskyV2,
    /// RISC-V with the compressed extension.
    RiscV,
}

/// C-SKY stack pointer in ABI v2.
pub const CSKY_SP: u8 = 14;
/// RISC-V stack pointer, `x2`.
pub const RISCV_SP: u8 = 2;

const CSKY_BKPT16: u16 = 0x0000;
const RISCV_EBREAK: u32 = 0x0010_0073;
const RISCV_C_EBREAK: u16 = 0x9002;

impl InstructionSet {
    /// Length in bytes of the instruction whose first 16-bit parcel is `parcel`.
    pub fn instruction_length(self, parcel: u16) -> u32 {
        match self {
            InstructionSet::CskyV1 => 2,
            InstructionSet::CskyV2 => {
                if parcel & 0xc000 == 0xc000 {
                    4
                } else {
                    2
                }
            }
            InstructionSet::RiscV => {
                if parcel & 0x3 == 0x3 {
                    4
                } else {
                    2
                }
            }
        }
    }

    /// The trap encoding for a software breakpoint of `length` bytes.
    pub fn breakpoint_instruction(self, length: u32) -> Result<u32, Error> {
        match (self, length) {
            (InstructionSet::CskyV1 | InstructionSet::CskyV2, 2) => Ok(CSKY_BKPT16.into()),
            // Two consecutive bkpt16.
            (InstructionSet::CskyV2, 4) => Ok(0),
            (InstructionSet::RiscV, 2) => Ok(RISCV_C_EBREAK.into()),
            (InstructionSet::RiscV, 4) => Ok(RISCV_EBREAK),
            (_, length) => Err(Error::InvalidLength(length)),
        }
    }

    /// The trap encoding as it has to be written to memory.
    pub fn breakpoint_bytes(self, length: u32, endian: Endian) -> Result<Vec<u8>, Error> {
        let insn = self.breakpoint_instruction(length)?;
        Ok(self.encode(insn, length, endian))
    }

    /// Encodes an instruction into memory order.
    ///
    /// C-SKY stores 32-bit instructions as two parcels with the high parcel first.
    pub fn encode(self, insn: u32, length: u32, endian: Endian) -> Vec<u8> {
        match (self, length) {
            (InstructionSet::CskyV2, 4) => {
                let mut bytes = endian.encode((insn >> 16).into(), 2);
                bytes.extend(endian.encode((insn & 0xffff).into(), 2));
                bytes
            }
            (_, length) => endian.encode(insn.into(), length as usize),
        }
    }

    /// Decodes an instruction from memory order. `bytes` must hold at least 2 bytes, and
    /// 4 if the first parcel announces a 32-bit instruction.
    pub fn decode(self, bytes: &[u8], endian: Endian) -> Option<(u32, u32)> {
        let parcel = |offset: usize| -> Option<u16> {
            let pair: [u8; 2] = bytes.get(offset..offset + 2)?.try_into().ok()?;
            Some(match endian {
                Endian::Little => u16::from_le_bytes(pair),
                Endian::BigV1 | Endian::BigV2 => u16::from_be_bytes(pair),
            })
        };

        let first = parcel(0)?;
        let length = self.instruction_length(first);
        if length == 2 {
            return Some((first.into(), 2));
        }
        let second = parcel(2)?;
        let insn = match self {
            InstructionSet::RiscV => u32::from(first) | (u32::from(second) << 16),
            _ => (u32::from(first) << 16) | u32::from(second),
        };
        Some((insn, 4))
    }

    /// Recognises a load or store and describes the memory it touches.
    pub fn decode_load_store(self, insn: u32, length: u32) -> Option<LoadStore> {
        match (self, length) {
            (InstructionSet::CskyV2, 2) => csky_v2_16(insn as u16),
            (InstructionSet::CskyV2, 4) => csky_v2_32(insn),
            (InstructionSet::RiscV, 2) => riscv_compressed(insn as u16),
            (InstructionSet::RiscV, 4) => riscv_32(insn),
            _ => None,
        }
    }
}

/// A decoded memory access. The effective address is
/// `base + index * scale + offset`, evaluated with the register values at the trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStore {
    /// General purpose register holding the base address.
    pub base: u8,
    /// Optional index register and its multiplier.
    pub index: Option<(u8, u64)>,
    /// Signed displacement.
    pub offset: i64,
    /// Number of bytes accessed.
    pub size: u32,
    /// `true` for stores.
    pub is_store: bool,
}

impl LoadStore {
    /// Computes the effective address from register values.
    pub fn effective_address(&self, base_value: u64, index_value: u64) -> u64 {
        let index = self
            .index
            .map(|(_, scale)| index_value.wrapping_mul(scale))
            .unwrap_or(0);
        base_value
            .wrapping_add(index)
            .wrapping_add(self.offset as u64)
    }
}

fn csky_v2_16(insn: u16) -> Option<LoadStore> {
    let size_shift = (insn & 0x1800) >> 11;

    // ld16/st16 rz, (rx, disp), the sp-relative forms are decoded separately.
    if matches!(insn & 0xe000, 0x8000 | 0xa000) && size_shift != 3 {
        return Some(LoadStore {
            base: ((insn & 0x700) >> 8) as u8,
            index: None,
            offset: i64::from((insn & 0x1f) << size_shift),
            size: 1 << size_shift,
            is_store: insn & 0xe000 == 0xa000,
        });
    }

    // ld16.w / st16.w rz, (sp, disp)
    if matches!(insn & 0xf800, 0x9800 | 0xb800) {
        return Some(LoadStore {
            base: CSKY_SP,
            index: None,
            offset: i64::from((((insn & 0x700) >> 3) + (insn & 0x1f)) << 2),
            size: 4,
            is_store: insn & 0xf800 == 0xb800,
        });
    }

    None
}

fn csky_v2_32(insn: u32) -> Option<LoadStore> {
    let rx = ((insn & 0x001f_0000) >> 16) as u8;

    // ldex32.w / stex32.w
    if matches!(insn & 0xfc00_f000, 0xd800_7000 | 0xdc00_7000) {
        return Some(LoadStore {
            base: rx,
            index: None,
            offset: i64::from((insn & 0x0fff) << 2),
            size: 4,
            is_store: insn & 0xfc00_0000 == 0xdc00_0000,
        });
    }

    // ld32 / st32 .b/.h/.w/.d
    if matches!(insn & 0xfc00_c000, 0xd800_0000 | 0xdc00_0000) {
        let size_shift = (insn & 0x3000) >> 12;
        return Some(LoadStore {
            base: rx,
            index: None,
            offset: i64::from((insn & 0xfff) << size_shift),
            size: 1 << size_shift,
            is_store: insn & 0xfc00_0000 == 0xdc00_0000,
        });
    }

    // ldm32 / stm32 ry-rz, (rx)
    if matches!(insn & 0xfc00_ffe0, 0xd000_1c20 | 0xd400_1c20) {
        return Some(LoadStore {
            base: rx,
            index: None,
            offset: 0,
            size: 4 * ((insn & 0x1f) + 1),
            is_store: insn & 0xfc00_0000 == 0xd400_0000,
        });
    }

    // ldr32 / str32 rz, (rx, ry << imm)
    let is_str = insn & 0xfc00_0000 == 0xd400_0000;
    let is_ldr = insn & 0xfc00_fe00 == 0xd000_0000;
    if is_str || is_ldr {
        return Some(LoadStore {
            base: rx,
            index: Some((((insn >> 21) & 0x1f) as u8, u64::from((insn & 0x3e0) >> 5))),
            offset: 0,
            size: 1 << ((insn & 0x0c00) >> 10),
            is_store: is_str,
        });
    }

    None
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((u64::from(value) << shift) as i64) >> shift
}

fn riscv_32(insn: u32) -> Option<LoadStore> {
    let opcode = insn & 0x7f;
    let funct3 = (insn >> 12) & 0x7;
    let rs1 = ((insn >> 15) & 0x1f) as u8;

    match opcode {
        // LOAD, LOAD-FP
        0x03 | 0x07 => Some(LoadStore {
            base: rs1,
            index: None,
            offset: sign_extend(insn >> 20, 12),
            size: 1 << (funct3 & 0x3),
            is_store: false,
        }),
        // STORE, STORE-FP
        0x23 | 0x27 => {
            let imm = ((insn >> 25) << 5) | ((insn >> 7) & 0x1f);
            Some(LoadStore {
                base: rs1,
                index: None,
                offset: sign_extend(imm, 12),
                size: 1 << (funct3 & 0x3),
                is_store: true,
            })
        }
        _ => None,
    }
}

fn riscv_compressed(insn: u16) -> Option<LoadStore> {
    let insn = u32::from(insn);
    let quadrant = insn & 0x3;
    let funct3 = (insn >> 13) & 0x7;
    let rs1_prime = (8 + ((insn >> 7) & 0x7)) as u8;

    let word_offset = ((insn >> 10) & 0x7) << 3 | ((insn >> 6) & 0x1) << 2 | ((insn >> 5) & 0x1) << 6;
    let double_offset = ((insn >> 10) & 0x7) << 3 | ((insn >> 5) & 0x3) << 6;

    let access = |base: u8, offset: u32, size: u32, is_store: bool| LoadStore {
        base,
        index: None,
        offset: i64::from(offset),
        size,
        is_store,
    };

    match (quadrant, funct3) {
        // c.fld, c.lw, c.ld
        (0, 0b001) | (0, 0b011) => Some(access(rs1_prime, double_offset, 8, false)),
        (0, 0b010) => Some(access(rs1_prime, word_offset, 4, false)),
        // c.fsd, c.sw, c.sd
        (0, 0b101) | (0, 0b111) => Some(access(rs1_prime, double_offset, 8, true)),
        (0, 0b110) => Some(access(rs1_prime, word_offset, 4, true)),
        // c.lwsp
        (2, 0b010) => {
            let offset = ((insn >> 12) & 0x1) << 5 | ((insn >> 4) & 0x7) << 2 | ((insn >> 2) & 0x3) << 6;
            Some(access(RISCV_SP, offset, 4, false))
        }
        // c.fldsp, c.ldsp
        (2, 0b001) | (2, 0b011) => {
            let offset = ((insn >> 12) & 0x1) << 5 | ((insn >> 5) & 0x3) << 3 | ((insn >> 2) & 0x7) << 6;
            Some(access(RISCV_SP, offset, 8, false))
        }
        // c.swsp
        (2, 0b110) => {
            let offset = ((insn >> 9) & 0xf) << 2 | ((insn >> 7) & 0x3) << 6;
            Some(access(RISCV_SP, offset, 4, true))
        }
        // c.fsdsp, c.sdsp
        (2, 0b101) | (2, 0b111) => {
            let offset = ((insn >> 10) & 0x7) << 3 | ((insn >> 7) & 0x7) << 6;
            Some(access(RISCV_SP, offset, 8, true))
        }
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(InstructionSet::CskyV2, 0x6c03, 2; "csky mov")]
    #[test_case(InstructionSet::CskyV2, 0xe800, 4; "csky 32 bit")]
    #[test_case(InstructionSet::CskyV1, 0xe800, 2; "csky v1 is always 16 bit")]
    #[test_case(InstructionSet::RiscV, 0x4501, 2; "c.li")]
    #[test_case(InstructionSet::RiscV, 0x0073, 4; "ebreak low parcel")]
    fn lengths(isa: InstructionSet, parcel: u16, expected: u32) {
        assert_eq!(isa.instruction_length(parcel), expected);
    }

    #[test]
    fn breakpoint_encodings() {
        assert_eq!(
            InstructionSet::RiscV
                .breakpoint_bytes(4, Endian::Little)
                .unwrap(),
            vec![0x73, 0x00, 0x10, 0x00]
        );
        assert_eq!(
            InstructionSet::RiscV
                .breakpoint_bytes(2, Endian::Little)
                .unwrap(),
            vec![0x02, 0x90]
        );
        assert_eq!(
            InstructionSet::CskyV2
                .breakpoint_bytes(2, Endian::Little)
                .unwrap(),
            vec![0x00, 0x00]
        );
        assert!(matches!(
            InstructionSet::CskyV1.breakpoint_instruction(4),
            Err(Error::InvalidLength(4))
        ));
    }

    #[test]
    fn csky_32_bit_parcels_are_high_first() {
        let bytes = InstructionSet::CskyV2.encode(0xdc0e_2001, 4, Endian::Little);
        assert_eq!(bytes, vec![0x0e, 0xdc, 0x01, 0x20]);
        assert_eq!(
            InstructionSet::CskyV2.decode(&bytes, Endian::Little),
            Some((0xdc0e_2001, 4))
        );
    }

    #[test]
    fn riscv_sw() {
        // sw a1, 8(a0)
        let access = InstructionSet::RiscV
            .decode_load_store(0x00b5_2423, 4)
            .unwrap();
        assert_eq!(
            access,
            LoadStore {
                base: 10,
                index: None,
                offset: 8,
                size: 4,
                is_store: true
            }
        );
    }

    #[test]
    fn riscv_negative_load_offset() {
        // lw a0, -4(sp)
        let access = InstructionSet::RiscV
            .decode_load_store(0xffc1_2503, 4)
            .unwrap();
        assert_eq!(access.base, 2);
        assert_eq!(access.offset, -4);
        assert_eq!(access.effective_address(0x2000_0100, 0), 0x2000_00fc);
        assert!(!access.is_store);
    }

    #[test]
    fn riscv_compressed_sw() {
        // c.sw a1, 4(a0)
        let access = InstructionSet::RiscV.decode_load_store(0xc14c, 2).unwrap();
        assert_eq!(access.base, 10);
        assert_eq!(access.offset, 4);
        assert_eq!(access.size, 4);
        assert!(access.is_store);
    }

    #[test]
    fn csky_st16_word() {
        // st16.w r1, (r2, 0x8): size field 2, rx 2, ry 1, disp 2
        let insn: u16 = 0xa000 | (2 << 11) | (2 << 8) | (1 << 5) | 2;
        let access = InstructionSet::CskyV2
            .decode_load_store(insn.into(), 2)
            .unwrap();
        assert_eq!(access.base, 2);
        assert_eq!(access.offset, 8);
        assert_eq!(access.size, 4);
        assert!(access.is_store);
    }

    #[test]
    fn csky_ld32_word() {
        // ld32.w r3, (r4, 0x10): size field 2, disp 4
        let insn = 0xd800_0000 | (3 << 21) | (4 << 16) | (2 << 12) | 4;
        let access = InstructionSet::CskyV2.decode_load_store(insn, 4).unwrap();
        assert_eq!(access.base, 4);
        assert_eq!(access.offset, 0x10);
        assert_eq!(access.size, 4);
        assert!(!access.is_store);
    }

    #[test]
    fn non_memory_instruction() {
        // addi a0, a0, 1
        assert_eq!(
            InstructionSet::RiscV.decode_load_store(0x0015_0513, 4),
            None
        );
    }
}
