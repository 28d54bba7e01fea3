//! The HAD identification register (`HID`).
//!
//! Single-core HAD modules report their version and breakpoint count. A HAD top module, which
//! multiplexes several cores, reuses the same register with a different layout and sets the
//! mark field to 1.

use bitfield::bitfield;

/// `HID` layout version of early HAD modules.
pub const HAD_ID_V1: u8 = 0;
/// `HID` layout version that reports the breakpoint count.
pub const HAD_ID_V2: u8 = 1;

/// Breakpoint units assumed when the HAD module does not report a count.
pub const DEFAULT_BREAKPOINT_UNITS: usize = 2;

bitfield! {
    /// The `HID` register.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct HadId(u32);
    impl Debug;
    pub u8, cdi_type, _: 31, 28;
    pub u8, arch_version, _: 27, 26;
    pub u8, mark, _: 25, 24;
    pub hacr16, _: 18;
    pub u8, breakpoint_units, _: 15, 12;
    pub u8, cpu_count, _: 13, 8;
    pub u8, revision, _: 11, 8;
    pub u8, raw_had_version, _: 7, 4;
    pub u8, id_version, _: 3, 0;
}

impl From<u32> for HadId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<HadId> for u32 {
    fn from(value: HadId) -> Self {
        value.0
    }
}

impl HadId {
    /// The HAD generation, starting at 1.
    pub fn had_version(&self) -> u8 {
        self.raw_had_version().min(6) + 1
    }

    /// `true` if this is a HAD top module in front of several cores.
    pub fn is_had_top(&self) -> bool {
        self.mark() == 1
    }

    /// The width of the HACR instruction register in bits.
    pub fn hacr_width(&self) -> u8 {
        if self.hacr16() {
            16
        } else {
            8
        }
    }

    /// Number of hardware breakpoint units, falling back to [`DEFAULT_BREAKPOINT_UNITS`]
    /// for modules that do not report it.
    pub fn hardware_breakpoints(&self) -> usize {
        match self.id_version() {
            HAD_ID_V2 => self.breakpoint_units() as usize,
            _ => DEFAULT_BREAKPOINT_UNITS,
        }
    }

    /// Number of cores behind a HAD top module, 1 otherwise.
    pub fn cores(&self) -> usize {
        if self.is_had_top() {
            (self.cpu_count() as usize).max(1)
        } else {
            1
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_core_v2() {
        let id = HadId::from(0x0400_8231);

        assert!(!id.is_had_top());
        assert_eq!(id.id_version(), HAD_ID_V2);
        assert_eq!(id.had_version(), 4);
        assert_eq!(id.revision(), 2);
        assert_eq!(id.arch_version(), 1);
        assert_eq!(id.hardware_breakpoints(), 8);
        assert_eq!(id.hacr_width(), 8);
        assert_eq!(id.cores(), 1);
    }

    #[test]
    fn v1_uses_default_units() {
        let id = HadId::from(0x0000_f010);
        assert_eq!(id.hardware_breakpoints(), DEFAULT_BREAKPOINT_UNITS);
    }

    #[test]
    fn had_top() {
        let id = HadId::from(0x1104_0442);

        assert!(id.is_had_top());
        assert_eq!(id.hacr_width(), 16);
        assert_eq!(id.cores(), 4);
        assert_eq!(id.cdi_type(), 1);
    }
}
