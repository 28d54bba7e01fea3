//! The contract with the flash programming collaborator.
//!
//! Flash breakpoints cannot be written with plain memory writes. The target layer reads the
//! sector, patches it and hands it to a [`FlashAlgorithm`] for erase and program. Algorithms
//! run on the target itself, so the registers and RAM they clobber are saved and restored
//! around every run by a [`ClobberGuard`].

use std::fmt;
use std::ops::{Deref, DerefMut, Range};

use serde::{Deserialize, Serialize};

use crate::core::CoreInterface;
use crate::registers::{RegisterDescriptor, RegisterValue};
use crate::Error;

/// Errors reported by a flash algorithm.
#[derive(thiserror::Error, Debug, docsplay::Display, Clone, PartialEq, Eq)]
pub enum FlashError {
    /// Address {0:#010x} is not in a flash region.
    NotInFlash(u64),
    /// The flash algorithm could not be loaded: {0}
    Load(String),
    /// Erasing the sector at {address:#010x} failed with code {code}.
    Erase {
        /// Start of the sector.
        address: u64,
        /// Return code of the algorithm.
        code: i32,
    },
    /// Programming {length} bytes at {address:#010x} failed with code {code}.
    Program {
        /// Start of the programmed block.
        address: u64,
        /// Length of the programmed block.
        length: usize,
        /// Return code of the algorithm.
        code: i32,
    },
    /// Simulating the instruction at {0:#010x} failed.
    Simulation(u64),
}

/// Kind of a region in the memory map of a flash device description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Ram,
    Rom,
    Flash,
}

/// A region of the device memory map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub kind: MemoryKind,
    pub range: Range<u64>,
    /// Erase granularity, only meaningful for flash.
    #[serde(default)]
    pub sector_size: u64,
}

impl MemoryRegion {
    /// The sector of this region containing `address`.
    pub fn sector_of(&self, address: u64) -> Option<Sector> {
        if self.kind != MemoryKind::Flash || !self.range.contains(&address) || self.sector_size == 0
        {
            return None;
        }
        let offset = (address - self.range.start) / self.sector_size * self.sector_size;
        Some(Sector {
            address: self.range.start + offset,
            size: self.sector_size,
        })
    }
}

/// One erase unit of a flash device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Sector {
    pub address: u64,
    pub size: u64,
}

impl Sector {
    /// The address range covered by this sector.
    pub fn range(&self) -> Range<u64> {
        self.address..self.address.saturating_add(self.size)
    }
}

/// A flash programming algorithm executing on the target.
pub trait FlashAlgorithm: fmt::Debug + Send {
    /// The memory map served by this algorithm.
    fn memory_map(&self) -> &[MemoryRegion];

    /// `true` if `address` is in flash.
    fn is_flash(&self, address: u64) -> bool {
        self.sector(address).is_ok()
    }

    /// The sector containing `address`.
    fn sector(&self, address: u64) -> Result<Sector, FlashError> {
        self.memory_map()
            .iter()
            .find_map(|region| region.sector_of(address))
            .ok_or(FlashError::NotInFlash(address))
    }

    /// Target RAM overwritten while the algorithm runs.
    fn destroyed_memory(&self) -> Option<Range<u64>>;

    /// Debugger numbers of the CPU registers overwritten while the algorithm runs.
    fn destroyed_registers(&self) -> Vec<u16>;

    /// Downloads the algorithm into target RAM.
    fn load(&mut self, core: &mut dyn CoreInterface) -> Result<(), FlashError>;

    /// Erases one sector.
    fn erase_sector(&mut self, core: &mut dyn CoreInterface, sector: Sector)
        -> Result<(), FlashError>;

    /// Programs `data` at `address`. The range must have been erased.
    fn program(
        &mut self,
        core: &mut dyn CoreInterface,
        address: u64,
        data: &[u8],
    ) -> Result<(), FlashError>;

    /// `true` if the debugger can execute `instruction` on behalf of the target.
    fn can_simulate(&self, _instruction: &[u8]) -> bool {
        false
    }

    /// Executes the instruction at `address` without running the target, updating registers
    /// and the program counter. Returns `false` if the instruction cannot be simulated.
    fn simulate_instruction(
        &mut self,
        _core: &mut dyn CoreInterface,
        _address: u64,
        _instruction: &[u8],
    ) -> Result<bool, FlashError> {
        Ok(false)
    }
}

/// Saves the registers and memory a flash algorithm clobbers and restores them when done.
///
/// Call [`ClobberGuard::finish`] to observe restore errors. A guard dropped without `finish`
/// still restores, but can only log failures.
pub struct ClobberGuard<'a> {
    core: &'a mut dyn CoreInterface,
    registers: Vec<(RegisterDescriptor, RegisterValue)>,
    memory: Option<(u64, Vec<u8>)>,
    done: bool,
}

impl<'a> ClobberGuard<'a> {
    /// Snapshots `registers` and the `memory` range.
    pub fn save(
        core: &'a mut dyn CoreInterface,
        registers: &[RegisterDescriptor],
        memory: Option<Range<u64>>,
    ) -> Result<Self, Error> {
        let mut saved = Vec::with_capacity(registers.len());
        for register in registers {
            let value = core.read_core_reg(register)?;
            saved.push((register.clone(), value));
        }

        let memory = match memory {
            Some(range) => {
                let mut contents = vec![0; (range.end - range.start) as usize];
                core.read_8(range.start, &mut contents)?;
                Some((range.start, contents))
            }
            None => None,
        };

        tracing::trace!(
            "Saved {} registers and {} bytes for the flash algorithm",
            saved.len(),
            memory.as_ref().map(|(_, m)| m.len()).unwrap_or(0)
        );

        Ok(ClobberGuard {
            core,
            registers: saved,
            memory,
            done: false,
        })
    }

    fn restore(&mut self) -> Result<(), Error> {
        if let Some((address, contents)) = &self.memory {
            self.core.write_8(*address, contents)?;
        }
        for (register, value) in &self.registers {
            self.core.write_core_reg(register, value)?;
        }
        Ok(())
    }

    /// Restores the saved state.
    pub fn finish(mut self) -> Result<(), Error> {
        self.done = true;
        self.restore()
    }
}

impl<'a> Deref for ClobberGuard<'a> {
    type Target = dyn CoreInterface + 'a;

    fn deref(&self) -> &Self::Target {
        self.core
    }
}

impl<'a> DerefMut for ClobberGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.core
    }
}

impl Drop for ClobberGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(error) = self.restore() {
            tracing::warn!("Could not restore state clobbered by the flash algorithm: {error}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sectors_are_aligned_to_region_start() {
        let region = MemoryRegion {
            kind: MemoryKind::Flash,
            range: 0x1000..0x9000,
            sector_size: 0x1000,
        };

        assert_eq!(
            region.sector_of(0x2ffe),
            Some(Sector {
                address: 0x2000,
                size: 0x1000
            })
        );
        assert_eq!(region.sector_of(0x9000), None);
    }

    #[test]
    fn ram_has_no_sectors() {
        let region = MemoryRegion {
            kind: MemoryKind::Ram,
            range: 0x2000_0000..0x2001_0000,
            sector_size: 0x100,
        };
        assert_eq!(region.sector_of(0x2000_0000), None);
    }

    #[test]
    fn memory_map_from_yaml() {
        let regions: Vec<MemoryRegion> = serde_yaml::from_str(
            "- kind: flash\n  range: {start: 0, end: 65536}\n  sector_size: 4096\n- kind: ram\n  range: {start: 536870912, end: 536936448}\n",
        )
        .unwrap();

        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].sector_size, 0);
        assert_eq!(regions[0].sector_of(0x1234).map(|s| s.address), Some(0x1000));
    }
}
