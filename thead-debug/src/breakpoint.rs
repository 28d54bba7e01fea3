//! Breakpoints.
//!
//! Software breakpoints replace the instruction at their address with a trap. The original bytes
//! are captured when the breakpoint is added, while the patch itself is only written when the
//! target is about to resume. Until then, and while installed, reads through
//! [`BreakpointManager::overlay`] return the original bytes.
//!
//! Flash breakpoints are software breakpoints in non-volatile memory. They are written by
//! rewriting whole sectors through a [`FlashAlgorithm`], batched per sector in
//! [`BreakpointManager::sync_flash`]. Removing an installed flash breakpoint only marks it
//! [`BreakpointKind::PendingDelete`]; the sector is rewritten on the next sync.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};

use serde::Serialize;

use crate::core::CoreInterface;
use crate::flash::{ClobberGuard, FlashAlgorithm, FlashError, Sector};
use crate::instruction::InstructionSet;
use crate::memory::Endian;
use crate::registers::RegisterDescriptor;
use crate::slots::SlotAllocator;
use crate::Error;

/// How a breakpoint is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakpointKind {
    /// A trap instruction patched into RAM.
    Software,
    /// A hardware comparator.
    Hardware,
    /// A trap instruction programmed into flash.
    Flash,
    /// A flash breakpoint on an instruction the flash algorithm can execute on behalf of the
    /// target, so stepping off it does not need a sector rewrite.
    Simulated,
    /// A removed flash breakpoint whose trap is still in flash.
    PendingDelete,
}

impl BreakpointKind {
    fn patches_memory(self) -> bool {
        !matches!(self, BreakpointKind::Hardware)
    }

    fn in_flash(self) -> bool {
        matches!(
            self,
            BreakpointKind::Flash | BreakpointKind::Simulated | BreakpointKind::PendingDelete
        )
    }
}

/// A breakpoint of one CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub address: u64,
    /// Length of the trap in bytes, 2 or 4.
    pub length: u32,
    pub kind: BreakpointKind,
    /// The bytes replaced by the trap. `None` for hardware breakpoints.
    pub original: Option<Vec<u8>>,
    /// The comparator of a hardware breakpoint.
    pub unit: Option<usize>,
    /// `true` while memory or the comparator reflects this breakpoint.
    pub set: bool,
    /// `true` while the debugger wants this breakpoint.
    pub requested: bool,
    /// A software request turned into a flash breakpoint because the address is in flash.
    pub type_adjusted: bool,
    /// A flash breakpoint not yet programmed since it was added.
    pub is_new: bool,
    /// The flash sector holding a flash breakpoint.
    pub sector: Option<Sector>,
}

impl Breakpoint {
    fn answers(&self, kind: BreakpointKind) -> bool {
        self.kind == kind
            || (self.type_adjusted && kind == BreakpointKind::Software)
            || (self.kind == BreakpointKind::Simulated && kind == BreakpointKind::Flash)
    }

    /// One past the last covered byte. Wide enough for a breakpoint ending at `u64::MAX`.
    fn end(&self) -> u128 {
        u128::from(self.address) + u128::from(self.length)
    }
}

/// Copies the part of `source` (located at `source_address`) that overlaps
/// `target_address..target_address + target.len()` into `target`.
fn copy_overlap(source_address: u64, source: &[u8], target_address: u64, target: &mut [u8]) {
    let start = source_address.max(target_address);
    let end = (u128::from(source_address) + source.len() as u128)
        .min(u128::from(target_address) + target.len() as u128);
    if u128::from(start) >= end {
        return;
    }
    let from = (start - source_address) as usize;
    let to = (start - target_address) as usize;
    let len = (end - u128::from(start)) as usize;
    target[to..to + len].copy_from_slice(&source[from..from + len]);
}

/// Owns the breakpoints of one CPU, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct BreakpointManager {
    breakpoints: BTreeMap<u64, Breakpoint>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a breakpoint.
    ///
    /// Adding the same breakpoint twice is a no-op. A different kind or length at the same
    /// address is an [`Error::AddressConflict`]. Software requests inside a flash region of
    /// `flash` become flash breakpoints.
    #[tracing::instrument(skip_all, fields(address = format_args!("{address:#010x}"), ?kind))]
    pub fn add(
        &mut self,
        slots: &mut SlotAllocator,
        core: &mut dyn CoreInterface,
        flash: Option<&dyn FlashAlgorithm>,
        address: u64,
        length: u32,
        kind: BreakpointKind,
    ) -> Result<&Breakpoint, Error> {
        if length != 2 && length != 4 {
            return Err(Error::InvalidLength(length));
        }

        if let Some(existing) = self.breakpoints.get_mut(&address) {
            if existing.kind == BreakpointKind::PendingDelete
                && existing.length == length
                && matches!(kind, BreakpointKind::Software | BreakpointKind::Flash)
            {
                tracing::debug!("Reviving flash breakpoint pending removal");
                let simulate = flash.is_some_and(|flash| {
                    existing
                        .original
                        .as_deref()
                        .is_some_and(|original| flash.can_simulate(original))
                });
                existing.kind = if simulate {
                    BreakpointKind::Simulated
                } else {
                    BreakpointKind::Flash
                };
                existing.type_adjusted = kind == BreakpointKind::Software;
                existing.requested = true;
            } else if !existing.answers(kind) || existing.length != length {
                return Err(Error::AddressConflict { address });
            } else {
                tracing::debug!("Breakpoint already exists");
            }
            return self
                .breakpoints
                .get(&address)
                .ok_or(Error::NotFound(address));
        }

        let mut breakpoint = Breakpoint {
            address,
            length,
            kind,
            original: None,
            unit: None,
            set: false,
            requested: true,
            type_adjusted: false,
            is_new: false,
            sector: None,
        };

        match kind {
            BreakpointKind::Hardware => {
                let unit = slots.allocate().ok_or(Error::NoHardwareSlot)?;
                breakpoint.unit = Some(unit);
            }
            BreakpointKind::Software | BreakpointKind::Flash | BreakpointKind::Simulated => {
                let in_flash = flash.filter(|flash| flash.is_flash(address));
                let flash = match (kind, in_flash) {
                    (BreakpointKind::Software, None) => None,
                    (BreakpointKind::Software, Some(flash)) => {
                        tracing::debug!("Address is in flash, using a flash breakpoint");
                        breakpoint.type_adjusted = true;
                        Some(flash)
                    }
                    (_, Some(flash)) => Some(flash),
                    (_, None) if flash.is_none() => return Err(Error::FlashUnavailable),
                    (_, None) => return Err(FlashError::NotInFlash(address).into()),
                };

                let mut original = vec![0u8; length as usize];
                core.read_8(address, &mut original)?;

                if let Some(flash) = flash {
                    breakpoint.sector = Some(flash.sector(address)?);
                    breakpoint.is_new = true;
                    breakpoint.kind = if flash.can_simulate(&original) {
                        BreakpointKind::Simulated
                    } else {
                        BreakpointKind::Flash
                    };
                }
                breakpoint.original = Some(original);
            }
            BreakpointKind::PendingDelete => {
                return Err(anyhow::anyhow!("pending-delete breakpoints cannot be requested").into())
            }
        }

        tracing::debug!("Added {:?} breakpoint", breakpoint.kind);
        Ok(self.breakpoints.entry(address).or_insert(breakpoint))
    }

    /// Removes the breakpoint at `address`.
    ///
    /// The breakpoint is gone afterwards even if memory or the comparator could not be
    /// restored, which is reported as [`Error::RestoreFailed`]. Installed flash breakpoints
    /// stay in flash as [`BreakpointKind::PendingDelete`] until the next sync.
    #[tracing::instrument(skip_all, fields(address = format_args!("{address:#010x}")))]
    pub fn remove(
        &mut self,
        slots: &mut SlotAllocator,
        core: &mut dyn CoreInterface,
        address: u64,
    ) -> Result<(), Error> {
        match self.breakpoints.get(&address) {
            None => return Err(Error::NotFound(address)),
            Some(breakpoint) if breakpoint.kind == BreakpointKind::PendingDelete => {
                return Err(Error::NotFound(address))
            }
            Some(breakpoint) if breakpoint.kind.in_flash() && breakpoint.set => {
                if let Some(breakpoint) = self.breakpoints.get_mut(&address) {
                    breakpoint.kind = BreakpointKind::PendingDelete;
                    breakpoint.requested = false;
                }
                return Ok(());
            }
            Some(_) => {}
        }

        match self.breakpoints.remove(&address) {
            Some(breakpoint) => Self::teardown(slots, core, &breakpoint),
            None => Err(Error::NotFound(address)),
        }
    }

    fn teardown(
        slots: &mut SlotAllocator,
        core: &mut dyn CoreInterface,
        breakpoint: &Breakpoint,
    ) -> Result<(), Error> {
        let result = match (breakpoint.kind, breakpoint.unit) {
            (BreakpointKind::Hardware, Some(unit)) => {
                slots.release(unit);
                if breakpoint.set {
                    core.clear_hw_unit(unit)
                } else {
                    Ok(())
                }
            }
            (BreakpointKind::Software, _) if breakpoint.set => match &breakpoint.original {
                Some(original) => core.write_8(breakpoint.address, original),
                None => Ok(()),
            },
            _ => Ok(()),
        };

        result.map_err(|error| {
            tracing::warn!(
                "Could not restore the breakpoint at {:#010x}: {error}",
                breakpoint.address
            );
            Error::RestoreFailed {
                address: breakpoint.address,
                source: Box::new(error),
            }
        })
    }

    /// Removes all breakpoints. Failures are collected, the manager holds no requested
    /// breakpoint afterwards.
    pub fn clear(
        &mut self,
        slots: &mut SlotAllocator,
        core: &mut dyn CoreInterface,
    ) -> Result<(), Error> {
        let addresses: Vec<u64> = self.iter().map(|breakpoint| breakpoint.address).collect();
        let errors: Vec<Error> = addresses
            .into_iter()
            .filter_map(|address| self.remove(slots, core, address).err())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::ClearIncomplete(errors))
        }
    }

    /// The requested breakpoint at `address`.
    pub fn find(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints
            .get(&address)
            .filter(|breakpoint| breakpoint.kind != BreakpointKind::PendingDelete)
    }

    /// Requested breakpoints in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints
            .values()
            .filter(|breakpoint| breakpoint.kind != BreakpointKind::PendingDelete)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of hardware breakpoints.
    pub fn hardware_count(&self) -> usize {
        self.breakpoints
            .values()
            .filter(|breakpoint| breakpoint.kind == BreakpointKind::Hardware)
            .count()
    }

    /// Writes the trap of every software breakpoint that is not yet installed. Stops at the
    /// first failure, breakpoints installed before it stay set.
    pub fn install_software(
        &mut self,
        core: &mut dyn CoreInterface,
        isa: InstructionSet,
    ) -> Result<(), Error> {
        let endian = core.endian();
        for breakpoint in self
            .breakpoints
            .values_mut()
            .filter(|b| b.kind == BreakpointKind::Software && !b.set)
        {
            let trap = isa.breakpoint_bytes(breakpoint.length, endian)?;
            core.write_8(breakpoint.address, &trap)?;
            breakpoint.set = true;
            tracing::trace!("Installed software breakpoint at {:#010x}", breakpoint.address);
        }
        Ok(())
    }

    /// Programs the comparator of every hardware breakpoint that is not yet installed.
    pub fn install_hardware(&mut self, core: &mut dyn CoreInterface) -> Result<(), Error> {
        for breakpoint in self
            .breakpoints
            .values_mut()
            .filter(|b| b.kind == BreakpointKind::Hardware && !b.set)
        {
            if let Some(unit) = breakpoint.unit {
                core.set_hw_breakpoint(unit, breakpoint.address)?;
                breakpoint.set = true;
                tracing::trace!(
                    "Installed hardware breakpoint at {:#010x} on comparator {unit}",
                    breakpoint.address
                );
            }
        }
        Ok(())
    }

    /// Disables the comparator of the hardware breakpoint at `address`, so the core can step
    /// over it. It is programmed again by the next [`BreakpointManager::install_hardware`].
    pub fn suspend_hardware(
        &mut self,
        core: &mut dyn CoreInterface,
        address: u64,
    ) -> Result<bool, Error> {
        let Some(breakpoint) = self
            .breakpoints
            .get_mut(&address)
            .filter(|b| b.kind == BreakpointKind::Hardware && b.set)
        else {
            return Ok(false);
        };
        if let Some(unit) = breakpoint.unit {
            core.clear_hw_unit(unit)?;
        }
        breakpoint.set = false;
        Ok(true)
    }

    /// `true` if flash sectors have to be rewritten before the target resumes.
    pub fn needs_flash_sync(&self) -> bool {
        self.breakpoints.values().any(|breakpoint| match breakpoint.kind {
            BreakpointKind::Flash | BreakpointKind::Simulated => !breakpoint.set,
            BreakpointKind::PendingDelete => true,
            _ => false,
        })
    }

    /// Rewrites the flash sectors with pending changes.
    ///
    /// Each affected sector is read, patched with the traps of its flash breakpoints and the
    /// original bytes of removed ones, then erased and programmed. The registers and RAM the
    /// algorithm clobbers are restored afterwards. The breakpoint at `exclude` is written with
    /// its original bytes and left unset, so the core can step over it.
    #[tracing::instrument(skip_all)]
    pub fn sync_flash(
        &mut self,
        core: &mut dyn CoreInterface,
        flash: &mut dyn FlashAlgorithm,
        registers: &[RegisterDescriptor],
        isa: InstructionSet,
        exclude: Option<u64>,
    ) -> Result<(), Error> {
        let sectors: BTreeSet<Sector> = self
            .breakpoints
            .values()
            .filter(|breakpoint| match breakpoint.kind {
                BreakpointKind::Flash | BreakpointKind::Simulated => {
                    !breakpoint.set || Some(breakpoint.address) == exclude
                }
                BreakpointKind::PendingDelete => true,
                _ => false,
            })
            .filter_map(|breakpoint| breakpoint.sector)
            .collect();

        if sectors.is_empty() {
            return Ok(());
        }

        let endian = core.endian();
        let mut guard = ClobberGuard::save(core, registers, flash.destroyed_memory())?;
        flash.load(&mut *guard)?;

        for sector in &sectors {
            let mut contents = vec![0u8; sector.size as usize];
            guard.read_8(sector.address, &mut contents)?;
            self.patch_sector(*sector, &mut contents, isa, endian, exclude)?;

            tracing::debug!("Rewriting flash sector at {:#010x}", sector.address);
            flash.erase_sector(&mut *guard, *sector)?;
            flash.program(&mut *guard, sector.address, &contents)?;
        }

        guard.finish()?;

        let synced =
            |breakpoint: &Breakpoint| breakpoint.sector.is_some_and(|s| sectors.contains(&s));
        self.breakpoints
            .retain(|_, b| !(b.kind == BreakpointKind::PendingDelete && synced(b)));
        for breakpoint in self
            .breakpoints
            .values_mut()
            .filter(|b| b.kind.in_flash() && synced(b))
        {
            breakpoint.set = Some(breakpoint.address) != exclude;
            breakpoint.is_new = false;
        }
        Ok(())
    }

    fn patch_sector(
        &self,
        sector: Sector,
        contents: &mut [u8],
        isa: InstructionSet,
        endian: Endian,
        exclude: Option<u64>,
    ) -> Result<(), Error> {
        let range = sector.range();
        for breakpoint in self
            .breakpoints
            .values()
            .filter(|b| b.kind.in_flash() && range.contains(&b.address))
        {
            let restore = breakpoint.kind == BreakpointKind::PendingDelete
                || Some(breakpoint.address) == exclude;
            let bytes = if restore {
                breakpoint.original.clone().unwrap_or_default()
            } else {
                isa.breakpoint_bytes(breakpoint.length, endian)?
            };
            copy_overlap(breakpoint.address, &bytes, sector.address, contents);
        }
        Ok(())
    }

    /// Replaces installed traps in `data`, read from `address`, with the original bytes.
    pub fn overlay(&self, address: u64, data: &mut [u8]) {
        for breakpoint in self.breakpoints.values().filter(|b| b.set) {
            if let Some(original) = &breakpoint.original {
                copy_overlap(breakpoint.address, original, address, data);
            }
        }
    }

    /// Prepares a memory write of `data` at `address`.
    ///
    /// Bytes written over a breakpoint become its new original contents. Installed software
    /// traps are kept in the returned bytes, so the write does not remove them.
    pub fn patch_write(
        &mut self,
        address: u64,
        data: &[u8],
        isa: InstructionSet,
        endian: Endian,
    ) -> Result<Vec<u8>, Error> {
        let end = u128::from(address) + data.len() as u128;
        let mut patched = data.to_vec();

        for breakpoint in self
            .breakpoints
            .values_mut()
            .filter(|b| {
                b.kind.patches_memory() && u128::from(b.address) < end && u128::from(address) < b.end()
            })
        {
            if let Some(original) = breakpoint.original.as_mut() {
                copy_overlap(address, data, breakpoint.address, original);
            }
            if breakpoint.kind == BreakpointKind::Software && breakpoint.set {
                let trap = isa.breakpoint_bytes(breakpoint.length, endian)?;
                copy_overlap(breakpoint.address, &trap, address, &mut patched);
            }
        }
        Ok(patched)
    }

    /// A reset cleared the comparators. Traps written to memory survive it and stay set.
    pub fn mark_comparators_cleared(&mut self) {
        for breakpoint in self
            .breakpoints
            .values_mut()
            .filter(|b| b.kind == BreakpointKind::Hardware)
        {
            breakpoint.set = false;
        }
    }

    /// Temporarily puts the original instruction back at the installed software breakpoint at
    /// `address`. Returns `None` if there is none.
    pub fn lift<'a>(
        &self,
        core: &'a mut dyn CoreInterface,
        address: u64,
        isa: InstructionSet,
    ) -> Result<Option<LiftedBreakpoint<'a>>, Error> {
        let Some(breakpoint) = self
            .breakpoints
            .get(&address)
            .filter(|b| b.kind == BreakpointKind::Software && b.set)
        else {
            return Ok(None);
        };
        let Some(original) = &breakpoint.original else {
            return Ok(None);
        };

        let trap = isa.breakpoint_bytes(breakpoint.length, core.endian())?;
        core.write_8(address, original)?;
        Ok(Some(LiftedBreakpoint {
            core,
            address,
            trap,
            done: false,
        }))
    }
}

/// A software breakpoint whose original instruction is temporarily back in memory.
///
/// [`LiftedBreakpoint::finish`] writes the trap again. A guard dropped without `finish` still
/// does, but can only log failures.
pub struct LiftedBreakpoint<'a> {
    core: &'a mut dyn CoreInterface,
    address: u64,
    trap: Vec<u8>,
    done: bool,
}

impl LiftedBreakpoint<'_> {
    /// Writes the trap back.
    pub fn finish(mut self) -> Result<(), Error> {
        self.done = true;
        self.core.write_8(self.address, &self.trap)
    }
}

impl<'a> Deref for LiftedBreakpoint<'a> {
    type Target = dyn CoreInterface + 'a;

    fn deref(&self) -> &Self::Target {
        self.core
    }
}

impl<'a> DerefMut for LiftedBreakpoint<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.core
    }
}

impl Drop for LiftedBreakpoint<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(error) = self.core.write_8(self.address, &self.trap) {
            tracing::warn!(
                "Could not re-install the breakpoint at {:#010x}: {error}",
                self.address
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::{DebugModule, HadParams};
    use crate::flash::{MemoryKind, MemoryRegion};
    use crate::link::fake::{FakeFlash, FakeLink};
    use pretty_assertions::assert_eq;
    use rand::Rng;

    const ISA: InstructionSet = InstructionSet::CskyV2;

    fn had() -> DebugModule {
        DebugModule::Had(HadParams {
            units: 2,
            ..HadParams::default()
        })
    }

    #[test]
    fn software_breakpoint_lifecycle() {
        let mut link = FakeLink::had(0x0480_0003);
        link.poke(0x1000, &[0x12, 0x34, 0x56, 0x78]);
        let mut core = had().attach(&mut link);
        let mut slots = SlotAllocator::new(2);
        let mut manager = BreakpointManager::new();

        manager
            .add(&mut slots, &mut *core, None, 0x1000, 2, BreakpointKind::Software)
            .unwrap();
        let breakpoint = manager.find(0x1000).unwrap();
        assert_eq!(breakpoint.kind, BreakpointKind::Software);
        assert!(!breakpoint.set);
        assert_eq!(breakpoint.original.as_deref(), Some(&[0x12, 0x34][..]));

        manager.install_software(&mut *core, ISA).unwrap();
        let mut memory = [0u8; 4];
        core.read_8(0x1000, &mut memory).unwrap();
        assert_eq!(memory, [0x00, 0x00, 0x56, 0x78]);

        manager.overlay(0x1000, &mut memory);
        assert_eq!(memory, [0x12, 0x34, 0x56, 0x78]);

        manager.remove(&mut slots, &mut *core, 0x1000).unwrap();
        core.read_8(0x1000, &mut memory).unwrap();
        assert_eq!(memory, [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(manager.find(0x1000), None);
    }

    #[test]
    fn duplicates_and_conflicts() {
        let mut link = FakeLink::had(0x0480_0003);
        let mut core = had().attach(&mut link);
        let mut slots = SlotAllocator::new(2);
        let mut manager = BreakpointManager::new();

        manager
            .add(&mut slots, &mut *core, None, 0x2000, 4, BreakpointKind::Hardware)
            .unwrap();
        manager
            .add(&mut slots, &mut *core, None, 0x2000, 4, BreakpointKind::Hardware)
            .unwrap();
        assert_eq!(slots.in_use(), 1);

        assert!(matches!(
            manager.add(&mut slots, &mut *core, None, 0x2000, 4, BreakpointKind::Software),
            Err(Error::AddressConflict { address: 0x2000 })
        ));
        assert!(matches!(
            manager.add(&mut slots, &mut *core, None, 0x2000, 3, BreakpointKind::Hardware),
            Err(Error::InvalidLength(3))
        ));
        assert!(matches!(
            manager.remove(&mut slots, &mut *core, 0x3000),
            Err(Error::NotFound(0x3000))
        ));
    }

    #[test]
    fn restore_failure_still_removes() {
        let mut link = FakeLink::had(0x0480_0003);
        let handle = link.clone();
        let mut core = had().attach(&mut link);
        let mut slots = SlotAllocator::new(2);
        let mut manager = BreakpointManager::new();

        manager
            .add(&mut slots, &mut *core, None, 0x1000, 2, BreakpointKind::Software)
            .unwrap();
        manager.install_software(&mut *core, ISA).unwrap();

        handle.fail_next(crate::link::LinkError::Io);
        let error = manager.remove(&mut slots, &mut *core, 0x1000).unwrap_err();
        assert!(matches!(error, Error::RestoreFailed { address: 0x1000, .. }));
        assert!(manager.is_empty());
    }

    #[test]
    fn written_bytes_update_the_snapshot() {
        let mut link = FakeLink::had(0x0480_0003);
        let mut core = had().attach(&mut link);
        let mut slots = SlotAllocator::new(2);
        let mut manager = BreakpointManager::new();

        manager
            .add(&mut slots, &mut *core, None, 0x1002, 2, BreakpointKind::Software)
            .unwrap();
        manager.install_software(&mut *core, ISA).unwrap();

        let patched = manager
            .patch_write(0x1000, &[1, 2, 3, 4, 5, 6], ISA, Endian::Little)
            .unwrap();
        assert_eq!(patched, vec![1, 2, 0, 0, 5, 6]);
        assert_eq!(
            manager.find(0x1002).unwrap().original.as_deref(),
            Some(&[3, 4][..])
        );
    }

    #[test]
    fn breakpoint_at_the_top_of_memory() {
        let top = u64::MAX - 1;
        let mut link = FakeLink::had(0x0480_0003);
        link.poke(top, &[0x12, 0x34]);
        let mut core = had().attach(&mut link);
        let mut slots = SlotAllocator::new(2);
        let mut manager = BreakpointManager::new();

        manager
            .add(&mut slots, &mut *core, None, top, 2, BreakpointKind::Software)
            .unwrap();
        manager.install_software(&mut *core, ISA).unwrap();
        assert_eq!(manager.find(top).unwrap().end(), 1u128 << 64);

        let patched = manager
            .patch_write(top - 2, &[1, 2, 3], ISA, Endian::Little)
            .unwrap();
        assert_eq!(patched, vec![1, 2, 0]);

        let mut data = [0u8; 4];
        manager.overlay(top - 2, &mut data);
        assert_eq!(data, [0, 0, 3, 0x34]);
    }

    #[test]
    fn overlap_ending_at_the_last_address() {
        let mut target = [0u8; 4];
        copy_overlap(u64::MAX - 1, &[7, 8], u64::MAX - 3, &mut target);
        assert_eq!(target, [0, 0, 7, 8]);

        let mut target = [0u8; 2];
        copy_overlap(u64::MAX - 3, &[1, 2, 3, 4], u64::MAX - 1, &mut target);
        assert_eq!(target, [3, 4]);
    }

    #[test]
    fn lifted_breakpoint_is_restored() {
        let mut link = FakeLink::had(0x0480_0003);
        let handle = link.clone();
        handle.poke(0x1000, &[0xaa, 0xbb]);
        let mut core = had().attach(&mut link);
        let mut slots = SlotAllocator::new(2);
        let mut manager = BreakpointManager::new();

        manager
            .add(&mut slots, &mut *core, None, 0x1000, 2, BreakpointKind::Software)
            .unwrap();
        manager.install_software(&mut *core, ISA).unwrap();

        {
            let lifted = manager.lift(&mut *core, 0x1000, ISA).unwrap().unwrap();
            assert_eq!(handle.peek(0x1000, 2), vec![0xaa, 0xbb]);
            drop(lifted);
        }
        assert_eq!(handle.peek(0x1000, 2), vec![0x00, 0x00]);

        assert!(manager.lift(&mut *core, 0x2000, ISA).unwrap().is_none());
    }

    #[test]
    fn hardware_units_never_exceed_capacity() {
        let mut link = FakeLink::had(0x0480_0003);
        let mut core = had().attach(&mut link);
        let mut slots = SlotAllocator::new(2);
        let mut manager = BreakpointManager::new();
        let mut rng = rand::thread_rng();

        for _ in 0..300 {
            let address = 0x1000 + 4 * rng.gen_range(0..6u64);
            if rng.gen_bool(0.6) {
                match manager.add(&mut slots, &mut *core, None, address, 4, BreakpointKind::Hardware)
                {
                    Ok(breakpoint) => assert_eq!(breakpoint.kind, BreakpointKind::Hardware),
                    Err(error) => assert!(matches!(error, Error::NoHardwareSlot)),
                }
                if rng.gen_bool(0.5) {
                    manager.install_hardware(&mut *core).unwrap();
                }
            } else {
                let _ = manager.remove(&mut slots, &mut *core, address);
                assert_eq!(manager.find(address), None);
            }
            assert!(manager.hardware_count() <= 2);
            assert_eq!(manager.hardware_count(), slots.in_use());
        }
    }

    fn flash() -> FakeFlash {
        FakeFlash::new(vec![
            MemoryRegion {
                kind: MemoryKind::Flash,
                range: 0x0..0x1_0000,
                sector_size: 0x100,
            },
            MemoryRegion {
                kind: MemoryKind::Ram,
                range: 0x2000_0000..0x2000_1000,
                sector_size: 0,
            },
        ])
    }

    #[test]
    fn flash_breakpoints_are_batched_per_sector() {
        let mut link = FakeLink::had(0x0480_0003);
        let handle = link.clone();
        handle.poke(0x200, &[0x11, 0x22, 0x33, 0x44]);
        let mut core = had().attach(&mut link);
        let mut slots = SlotAllocator::new(2);
        let mut manager = BreakpointManager::new();
        let mut flash = flash();

        let breakpoint = manager
            .add(&mut slots, &mut *core, Some(&flash), 0x200, 2, BreakpointKind::Software)
            .unwrap();
        assert_eq!(breakpoint.kind, BreakpointKind::Flash);
        assert!(breakpoint.type_adjusted);
        assert!(breakpoint.is_new);
        manager
            .add(&mut slots, &mut *core, Some(&flash), 0x202, 2, BreakpointKind::Flash)
            .unwrap();
        manager
            .add(&mut slots, &mut *core, Some(&flash), 0x2000_0000, 2, BreakpointKind::Software)
            .unwrap();
        assert!(matches!(
            manager.add(&mut slots, &mut *core, Some(&flash), 0x2000_0010, 2, BreakpointKind::Flash),
            Err(Error::Flash(FlashError::NotInFlash(0x2000_0010)))
        ));

        assert!(manager.needs_flash_sync());
        manager
            .sync_flash(&mut *core, &mut flash, &[], ISA, None)
            .unwrap();
        assert!(!manager.needs_flash_sync());
        assert_eq!(flash.erased(), vec![0x200]);
        assert_eq!(handle.peek(0x200, 4), vec![0, 0, 0, 0]);

        manager.remove(&mut slots, &mut *core, 0x202).unwrap();
        assert_eq!(manager.find(0x202), None);
        assert!(manager.needs_flash_sync());
        manager
            .sync_flash(&mut *core, &mut flash, &[], ISA, None)
            .unwrap();
        assert_eq!(handle.peek(0x200, 4), vec![0, 0, 0x33, 0x44]);
        assert_eq!(flash.erased(), vec![0x200, 0x200]);
    }

    #[test]
    fn flash_requires_an_algorithm() {
        let mut link = FakeLink::had(0x0480_0003);
        let mut core = had().attach(&mut link);
        let mut slots = SlotAllocator::new(2);
        let mut manager = BreakpointManager::new();

        assert!(matches!(
            manager.add(&mut slots, &mut *core, None, 0x200, 2, BreakpointKind::Flash),
            Err(Error::FlashUnavailable)
        ));
    }
}
