//! Data watchpoints.
//!
//! Every watchpoint owns one hardware comparator that can match data accesses. Comparators are
//! claimed when the watchpoint is added and programmed lazily, right before the target resumes.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::core::CoreInterface;
use crate::slots::SlotAllocator;
use crate::Error;

/// The kind of data access a watchpoint triggers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Write,
    Read,
    /// Reads and writes.
    Access,
}

impl AccessKind {
    /// `true` if an access of the given direction triggers this kind.
    pub fn matches(self, is_store: bool) -> bool {
        match self {
            AccessKind::Write => is_store,
            AccessKind::Read => !is_store,
            AccessKind::Access => true,
        }
    }
}

/// A data watchpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watchpoint {
    pub address: u64,
    pub length: u32,
    /// Address bits ignored by the comparator.
    pub mask: u64,
    pub access: AccessKind,
    /// The comparator owned by this watchpoint.
    pub unit: usize,
    /// `true` while the comparator is programmed.
    pub set: bool,
}

impl Watchpoint {
    /// The addresses matched by the comparator.
    pub fn range(&self) -> Range<u64> {
        let base = self.address & !self.mask;
        base..base.saturating_add(self.mask + 1)
    }

    fn overlaps(&self, address: u64, length: u32) -> bool {
        let range = self.range();
        let end = address.saturating_add(u64::from(length.max(1)));
        address < range.end && range.start < end
    }
}

/// The smallest naturally aligned power of two block containing `address..address + length`,
/// as a mask of the ignored low address bits.
pub fn address_mask(address: u64, length: u32) -> u64 {
    if length <= 1 {
        return 0;
    }
    let last = address.saturating_add(u64::from(length) - 1);
    let mut size = u64::from(length).next_power_of_two();
    while size < (1 << 63) && (address & !(size - 1)) != (last & !(size - 1)) {
        size <<= 1;
    }
    size - 1
}

/// A data access that caused a trap, decoded from the instruction at the trap address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrappedAccess {
    pub address: u64,
    pub length: u32,
    pub is_store: bool,
}

/// Owns the watchpoints of one CPU, keyed by address and length.
#[derive(Debug, Clone, Default)]
pub struct WatchpointManager {
    watchpoints: BTreeMap<(u64, u32), Watchpoint>,
}

impl WatchpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a watchpoint and claims a comparator accepted by `data_match`.
    ///
    /// Adding the same watchpoint twice is a no-op. A watchpoint with the same address and
    /// length but a different access kind is an [`Error::AddressConflict`].
    pub fn add(
        &mut self,
        slots: &mut SlotAllocator,
        data_match: impl Fn(usize) -> bool,
        address: u64,
        length: u32,
        access: AccessKind,
    ) -> Result<&Watchpoint, Error> {
        if length == 0 {
            return Err(Error::InvalidLength(length));
        }

        if let Some(existing) = self.watchpoints.get(&(address, length)) {
            if existing.access != access {
                return Err(Error::AddressConflict { address });
            }
            tracing::debug!("Watchpoint at {address:#010x} already exists");
        } else {
            let unit = slots
                .allocate_where(data_match)
                .ok_or(Error::NoHardwareSlot)?;
            let mask = address_mask(address, length);
            tracing::debug!(
                "Adding {access:?} watchpoint at {address:#010x}, mask {mask:#x}, comparator {unit}"
            );
            self.watchpoints.insert(
                (address, length),
                Watchpoint {
                    address,
                    length,
                    mask,
                    access,
                    unit,
                    set: false,
                },
            );
        }

        self.watchpoints
            .get(&(address, length))
            .ok_or(Error::NotFound(address))
    }

    /// Removes the watchpoints at `address` and disables their comparators.
    ///
    /// The entries are gone even if a comparator could not be disabled, which is reported as
    /// [`Error::RestoreFailed`].
    pub fn remove(
        &mut self,
        slots: &mut SlotAllocator,
        core: &mut dyn CoreInterface,
        address: u64,
    ) -> Result<(), Error> {
        let keys: Vec<(u64, u32)> = self
            .watchpoints
            .range((address, 0)..=(address, u32::MAX))
            .map(|(key, _)| *key)
            .collect();
        if keys.is_empty() {
            return Err(Error::NotFound(address));
        }

        let mut result = Ok(());
        for key in keys {
            if let Some(watchpoint) = self.watchpoints.remove(&key) {
                if let Err(error) = Self::teardown(slots, core, &watchpoint) {
                    result = Err(error);
                }
            }
        }
        result
    }

    fn teardown(
        slots: &mut SlotAllocator,
        core: &mut dyn CoreInterface,
        watchpoint: &Watchpoint,
    ) -> Result<(), Error> {
        slots.release(watchpoint.unit);
        if !watchpoint.set {
            return Ok(());
        }
        core.clear_hw_unit(watchpoint.unit).map_err(|error| {
            tracing::warn!(
                "Could not disable comparator {} of the watchpoint at {:#010x}: {error}",
                watchpoint.unit,
                watchpoint.address
            );
            Error::RestoreFailed {
                address: watchpoint.address,
                source: Box::new(error),
            }
        })
    }

    /// Removes all watchpoints. The manager is empty afterwards even if some comparators
    /// could not be disabled.
    pub fn clear(
        &mut self,
        slots: &mut SlotAllocator,
        core: &mut dyn CoreInterface,
    ) -> Result<(), Error> {
        let errors: Vec<Error> = std::mem::take(&mut self.watchpoints)
            .into_values()
            .filter_map(|watchpoint| Self::teardown(slots, core, &watchpoint).err())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::ClearIncomplete(errors))
        }
    }

    /// The first watchpoint at exactly `address`.
    pub fn find(&self, address: u64) -> Option<&Watchpoint> {
        self.watchpoints
            .range((address, 0)..=(address, u32::MAX))
            .map(|(_, watchpoint)| watchpoint)
            .next()
    }

    /// Watchpoints triggered by an access of `length` bytes at `address`.
    pub fn find_access(
        &self,
        address: u64,
        length: u32,
        is_store: bool,
    ) -> impl Iterator<Item = &Watchpoint> {
        self.watchpoints.values().filter(move |watchpoint| {
            watchpoint.access.matches(is_store) && watchpoint.overlaps(address, length)
        })
    }

    /// Picks the watchpoint responsible for a data trap.
    ///
    /// The comparators only report that one of them matched. With a decoded access the
    /// candidates are the set watchpoints covering it; without one, all set watchpoints.
    /// Ties go to the watchpoint starting exactly at the accessed address, then to the
    /// narrowest one, then to the lowest comparator.
    pub fn find_unique(&self, access: Option<TrappedAccess>) -> Option<&Watchpoint> {
        let set = || self.watchpoints.values().filter(|watchpoint| watchpoint.set);

        match access {
            Some(access) => set()
                .filter(|watchpoint| {
                    watchpoint.access.matches(access.is_store)
                        && watchpoint.overlaps(access.address, access.length)
                })
                .min_by_key(|watchpoint| {
                    (
                        watchpoint.address != access.address,
                        watchpoint.mask,
                        watchpoint.unit,
                    )
                }),
            None => set().min_by_key(|watchpoint| watchpoint.unit),
        }
    }

    /// Programs all comparators that are not yet set. Stops at the first failure; watchpoints
    /// installed before it stay set, so a retry only installs the rest.
    pub fn install(&mut self, core: &mut dyn CoreInterface) -> Result<(), Error> {
        for watchpoint in self.watchpoints.values_mut().filter(|w| !w.set) {
            core.set_hw_watchpoint(
                watchpoint.unit,
                watchpoint.address,
                watchpoint.mask,
                watchpoint.access,
            )?;
            watchpoint.set = true;
            tracing::trace!(
                "Installed watchpoint at {:#010x} on comparator {}",
                watchpoint.address,
                watchpoint.unit
            );
        }
        Ok(())
    }

    /// Disables all programmed comparators so the core can step over the access that
    /// triggered. They are programmed again by the next [`WatchpointManager::install`].
    pub fn suspend(&mut self, core: &mut dyn CoreInterface) -> Result<(), Error> {
        for watchpoint in self.watchpoints.values_mut().filter(|w| w.set) {
            core.clear_hw_unit(watchpoint.unit)?;
            watchpoint.set = false;
        }
        Ok(())
    }

    /// Marks every comparator as unprogrammed, after a reset cleared them.
    pub fn mark_unset(&mut self) {
        for watchpoint in self.watchpoints.values_mut() {
            watchpoint.set = false;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Watchpoint> {
        self.watchpoints.values()
    }

    pub fn len(&self) -> usize {
        self.watchpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchpoints.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(0x1000, 1, 0; "byte")]
    #[test_case(0x1000, 4, 0x3; "aligned word")]
    #[test_case(0x1002, 4, 0x7; "unaligned word")]
    #[test_case(0x1000, 3, 0x3; "odd length")]
    #[test_case(0x0ffc, 8, 0x1fff; "crossing a boundary")]
    fn masks(address: u64, length: u32, expected: u64) {
        let mask = address_mask(address, length);
        assert_eq!(mask, expected);
        let base = address & !mask;
        assert!(base + mask + 1 >= address + u64::from(length));
    }

    fn manager_with(entries: &[(u64, u32, AccessKind)]) -> (WatchpointManager, SlotAllocator) {
        let mut slots = SlotAllocator::new(4);
        let mut manager = WatchpointManager::new();
        for (address, length, access) in entries {
            manager
                .add(&mut slots, |_| true, *address, *length, *access)
                .unwrap();
        }
        for watchpoint in manager.watchpoints.values_mut() {
            watchpoint.set = true;
        }
        (manager, slots)
    }

    #[test]
    fn duplicate_and_conflict() {
        let (mut manager, mut slots) = manager_with(&[(0x2000, 4, AccessKind::Write)]);

        manager
            .add(&mut slots, |_| true, 0x2000, 4, AccessKind::Write)
            .unwrap();
        assert_eq!(slots.in_use(), 1);
        assert!(matches!(
            manager.add(&mut slots, |_| true, 0x2000, 4, AccessKind::Read),
            Err(Error::AddressConflict { address: 0x2000 })
        ));
    }

    #[test]
    fn only_data_match_units_are_used() {
        let mut slots = SlotAllocator::new(8);
        let mut manager = WatchpointManager::new();
        let data_match = |unit: usize| unit < 2;

        for address in [0x10, 0x20] {
            manager
                .add(&mut slots, data_match, address, 4, AccessKind::Access)
                .unwrap();
        }
        assert!(matches!(
            manager.add(&mut slots, data_match, 0x30, 4, AccessKind::Access),
            Err(Error::NoHardwareSlot)
        ));
        assert_eq!(slots.available(), 6);
    }

    #[test]
    fn lookup_by_access() {
        let (manager, _) = manager_with(&[
            (0x2000, 4, AccessKind::Write),
            (0x2002, 2, AccessKind::Read),
        ]);

        let hits: Vec<u64> = manager
            .find_access(0x2002, 2, true)
            .map(|w| w.address)
            .collect();
        assert_eq!(hits, vec![0x2000]);

        let hits: Vec<u64> = manager
            .find_access(0x2003, 1, false)
            .map(|w| w.address)
            .collect();
        assert_eq!(hits, vec![0x2002]);

        assert_eq!(manager.find_access(0x2004, 4, true).count(), 0);
    }

    #[test]
    fn unique_prefers_exact_then_narrow() {
        let (manager, _) = manager_with(&[
            (0x2000, 16, AccessKind::Access),
            (0x2004, 4, AccessKind::Access),
            (0x2006, 2, AccessKind::Access),
        ]);

        let hit = |address, length| {
            manager
                .find_unique(Some(TrappedAccess {
                    address,
                    length,
                    is_store: true,
                }))
                .map(|w| w.address)
        };

        assert_eq!(hit(0x2004, 2), Some(0x2004));
        assert_eq!(hit(0x2006, 2), Some(0x2006));
        // covered by the 16 byte and the 4 byte watchpoint, the narrower one wins
        assert_eq!(hit(0x2005, 1), Some(0x2004));
        assert_eq!(hit(0x2001, 1), Some(0x2000));
        assert_eq!(hit(0x3000, 2), None);
    }

    #[test]
    fn unique_without_decoded_access() {
        let (manager, _) = manager_with(&[
            (0x3000, 4, AccessKind::Read),
            (0x2000, 4, AccessKind::Write),
        ]);

        assert_eq!(manager.find_unique(None).map(|w| w.unit), Some(0));
        assert_eq!(manager.find_unique(None).map(|w| w.address), Some(0x3000));
    }
}
