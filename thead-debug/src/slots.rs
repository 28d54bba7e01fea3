//! Bookkeeping of the hardware comparator units shared by breakpoints and watchpoints.

use bitvec::prelude::*;

/// A fixed pool of hardware units. Units are handed out lowest index first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotAllocator {
    used: BitVec,
}

impl SlotAllocator {
    /// A pool of `capacity` free units.
    pub fn new(capacity: usize) -> Self {
        SlotAllocator {
            used: bitvec![0; capacity],
        }
    }

    /// Total number of units.
    pub fn capacity(&self) -> usize {
        self.used.len()
    }

    /// Number of free units.
    pub fn available(&self) -> usize {
        self.used.count_zeros()
    }

    /// Number of units in use.
    pub fn in_use(&self) -> usize {
        self.used.count_ones()
    }

    /// Claims the lowest free unit.
    pub fn allocate(&mut self) -> Option<usize> {
        let index = self.used.first_zero()?;
        self.used.set(index, true);
        Some(index)
    }

    /// Claims the lowest free unit accepted by `usable`.
    pub fn allocate_where(&mut self, usable: impl Fn(usize) -> bool) -> Option<usize> {
        let index = self.used.iter_zeros().find(|index| usable(*index))?;
        self.used.set(index, true);
        Some(index)
    }

    /// Returns a unit to the pool. Releasing a free or unknown unit is a no-op.
    pub fn release(&mut self, index: usize) {
        if index < self.used.len() {
            self.used.set(index, false);
        }
    }

    /// `true` if `index` is claimed.
    pub fn is_used(&self, index: usize) -> bool {
        self.used.get(index).is_some_and(|bit| *bit)
    }

    /// Replaces the pool with `capacity` free units.
    pub fn reset(&mut self, capacity: usize) {
        self.used = bitvec![0; capacity];
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::Rng;

    #[test]
    fn lowest_free_first() {
        let mut slots = SlotAllocator::new(3);

        assert_eq!(slots.allocate(), Some(0));
        assert_eq!(slots.allocate(), Some(1));
        slots.release(0);
        assert_eq!(slots.allocate(), Some(0));
        assert_eq!(slots.allocate(), Some(2));
        assert_eq!(slots.allocate(), None);
        assert_eq!(slots.available(), 0);
    }

    #[test]
    fn restricted_allocation() {
        let mut slots = SlotAllocator::new(4);
        assert_eq!(slots.allocate(), Some(0));

        assert_eq!(slots.allocate_where(|unit| unit < 2), Some(1));
        assert_eq!(slots.allocate_where(|unit| unit < 2), None);
        assert_eq!(slots.available(), 2);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut rng = rand::thread_rng();
        let mut slots = SlotAllocator::new(4);
        let mut held = Vec::new();

        for _ in 0..500 {
            if rng.gen_bool(0.6) {
                if let Some(index) = slots.allocate() {
                    assert!(!held.contains(&index));
                    held.push(index);
                }
            } else if !held.is_empty() {
                let index = held.swap_remove(rng.gen_range(0..held.len()));
                slots.release(index);
            }
            assert!(slots.in_use() <= slots.capacity());
            assert_eq!(slots.in_use(), held.len());
        }
    }
}
