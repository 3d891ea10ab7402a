//! Fixed pool of in-flight job slots.
//!
//! Free slot indices live in a ring of `u16` addressed by two free-running
//! counters; capacity is a power of two so the counters are reduced with a
//! mask.  Each hand-out stamps the slot with a fresh generation, and the
//! returned [`SlotKey`] must match it to read or release the slot.

use std::fmt;

use qrun_core::backend::SlotKey;
use qrun_core::error::{Result, RuntimeError};

/// Default number of concurrently in-flight async jobs per session.
pub const DEFAULT_NOTIFY_SLOTS: usize = 8;

struct Slot<T> {
    generation: u32,
    occupant: Option<T>,
}

/// Bounded arena of reusable notification slots.
pub struct NotificationRingBuffer<T> {
    ring: Box<[u16]>,
    slots: Box<[Slot<T>]>,
    push_idx: u32,
    pop_idx: u32,
    mask: u32,
    next_generation: u32,
}

impl<T> fmt::Debug for NotificationRingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationRingBuffer")
            .field("capacity", &self.capacity())
            .field("free", &self.free())
            .field("push_idx", &self.push_idx)
            .field("pop_idx", &self.pop_idx)
            .finish_non_exhaustive()
    }
}

impl<T> NotificationRingBuffer<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() || capacity > usize::from(u16::MAX) + 1 {
            return Err(RuntimeError::Config(format!(
                "notify slot capacity must be a power of two in 1..=65536, got {capacity}"
            )));
        }
        let mut ring = Self {
            ring: vec![0u16; capacity].into_boxed_slice(),
            slots: (0..capacity)
                .map(|_| Slot {
                    generation: 0,
                    occupant: None,
                })
                .collect(),
            push_idx: 0,
            pop_idx: 0,
            mask: (capacity - 1) as u32,
            next_generation: 1,
        };
        ring.reset();
        Ok(ring)
    }

    /// Mark every slot free again, dropping any occupant.
    ///
    /// Generations keep counting, so keys issued before the reset stay stale.
    pub fn reset(&mut self) {
        self.push_idx = 0;
        self.pop_idx = 0;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            slot.occupant = None;
            self.ring[(self.push_idx & self.mask) as usize] = idx as u16;
            self.push_idx = self.push_idx.wrapping_add(1);
        }
    }

    /// Take a free slot for `payload`; fails instead of waiting.
    pub fn acquire(&mut self, payload: T) -> Result<SlotKey> {
        if self.push_idx == self.pop_idx {
            return Err(RuntimeError::SlotsExhausted {
                capacity: self.capacity(),
            });
        }
        let index = self.ring[(self.pop_idx & self.mask) as usize];
        self.pop_idx = self.pop_idx.wrapping_add(1);

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);

        let slot = &mut self.slots[usize::from(index)];
        slot.generation = generation;
        slot.occupant = Some(payload);
        Ok(SlotKey { index, generation })
    }

    pub fn get(&self, key: SlotKey) -> Option<&T> {
        self.slots
            .get(usize::from(key.index))
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.occupant.as_ref())
    }

    /// Return the slot behind `key` to the free ring.
    ///
    /// `None` means the key was stale and nothing changed.
    pub fn release(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(usize::from(key.index))?;
        if slot.generation != key.generation {
            return None;
        }
        let payload = slot.occupant.take()?;
        self.ring[(self.push_idx & self.mask) as usize] = key.index;
        self.push_idx = self.push_idx.wrapping_add(1);
        Some(payload)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free(&self) -> usize {
        self.push_idx.wrapping_sub(self.pop_idx) as usize
    }

    pub fn in_flight(&self) -> usize {
        self.capacity() - self.free()
    }

    /// Restart both free-list counters at `start`, keeping every slot free.
    #[cfg(test)]
    fn seed_counters(&mut self, start: u32) {
        self.reset();
        self.pop_idx = start;
        self.push_idx = start;
        for idx in 0..self.capacity() {
            self.ring[(self.push_idx & self.mask) as usize] = idx as u16;
            self.push_idx = self.push_idx.wrapping_add(1);
        }
    }
}
