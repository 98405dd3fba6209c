//! Generational slot arenas for per-transaction state.
//!
//! Slots are pre-sized at startup and recycled through a free list, so the steady state does not
//! allocate per transaction. A released slot bumps its generation, which turns every stale
//! `SlotId` into a miss instead of an alias of the next occupant.

/// State that can be cleared and handed to the next user of its slot.
pub trait Reusable: Default {
    /// Clears all per-use fields.
    fn reset(&mut self);
}

/// Handle into a [`SlotArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    value: T,
    generation: u32,
    occupied: bool,
}

/// Usage counters of one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Slots allocated so far.
    pub capacity: usize,
    /// Slots currently acquired.
    pub in_use: usize,
}

/// Fixed-at-start arena that grows on demand.
#[derive(Debug)]
pub struct SlotArena<T: Reusable> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    in_use: usize,
}

impl<T: Reusable> Default for SlotArena<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<T: Reusable> SlotArena<T> {
    /// Creates an arena with `capacity` preloaded free slots.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let mut arena = Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            in_use: 0,
        };
        arena.preload(capacity);
        arena
    }

    /// Adds `count` free slots.
    pub fn preload(&mut self, count: usize) {
        let start = self.slots.len();
        for _ in 0..count {
            self.slots.push(Slot {
                value: T::default(),
                generation: 0,
                occupied: false,
            });
        }
        // Lowest index is handed out first.
        for index in (start..self.slots.len()).rev() {
            if let Ok(index) = u32::try_from(index) {
                self.free.push(index);
            }
        }
    }

    /// Takes a free slot, growing the arena when none is left.
    pub fn acquire(&mut self) -> SlotId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.preload(1);
                self.free.pop().unwrap_or_default()
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.occupied = true;
        self.in_use += 1;
        SlotId {
            index,
            generation: slot.generation,
        }
    }

    /// Borrows the value behind a live handle.
    #[must_use]
    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.occupied && slot.generation == id.generation)
            .map(|slot| &slot.value)
    }

    /// Mutably borrows the value behind a live handle.
    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.occupied && slot.generation == id.generation)
            .map(|slot| &mut slot.value)
    }

    /// Resets the value and returns its slot to the free list.
    ///
    /// Returns `false` for stale or already released handles.
    pub fn release(&mut self, id: SlotId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return false;
        };
        if !slot.occupied || slot.generation != id.generation {
            return false;
        }
        slot.value.reset();
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.in_use -= 1;
        true
    }

    /// Current usage counters.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            capacity: self.slots.len(),
            in_use: self.in_use,
        }
    }
}
