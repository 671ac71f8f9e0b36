//! Zero-count table.
//!
//! Mutators record objects whose count dropped to zero in a private
//! [`ZeroCountBuffer`]. Buffers are only merged at a collection, into a
//! [`ZeroCountTable`] sized for that cycle: open addressing over object
//! addresses, so duplicate pushes collapse and membership is O(1).

use log::trace;

/// Thread-local zero-count buffer. May hold duplicates.
#[derive(Debug, Default)]
pub struct ZeroCountBuffer {
    entries: Vec<usize>,
}

impl ZeroCountBuffer {
    #[inline]
    pub fn push(&mut self, obj: *const u8) {
        trace!("zero count {obj:p}");
        self.entries.push(obj as usize);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Empties the buffer, handing out its entries.
    pub fn take(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.entries)
    }
}

/// State of an entry during one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Provisionally dead.
    Pending,
    /// Found referenced from a root; kept this cycle.
    Resurrected,
    /// Reclaimed.
    Freed,
}

const EMPTY: usize = 0;

/// Fixed-capacity set of zero-count objects for one cycle.
#[derive(Debug)]
pub struct ZeroCountTable {
    keys: Box<[usize]>,
    states: Box<[EntryState]>,
    len: usize,
}

impl ZeroCountTable {
    /// A table able to hold `expected` distinct entries.
    pub fn with_capacity(expected: usize) -> Self {
        let capacity = (expected * 2).max(16).next_power_of_two();
        Self {
            keys: vec![EMPTY; capacity].into_boxed_slice(),
            states: vec![EntryState::Pending; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    fn mask(&self) -> usize {
        self.keys.len() - 1
    }

    #[inline(always)]
    fn home(&self, addr: usize) -> usize {
        // cells are 16-byte aligned; fibonacci hashing spreads the rest
        ((addr >> 4).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 16) & self.mask()
    }

    /// Slot holding `addr`, or the empty slot where it would go.
    #[inline]
    fn slot_of(&self, addr: usize) -> usize {
        debug_assert_ne!(addr, EMPTY);
        let mut idx = self.home(addr);
        loop {
            let key = self.keys[idx];
            if key == addr || key == EMPTY {
                return idx;
            }
            idx = (idx + 1) & self.mask();
        }
    }

    /// Adds `addr` as pending. Returns `false` if it was already present.
    pub fn insert(&mut self, addr: usize) -> bool {
        assert!(
            self.len < self.keys.len() / 2,
            "zero-count table sized for fewer entries"
        );
        let idx = self.slot_of(addr);
        if self.keys[idx] == addr {
            return false;
        }
        self.keys[idx] = addr;
        self.states[idx] = EntryState::Pending;
        self.len += 1;
        true
    }

    pub fn state(&self, addr: usize) -> Option<EntryState> {
        let idx = self.slot_of(addr);
        (self.keys[idx] == addr).then(|| self.states[idx])
    }

    /// Marks a pending entry as resurrected. Returns `true` on transition.
    pub fn resurrect(&mut self, addr: usize) -> bool {
        self.transition(addr, EntryState::Pending, EntryState::Resurrected)
    }

    /// Marks a pending entry as freed. Returns `true` on transition.
    pub fn mark_freed(&mut self, addr: usize) -> bool {
        self.transition(addr, EntryState::Pending, EntryState::Freed)
    }

    fn transition(
        &mut self,
        addr: usize,
        from: EntryState,
        to: EntryState,
    ) -> bool {
        let idx = self.slot_of(addr);
        if self.keys[idx] != addr || self.states[idx] != from {
            return false;
        }
        self.states[idx] = to;
        true
    }

    /// Entries currently in `state`.
    pub fn entries_in(&self, state: EntryState) -> Vec<usize> {
        self.keys
            .iter()
            .zip(self.states.iter())
            .filter(|&(&key, &s)| key != EMPTY && s == state)
            .map(|(&key, _)| key)
            .collect()
    }
}

impl Default for ZeroCountTable {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}
