//! The per-library-copy handle an allocated slot range belongs to.
//!
//! A handle pairs a loaded copy's identity with its real-address table (the
//! copy's own shadow GOT) and, once placed, the first index of its slot range
//! in the owning codepage's [`SlotTable`](crate::SlotTable). That recorded
//! index is what lets a stub translate its table-global slot index into an
//! offset in the handle's real-address table.
//!
//! The allocator stores each handle's address in the slots it hands out but
//! never manages its lifetime: the load/unload path owns the handle and must
//! keep it alive and pinned until its range has been freed.

use core::sync::atomic::{AtomicUsize, Ordering};

use smartstring::alias::String as SmartString;

use crate::slot_table::INDEX_NONE;

pub struct LibraryHandle {
    name: SmartString,
    /// One real call target per override slot, indexed by slot offset within
    /// the handle's range.
    real_addresses: Vec<usize>,
    /// First slot of the range the allocator granted, [`INDEX_NONE`] while
    /// unplaced. Atomic so stub dispatch may read it from any thread.
    first_slot: AtomicUsize,
}

impl LibraryHandle {
    pub fn new(name: &str, real_addresses: Vec<usize>) -> Self {
        LibraryHandle {
            name: SmartString::from(name),
            real_addresses,
            first_slot: AtomicUsize::new(INDEX_NONE),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of contiguous override slots this copy needs: one per entry in
    /// its real-address table.
    pub fn required_slot_count(&self) -> usize {
        self.real_addresses.len()
    }

    /// Called by the allocator on a successful allocation.
    pub fn record_allocation(&self, first_index: usize) {
        debug_assert_eq!(self.first_slot.load(Ordering::Relaxed), INDEX_NONE);
        self.first_slot.store(first_index, Ordering::Release);
    }

    /// Called by the load/unload path once the range has been freed.
    pub fn clear_allocation(&self) {
        self.first_slot.store(INDEX_NONE, Ordering::Release);
    }

    pub fn first_slot_index(&self) -> Option<usize> {
        match self.first_slot.load(Ordering::Acquire) {
            INDEX_NONE => None,
            index => Some(index),
        }
    }

    /// Stub-path translation of a table-global slot index into this copy's
    /// real call target. Valid only for indices inside the recorded range.
    pub fn resolve(&self, slot_index: usize) -> usize {
        let first = self.first_slot.load(Ordering::Acquire);
        debug_assert_ne!(first, INDEX_NONE, "resolve on an unplaced handle");
        debug_assert!(slot_index >= first);
        self.real_addresses[slot_index - first]
    }
}
