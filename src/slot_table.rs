//! The override-slot allocator shared between the load/unload path and the
//! stub codepages.
//!
//! Each stub codepage owns one `SlotTable`: a fixed array of one-word slots,
//! indexed 1:1 with the page's call-through stubs. A slot is either Allocated
//! (its word is the address of the owning [`LibraryHandle`]) or Free (its word
//! carries a chain index), discriminated by bit 0. The entire free list is
//! packed into the same array the stub code reads at call time; no side
//! metadata exists.
//!
//! Free slots form maximal contiguous runs ("blocks"), chained in ascending
//! index order starting at `first_free`. Within a block `[s, e]`:
//!   * every slot before the last stores `e`, the index of the block's last
//!     slot, so a reader learns the block's extent in one access;
//!   * the last slot stores the index of the next block's first slot, or the
//!     sentinel when no free block follows.
//!
//! Adjacent free blocks are never left unmerged: `free` must coalesce with a
//! touching neighbor on either side, or length inference from the first rule
//! breaks for later allocations.

use core::fmt;

use crate::library_handle::LibraryHandle;

/// Sentinel index: "no further free entry" in a chain link, "table full" in
/// `first_free`. The all-ones value of the index field, so a terminal free
/// slot's word is all-ones.
pub const INDEX_NONE: usize = usize::MAX >> 1;

const FREE_TAG: usize = 0b1;

/// One table entry: a single word shared with the stub code.
///
/// Bit 0 is the Free/Allocated tag. A free slot's remaining bits hold a chain
/// index; an allocated slot's word is the owning handle's address verbatim,
/// which keeps bit 0 clear through the handle's alignment. Stub code is
/// compiled against exactly this layout.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
struct SlotWord(usize);

impl SlotWord {
    fn free(link: usize) -> Self {
        debug_assert!(link <= INDEX_NONE);
        SlotWord((link << 1) | FREE_TAG)
    }

    fn allocated(owner: &LibraryHandle) -> Self {
        let address = owner as *const LibraryHandle as usize;
        debug_assert!(address & FREE_TAG == 0);
        SlotWord(address)
    }

    fn is_free(self) -> bool {
        self.0 & FREE_TAG != 0
    }

    /// The chain index of a free slot. Meaningless for an allocated one.
    fn link(self) -> usize {
        debug_assert!(self.is_free());
        self.0 >> 1
    }

    fn decode(self) -> SlotState {
        if self.is_free() {
            SlotState::Free { next: self.0 >> 1 }
        } else {
            SlotState::Allocated {
                owner: self.0 as *const LibraryHandle,
            }
        }
    }
}

impl fmt::Debug for SlotWord {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            SlotState::Free { next } if next == INDEX_NONE => write!(formatter, "Free(end)"),
            SlotState::Free { next } => write!(formatter, "Free({next})"),
            SlotState::Allocated { owner } => write!(formatter, "Allocated({owner:p})"),
        }
    }
}

/// Decoded view of one slot word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotState {
    /// Free slot; `next` is the chain index described in the module docs,
    /// [`INDEX_NONE`] at the end of the chain.
    Free { next: usize },
    /// Allocated slot; `owner` is a non-owning reference to the handle the
    /// containing range belongs to. It is valid to dereference only while the
    /// surrounding load/unload path keeps that handle alive and pinned.
    Allocated { owner: *const LibraryHandle },
}

/// A fixed-capacity table of override slots for one stub codepage.
///
/// The layout is a binary contract with the stub code: the `first_free` word
/// followed by `CAPACITY` slot words. Mutation (`allocate`, `free`) happens
/// only on the load/unload path and must be serialized by the caller; stub
/// dispatch reads a non-mutating table from arbitrary threads with no
/// synchronization.
#[repr(C)]
pub struct SlotTable<const CAPACITY: usize> {
    first_free: usize,
    entries: [SlotWord; CAPACITY],
}

impl<const CAPACITY: usize> SlotTable<CAPACITY> {
    pub fn new() -> Self {
        assert!(CAPACITY >= 1, "a slot table must hold at least one slot");
        let mut table = SlotTable {
            first_free: 0,
            entries: [SlotWord::free(INDEX_NONE); CAPACITY],
        };
        table.initialize();
        table
    }

    /// Resets every slot to Free, encoded as one block spanning the table.
    pub fn initialize(&mut self) {
        self.first_free = 0;
        for entry in self.entries.iter_mut() {
            *entry = SlotWord::free(CAPACITY - 1);
        }
        self.entries[CAPACITY - 1] = SlotWord::free(INDEX_NONE);
    }

    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    pub fn slot(&self, index: usize) -> SlotState {
        self.entries[index].decode()
    }

    /// Reserves a contiguous run of `owner.required_slot_count()` slots.
    ///
    /// First fit over the free-block chain in ascending index order: the
    /// first block long enough is carved from its low end, so low indices
    /// stay in steady use and high indices remain a slack buffer. A request
    /// is never assembled from two separate blocks. On success the starting
    /// index is recorded on the handle and `true` is returned; on failure the
    /// table is untouched.
    ///
    /// The handle's address is stored in every reserved slot, so the caller
    /// must keep the handle alive and at a stable address until the range is
    /// freed.
    pub fn allocate(&mut self, owner: &LibraryHandle) -> bool {
        let needed = owner.required_slot_count();
        if needed == 0 || needed > CAPACITY {
            return false;
        }

        // `prev_end` is the slot holding the chain link into `cursor`, when
        // that link lives in the table rather than in `first_free`.
        let mut prev_end: Option<usize> = None;
        let mut cursor = self.first_free;
        while cursor != INDEX_NONE {
            let (end, next) = self.block_bounds(cursor);
            let length = end - cursor + 1;
            if length >= needed {
                let first = cursor;
                // A leftover `[first + needed, end]` already satisfies the
                // block encoding: its interior slots still name `end` and its
                // last slot still names `next`, so only the incoming link and
                // the carved range need writing.
                let incoming = if length > needed { first + needed } else { next };
                let word = SlotWord::allocated(owner);
                for entry in &mut self.entries[first..first + needed] {
                    *entry = word;
                }
                match prev_end {
                    Some(link_slot) => self.entries[link_slot] = SlotWord::free(incoming),
                    None => self.first_free = incoming,
                }
                owner.record_allocation(first);
                return true;
            }
            prev_end = Some(end);
            cursor = next;
        }
        false
    }

    /// Releases the range starting at `first_index`, owned by whatever handle
    /// that slot names, merging the freed run with any touching free block.
    ///
    /// Returns `false` without touching the table when `first_index` is out
    /// of range or already Free: a double free or a bad index, which is
    /// caller misuse rather than a recoverable condition.
    ///
    /// # Safety
    ///
    /// The handle stored at `first_index` must still be alive: the range
    /// length is read back from it. The caller must also pass the same first
    /// index the allocation reported; naming the interior of a range is
    /// undetectable here and corrupts the table.
    pub unsafe fn free(&mut self, first_index: usize) -> bool {
        if first_index >= CAPACITY || self.entries[first_index].is_free() {
            return false;
        }
        let owner = self.entries[first_index].0 as *const LibraryHandle;
        let count = unsafe { (*owner).required_slot_count() };
        debug_assert!(count >= 1 && first_index + count <= CAPACITY);
        #[cfg(debug_assertions)]
        for entry in &self.entries[first_index..first_index + count] {
            debug_assert!(!entry.is_free());
            debug_assert!(entry.0 == owner as usize);
        }

        // Find the last free block wholly before the range and the first one
        // after it; the chain is hopped block by block.
        let mut prev: Option<(usize, usize)> = None;
        let mut cursor = self.first_free;
        while cursor != INDEX_NONE && cursor < first_index {
            let (end, next) = self.block_bounds(cursor);
            debug_assert!(end < first_index);
            prev = Some((cursor, end));
            cursor = next;
        }

        let after = first_index + count;
        let merged_start = match prev {
            Some((start, end)) if end + 1 == first_index => start,
            _ => first_index,
        };
        // Any block past the range starts at `after` or later, so equality
        // is exactly adjacency.
        let (merged_end, merged_next) = if cursor == after {
            self.block_bounds(cursor)
        } else {
            (after - 1, cursor)
        };

        for entry in &mut self.entries[merged_start..merged_end] {
            *entry = SlotWord::free(merged_end);
        }
        self.entries[merged_end] = SlotWord::free(merged_next);

        match prev {
            // Merged into the preceding block: the link into it already
            // names `merged_start`.
            Some((_, end)) if end + 1 == first_index => {}
            Some((_, end)) => self.entries[end] = SlotWord::free(merged_start),
            None => self.first_free = merged_start,
        }
        true
    }

    /// Extent of the free block starting at `start`, and the first slot of
    /// the block after it (or [`INDEX_NONE`]).
    ///
    /// The stored link alone cannot distinguish a multi-slot block (link =
    /// own last slot) from a single-slot one (link = next block's start);
    /// the tag of the following slot settles it. Treating the link as a
    /// length bound without that check over-counts single-slot blocks and
    /// carves across allocated slots.
    fn block_bounds(&self, start: usize) -> (usize, usize) {
        let link = self.entries[start].link();
        if link == INDEX_NONE {
            return (start, INDEX_NONE);
        }
        if start + 1 < CAPACITY && self.entries[start + 1].is_free() {
            (link, self.entries[link].link())
        } else {
            (start, link)
        }
    }
}

impl<const CAPACITY: usize> Default for SlotTable<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}
