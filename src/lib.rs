//! Shadow GOT/PLT tables for loading mutually incompatible copies of one
//! shared library into a single process.
//!
//! Each loaded copy gets a private table of function-pointer override slots
//! (its shadow GOT) and a matching page of call-through stubs (its shadow
//! PLT). Call sites compiled against a given copy are redirected through
//! stubs that resolve, via the slot table, to that copy's own entry points
//! instead of the process-global ones.
//!
//! The heart of the crate is [`SlotTable`]: a fixed-capacity array of
//! one-word slots whose free list is packed into the very words the stub
//! code reads, using a tag bit plus an index field per slot and no side
//! structure.
//! [`LibraryHandle`] is the owner a contiguous slot range is allocated to
//! and the translator from slot index to real call target; [`StubCodepage`]
//! and [`CodepageSet`] tie the tables to the per-page stub layout and the
//! process's load/unload path.
//!
//! Nothing here locks: stub dispatch is a plain read valid against a stable
//! table, and allocate/free must be serialized by whatever exclusion the
//! surrounding loader already holds across load and unload events.

mod codepage;
mod library_handle;
mod slot_table;

pub use codepage::{
    CodepageSet, StubCodepage, CODEPAGE_BYTES, CODEPAGE_SLOTS, MAX_CODEPAGES, STUB_BYTES,
};
pub use library_handle::LibraryHandle;
pub use slot_table::{SlotState, SlotTable, INDEX_NONE};
