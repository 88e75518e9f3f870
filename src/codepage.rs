//! Stub codepages and the process-wide codepage roster.
//!
//! A codepage is one page of call-through stubs, indexed 1:1 with the slots
//! of its [`SlotTable`]. A stub, at call time, reads its own slot to find the
//! owning [`LibraryHandle`], asks it to translate the stub's index into a
//! real call target, and jumps there. That path performs no allocation,
//! takes no lock, and is valid only while load/unload mutation is quiescent.
//!
//! A single codepage cannot host a library whose override requirement
//! exceeds its slot count, so a process carries a fixed roster of codepages
//! and places each library into the first one with a long enough free run.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use smartstring::alias::String as SmartString;
use tracing::debug;

use crate::library_handle::LibraryHandle;
use crate::slot_table::{SlotState, SlotTable};

pub const CODEPAGE_BYTES: usize = 4096;
pub const STUB_BYTES: usize = 16;
/// Override slots per codepage: one per stub that fits in the page.
pub const CODEPAGE_SLOTS: usize = CODEPAGE_BYTES / STUB_BYTES;
/// Upper bound on the roster; the stub pages are laid out contiguously at
/// build time, so the roster never grows past it.
pub const MAX_CODEPAGES: usize = 16;

/// One page of stubs and the slot table they read.
pub struct StubCodepage {
    table: SlotTable<CODEPAGE_SLOTS>,
}

impl StubCodepage {
    pub fn new() -> Self {
        StubCodepage {
            table: SlotTable::new(),
        }
    }

    pub fn table(&self) -> &SlotTable<CODEPAGE_SLOTS> {
        &self.table
    }

    /// The stub read path: reads the slot word, follows the owning handle,
    /// and returns the real call target.
    ///
    /// # Safety
    ///
    /// The slot must be Allocated and its handle still alive; invoking a
    /// stub whose library is unloaded (or mid-load) is undefined under the
    /// load/unload sequencing this crate requires of its caller. No mutation
    /// of this table may be in flight.
    pub unsafe fn dispatch(&self, index: usize) -> usize {
        let state = self.table.slot(index);
        debug_assert!(
            matches!(state, SlotState::Allocated { .. }),
            "stub invoked on an unallocated slot"
        );
        match state {
            SlotState::Allocated { owner } => unsafe { (*owner).resolve(index) },
            SlotState::Free { .. } => unsafe { core::hint::unreachable_unchecked() },
        }
    }
}

impl Default for StubCodepage {
    fn default() -> Self {
        Self::new()
    }
}

struct InstalledLibrary {
    handle: Box<LibraryHandle>,
    codepage: usize,
}

/// The process's codepages plus ownership of every installed handle.
///
/// Installed handles are boxed so the addresses stored in slot words stay
/// stable for the stubs. All methods that mutate are load/unload-path
/// operations and must be serialized by the surrounding loader, typically
/// under the same exclusion it already holds across load and unload events.
pub struct CodepageSet {
    codepages: SmallVec<[Box<StubCodepage>; 4]>,
    installed: FxHashMap<SmartString, InstalledLibrary>,
}

impl CodepageSet {
    pub fn new() -> Self {
        CodepageSet {
            codepages: SmallVec::new(),
            installed: FxHashMap::default(),
        }
    }

    pub fn codepage_count(&self) -> usize {
        self.codepages.len()
    }

    pub fn codepage(&self, index: usize) -> Option<&StubCodepage> {
        self.codepages.get(index).map(|codepage| &**codepage)
    }

    pub fn handle(&self, name: &str) -> Option<&LibraryHandle> {
        self.installed.get(name).map(|entry| &*entry.handle)
    }

    /// Installs one loaded copy's override slots, returning the index of the
    /// codepage that took it.
    ///
    /// First fit across the roster: existing codepages are tried in order
    /// and a fresh one is appended only when none has a long enough run and
    /// the roster is not exhausted. A copy needing more slots than one
    /// codepage holds is rejected outright; the tables never grow.
    pub fn install(&mut self, name: &str, real_addresses: Vec<usize>) -> Result<usize, &'static str> {
        let needed = real_addresses.len();
        if needed == 0 {
            return Err("library declares no override slots");
        }
        if needed > CODEPAGE_SLOTS {
            return Err("library needs more override slots than one codepage holds");
        }
        if self.installed.contains_key(name) {
            return Err("library is already installed");
        }

        let handle = Box::new(LibraryHandle::new(name, real_addresses));
        let codepage = match self.place(&handle) {
            Some(codepage) => codepage,
            None => return Err("every codepage is exhausted or too fragmented"),
        };
        let first_slot = handle.first_slot_index();
        debug!(
            library = name,
            slots = needed,
            codepage,
            first_slot,
            "installed override slots"
        );
        self.installed
            .insert(SmartString::from(name), InstalledLibrary { handle, codepage });
        Ok(codepage)
    }

    fn place(&mut self, handle: &LibraryHandle) -> Option<usize> {
        for (index, codepage) in self.codepages.iter_mut().enumerate() {
            if codepage.table.allocate(handle) {
                return Some(index);
            }
        }
        if self.codepages.len() == MAX_CODEPAGES {
            return None;
        }
        let mut fresh = Box::new(StubCodepage::new());
        let placed = fresh.table.allocate(handle);
        debug_assert!(placed, "a fresh codepage rejected a fitting request");
        self.codepages.push(fresh);
        Some(self.codepages.len() - 1)
    }

    /// Releases an installed copy's slot range and drops its handle. The
    /// caller must have quiesced every stub that could still name it.
    pub fn uninstall(&mut self, name: &str) -> Result<(), &'static str> {
        let entry = match self.installed.remove(name) {
            Some(entry) => entry,
            None => return Err("library is not installed"),
        };
        let first_slot = match entry.handle.first_slot_index() {
            Some(index) => index,
            None => return Err("installed library has no recorded slot range"),
        };
        // The handle is still alive here; `free` reads the range length
        // back from it before the box drops.
        let released = unsafe { self.codepages[entry.codepage].table.free(first_slot) };
        debug_assert!(released, "installed range was not allocated");
        entry.handle.clear_allocation();
        debug!(library = name, codepage = entry.codepage, first_slot, "released override slots");
        Ok(())
    }

    /// Cross-roster stub path; see [`StubCodepage::dispatch`] for the
    /// sequencing contract.
    ///
    /// # Safety
    ///
    /// Same as [`StubCodepage::dispatch`].
    pub unsafe fn dispatch(&self, codepage: usize, index: usize) -> usize {
        unsafe { self.codepages[codepage].dispatch(index) }
    }
}

impl Default for CodepageSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addresses(count: usize, base: usize) -> Vec<usize> {
        (0..count).map(|index| base + index * 8).collect()
    }

    #[test]
    fn install_then_dispatch_resolves_each_stub() {
        let mut set = CodepageSet::new();
        let codepage = set.install("libcrypto.so.1", addresses(4, 0x4000)).unwrap();
        assert_eq!(codepage, 0);

        let first = set
            .handle("libcrypto.so.1")
            .and_then(LibraryHandle::first_slot_index)
            .unwrap();
        for offset in 0..4 {
            let target = unsafe { set.dispatch(codepage, first + offset) };
            assert_eq!(target, 0x4000 + offset * 8);
        }
    }

    #[test]
    fn two_copies_of_one_library_resolve_independently() {
        let mut set = CodepageSet::new();
        let page_a = set.install("libssl.so.1#0", addresses(3, 0x1000)).unwrap();
        let page_b = set.install("libssl.so.1#1", addresses(3, 0x9000)).unwrap();

        let first_a = set.handle("libssl.so.1#0").unwrap().first_slot_index().unwrap();
        let first_b = set.handle("libssl.so.1#1").unwrap().first_slot_index().unwrap();
        assert_ne!((page_a, first_a), (page_b, first_b));

        assert_eq!(unsafe { set.dispatch(page_a, first_a + 1) }, 0x1008);
        assert_eq!(unsafe { set.dispatch(page_b, first_b + 1) }, 0x9008);
    }

    #[test]
    fn oversized_library_is_rejected() {
        let mut set = CodepageSet::new();
        let result = set.install("libhuge.so", addresses(CODEPAGE_SLOTS + 1, 0x1000));
        assert!(result.is_err());
        assert_eq!(set.codepage_count(), 0);
    }

    #[test]
    fn empty_library_is_rejected() {
        let mut set = CodepageSet::new();
        assert!(set.install("libnothing.so", Vec::new()).is_err());
    }

    #[test]
    fn duplicate_install_is_rejected() {
        let mut set = CodepageSet::new();
        set.install("libz.so.1", addresses(2, 0x1000)).unwrap();
        assert!(set.install("libz.so.1", addresses(2, 0x2000)).is_err());
    }

    #[test]
    fn full_codepage_overflows_to_a_fresh_one() {
        let mut set = CodepageSet::new();
        let page_a = set
            .install("libbig.so", addresses(CODEPAGE_SLOTS, 0x1000))
            .unwrap();
        let page_b = set.install("libsmall.so", addresses(1, 0x2000)).unwrap();
        assert_eq!(page_a, 0);
        assert_eq!(page_b, 1);
        assert_eq!(set.codepage_count(), 2);
    }

    #[test]
    fn uninstall_makes_room_in_the_original_codepage() {
        let mut set = CodepageSet::new();
        set.install("libbig.so", addresses(CODEPAGE_SLOTS, 0x1000))
            .unwrap();
        set.uninstall("libbig.so").unwrap();

        let page = set.install("libnext.so", addresses(8, 0x2000)).unwrap();
        assert_eq!(page, 0);
        assert_eq!(set.codepage_count(), 1);
    }

    #[test]
    fn uninstall_of_unknown_library_fails() {
        let mut set = CodepageSet::new();
        assert!(set.uninstall("libghost.so").is_err());
    }

    #[test]
    fn double_uninstall_fails() {
        let mut set = CodepageSet::new();
        set.install("liba.so", addresses(2, 0x1000)).unwrap();
        set.uninstall("liba.so").unwrap();
        assert!(set.uninstall("liba.so").is_err());
    }

    #[test]
    fn exhausted_roster_rejects_further_installs() {
        let mut set = CodepageSet::new();
        for index in 0..MAX_CODEPAGES {
            let name = format!("libfill.so.{index}");
            set.install(&name, addresses(CODEPAGE_SLOTS, 0x1000)).unwrap();
        }
        assert_eq!(set.codepage_count(), MAX_CODEPAGES);
        assert!(set.install("libmore.so", addresses(1, 0x2000)).is_err());

        set.uninstall("libfill.so.7").unwrap();
        assert_eq!(set.install("libmore.so", addresses(1, 0x2000)), Ok(7));
    }
}
