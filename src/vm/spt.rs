//! Supplemental page table: per-process bookkeeping for virtual pages that
//! aren't currently resident, recording where to fetch — and where to send
//! back — their contents.

use crate::hal::VirtPage;
use crate::error::Error;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

/// Offset-addressed read/write access to a page's backing file, decoupling
/// the VM subsystem from the concrete file system implementation.
pub trait BackingFile: Send + Sync {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Error>;
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, Error>;
}

/// The page's original source of truth, consulted whenever it needs
/// (re-)loading from scratch.
pub enum Origin {
    /// One page of a file — an executable segment or a memory-mapped file.
    File {
        file: Arc<dyn BackingFile>,
        offset: usize,
        /// Bytes to copy from the file; the rest of the page is zeroed (the
        /// tail of a segment whose length isn't page-aligned).
        bytes_read: usize,
        /// Dirty pages are written back to `file` on eviction instead of
        /// being sent to swap (a writable mmap). When `false` (an
        /// executable segment), a dirty page is swapped instead, since the
        /// backing file must not be overwritten.
        writeback: bool,
    },
    /// Zero-fill-on-demand: anonymous memory, or a stack page being grown
    /// into. Never read from anywhere; just zeroed.
    Zero,
}

/// Where a page currently lives.
pub enum Location {
    /// Never faulted in (or reloadable from `origin` without having
    /// diverged from it) — load from `origin` on next fault.
    NotLoaded,
    /// Swapped out to the recorded slot.
    Swapped(usize),
    /// Mapped into a frame right now.
    Resident,
}

/// One virtual page's supplemental entry.
pub struct Spte {
    pub origin: Origin,
    pub writable: bool,
    pub location: Location,
}

impl Spte {
    pub fn is_resident(&self) -> bool {
        matches!(self.location, Location::Resident)
    }
}

/// A process's full set of non-trivial (non-resident or lazily-backed)
/// virtual pages.
pub struct SupplementalPageTable {
    entries: Mutex<BTreeMap<VirtPage, Arc<Mutex<Spte>>>>,
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        SupplementalPageTable {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers a lazily file-backed mapping for `upage` (e.g. one page of
    /// an ELF segment, or a page of a memory-mapped file).
    pub fn map_file(
        &self,
        upage: VirtPage,
        file: Arc<dyn BackingFile>,
        offset: usize,
        bytes_read: usize,
        writable: bool,
        writeback: bool,
    ) {
        self.entries.lock().insert(
            upage,
            Arc::new(Mutex::new(Spte {
                origin: Origin::File {
                    file,
                    offset,
                    bytes_read,
                    writeback,
                },
                writable,
                location: Location::NotLoaded,
            })),
        );
    }

    /// Registers a zero-fill-on-demand mapping (anonymous memory, or a
    /// stack page about to be grown into).
    pub fn map_zero(&self, upage: VirtPage, writable: bool) {
        self.entries.lock().insert(
            upage,
            Arc::new(Mutex::new(Spte {
                origin: Origin::Zero,
                writable,
                location: Location::NotLoaded,
            })),
        );
    }

    pub fn entry(&self, upage: VirtPage) -> Option<Arc<Mutex<Spte>>> {
        self.entries.lock().get(&upage).cloned()
    }

    pub fn remove(&self, upage: VirtPage) -> Option<Arc<Mutex<Spte>>> {
        self.entries.lock().remove(&upage)
    }

    pub fn contains(&self, upage: VirtPage) -> bool {
        self.entries.lock().contains_key(&upage)
    }

    /// All currently-mapped virtual pages, for tearing a process's address
    /// space down at exit.
    pub fn pages(&self) -> alloc::vec::Vec<VirtPage> {
        self.entries.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_mapping_round_trips() {
        let spt = SupplementalPageTable::new();
        let page = VirtPage::new(0x1000).unwrap();
        spt.map_zero(page, true);
        assert!(spt.contains(page));
        let entry = spt.entry(page).unwrap();
        assert!(!entry.lock().is_resident());
        assert!(entry.lock().writable);
    }
}
