//! Hardware abstraction layer.
//!
//! Everything this crate treats as "external" — the block device, the MMU's
//! page directory, the physical page allocator, and user-pointer validation —
//! is a trait here instead of a hardware driver. A real kernel embedding this
//! crate implements these against its own scheduler and page tables; tests
//! drive the crate against the in-memory implementations in [`mock`].

use crate::error::Error;
use alloc::boxed::Box;
use alloc::sync::Arc;

/// Sector size of the backing block device, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Page size of the virtual memory subsystem, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Sectors spanned by one page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// A sector index on a [`BlockDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sector(pub u32);

impl Sector {
    pub const fn new(n: u32) -> Self {
        Sector(n)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// A process identifier, opaque to this crate beyond equality and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

/// A page-aligned user virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPage(usize);

impl VirtPage {
    /// Builds a `VirtPage`, returning `None` if `addr` isn't page-aligned.
    pub fn new(addr: usize) -> Option<Self> {
        if addr % PAGE_SIZE == 0 {
            Some(VirtPage(addr))
        } else {
            None
        }
    }

    pub fn addr(self) -> usize {
        self.0
    }
}

/// A raw block device: flat array of fixed-size sectors.
///
/// Implementations are expected to be cheaply `Clone`-able or used behind an
/// `Arc`; this crate never mutates a device through `&mut self`, matching the
/// teacher kernel's convention of treating the disk as a shared resource
/// synchronized internally (by the device driver, outside this crate's
/// scope).
pub trait BlockDevice: Send + Sync {
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error>;
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), Error>;
    fn num_sectors(&self) -> u32;
}

/// One physical page's worth of owned storage.
///
/// Standing in for a physical frame: in a real kernel this would be a
/// directly-addressable region of physical memory, identified by its
/// address. Here it is an owned, heap-allocated buffer whose stable heap
/// address serves as that identifier (see [`Page::addr`]).
pub struct Page(Box<[u8; PAGE_SIZE]>);

impl Page {
    pub fn zeroed() -> Self {
        Page(Box::new([0u8; PAGE_SIZE]))
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.0
    }

    /// A stable identifier for this page's storage, suitable for installing
    /// into a [`PageDirectory`].
    pub fn addr(&self) -> PhysFrame {
        PhysFrame(self.0.as_ptr() as usize)
    }
}

/// Opaque physical-frame identifier handed to [`PageDirectory::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame(pub usize);

/// Allocator for zeroed physical pages.
pub trait PhysPagePool: Send + Sync {
    fn alloc_zeroed(&self) -> Option<Page>;
    fn free(&self, page: Page);
}

/// A process's page table.
///
/// The frame table holds one of these per frame owner so eviction can
/// invalidate the *owning* process's mapping rather than the currently
/// running one.
pub trait PageDirectory: Send + Sync {
    fn install(&self, upage: VirtPage, frame: PhysFrame, writable: bool);
    fn clear(&self, upage: VirtPage);
    fn is_accessed(&self, upage: VirtPage) -> bool;
    fn is_dirty(&self, upage: VirtPage) -> bool;
    fn set_accessed(&self, upage: VirtPage, v: bool);
    fn set_dirty(&self, upage: VirtPage, v: bool);
}

/// Validates that a user-supplied pointer range is safe to dereference.
///
/// Owned by the syscall marshaling layer, out of this crate's scope; the
/// trait exists so `syscall` can accept a validator without depending on a
/// concrete implementation.
pub trait PointerValidator {
    fn valid(&self, ptr: usize, len: usize) -> bool;
}

/// Shared handle to a process's page directory, as stored by frame owners.
pub type PageDirectoryHandle = Arc<dyn PageDirectory>;

/// Process creation and machine shutdown: the scheduler/ELF-loader-backed
/// half of `halt`/`exec`, entirely outside this crate's scope. `syscall`
/// forwards to whatever the embedding kernel implements here.
pub trait ProcessLauncher: Send + Sync {
    /// Loads and starts `path` as a new process, returning its pid once the
    /// new process is scheduled (not once it finishes running).
    fn exec(&self, path: &str) -> Result<Pid, Error>;
    /// Shuts the machine down. Never returns.
    fn halt(&self) -> !;
}

/// Test-only in-memory implementations of the traits above.
#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// An in-memory block device backed by a flat byte vector.
    pub struct MemDevice {
        sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    }

    impl MemDevice {
        pub fn new(num_sectors: u32) -> Self {
            MemDevice {
                sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; num_sectors as usize]),
            }
        }
    }

    impl BlockDevice for MemDevice {
        fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error> {
            let sectors = self.sectors.lock();
            let s = sectors.get(sector.0 as usize).ok_or(Error::Io)?;
            buf.copy_from_slice(s);
            Ok(())
        }

        fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), Error> {
            let mut sectors = self.sectors.lock();
            let s = sectors.get_mut(sector.0 as usize).ok_or(Error::Io)?;
            s.copy_from_slice(buf);
            Ok(())
        }

        fn num_sectors(&self) -> u32 {
            self.sectors.lock().len() as u32
        }
    }

    /// A physical page pool that never runs out, for tests that aren't
    /// exercising eviction pressure directly.
    pub struct UnboundedPagePool;

    impl PhysPagePool for UnboundedPagePool {
        fn alloc_zeroed(&self) -> Option<Page> {
            Some(Page::zeroed())
        }

        fn free(&self, _page: Page) {}
    }

    /// A recording page directory: tracks installed mappings and
    /// accessed/dirty bits entirely in memory, with no real MMU behind it.
    #[derive(Default)]
    pub struct RecordingPageDirectory {
        entries: Mutex<BTreeMap<VirtPage, Entry>>,
    }

    struct Entry {
        frame: PhysFrame,
        writable: bool,
        accessed: bool,
        dirty: bool,
    }

    impl RecordingPageDirectory {
        pub fn new() -> Self {
            RecordingPageDirectory {
                entries: Mutex::new(BTreeMap::new()),
            }
        }

        /// Test helper: is `upage` currently mapped at all?
        pub fn is_mapped(&self, upage: VirtPage) -> bool {
            self.entries.lock().contains_key(&upage)
        }

        /// Test helper: touch a page as if the CPU had read/written through it.
        pub fn touch(&self, upage: VirtPage, write: bool) {
            let mut entries = self.entries.lock();
            if let Some(e) = entries.get_mut(&upage) {
                e.accessed = true;
                if write {
                    e.dirty = true;
                }
            }
        }
    }

    impl PageDirectory for RecordingPageDirectory {
        fn install(&self, upage: VirtPage, frame: PhysFrame, writable: bool) {
            self.entries.lock().insert(
                upage,
                Entry {
                    frame,
                    writable,
                    accessed: false,
                    dirty: false,
                },
            );
        }

        fn clear(&self, upage: VirtPage) {
            self.entries.lock().remove(&upage);
        }

        fn is_accessed(&self, upage: VirtPage) -> bool {
            self.entries
                .lock()
                .get(&upage)
                .map(|e| e.accessed)
                .unwrap_or(false)
        }

        fn is_dirty(&self, upage: VirtPage) -> bool {
            self.entries
                .lock()
                .get(&upage)
                .map(|e| e.dirty)
                .unwrap_or(false)
        }

        fn set_accessed(&self, upage: VirtPage, v: bool) {
            if let Some(e) = self.entries.lock().get_mut(&upage) {
                e.accessed = v;
            }
        }

        fn set_dirty(&self, upage: VirtPage, v: bool) {
            if let Some(e) = self.entries.lock().get_mut(&upage) {
                e.dirty = v;
            }
        }
    }
}
