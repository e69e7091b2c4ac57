//! Page-fault resolution: demand-paging from a file or swap, and bounded
//! automatic stack growth.

use crate::error::Error;
use crate::hal::{PageDirectoryHandle, Pid, VirtPage, PAGE_SIZE};
use crate::vm::frame::FrameTable;
use crate::vm::spt::{Location, Origin, Spte, SupplementalPageTable};
use alloc::sync::Arc;
use log::trace;
use spin::Mutex;

/// Bytes below the current stack pointer a faulting address is still
/// allowed to land in and be treated as stack growth (covers `push`-family
/// instructions that write below `esp` before adjusting it).
pub const STACK_GROWTH_MARGIN: usize = 32;

/// Maximum size the user stack is allowed to grow to.
pub const STACK_SIZE_LIMIT: usize = 8 * 1024 * 1024;

/// Resolves page faults for one process against its supplemental page
/// table and the shared frame table.
pub struct PageFaultResolver {
    /// Highest address of the user stack region (grows downward from here).
    stack_top: usize,
}

impl PageFaultResolver {
    pub fn new(stack_top: usize) -> Self {
        PageFaultResolver { stack_top }
    }

    /// Handles a fault at `fault_addr`. `esp` is the user stack pointer at
    /// the time of the fault (used only for the stack-growth heuristic).
    /// Returns `Ok(())` once the page is resident and mapped, or an error
    /// the caller should translate into killing the faulting process.
    pub fn handle_fault(
        &self,
        pid: Pid,
        fault_addr: usize,
        is_write: bool,
        esp: usize,
        spt: &SupplementalPageTable,
        frames: &FrameTable,
        page_directory: PageDirectoryHandle,
    ) -> Result<(), Error> {
        let upage = VirtPage::new(fault_addr - fault_addr % PAGE_SIZE).ok_or(Error::Invalid)?;

        let spte = match spt.entry(upage) {
            Some(spte) => spte,
            None => {
                if self.is_stack_growth(fault_addr, esp) {
                    trace!("growing stack to include page {:?}", upage);
                    spt.map_zero(upage, true);
                    spt.entry(upage).unwrap()
                } else {
                    return Err(Error::Invalid);
                }
            }
        };

        if is_write && !spte.lock().writable {
            return Err(Error::Invalid);
        }
        if spte.lock().is_resident() {
            // Already mapped; nothing to do (a benign race with another
            // fault on the same page, or a stale TLB entry upstream).
            return Ok(());
        }

        self.load(pid, upage, spte, frames, page_directory)
    }

    /// A fault address qualifies as stack growth when it falls within
    /// `STACK_GROWTH_MARGIN` bytes below `esp`, inside the stack region,
    /// and the resulting stack wouldn't exceed [`STACK_SIZE_LIMIT`].
    fn is_stack_growth(&self, fault_addr: usize, esp: usize) -> bool {
        if fault_addr >= self.stack_top {
            return false;
        }
        if fault_addr + STACK_GROWTH_MARGIN < esp {
            return false;
        }
        let depth = self.stack_top - fault_addr;
        depth <= STACK_SIZE_LIMIT
    }

    /// Brings `upage`'s contents into a frame per its SPTE, then publishes
    /// the mapping.
    fn load(
        &self,
        pid: Pid,
        upage: VirtPage,
        spte: Arc<Mutex<Spte>>,
        frames: &FrameTable,
        page_directory: PageDirectoryHandle,
    ) -> Result<(), Error> {
        let handle = frames.acquire(pid, upage, spte.clone(), page_directory)?;

        let (location_kind, writable) = {
            let s = spte.lock();
            let kind = match &s.location {
                Location::NotLoaded => LoadKind::FromOrigin,
                Location::Swapped(slot) => LoadKind::FromSwap(*slot),
                Location::Resident => unreachable!("checked by caller"),
            };
            (kind, s.writable)
        };

        let result = match location_kind {
            LoadKind::FromSwap(slot) => {
                frames.content_mut(&handle, |page| frames.swap_in_page(slot, page))
            }
            LoadKind::FromOrigin => {
                let origin_read = {
                    let s = spte.lock();
                    match &s.origin {
                        Origin::Zero => None,
                        Origin::File { file, offset, bytes_read, .. } => {
                            Some((file.clone(), *offset, *bytes_read))
                        }
                    }
                };
                match origin_read {
                    None => Ok(()),
                    Some((file, offset, bytes_read)) => frames.content_mut(&handle, |page| {
                        let bytes = page.as_bytes_mut();
                        if bytes_read > 0 {
                            file.read_at(offset, &mut bytes[..bytes_read])?;
                        }
                        for b in bytes[bytes_read..].iter_mut() {
                            *b = 0;
                        }
                        Ok(())
                    }),
                }
            }
        };

        match result {
            Ok(()) => {
                frames.publish(handle, writable);
                Ok(())
            }
            Err(e) => {
                frames.abort(handle);
                Err(e)
            }
        }
    }
}

enum LoadKind {
    FromOrigin,
    FromSwap(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{RecordingPageDirectory, UnboundedPagePool};
    use crate::hal::mock::MemDevice;
    use crate::hal::{BlockDevice, SECTORS_PER_PAGE};
    use crate::vm::swap::SwapManager;

    const STACK_TOP: usize = 0x8000_0000;

    fn table(capacity: usize) -> FrameTable {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new((capacity.max(4) * SECTORS_PER_PAGE) as u32));
        FrameTable::new(Arc::new(UnboundedPagePool), Arc::new(SwapManager::new(device)), capacity)
    }

    #[test]
    fn growth_within_margin_and_cap_is_accepted() {
        let resolver = PageFaultResolver::new(STACK_TOP);
        let spt = SupplementalPageTable::new();
        let frames = table(4);
        let pd = Arc::new(RecordingPageDirectory::new());
        let esp = STACK_TOP - PAGE_SIZE;
        let fault_addr = esp - 4; // a `push` one word below esp

        resolver
            .handle_fault(Pid(1), fault_addr, true, esp, &spt, &frames, pd.clone())
            .unwrap();

        let upage = VirtPage::new(fault_addr - fault_addr % PAGE_SIZE).unwrap();
        assert!(pd.is_mapped(upage));
    }

    #[test]
    fn growth_beyond_cap_is_rejected() {
        let resolver = PageFaultResolver::new(STACK_TOP);
        let spt = SupplementalPageTable::new();
        let frames = table(4);
        let pd = Arc::new(RecordingPageDirectory::new());
        let esp = STACK_TOP - PAGE_SIZE;
        let fault_addr = STACK_TOP - STACK_SIZE_LIMIT - PAGE_SIZE;

        let err = resolver
            .handle_fault(Pid(1), fault_addr, true, esp, &spt, &frames, pd)
            .unwrap_err();
        assert_eq!(err, Error::Invalid);
    }

    #[test]
    fn far_below_esp_is_rejected() {
        let resolver = PageFaultResolver::new(STACK_TOP);
        let spt = SupplementalPageTable::new();
        let frames = table(4);
        let pd = Arc::new(RecordingPageDirectory::new());
        let esp = STACK_TOP - PAGE_SIZE;
        let fault_addr = esp - 4096; // nowhere near a push

        let err = resolver
            .handle_fault(Pid(1), fault_addr, true, esp, &spt, &frames, pd)
            .unwrap_err();
        assert_eq!(err, Error::Invalid);
    }
}
