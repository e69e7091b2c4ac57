//! Swap device: a flat array of page-sized slots on a dedicated block
//! device, tracked by a free/used bitmap.

use crate::error::Error;
use crate::hal::{BlockDevice, Page, Sector, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// Manages a swap block device as a bitmap of page-sized slots.
pub struct SwapManager {
    device: Arc<dyn BlockDevice>,
    used: Mutex<Vec<bool>>,
}

impl SwapManager {
    /// `device`'s sector count must be a multiple of [`SECTORS_PER_PAGE`];
    /// any remainder is simply unaddressable.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = device.num_sectors() as usize / SECTORS_PER_PAGE;
        SwapManager {
            device,
            used: Mutex::new(vec![false; slots]),
        }
    }

    pub fn capacity_slots(&self) -> usize {
        self.used.lock().len()
    }

    /// Writes `page` out to a free slot and returns its index.
    pub fn swap_out(&self, page: &Page) -> Result<usize, Error> {
        let slot = {
            let mut used = self.used.lock();
            let idx = used.iter().position(|&u| !u).ok_or(Error::Fatal)?;
            used[idx] = true;
            idx
        };
        let base = (slot * SECTORS_PER_PAGE) as u32;
        let bytes = page.as_bytes();
        for i in 0..SECTORS_PER_PAGE {
            let mut buf = [0u8; SECTOR_SIZE];
            buf.copy_from_slice(&bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            if let Err(e) = self.device.write(Sector::new(base + i as u32), &buf) {
                self.used.lock()[slot] = false;
                return Err(e);
            }
        }
        Ok(slot)
    }

    /// Reads slot `slot` back into `page` and releases the slot.
    pub fn swap_in(&self, slot: usize, page: &mut Page) -> Result<(), Error> {
        let base = (slot * SECTORS_PER_PAGE) as u32;
        let bytes = page.as_bytes_mut();
        for i in 0..SECTORS_PER_PAGE {
            let mut buf = [0u8; SECTOR_SIZE];
            self.device.read(Sector::new(base + i as u32), &mut buf)?;
            bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
        }
        self.free(slot);
        Ok(())
    }

    /// Releases `slot` without reading it back (process exit discarding a
    /// swapped-out page).
    pub fn free(&self, slot: usize) {
        let mut used = self.used.lock();
        if let Some(u) = used.get_mut(slot) {
            *u = false;
        }
    }
}

const _: () = assert!(PAGE_SIZE % SECTOR_SIZE == 0);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MemDevice;

    #[test]
    fn out_then_in_round_trips_bytes() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new((SECTORS_PER_PAGE * 4) as u32));
        let swap = SwapManager::new(device);
        let mut page = Page::zeroed();
        page.as_bytes_mut()[0] = 0xAB;
        page.as_bytes_mut()[PAGE_SIZE - 1] = 0xCD;

        let slot = swap.swap_out(&page).unwrap();
        let mut back = Page::zeroed();
        swap.swap_in(slot, &mut back).unwrap();
        assert_eq!(back.as_bytes()[0], 0xAB);
        assert_eq!(back.as_bytes()[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn exhaustion_is_fatal() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(SECTORS_PER_PAGE as u32));
        let swap = SwapManager::new(device);
        let page = Page::zeroed();
        swap.swap_out(&page).unwrap();
        assert_eq!(swap.swap_out(&page), Err(Error::Fatal));
    }
}
