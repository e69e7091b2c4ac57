//! Sector-granularity free-space bitmap, persisted as a reserved run of
//! sectors at a fixed offset on the device (mirrors Pintos's `free-map.c`).

use crate::error::Error;
use crate::hal::{BlockDevice, Sector, SECTOR_SIZE};
use alloc::vec;
use alloc::vec::Vec;
use log::warn;
use spin::Mutex;

/// Tracks which sectors on the device are in use.
///
/// `true` means free, matching the on-disk convention this crate inherited
/// from its Pintos ancestor (a freshly formatted map is all-ones).
pub struct FreeMap {
    bits: Mutex<Vec<bool>>,
}

impl FreeMap {
    /// Builds a fully-free map for a device of `num_sectors` sectors.
    pub fn new(num_sectors: u32) -> Self {
        FreeMap {
            bits: Mutex::new(vec![true; num_sectors as usize]),
        }
    }

    /// Reconstructs a map from its on-disk bitmap representation (one byte
    /// per 8 sectors, LSB-first), as read from `start` for `len_sectors`
    /// worth of bits.
    pub fn from_bytes(bytes: &[u8], num_sectors: u32) -> Self {
        let mut bits = vec![false; num_sectors as usize];
        for (i, bit) in bits.iter_mut().enumerate() {
            let byte = bytes.get(i / 8).copied().unwrap_or(0);
            *bit = (byte >> (i % 8)) & 1 == 1;
        }
        FreeMap {
            bits: Mutex::new(bits),
        }
    }

    /// Serializes the map to bytes suitable for `from_bytes`/on-disk storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        let bits = self.bits.lock();
        let mut out = vec![0u8; bits.len().div_ceil(8)];
        for (i, &b) in bits.iter().enumerate() {
            if b {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        out
    }

    /// Allocates `count` contiguous free sectors, marking them in-use.
    ///
    /// Returns the first sector of the run. This crate only ever allocates
    /// single sectors in practice (indirect/doubly-indirect growth is
    /// one-sector-at-a-time), but the primitive mirrors Pintos's
    /// `free_map_allocate`, which is run-based.
    pub fn allocate(&self, count: usize) -> Result<Sector, Error> {
        let mut bits = self.bits.lock();
        if count == 0 {
            return Err(Error::Invalid);
        }
        let mut run_start = None;
        let mut run_len = 0usize;
        for (i, &free) in bits.iter().enumerate() {
            if free {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == count {
                    let start = run_start.unwrap();
                    for b in bits.iter_mut().skip(start).take(count) {
                        *b = false;
                    }
                    return Ok(Sector::new(start as u32));
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        warn!("free-map exhausted: no run of {count} free sectors");
        Err(Error::NoSpace)
    }

    /// Allocates a single sector. Convenience wrapper over [`allocate`].
    pub fn allocate_one(&self) -> Result<Sector, Error> {
        self.allocate(1)
    }

    /// Marks `count` sectors starting at `start` free again.
    pub fn release(&self, start: Sector, count: usize) {
        let mut bits = self.bits.lock();
        let start = start.as_u32() as usize;
        for b in bits.iter_mut().skip(start).take(count) {
            *b = true;
        }
    }

    /// Marks a single sector as reserved without going through `allocate`
    /// (used once at format time to reserve the root directory and free-map
    /// sectors themselves).
    pub fn reserve(&self, sector: Sector) {
        let mut bits = self.bits.lock();
        if let Some(b) = bits.get_mut(sector.as_u32() as usize) {
            *b = false;
        }
    }

    pub fn num_sectors(&self) -> usize {
        self.bits.lock().len()
    }

    /// Writes the serialized bitmap out to `device` starting at `at`,
    /// spanning as many sectors as needed.
    pub fn flush(&self, device: &dyn BlockDevice, at: Sector) -> Result<(), Error> {
        let bytes = self.to_bytes();
        for (i, chunk) in bytes.chunks(SECTOR_SIZE).enumerate() {
            let mut buf = [0u8; SECTOR_SIZE];
            buf[..chunk.len()].copy_from_slice(chunk);
            device.write(Sector::new(at.as_u32() + i as u32), &buf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_release_round_trips() {
        let map = FreeMap::new(16);
        let a = map.allocate_one().unwrap();
        let b = map.allocate_one().unwrap();
        assert_ne!(a, b);
        map.release(a, 1);
        let c = map.allocate_one().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let map = FreeMap::new(2);
        map.allocate_one().unwrap();
        map.allocate_one().unwrap();
        assert_eq!(map.allocate_one(), Err(Error::NoSpace));
    }

    #[test]
    fn bytes_round_trip() {
        let map = FreeMap::new(20);
        map.allocate_one().unwrap();
        map.allocate(3).unwrap();
        let bytes = map.to_bytes();
        let restored = FreeMap::from_bytes(&bytes, 20);
        assert_eq!(restored.to_bytes(), bytes);
    }
}
