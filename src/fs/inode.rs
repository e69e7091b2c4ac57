//! Multi-level indexed inode: direct, singly-indirect and doubly-indirect
//! block pointers over a 512-byte sector device, in the style of Pintos's
//! `filesys/inode.c`.

use crate::error::Error;
use crate::freemap::FreeMap;
use crate::hal::{BlockDevice, Sector, SECTOR_SIZE};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use bitflags::bitflags;
use log::{debug, trace};
use spin::Mutex;

bitflags! {
    /// On-disk inode kind bits. A `u32` rather than a bare bool so future
    /// kinds (symlinks, devices) have somewhere to go without another
    /// on-disk format bump.
    struct InodeFlags: u32 {
        const DIRECTORY = 0b0000_0001;
    }
}

/// Direct block pointers stored inline in the inode.
pub const NUM_DIRECT: usize = 120;
/// Pointers per indirect (or doubly-indirect index) block.
pub const PTRS_PER_BLOCK: usize = SECTOR_SIZE / 4;
/// Largest offset (in sectors) reachable through the indirect tier alone.
const INDIRECT_LIMIT: usize = NUM_DIRECT + PTRS_PER_BLOCK;
/// Largest offset (in sectors) reachable through all three tiers.
const DOUBLY_INDIRECT_LIMIT: usize = INDIRECT_LIMIT + PTRS_PER_BLOCK * PTRS_PER_BLOCK;

const INODE_MAGIC: u32 = 0x494e4f44; // "INOD"

/// On-disk inode layout. Exactly one sector (512 bytes).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct InodeDisk {
    pub magic: u32,
    pub length: u32,
    pub is_dir: u32,
    /// Sector of the containing directory. Meaningful only when `is_dir`
    /// is set; `..` resolves through this back-reference rather than a
    /// stored directory entry. The root directory is its own parent.
    pub parent: u32,
    pub direct: [u32; NUM_DIRECT],
    pub indirect: u32,
    pub doubly_indirect: u32,
    _unused: [u8; 8],
}

const _: () = assert!(core::mem::size_of::<InodeDisk>() <= SECTOR_SIZE);

impl InodeDisk {
    fn empty(is_dir: bool, parent: Sector) -> Self {
        let flags = if is_dir {
            InodeFlags::DIRECTORY
        } else {
            InodeFlags::empty()
        };
        InodeDisk {
            magic: INODE_MAGIC,
            length: 0,
            is_dir: flags.bits(),
            parent: parent.as_u32(),
            direct: [0; NUM_DIRECT],
            indirect: 0,
            doubly_indirect: 0,
            _unused: [0; 8],
        }
    }

    fn flags(&self) -> InodeFlags {
        InodeFlags::from_bits_truncate(self.is_dir)
    }

    fn from_bytes(buf: &[u8; SECTOR_SIZE]) -> Result<Self, Error> {
        // SAFETY: `InodeDisk` is `repr(C)`, all-integer, and no larger than
        // one sector; any 512-byte pattern is a valid bit pattern for it.
        // `read_unaligned` because `buf` only guarantees byte alignment.
        let disk = unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const InodeDisk) };
        if disk.magic != INODE_MAGIC {
            return Err(Error::Corrupt);
        }
        Ok(disk)
    }

    fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        let size = core::mem::size_of::<InodeDisk>();
        // SAFETY: reading `size` bytes from a valid `&InodeDisk` of that size.
        let src = unsafe {
            core::slice::from_raw_parts(self as *const InodeDisk as *const u8, size)
        };
        buf[..size].copy_from_slice(src);
        buf
    }

    fn sectors_used(&self) -> usize {
        self.length.div_ceil(SECTOR_SIZE as u32) as usize
    }
}

/// Shared, lock-protected inode state: the on-disk image plus the
/// open-count / deny-write / removed bookkeeping that lives only in memory.
struct InodeShared {
    disk: InodeDisk,
    open_cnt: u32,
    removed: bool,
    deny_write_cnt: u32,
}

/// A handle to an open inode. Cheap to clone; clones share the same
/// underlying state and open-count.
#[derive(Clone)]
pub struct Inode {
    pub sector: Sector,
    shared: Arc<Mutex<InodeShared>>,
}

impl Inode {
    pub fn length(&self) -> usize {
        self.shared.lock().disk.length as usize
    }

    pub fn is_dir(&self) -> bool {
        self.shared.lock().disk.flags().contains(InodeFlags::DIRECTORY)
    }

    /// The containing directory's sector, for directories only — backs
    /// `..` path resolution. `None` for regular files.
    pub fn parent_sector(&self) -> Option<Sector> {
        let s = self.shared.lock();
        if s.disk.flags().contains(InodeFlags::DIRECTORY) {
            Some(Sector::new(s.disk.parent))
        } else {
            None
        }
    }

    pub fn is_removed(&self) -> bool {
        self.shared.lock().removed
    }

    /// Number of currently open handles (including this one) sharing this
    /// inode's in-memory state.
    pub fn open_count(&self) -> u32 {
        self.shared.lock().open_cnt
    }

    pub fn deny_write(&self) {
        self.shared.lock().deny_write_cnt += 1;
    }

    pub fn allow_write(&self) {
        let mut s = self.shared.lock();
        debug_assert!(s.deny_write_cnt > 0);
        s.deny_write_cnt -= 1;
    }

    fn writes_denied(&self) -> bool {
        self.shared.lock().deny_write_cnt > 0
    }
}

/// Owns the device and free-map and mediates all inode lifecycle and I/O.
///
/// Mirrors `inode.c`'s `open_inodes` list: a registry of weak handles so two
/// opens of the same sector share one in-memory image, without the registry
/// itself keeping an otherwise-closed inode alive.
pub struct InodeStore {
    device: Arc<dyn BlockDevice>,
    freemap: Arc<FreeMap>,
    open_inodes: Mutex<BTreeMap<Sector, Weak<Mutex<InodeShared>>>>,
}

impl InodeStore {
    pub fn new(device: Arc<dyn BlockDevice>, freemap: Arc<FreeMap>) -> Self {
        InodeStore {
            device,
            freemap,
            open_inodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Allocates `sector` (already reserved in the free map by the caller)
    /// as a fresh, empty inode of the given length and kind, and writes it
    /// out. `parent` is the containing directory's sector; ignored for
    /// regular files, and should be `sector` itself for the root.
    pub fn create(&self, sector: Sector, length: usize, is_dir: bool, parent: Sector) -> Result<(), Error> {
        let mut disk = InodeDisk::empty(is_dir, parent);
        grow(&self.device, &self.freemap, &mut disk, length)?;
        self.device.write(sector, &disk.to_bytes())
    }

    /// Opens (or returns the already-open handle for) the inode at `sector`.
    pub fn open(&self, sector: Sector) -> Result<Inode, Error> {
        let mut registry = self.open_inodes.lock();
        if let Some(weak) = registry.get(&sector) {
            if let Some(shared) = weak.upgrade() {
                shared.lock().open_cnt += 1;
                return Ok(Inode { sector, shared });
            }
        }
        let mut buf = [0u8; SECTOR_SIZE];
        self.device.read(sector, &mut buf)?;
        let disk = InodeDisk::from_bytes(&buf)?;
        let shared = Arc::new(Mutex::new(InodeShared {
            disk,
            open_cnt: 1,
            removed: false,
            deny_write_cnt: 0,
        }));
        registry.insert(sector, Arc::downgrade(&shared));
        Ok(Inode { sector, shared })
    }

    /// Marks the inode for deletion. The backing sectors are only actually
    /// freed once every open handle is closed (see [`close`]).
    pub fn remove(&self, inode: &Inode) {
        inode.shared.lock().removed = true;
    }

    /// Flushes `inode`'s on-disk image if dirty, decrements its open count,
    /// and — if it has been removed and this was the last handle — frees
    /// every sector it owns (data, indirect, doubly-indirect, and the inode
    /// sector itself) back to the free map.
    pub fn close(&self, inode: Inode) -> Result<(), Error> {
        self.device.write(inode.sector, &inode.shared.lock().disk.to_bytes())?;
        let should_free = {
            let mut s = inode.shared.lock();
            s.open_cnt -= 1;
            s.open_cnt == 0 && s.removed
        };
        if should_free {
            debug!("freeing inode at sector {:?} (removed, last close)", inode.sector);
            let disk = inode.shared.lock().disk;
            free_all(&self.device, &self.freemap, &disk)?;
            self.freemap.release(inode.sector, 1);
            self.open_inodes.lock().remove(&inode.sector);
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read (short if `offset` is near EOF).
    pub fn read_at(&self, inode: &Inode, buf: &mut [u8], offset: usize) -> Result<usize, Error> {
        let length = inode.length();
        if offset >= length {
            return Ok(0);
        }
        let to_read = buf.len().min(length - offset);
        let disk = inode.shared.lock().disk;
        let mut done = 0;
        while done < to_read {
            let pos = offset + done;
            let sector_idx = pos / SECTOR_SIZE;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_ofs).min(to_read - done);
            let sector = byte_to_sector(&self.device, &disk, sector_idx)?;
            let mut sbuf = [0u8; SECTOR_SIZE];
            self.device.read(sector, &mut sbuf)?;
            buf[done..done + chunk].copy_from_slice(&sbuf[sector_ofs..sector_ofs + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    /// Writes `buf` at `offset`, growing the inode (allocating new sectors)
    /// if the write extends past the current length. Returns the number of
    /// bytes written, or `Error::Invalid` if the inode's writes are
    /// currently denied (an executable image open for execution).
    pub fn write_at(&self, inode: &Inode, buf: &[u8], offset: usize) -> Result<usize, Error> {
        if inode.writes_denied() {
            return Err(Error::Invalid);
        }
        let new_len = offset + buf.len();
        {
            let mut s = inode.shared.lock();
            if new_len > s.disk.length as usize {
                grow(&self.device, &self.freemap, &mut s.disk, new_len)?;
            }
        }
        let disk = inode.shared.lock().disk;
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let sector_idx = pos / SECTOR_SIZE;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_ofs).min(buf.len() - done);
            let sector = byte_to_sector(&self.device, &disk, sector_idx)?;
            let mut sbuf = [0u8; SECTOR_SIZE];
            if chunk != SECTOR_SIZE {
                self.device.read(sector, &mut sbuf)?;
            }
            sbuf[sector_ofs..sector_ofs + chunk].copy_from_slice(&buf[done..done + chunk]);
            self.device.write(sector, &sbuf)?;
            done += chunk;
        }
        Ok(done)
    }
}

/// Maps a byte offset's sector index to a concrete on-disk sector, reading
/// whatever indirection blocks are necessary. `sector_idx` must be within
/// the inode's currently allocated range.
fn byte_to_sector(
    device: &Arc<dyn BlockDevice>,
    disk: &InodeDisk,
    sector_idx: usize,
) -> Result<Sector, Error> {
    if sector_idx < NUM_DIRECT {
        return Ok(Sector::new(disk.direct[sector_idx]));
    }
    if sector_idx < INDIRECT_LIMIT {
        let inner = sector_idx - NUM_DIRECT;
        if disk.indirect == 0 {
            return Err(Error::Invalid);
        }
        let ptrs = read_ptrs(device, Sector::new(disk.indirect))?;
        return Ok(Sector::new(ptrs[inner]));
    }
    if sector_idx < DOUBLY_INDIRECT_LIMIT {
        let inner = sector_idx - INDIRECT_LIMIT;
        let outer = inner / PTRS_PER_BLOCK;
        let inner_inner = inner % PTRS_PER_BLOCK;
        if disk.doubly_indirect == 0 {
            return Err(Error::Invalid);
        }
        let outer_block = read_ptrs(device, Sector::new(disk.doubly_indirect))?;
        if outer_block[outer] == 0 {
            return Err(Error::Invalid);
        }
        let ptrs = read_ptrs(device, Sector::new(outer_block[outer]))?;
        return Ok(Sector::new(ptrs[inner_inner]));
    }
    Err(Error::Invalid)
}

/// Grows `disk` so that it can address `new_length` bytes, allocating new
/// sectors tier by tier and persisting each tier's indirection block as soon
/// as it is fully populated (so a mid-grow allocation failure never leaves
/// an index block pointing at sectors it didn't actually get).
fn grow(
    device: &Arc<dyn BlockDevice>,
    freemap: &Arc<FreeMap>,
    disk: &mut InodeDisk,
    new_length: usize,
) -> Result<(), Error> {
    if new_length > DOUBLY_INDIRECT_LIMIT * SECTOR_SIZE {
        return Err(Error::NoSpace);
    }
    let old_sectors = disk.sectors_used();
    let new_sectors = new_length.div_ceil(SECTOR_SIZE);
    trace!("growing inode from {} to {} sectors", old_sectors, new_sectors);

    for idx in old_sectors..new_sectors {
        let sector = freemap.allocate_one()?;
        zero_sector(device, sector)?;
        set_sector(device, freemap, disk, idx, sector)?;
    }
    disk.length = new_length as u32;
    Ok(())
}

fn zero_sector(device: &Arc<dyn BlockDevice>, sector: Sector) -> Result<(), Error> {
    device.write(sector, &[0u8; SECTOR_SIZE])
}

/// Records `sector` as the data sector for `idx`, allocating and persisting
/// whatever indirect/doubly-indirect index blocks are needed along the way.
fn set_sector(
    device: &Arc<dyn BlockDevice>,
    freemap: &Arc<FreeMap>,
    disk: &mut InodeDisk,
    idx: usize,
    sector: Sector,
) -> Result<(), Error> {
    if idx < NUM_DIRECT {
        disk.direct[idx] = sector.as_u32();
        return Ok(());
    }
    if idx < INDIRECT_LIMIT {
        let inner = idx - NUM_DIRECT;
        if disk.indirect == 0 {
            disk.indirect = freemap.allocate_one()?.as_u32();
            zero_sector(device, Sector::new(disk.indirect))?;
        }
        write_ptr(device, Sector::new(disk.indirect), inner, sector)?;
        return Ok(());
    }
    if idx < DOUBLY_INDIRECT_LIMIT {
        let inner = idx - INDIRECT_LIMIT;
        let outer = inner / PTRS_PER_BLOCK;
        let inner_inner = inner % PTRS_PER_BLOCK;
        if disk.doubly_indirect == 0 {
            disk.doubly_indirect = freemap.allocate_one()?.as_u32();
            zero_sector(device, Sector::new(disk.doubly_indirect))?;
        }
        let mut outer_block = read_ptrs(device, Sector::new(disk.doubly_indirect))?;
        if outer_block[outer] == 0 {
            let new_indirect = freemap.allocate_one()?;
            zero_sector(device, new_indirect)?;
            outer_block[outer] = new_indirect.as_u32();
            write_ptrs(device, Sector::new(disk.doubly_indirect), &outer_block)?;
        }
        write_ptr(device, Sector::new(outer_block[outer]), inner_inner, sector)?;
        return Ok(());
    }
    Err(Error::NoSpace)
}

fn read_ptrs(device: &Arc<dyn BlockDevice>, sector: Sector) -> Result<[u32; PTRS_PER_BLOCK], Error> {
    let mut buf = [0u8; SECTOR_SIZE];
    device.read(sector, &mut buf)?;
    let mut ptrs = [0u32; PTRS_PER_BLOCK];
    for (i, p) in ptrs.iter_mut().enumerate() {
        *p = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
    }
    Ok(ptrs)
}

fn write_ptrs(device: &Arc<dyn BlockDevice>, sector: Sector, ptrs: &[u32; PTRS_PER_BLOCK]) -> Result<(), Error> {
    let mut buf = [0u8; SECTOR_SIZE];
    for (i, p) in ptrs.iter().enumerate() {
        buf[i * 4..i * 4 + 4].copy_from_slice(&p.to_le_bytes());
    }
    device.write(sector, &buf)
}

fn write_ptr(device: &Arc<dyn BlockDevice>, block_sector: Sector, index: usize, value: Sector) -> Result<(), Error> {
    let mut ptrs = read_ptrs(device, block_sector)?;
    ptrs[index] = value.as_u32();
    write_ptrs(device, block_sector, &ptrs)
}

/// Frees every sector an inode owns: data sectors at every tier, the
/// indirect block and its pointees, and the doubly-indirect block, its
/// second-level index blocks, and their pointees.
fn free_all(device: &Arc<dyn BlockDevice>, freemap: &Arc<FreeMap>, disk: &InodeDisk) -> Result<(), Error> {
    let sectors = disk.sectors_used();
    for idx in 0..sectors.min(NUM_DIRECT) {
        freemap.release(Sector::new(disk.direct[idx]), 1);
    }
    if sectors > NUM_DIRECT && disk.indirect != 0 {
        let indirect_count = sectors.min(INDIRECT_LIMIT) - NUM_DIRECT;
        let ptrs = read_ptrs(device, Sector::new(disk.indirect))?;
        for p in &ptrs[..indirect_count] {
            freemap.release(Sector::new(*p), 1);
        }
        freemap.release(Sector::new(disk.indirect), 1);
    }
    if sectors > INDIRECT_LIMIT && disk.doubly_indirect != 0 {
        let doubly_count = sectors - INDIRECT_LIMIT;
        let full_blocks = doubly_count / PTRS_PER_BLOCK;
        let remainder = doubly_count % PTRS_PER_BLOCK;
        let used_outer = full_blocks + if remainder > 0 { 1 } else { 0 };
        let outer_block = read_ptrs(device, Sector::new(disk.doubly_indirect))?;
        for (i, &inner_sector) in outer_block.iter().take(used_outer).enumerate() {
            if inner_sector == 0 {
                continue;
            }
            let count = if i < full_blocks { PTRS_PER_BLOCK } else { remainder };
            let inner_ptrs = read_ptrs(device, Sector::new(inner_sector))?;
            for p in &inner_ptrs[..count] {
                freemap.release(Sector::new(*p), 1);
            }
            freemap.release(Sector::new(inner_sector), 1);
        }
        freemap.release(Sector::new(disk.doubly_indirect), 1);
    }
    Ok(())
}
