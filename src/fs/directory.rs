//! Hierarchical directories, laid out as a flat sequence of fixed-size
//! entries inside an ordinary (directory-flavored) inode — the same
//! representation Pintos's `filesys/directory.c` uses.

use crate::error::Error;
use crate::fs::inode::{Inode, InodeStore};
use crate::hal::Sector;
use alloc::string::String;
use alloc::vec::Vec;

/// Maximum visible characters in one path component (Pintos's `NAME_MAX`).
pub const NAME_MAX: usize = 14;
const ENTRY_NAME_LEN: usize = NAME_MAX + 1; // + NUL

#[repr(C)]
#[derive(Clone, Copy)]
struct RawEntry {
    in_use: u8,
    name: [u8; ENTRY_NAME_LEN],
    sector: u32,
}

const ENTRY_SIZE: usize = core::mem::size_of::<RawEntry>();

impl RawEntry {
    fn empty() -> Self {
        RawEntry {
            in_use: 0,
            name: [0; ENTRY_NAME_LEN],
            sector: 0,
        }
    }

    fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0] = self.in_use;
        buf[1..1 + ENTRY_NAME_LEN].copy_from_slice(&self.name);
        buf[1 + ENTRY_NAME_LEN..].copy_from_slice(&self.sector.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut name = [0u8; ENTRY_NAME_LEN];
        name.copy_from_slice(&buf[1..1 + ENTRY_NAME_LEN]);
        let sector = u32::from_le_bytes(buf[1 + ENTRY_NAME_LEN..ENTRY_SIZE].try_into().unwrap());
        RawEntry {
            in_use: buf[0],
            name,
            sector,
        }
    }

    fn name_str(&self) -> Option<String> {
        let nul = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..nul]).ok().map(String::from)
    }
}

fn encode_name(name: &str, out: &mut [u8; ENTRY_NAME_LEN]) -> Result<(), Error> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > NAME_MAX || bytes.contains(&0) {
        return Err(Error::Invalid);
    }
    out[..bytes.len()].copy_from_slice(bytes);
    for b in out.iter_mut().skip(bytes.len()) {
        *b = 0;
    }
    Ok(())
}

/// One (name, inode sector) pairing read back from a directory.
pub struct DirEntry {
    pub name: String,
    pub sector: Sector,
}

/// Looks up `name` in the directory backed by `dir`, returning its sector.
pub fn lookup(store: &InodeStore, dir: &Inode, name: &str) -> Result<Sector, Error> {
    for_each_entry(store, dir, |entry| {
        if entry.in_use != 0 && entry.name_str().as_deref() == Some(name) {
            Some(Sector::new(entry.sector))
        } else {
            None
        }
    })
    .ok_or(Error::NotFound)
}

/// Adds a `(name, sector)` entry to `dir`, reusing a freed slot if one
/// exists. Fails with `Error::Busy` if the name is already present, or
/// `Error::Invalid` for the reserved names `.`/`..` — those are never
/// stored entries; `..` resolves through the inode's parent back-reference
/// instead.
pub fn add_entry(store: &InodeStore, dir: &Inode, name: &str, sector: Sector) -> Result<(), Error> {
    if name == "." || name == ".." {
        return Err(Error::Invalid);
    }
    if lookup(store, dir, name).is_ok() {
        return Err(Error::Busy);
    }
    let mut encoded = [0u8; ENTRY_NAME_LEN];
    encode_name(name, &mut encoded)?;
    let new_entry = RawEntry {
        in_use: 1,
        name: encoded,
        sector: sector.as_u32(),
    };

    let len = dir.length();
    let mut offset = 0;
    let mut buf = [0u8; ENTRY_SIZE];
    while offset < len {
        store.read_at(dir, &mut buf, offset)?;
        let entry = RawEntry::from_bytes(&buf);
        if entry.in_use == 0 {
            store.write_at(dir, &new_entry.to_bytes(), offset)?;
            return Ok(());
        }
        offset += ENTRY_SIZE;
    }
    store.write_at(dir, &new_entry.to_bytes(), len)?;
    Ok(())
}

/// Removes the entry named `name` from `dir`, returning the sector it
/// pointed at so the caller can open and dispose of the inode.
pub fn remove_entry(store: &InodeStore, dir: &Inode, name: &str) -> Result<Sector, Error> {
    let len = dir.length();
    let mut offset = 0;
    let mut buf = [0u8; ENTRY_SIZE];
    while offset < len {
        store.read_at(dir, &mut buf, offset)?;
        let mut entry = RawEntry::from_bytes(&buf);
        if entry.in_use != 0 && entry.name_str().as_deref() == Some(name) {
            let sector = Sector::new(entry.sector);
            entry.in_use = 0;
            store.write_at(dir, &entry.to_bytes(), offset)?;
            return Ok(sector);
        }
        offset += ENTRY_SIZE;
    }
    Err(Error::NotFound)
}

/// True if `dir` has no entries at all. `.`/`..` are never stored entries
/// (see [`add_entry`]), so this is a plain occupancy check.
pub fn is_empty(store: &InodeStore, dir: &Inode) -> bool {
    for_each_entry(store, dir, |entry| if entry.in_use != 0 { Some(()) } else { None }).is_none()
}

/// Lists every live entry in `dir`, in on-disk order.
pub fn readdir(store: &InodeStore, dir: &Inode) -> Result<Vec<DirEntry>, Error> {
    let mut out = Vec::new();
    let len = dir.length();
    let mut offset = 0;
    let mut buf = [0u8; ENTRY_SIZE];
    while offset < len {
        store.read_at(dir, &mut buf, offset)?;
        let entry = RawEntry::from_bytes(&buf);
        if entry.in_use != 0 {
            if let Some(name) = entry.name_str() {
                out.push(DirEntry {
                    name,
                    sector: Sector::new(entry.sector),
                });
            }
        }
        offset += ENTRY_SIZE;
    }
    Ok(out)
}

/// Advances `*pos` to (and past) the next live entry at or after `*pos`,
/// returning it. Returns `None` once the directory is exhausted. Backs the
/// fd-based `readdir` syscall, which hands out one entry per call.
pub fn next_entry(store: &InodeStore, dir: &Inode, pos: &mut usize) -> Result<Option<DirEntry>, Error> {
    let len = dir.length();
    let mut buf = [0u8; ENTRY_SIZE];
    while *pos < len {
        store.read_at(dir, &mut buf, *pos)?;
        let entry = RawEntry::from_bytes(&buf);
        *pos += ENTRY_SIZE;
        if entry.in_use == 0 {
            continue;
        }
        let Some(name) = entry.name_str() else { continue };
        return Ok(Some(DirEntry {
            name,
            sector: Sector::new(entry.sector),
        }));
    }
    Ok(None)
}

fn for_each_entry<T>(store: &InodeStore, dir: &Inode, mut f: impl FnMut(&RawEntry) -> Option<T>) -> Option<T> {
    let len = dir.length();
    let mut offset = 0;
    let mut buf = [0u8; ENTRY_SIZE];
    while offset < len {
        if store.read_at(dir, &mut buf, offset).is_err() {
            return None;
        }
        let entry = RawEntry::from_bytes(&buf);
        if let Some(v) = f(&entry) {
            return Some(v);
        }
        offset += ENTRY_SIZE;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freemap::FreeMap;
    use crate::hal::mock::MemDevice;
    use crate::hal::BlockDevice;
    use alloc::sync::Arc;

    fn setup() -> (InodeStore, Arc<FreeMap>) {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(4096));
        let freemap = Arc::new(FreeMap::new(4096));
        (InodeStore::new(device, freemap.clone()), freemap)
    }

    #[test]
    fn add_lookup_remove_round_trip() {
        let (store, freemap) = setup();
        let dir_sector = freemap.allocate_one().unwrap();
        store.create(dir_sector, 0, true, dir_sector).unwrap();
        let dir = store.open(dir_sector).unwrap();

        let file_sector = freemap.allocate_one().unwrap();
        add_entry(&store, &dir, "hello.txt", file_sector).unwrap();
        assert_eq!(lookup(&store, &dir, "hello.txt").unwrap(), file_sector);

        assert_eq!(add_entry(&store, &dir, "hello.txt", file_sector), Err(Error::Busy));

        let removed = remove_entry(&store, &dir, "hello.txt").unwrap();
        assert_eq!(removed, file_sector);
        assert_eq!(lookup(&store, &dir, "hello.txt"), Err(Error::NotFound));
        store.close(dir).unwrap();
    }

    #[test]
    fn empty_check_on_fresh_directory() {
        let (store, freemap) = setup();
        let dir_sector = freemap.allocate_one().unwrap();
        store.create(dir_sector, 0, true, dir_sector).unwrap();
        let dir = store.open(dir_sector).unwrap();
        assert!(is_empty(&store, &dir));
        let file_sector = freemap.allocate_one().unwrap();
        add_entry(&store, &dir, "child", file_sector).unwrap();
        assert!(!is_empty(&store, &dir));
        store.close(dir).unwrap();
    }

    #[test]
    fn dot_and_dotdot_names_are_rejected() {
        let (store, freemap) = setup();
        let dir_sector = freemap.allocate_one().unwrap();
        store.create(dir_sector, 0, true, dir_sector).unwrap();
        let dir = store.open(dir_sector).unwrap();
        let file_sector = freemap.allocate_one().unwrap();
        assert_eq!(add_entry(&store, &dir, ".", file_sector), Err(Error::Invalid));
        assert_eq!(add_entry(&store, &dir, "..", file_sector), Err(Error::Invalid));
        store.close(dir).unwrap();
    }

    #[test]
    fn readdir_lists_entries() {
        let (store, freemap) = setup();
        let dir_sector = freemap.allocate_one().unwrap();
        store.create(dir_sector, 0, true, dir_sector).unwrap();
        let dir = store.open(dir_sector).unwrap();
        add_entry(&store, &dir, "a", freemap.allocate_one().unwrap()).unwrap();
        add_entry(&store, &dir, "b", freemap.allocate_one().unwrap()).unwrap();
        let entries = readdir(&store, &dir).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        store.close(dir).unwrap();
    }
}
