//! The on-disk file system: free-map + indexed inodes + hierarchical
//! directories, tied together behind a single path-based API.

pub mod directory;
pub mod file;
pub mod inode;

use crate::error::Error;
use crate::freemap::FreeMap;
use crate::hal::{BlockDevice, Sector, SECTOR_SIZE};
use alloc::sync::Arc;
use inode::{Inode, InodeStore};
use log::info;

/// Sector holding the serialized free-map bitmap.
pub const FREE_MAP_SECTOR: Sector = Sector::new(0);
/// Sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: Sector = Sector::new(1);

/// Ties a block device, its free-map, and its inode store together, and
/// exposes the path-based operations the syscall surface needs.
pub struct FileSystem {
    device: Arc<dyn BlockDevice>,
    freemap: Arc<FreeMap>,
    inodes: Arc<InodeStore>,
}

impl FileSystem {
    /// Formats `device`: lays down an empty free-map and an empty root
    /// directory. Destroys any existing contents.
    pub fn format(device: Arc<dyn BlockDevice>) -> Result<Self, Error> {
        let num_sectors = device.num_sectors();
        let freemap = Arc::new(FreeMap::new(num_sectors));
        freemap.reserve(FREE_MAP_SECTOR);
        freemap.reserve(ROOT_DIR_SECTOR);
        let inodes = Arc::new(InodeStore::new(device.clone(), freemap.clone()));

        inodes.create(ROOT_DIR_SECTOR, 0, true, ROOT_DIR_SECTOR)?;

        freemap.flush(device.as_ref(), FREE_MAP_SECTOR)?;
        info!("formatted file system: {num_sectors} sectors");
        Ok(FileSystem {
            device,
            freemap,
            inodes,
        })
    }

    /// Reopens a previously formatted device, reading the free-map back in.
    pub fn open(device: Arc<dyn BlockDevice>) -> Result<Self, Error> {
        let num_sectors = device.num_sectors();
        let bitmap_bytes = read_bitmap_bytes(device.as_ref(), num_sectors)?;
        let freemap = Arc::new(FreeMap::from_bytes(&bitmap_bytes, num_sectors));
        let inodes = Arc::new(InodeStore::new(device.clone(), freemap.clone()));
        Ok(FileSystem {
            device,
            freemap,
            inodes,
        })
    }

    /// Persists the free-map back to disk. Callers should do this whenever
    /// they want a consistent snapshot (e.g. before "shutdown").
    pub fn sync(&self) -> Result<(), Error> {
        self.freemap.flush(self.device.as_ref(), FREE_MAP_SECTOR)
    }

    pub fn inodes(&self) -> Arc<InodeStore> {
        self.inodes.clone()
    }

    pub fn root_sector(&self) -> Sector {
        ROOT_DIR_SECTOR
    }

    /// Resolves `path` (absolute if it starts with `/`, else relative to
    /// `cwd`) to an open inode handle.
    ///
    /// A non-directory intermediate component (e.g. `a/b` where `a` is a
    /// regular file) resolves to `Error::NotFound`. `.` and `..` are handled
    /// without a directory lookup: `.` is a no-op, and `..` follows the
    /// current directory's on-inode parent back-reference.
    pub fn resolve(&self, cwd: Sector, path: &str) -> Result<Inode, Error> {
        let start = if path.starts_with('/') {
            ROOT_DIR_SECTOR
        } else {
            cwd
        };
        let components: alloc::vec::Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut current = self.inodes.open(start)?;
        for comp in &components {
            if !current.is_dir() {
                self.inodes.close(current)?;
                return Err(Error::NotFound);
            }
            if *comp == "." {
                continue;
            }
            let next_sector = if *comp == ".." {
                match current.parent_sector() {
                    Some(s) => s,
                    None => {
                        self.inodes.close(current)?;
                        return Err(Error::Invalid);
                    }
                }
            } else {
                match directory::lookup(&self.inodes, &current, comp) {
                    Ok(s) => s,
                    Err(e) => {
                        self.inodes.close(current)?;
                        return Err(e);
                    }
                }
            };
            let next = self.inodes.open(next_sector)?;
            self.inodes.close(current)?;
            current = next;
        }
        Ok(current)
    }

    /// Creates a new regular file at `path` (relative to `cwd`).
    pub fn create_file(&self, cwd: Sector, path: &str) -> Result<(), Error> {
        let (parent_path, name) = split_last_component(path)?;
        let parent = self.resolve(cwd, parent_path)?;
        if !parent.is_dir() {
            self.inodes.close(parent)?;
            return Err(Error::Invalid);
        }
        let sector = self.freemap.allocate_one()?;
        if let Err(e) = self.inodes.create(sector, 0, false, Sector::new(0)) {
            self.freemap.release(sector, 1);
            self.inodes.close(parent)?;
            return Err(e);
        }
        if let Err(e) = directory::add_entry(&self.inodes, &parent, name, sector) {
            self.discard_fresh_inode(sector)?;
            self.inodes.close(parent)?;
            return Err(e);
        }
        self.inodes.close(parent)
    }

    /// Creates a new directory at `path`. Its `..` resolves through the
    /// on-inode parent back-reference rather than a stored entry.
    pub fn mkdir(&self, cwd: Sector, path: &str) -> Result<(), Error> {
        let (parent_path, name) = split_last_component(path)?;
        let parent = self.resolve(cwd, parent_path)?;
        if !parent.is_dir() {
            self.inodes.close(parent)?;
            return Err(Error::Invalid);
        }
        let parent_sector = parent.sector;
        let sector = self.freemap.allocate_one()?;
        if let Err(e) = self.inodes.create(sector, 0, true, parent_sector) {
            self.freemap.release(sector, 1);
            self.inodes.close(parent)?;
            return Err(e);
        }
        if let Err(e) = directory::add_entry(&self.inodes, &parent, name, sector) {
            self.discard_fresh_inode(sector)?;
            self.inodes.close(parent)?;
            return Err(e);
        }
        self.inodes.close(parent)
    }

    /// Removes the entry named by the final component of `path`. Refuses
    /// with `Error::Busy` if it names a non-empty directory, the root, or a
    /// directory with any other open handle (an open file descriptor, or
    /// some process's cwd). A regular file may be removed while open —
    /// its sectors stay allocated until the last open handle closes.
    pub fn remove(&self, cwd: Sector, path: &str) -> Result<(), Error> {
        let (parent_path, name) = split_last_component(path)?;
        let parent = self.resolve(cwd, parent_path)?;
        let sector = match directory::lookup(&self.inodes, &parent, name) {
            Ok(s) => s,
            Err(e) => {
                self.inodes.close(parent)?;
                return Err(e);
            }
        };
        let target = self.inodes.open(sector)?;
        if target.is_dir() && !directory::is_empty(&self.inodes, &target) {
            self.inodes.close(target)?;
            self.inodes.close(parent)?;
            return Err(Error::Busy);
        }
        if sector == ROOT_DIR_SECTOR {
            self.inodes.close(target)?;
            self.inodes.close(parent)?;
            return Err(Error::Busy);
        }
        // `target`'s own handle from the `open` above always counts as one;
        // any count beyond that is another open fd or process cwd. Only
        // directories are rejected for this — an open directory handle or
        // cwd depends on the entry staying resolvable, unlike a plain file
        // descriptor's read/write cursor.
        if target.is_dir() && target.open_count() > 1 {
            self.inodes.close(target)?;
            self.inodes.close(parent)?;
            return Err(Error::Busy);
        }
        directory::remove_entry(&self.inodes, &parent, name)?;
        self.inodes.remove(&target);
        self.inodes.close(target)?;
        self.inodes.close(parent)
    }

    /// Frees a just-allocated, not-yet-linked inode on a failed create.
    fn discard_fresh_inode(&self, sector: Sector) -> Result<(), Error> {
        let inode = self.inodes.open(sector)?;
        self.inodes.remove(&inode);
        self.inodes.close(inode)
    }
}

fn split_last_component(path: &str) -> Result<(&str, &str), Error> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::Invalid);
    }
    match trimmed.rfind('/') {
        Some(idx) => {
            let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
            let name = &trimmed[idx + 1..];
            if name.is_empty() {
                return Err(Error::Invalid);
            }
            Ok((parent, name))
        }
        None => Ok((".", trimmed)),
    }
}

fn read_bitmap_bytes(device: &dyn BlockDevice, num_sectors: u32) -> Result<alloc::vec::Vec<u8>, Error> {
    let total_bytes = (num_sectors as usize).div_ceil(8);
    let total_sectors = total_bytes.div_ceil(SECTOR_SIZE).max(1);
    let mut out = alloc::vec::Vec::with_capacity(total_sectors * SECTOR_SIZE);
    for i in 0..total_sectors {
        let mut buf = [0u8; SECTOR_SIZE];
        device.read(Sector::new(FREE_MAP_SECTOR.as_u32() + i as u32), &mut buf)?;
        out.extend_from_slice(&buf);
    }
    out.truncate(total_bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MemDevice;

    fn formatted(num_sectors: u32) -> FileSystem {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(num_sectors));
        FileSystem::format(device).unwrap()
    }

    #[test]
    fn create_and_resolve_file() {
        let fs = formatted(4096);
        let root = fs.root_sector();
        fs.create_file(root, "/hello.txt").unwrap();
        let inode = fs.resolve(root, "/hello.txt").unwrap();
        assert!(!inode.is_dir());
        fs.inodes().close(inode).unwrap();
    }

    #[test]
    fn mkdir_then_nested_create() {
        let fs = formatted(4096);
        let root = fs.root_sector();
        fs.mkdir(root, "/sub").unwrap();
        let sub = fs.resolve(root, "/sub").unwrap();
        assert!(sub.is_dir());
        let sub_sector = sub.sector;
        fs.inodes().close(sub).unwrap();

        fs.create_file(sub_sector, "nested.txt").unwrap();
        let nested = fs.resolve(sub_sector, "nested.txt").unwrap();
        assert!(!nested.is_dir());
        fs.inodes().close(nested).unwrap();

        // Absolute path from an unrelated cwd still finds it.
        let nested2 = fs.resolve(root, "/sub/nested.txt").unwrap();
        fs.inodes().close(nested2).unwrap();
    }

    #[test]
    fn parent_navigation_via_dotdot() {
        let fs = formatted(4096);
        let root = fs.root_sector();
        fs.mkdir(root, "/sub").unwrap();
        let sub = fs.resolve(root, "/sub").unwrap();
        let sub_sector = sub.sector;
        fs.inodes().close(sub).unwrap();

        let back = fs.resolve(sub_sector, "..").unwrap();
        assert_eq!(back.sector, root);
        fs.inodes().close(back).unwrap();
    }

    #[test]
    fn non_directory_intermediate_component_is_not_found() {
        let fs = formatted(4096);
        let root = fs.root_sector();
        fs.create_file(root, "/plain").unwrap();
        assert_eq!(fs.resolve(root, "/plain/nope"), Err(Error::NotFound));
    }

    #[test]
    fn remove_nonempty_directory_is_busy() {
        let fs = formatted(4096);
        let root = fs.root_sector();
        fs.mkdir(root, "/sub").unwrap();
        let sub = fs.resolve(root, "/sub").unwrap();
        let sub_sector = sub.sector;
        fs.inodes().close(sub).unwrap();
        fs.create_file(sub_sector, "child").unwrap();
        assert_eq!(fs.remove(root, "/sub"), Err(Error::Busy));
    }

    #[test]
    fn remove_empty_directory_succeeds() {
        let fs = formatted(4096);
        let root = fs.root_sector();
        fs.mkdir(root, "/sub").unwrap();
        fs.remove(root, "/sub").unwrap();
        assert_eq!(fs.resolve(root, "/sub"), Err(Error::NotFound));
    }

    #[test]
    fn remove_file_with_open_handle_still_succeeds() {
        let fs = formatted(4096);
        let root = fs.root_sector();
        fs.create_file(root, "/open.txt").unwrap();
        let held = fs.resolve(root, "/open.txt").unwrap();
        fs.remove(root, "/open.txt").unwrap();
        fs.inodes().close(held).unwrap();
    }

    #[test]
    fn remove_directory_with_open_handle_is_busy() {
        let fs = formatted(4096);
        let root = fs.root_sector();
        fs.mkdir(root, "/sub").unwrap();
        let held = fs.resolve(root, "/sub").unwrap();
        assert_eq!(fs.remove(root, "/sub"), Err(Error::Busy));
        fs.inodes().close(held).unwrap();
        fs.remove(root, "/sub").unwrap();
    }
}
