//! An open regular file: an inode handle plus a cursor, as returned through
//! the syscall surface's file descriptors.

use crate::error::Error;
use crate::fs::inode::{Inode, InodeStore};
use crate::vm::spt::BackingFile;
use alloc::sync::Arc;

/// A process-local handle to an open regular file.
pub struct FileHandle {
    store: Arc<InodeStore>,
    inode: Inode,
    position: usize,
}

impl FileHandle {
    pub fn new(store: Arc<InodeStore>, inode: Inode) -> Self {
        FileHandle {
            store,
            inode,
            position: 0,
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = self.store.read_at(&self.inode, buf, self.position)?;
        self.position += n;
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let n = self.store.write_at(&self.inode, buf, self.position)?;
        self.position += n;
        Ok(n)
    }

    pub fn seek(&mut self, pos: usize) {
        self.position = pos;
    }

    pub fn tell(&self) -> usize {
        self.position
    }

    pub fn length(&self) -> usize {
        self.inode.length()
    }

    pub fn deny_write(&self) {
        self.inode.deny_write();
    }

    pub fn allow_write(&self) {
        self.inode.allow_write();
    }

    pub fn inode_sector(&self) -> crate::hal::Sector {
        self.inode.sector
    }

    /// Produces a cheap, independent backing handle for the page-fault
    /// resolver's file-mapped (lazily loaded / mmap'd) pages. The handle
    /// shares the underlying inode but keeps its own cursor-free read/write
    /// path since the VM subsystem always addresses by absolute offset.
    pub fn backing(&self) -> FileBacking {
        FileBacking {
            store: self.store.clone(),
            inode: self.inode.clone(),
        }
    }

    pub fn close(self) -> Result<(), Error> {
        self.store.close(self.inode)
    }
}

/// Offset-addressed view of a file, used by the supplemental page table to
/// load and (for writable mappings) write back pages without touching a
/// process's own file-descriptor cursor.
#[derive(Clone)]
pub struct FileBacking {
    store: Arc<InodeStore>,
    inode: Inode,
}

impl BackingFile for FileBacking {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Error> {
        self.store.read_at(&self.inode, buf, offset)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, Error> {
        self.store.write_at(&self.inode, buf, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freemap::FreeMap;
    use crate::hal::mock::MemDevice;
    use crate::hal::{BlockDevice, Sector};

    #[test]
    fn cursor_advances_across_read_write() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(4096));
        let freemap = Arc::new(FreeMap::new(4096));
        let store = Arc::new(InodeStore::new(device, freemap.clone()));
        let sector = freemap.allocate_one().unwrap();
        store.create(sector, 0, false, Sector::new(0)).unwrap();
        let inode = store.open(sector).unwrap();
        let mut handle = FileHandle::new(store.clone(), inode);

        handle.write(b"abcdef").unwrap();
        assert_eq!(handle.tell(), 6);
        handle.seek(0);
        let mut buf = [0u8; 3];
        handle.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert_eq!(handle.tell(), 3);
        handle.close().unwrap();
    }
}
