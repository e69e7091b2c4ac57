//! File-system and virtual-memory-facing system calls.
//!
//! Each function here is the implementation behind one syscall number, once
//! the embedding kernel's trap dispatcher has validated and marshaled the
//! user's arguments (a `hal::PointerValidator` concern, out of scope here).
//! `halt`/`exec` are thin forwards to [`crate::hal::ProcessLauncher`]; every
//! other file/directory syscall goes through [`crate::fs::FileSystem`] and
//! the calling process's descriptor table.

use crate::error::Error;
use crate::fs::directory;
use crate::fs::file::FileHandle;
use crate::fs::FileSystem;
use crate::hal::{Pid, ProcessLauncher};
use crate::process::{Descriptor, Process};
use crate::vm::frame::FrameTable;
use crate::vm::swap::SwapManager;
use alloc::string::String;

pub fn halt(launcher: &dyn ProcessLauncher) -> ! {
    launcher.halt()
}

pub fn exec(launcher: &dyn ProcessLauncher, path: &str) -> Result<Pid, Error> {
    launcher.exec(path)
}

pub fn wait(process: &mut Process, pid: Pid) -> Result<i32, Error> {
    process.wait(pid)
}

pub fn exit(process: Process, code: i32, frames: &FrameTable, swap: &SwapManager) -> Result<(), Error> {
    process.exit(code, frames, swap)
}

pub fn create(fs: &FileSystem, process: &Process, path: &str) -> Result<(), Error> {
    fs.create_file(process.cwd, path)
}

pub fn remove(fs: &FileSystem, process: &Process, path: &str) -> Result<(), Error> {
    fs.remove(process.cwd, path)
}

/// Opens `path` relative to the process's cwd, returning a new fd. Works
/// for both regular files and directories; `isdir` distinguishes them
/// afterward.
pub fn open(fs: &FileSystem, process: &mut Process, path: &str) -> Result<i32, Error> {
    let inode = fs.resolve(process.cwd, path)?;
    let descriptor = if inode.is_dir() {
        Descriptor::Dir {
            store: fs.inodes(),
            inode,
            pos: 0,
        }
    } else {
        Descriptor::File(FileHandle::new(fs.inodes(), inode))
    };
    Ok(process.fds.insert(descriptor))
}

pub fn filesize(process: &Process, fd: i32) -> Result<usize, Error> {
    match process.fds.get(fd) {
        Some(Descriptor::File(f)) => Ok(f.length()),
        _ => Err(Error::Invalid),
    }
}

pub fn read(process: &mut Process, fd: i32, buf: &mut [u8]) -> Result<usize, Error> {
    match process.fds.get_mut(fd) {
        Some(Descriptor::File(f)) => f.read(buf),
        _ => Err(Error::Invalid),
    }
}

pub fn write(process: &mut Process, fd: i32, buf: &[u8]) -> Result<usize, Error> {
    match process.fds.get_mut(fd) {
        Some(Descriptor::File(f)) => f.write(buf),
        _ => Err(Error::Invalid),
    }
}

pub fn seek(process: &mut Process, fd: i32, position: usize) -> Result<(), Error> {
    match process.fds.get_mut(fd) {
        Some(Descriptor::File(f)) => {
            f.seek(position);
            Ok(())
        }
        _ => Err(Error::Invalid),
    }
}

pub fn tell(process: &Process, fd: i32) -> Result<usize, Error> {
    match process.fds.get(fd) {
        Some(Descriptor::File(f)) => Ok(f.tell()),
        _ => Err(Error::Invalid),
    }
}

pub fn close(process: &mut Process, fd: i32) -> Result<(), Error> {
    match process.fds.remove(fd) {
        Some(Descriptor::File(f)) => f.close(),
        Some(Descriptor::Dir { .. }) => Ok(()),
        None => Err(Error::Invalid),
    }
}

pub fn mkdir(fs: &FileSystem, process: &Process, path: &str) -> Result<(), Error> {
    fs.mkdir(process.cwd, path)
}

pub fn chdir(fs: &FileSystem, process: &mut Process, path: &str) -> Result<(), Error> {
    let inode = fs.resolve(process.cwd, path)?;
    if !inode.is_dir() {
        fs.inodes().close(inode)?;
        return Err(Error::Invalid);
    }
    let sector = inode.sector;
    fs.inodes().close(inode)?;
    process.cwd = sector;
    Ok(())
}

/// Returns the next directory entry name for `fd`, or `None` once the
/// directory has been fully enumerated.
pub fn readdir(process: &mut Process, fd: i32) -> Result<Option<String>, Error> {
    match process.fds.get_mut(fd) {
        Some(Descriptor::Dir { store, inode, pos }) => {
            Ok(directory::next_entry(&*store, &*inode, pos)?.map(|e| e.name))
        }
        _ => Err(Error::Invalid),
    }
}

pub fn isdir(process: &Process, fd: i32) -> Result<bool, Error> {
    match process.fds.get(fd) {
        Some(Descriptor::Dir { .. }) => Ok(true),
        Some(Descriptor::File(_)) => Ok(false),
        None => Err(Error::Invalid),
    }
}

pub fn inumber(process: &Process, fd: i32) -> Result<u32, Error> {
    match process.fds.get(fd) {
        Some(Descriptor::File(f)) => Ok(f.inode_sector().as_u32()),
        Some(Descriptor::Dir { inode, .. }) => Ok(inode.sector.as_u32()),
        None => Err(Error::Invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{MemDevice, RecordingPageDirectory};
    use crate::hal::BlockDevice;
    use alloc::sync::Arc;

    fn setup() -> (FileSystem, Process) {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(4096));
        let fs = FileSystem::format(device).unwrap();
        let pd = Arc::new(RecordingPageDirectory::new());
        let process = Process::new(Pid(1), fs.root_sector(), pd);
        (fs, process)
    }

    #[test]
    fn create_open_write_read_close() {
        let (fs, mut process) = setup();
        create(&fs, &process, "/greeting").unwrap();
        let fd = open(&fs, &mut process, "/greeting").unwrap();
        assert_eq!(write(&mut process, fd, b"hi").unwrap(), 2);
        seek(&mut process, fd, 0).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(read(&mut process, fd, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
        close(&mut process, fd).unwrap();
    }

    #[test]
    fn mkdir_chdir_and_readdir() {
        let (fs, mut process) = setup();
        mkdir(&fs, &process, "/sub").unwrap();
        create(&fs, &process, "/sub/a").unwrap();
        create(&fs, &process, "/sub/b").unwrap();
        chdir(&fs, &mut process, "/sub").unwrap();

        let fd = open(&fs, &mut process, ".").unwrap();
        assert!(isdir(&process, fd).unwrap());
        let mut names = alloc::vec::Vec::new();
        while let Some(name) = readdir(&mut process, fd).unwrap() {
            names.push(name);
        }
        names.sort();
        assert_eq!(names, ["a", "b"]);
        close(&mut process, fd).unwrap();
    }

    #[test]
    fn operations_on_bad_fd_are_invalid() {
        let (_fs, process) = setup();
        assert_eq!(filesize(&process, 99), Err(Error::Invalid));
    }
}
