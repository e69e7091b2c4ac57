//! Process-level glue: file descriptors, current working directory, and
//! parent/child exit-code bookkeeping. Scheduling, address-space setup and
//! ELF loading remain outside this crate's scope (see `hal`).

use crate::error::Error;
use crate::fs::file::FileHandle;
use crate::fs::inode::{Inode, InodeStore};
use crate::hal::{PageDirectoryHandle, Pid, Sector};
use crate::vm::frame::FrameTable;
use crate::vm::spt::{Location, SupplementalPageTable};
use crate::vm::swap::SwapManager;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// One process's open file descriptor.
pub enum Descriptor {
    File(FileHandle),
    Dir {
        store: Arc<InodeStore>,
        inode: Inode,
        /// Byte offset of the next entry `readdir` will return.
        pos: usize,
    },
}

/// The file-descriptor table: fd 0/1 are reserved for stdio by convention,
/// matching the Pintos syscall surface this crate's `syscall` module
/// implements (fd allocation starts at 2).
pub struct FdTable {
    next_fd: i32,
    table: BTreeMap<i32, Descriptor>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    pub fn new() -> Self {
        FdTable {
            next_fd: 2,
            table: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, descriptor: Descriptor) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.table.insert(fd, descriptor);
        fd
    }

    pub fn get(&self, fd: i32) -> Option<&Descriptor> {
        self.table.get(&fd)
    }

    pub fn get_mut(&mut self, fd: i32) -> Option<&mut Descriptor> {
        self.table.get_mut(&fd)
    }

    pub fn remove(&mut self, fd: i32) -> Option<Descriptor> {
        self.table.remove(&fd)
    }

    /// Drains every open descriptor, closing regular files as it goes.
    /// Open directories need no teardown beyond dropping their `Inode`
    /// handle, but since `Inode` isn't itself close-aware (the store is),
    /// callers that need the sector freed should `remove` it through
    /// `InodeStore` directly; ordinary directory traversal handles never
    /// own the only reference.
    pub fn close_all(&mut self) -> Result<(), Error> {
        for (_, descriptor) in core::mem::take(&mut self.table) {
            if let Descriptor::File(file) = descriptor {
                file.close()?;
            }
        }
        Ok(())
    }
}

/// Shared child-exit bookkeeping: one semaphore-shaped handle per child. A
/// real kernel backs the "wait" side with its scheduler's blocking
/// primitive; here the handle only carries the state such a primitive would
/// protect.
pub struct ExitSignal {
    exit_code: AtomicI32,
    has_exited: AtomicBool,
    reaped: AtomicBool,
}

const EXIT_CODE_SENTINEL: i32 = i32::MIN;

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitSignal {
    pub fn new() -> Self {
        ExitSignal {
            exit_code: AtomicI32::new(EXIT_CODE_SENTINEL),
            has_exited: AtomicBool::new(false),
            reaped: AtomicBool::new(false),
        }
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
        self.has_exited.store(true, Ordering::SeqCst);
    }

    pub fn exit_code(&self) -> Option<i32> {
        if self.has_exited.load(Ordering::SeqCst) {
            Some(self.exit_code.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// Atomically marks the child as reaped. Returns `true` only for the
    /// first caller — a second `wait` on the same child must fail.
    pub fn mark_reaped(&self) -> bool {
        self.reaped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A user process: its address space's supplemental state, its open files,
/// and its place in the process tree.
pub struct Process {
    pub pid: Pid,
    pub cwd: Sector,
    pub fds: FdTable,
    pub page_directory: PageDirectoryHandle,
    pub spt: SupplementalPageTable,
    /// This process's own exit signal, shared with whoever `wait`s on it.
    pub exit_signal: Arc<ExitSignal>,
    children: Vec<(Pid, Arc<ExitSignal>)>,
}

impl Process {
    pub fn new(pid: Pid, cwd: Sector, page_directory: PageDirectoryHandle) -> Self {
        Process {
            pid,
            cwd,
            fds: FdTable::new(),
            page_directory,
            spt: SupplementalPageTable::new(),
            exit_signal: Arc::new(ExitSignal::new()),
            children: Vec::new(),
        }
    }

    /// Registers a freshly created child, returning the exit signal the
    /// exec/scheduler glue should hand to it.
    pub fn adopt_child(&mut self, pid: Pid, signal: Arc<ExitSignal>) {
        self.children.push((pid, signal));
    }

    /// Waits for `pid`, a direct child, to exit, returning its exit code.
    /// Fails with `Error::Invalid` if `pid` isn't a child, or has already
    /// been reaped once (only one `wait` per child ever succeeds).
    ///
    /// A real kernel blocks here (via its scheduler) until the child's
    /// `ExitSignal` is posted; that suspension point is outside this
    /// crate's scope, so this returns immediately once the exit code is
    /// already available, and errors rather than blocking if it isn't.
    pub fn wait(&mut self, pid: Pid) -> Result<i32, Error> {
        let idx = self
            .children
            .iter()
            .position(|(p, _)| *p == pid)
            .ok_or(Error::Invalid)?;
        let signal = self.children[idx].1.clone();
        if !signal.mark_reaped() {
            return Err(Error::Invalid);
        }
        let code = signal.exit_code().ok_or(Error::Invalid)?;
        self.children.remove(idx);
        Ok(code)
    }

    /// Tears the process down: closes every open file, releases every
    /// frame it owns, frees any swap slots its non-resident pages still
    /// hold, and posts its exit code for its parent to collect.
    pub fn exit(mut self, code: i32, frames: &FrameTable, swap: &SwapManager) -> Result<(), Error> {
        self.fds.close_all()?;
        frames.free_owned_by(self.pid);
        for upage in self.spt.pages() {
            if let Some(spte) = self.spt.remove(upage) {
                if let Location::Swapped(slot) = spte.lock().location {
                    swap.free(slot);
                }
            }
        }
        self.exit_signal.set_exit_code(code);
        Ok(())
    }
}
