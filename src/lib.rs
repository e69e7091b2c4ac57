//! Virtual memory and file system subsystem for a teaching operating system
//! kernel: a multi-level indexed inode file system with hierarchical
//! directories, and a demand-paged virtual memory system with second-chance
//! frame eviction and swap.
//!
//! This crate is `no_std` + `alloc`: it owns no scheduler, no interrupt or
//! trap handling, no ELF loader, and no MMU driver. Those live on the other
//! side of the traits in [`hal`] — a real kernel embeds this crate by
//! implementing [`hal::BlockDevice`], [`hal::PageDirectory`],
//! [`hal::PhysPagePool`], and (at the syscall boundary)
//! [`hal::PointerValidator`] and [`hal::ProcessLauncher`].
#![no_std]

extern crate alloc;

pub mod error;
pub mod freemap;
pub mod fs;
pub mod hal;
pub mod process;
pub mod syscall;
pub mod vm;

pub use error::Error;
