//! Virtual memory subsystem: supplemental page table, frame table with
//! second-chance eviction, swap manager, and the page-fault resolver that
//! ties them together.

pub mod fault;
pub mod frame;
pub mod spt;
pub mod swap;
