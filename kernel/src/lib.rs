//! Virtual memory for KidneyOS user processes: demand paging from executables, swap and
//! memory-mapped files, stack growth, and eviction under memory pressure.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod timer;
pub mod user_program;
