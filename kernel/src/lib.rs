//! Helium kernel library
//!
//! The core of a small i686 microkernel: process and thread lifecycle,
//! capability descriptors, synchronous rendezvous IPC, and the two-level
//! (optionally PAE three-level) virtual-memory manager backing them.

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// Bare metal uses the kernel heap; the host target (unit tests, coverage)
// delegates to the system allocator so test code using alloc compiles and
// runs under the standard harness.
#[cfg(all(target_arch = "x86", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Hand the kernel heap its backing region.
///
/// Called once during boot with pages carved from the early allocator.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init_heap(start: *mut u8, size: usize) {
    // SAFETY: boot passes a region owned exclusively by the heap.
    unsafe { ALLOCATOR.lock().init(start, size) };
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootinfo;
pub mod cmdline;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod mm;
pub mod object;
pub mod process;
pub mod sched;
pub mod syscall;

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_env;

pub use error::{Errno, KernelResult};
