//! Processes
//!
//! A process owns an address space and a descriptor table. It does not hold
//! counted references to its threads; threads keep an uncounted back-pointer
//! and the process is torn down after its last thread exits. Two designated
//! descriptor slots are installed at exec time: the process's own handle and
//! its main thread.

pub mod thread;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{Errno, KernelResult};
use crate::mm::addr_space::AddrSpace;
use crate::mm::paging::Paging;
use crate::mm::slab::ObjectCache;
use crate::mm::PAGE_ALLOCATOR;
use crate::object::descriptor::DescriptorTable;
use crate::object::{ObjectHeader, ObjectKind};

/// Designated descriptor for the process itself, installed at exec time
pub const SELF_PROCESS_FD: usize = 0;

/// Designated descriptor for the initial thread, installed at exec time
pub const MAIN_THREAD_FD: usize = 1;

/// A process
pub struct Process {
    header: ObjectHeader,
    paging: &'static Paging,
    addr_space: Mutex<AddrSpace>,
    descriptors: DescriptorTable,
    /// Live threads; uncounted, drives teardown
    thread_count: AtomicU32,
}

impl Process {
    #[inline]
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    #[inline]
    pub fn paging(&self) -> &'static Paging {
        self.paging
    }

    pub fn addr_space(&self) -> &Mutex<AddrSpace> {
        &self.addr_space
    }

    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    pub(crate) fn thread_created(&self) {
        self.thread_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Called when one of this process's threads is reclaimed. Returns true
    /// when it was the last one and the process must be torn down.
    pub(crate) fn thread_exited(&self) -> bool {
        self.thread_count.fetch_sub(1, Ordering::Relaxed) == 1
    }

    pub fn thread_count(&self) -> u32 {
        self.thread_count.load(Ordering::Relaxed)
    }
}

/// Handle to a slab-allocated process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessPtr(NonNull<Process>);

// SAFETY: single-CPU kernel; process internals are interior-mutable behind
// locks and atomics.
unsafe impl Send for ProcessPtr {}
// SAFETY: same reasoning as Send.
unsafe impl Sync for ProcessPtr {}

impl ProcessPtr {
    pub fn get(&self) -> &'static Process {
        // SAFETY: processes live at stable slab addresses and are freed
        // only when their reference count reaches zero, at which point no
        // handle remains.
        unsafe { &*self.0.as_ptr() }
    }
}

lazy_static! {
    static ref PROCESS_CACHE: Mutex<ObjectCache<Process>> =
        Mutex::new(ObjectCache::new("process"));
}

/// Construct an empty process: fresh address space, zeroed descriptor
/// table, no threads.
pub fn create_process(paging: &'static Paging) -> KernelResult<ProcessPtr> {
    let storage = {
        let mut cache = PROCESS_CACHE.lock();
        let mut frames = PAGE_ALLOCATOR.lock();
        cache.reserve(&mut frames).ok_or(Errno::Again)?
    };

    let addr_space = {
        let mut frames = PAGE_ALLOCATOR.lock();
        match AddrSpace::create(paging, &mut frames) {
            Ok(space) => space,
            Err(errno) => {
                // SAFETY: storage was reserved above and never initialised.
                unsafe { PROCESS_CACHE.lock().unreserve(storage) };
                return Err(errno);
            }
        }
    };

    // SAFETY: storage is T-sized, T-aligned and unaliased.
    unsafe {
        storage.as_ptr().write(Process {
            header: ObjectHeader::new(ObjectKind::Process),
            paging,
            addr_space: Mutex::new(addr_space),
            descriptors: DescriptorTable::new(),
            thread_count: AtomicU32::new(0),
        });
    }

    Ok(ProcessPtr(storage))
}

/// Tear down a process after its last thread exited: destroy the address
/// space, then close every descriptor (releasing the referenced objects,
/// including the process's own handle). The object itself is freed when
/// its reference count reaches zero.
///
/// The address space goes first: closing the self descriptor can drop the
/// last reference, and the free path re-runs teardown, which must then
/// find nothing left to do.
pub fn teardown_process(process: ProcessPtr) {
    {
        // Lock order everywhere: address space, then page allocator.
        let mut space = process.get().addr_space.lock();
        let mut frames = PAGE_ALLOCATOR.lock();
        space.destroy(process.get().paging, &mut frames);
    }

    process.get().descriptors.close_all();
}

/// Free a process whose reference count reached zero.
pub(crate) fn free_process(process: ProcessPtr) {
    // A process that never ran a thread is torn down here instead; for one
    // already torn down both steps are no-ops.
    teardown_process(process);

    let mut cache = PROCESS_CACHE.lock();
    // SAFETY: the last reference is gone; nothing can reach this process
    // anymore.
    unsafe { cache.free(process.0) };
}
