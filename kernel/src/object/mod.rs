//! Kernel objects
//!
//! Every kernel object a descriptor can name (process, thread, endpoint)
//! embeds an [`ObjectHeader`] at the start: a type tag, a reference count
//! and a destroyed flag. The reference count equals the number of
//! descriptors naming the object plus its internal pins (a running thread
//! pins itself until exit, a parked sender is pinned by its receiver).
//! Objects are freed back to their slab caches when the count reaches zero;
//! the destroyed flag only gates new use, it does not free anything.
//!
//! No object holds a counted reference to another: processes do not
//! reference their threads, and a thread's back-pointer to its process is
//! uncounted.

pub mod descriptor;

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::ipc::endpoint::EndpointPtr;
use crate::process::thread::ThreadPtr;
use crate::process::ProcessPtr;

/// Object type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Process,
    Thread,
    Endpoint,
}

const FLAG_DESTROYED: u8 = 1 << 0;

/// Header embedded at the start of every kernel object
#[derive(Debug)]
pub struct ObjectHeader {
    kind: ObjectKind,
    ref_count: AtomicU32,
    flags: AtomicU8,
}

impl ObjectHeader {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            ref_count: AtomicU32::new(0),
            flags: AtomicU8::new(0),
        }
    }

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; returns true when this was the last one.
    #[inline]
    pub fn sub_ref(&self) -> bool {
        let previous = self.ref_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "reference count underflow");
        previous == 1
    }

    #[inline]
    pub fn mark_destroyed(&self) {
        self.flags.fetch_or(FLAG_DESTROYED, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_DESTROYED != 0
    }
}

/// Reference to any kernel object
///
/// A plain tagged pointer; holding one does not count as a reference. The
/// descriptor table and the IPC engine manage the count explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjRef {
    Process(ProcessPtr),
    Thread(ThreadPtr),
    Endpoint(EndpointPtr),
}

impl ObjRef {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Process(_) => ObjectKind::Process,
            Self::Thread(_) => ObjectKind::Thread,
            Self::Endpoint(_) => ObjectKind::Endpoint,
        }
    }

    pub fn header(&self) -> &ObjectHeader {
        match self {
            Self::Process(p) => p.get().header(),
            Self::Thread(t) => t.get().header(),
            Self::Endpoint(e) => e.get().header(),
        }
    }

    pub fn as_process(&self) -> Option<ProcessPtr> {
        match self {
            Self::Process(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<ThreadPtr> {
        match self {
            Self::Thread(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_endpoint(&self) -> Option<EndpointPtr> {
        match self {
            Self::Endpoint(e) => Some(*e),
            _ => None,
        }
    }
}

/// Add a counted reference to `object`.
pub fn add_ref(object: ObjRef) {
    object.header().add_ref();
}

/// Drop a counted reference; the object is freed back to its slab cache
/// when this was the last one.
pub fn release(object: ObjRef) {
    if object.header().sub_ref() {
        match object {
            ObjRef::Process(p) => crate::process::free_process(p),
            ObjRef::Thread(t) => crate::process::thread::free_thread(t),
            ObjRef::Endpoint(e) => crate::ipc::endpoint::free_endpoint(e),
        }
    }
}

/// Destroy hook, run once when an object's owner descriptor is closed.
///
/// Pending IPC peers and joiners are woken with a failure status; the
/// storage itself lives until the reference count reaches zero.
pub fn on_destroyed(object: ObjRef) {
    match object {
        ObjRef::Endpoint(endpoint) => {
            let mut sched = crate::sched::SCHEDULER.lock();
            crate::ipc::rendezvous::endpoint_destroyed(&mut sched, endpoint);
        }
        ObjRef::Thread(thread) => {
            let mut sched = crate::sched::SCHEDULER.lock();
            crate::sched::scheduler::abort_join(&mut sched, thread);
        }
        ObjRef::Process(_) => {}
    }
}
