//! IPC endpoints
//!
//! An endpoint is a rendezvous point: a FIFO queue of senders blocked
//! awaiting a receiver and a FIFO queue of receivers blocked awaiting a
//! sender. At most one of the two queues is non-empty at any time.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::collections::VecDeque;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{Errno, KernelResult};
use crate::mm::slab::ObjectCache;
use crate::mm::PAGE_ALLOCATOR;
use crate::object::{ObjectHeader, ObjectKind};
use crate::process::thread::ThreadPtr;

/// An IPC endpoint
pub struct Endpoint {
    header: ObjectHeader,
    senders: Mutex<VecDeque<ThreadPtr>>,
    receivers: Mutex<VecDeque<ThreadPtr>>,
    receivers_count: AtomicU32,
}

impl Endpoint {
    #[inline]
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    pub fn add_receiver(&self) {
        self.receivers_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sub_receiver(&self) {
        self.receivers_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn has_receivers(&self) -> bool {
        self.receivers_count.load(Ordering::Relaxed) > 0
    }

    pub fn senders(&self) -> &Mutex<VecDeque<ThreadPtr>> {
        &self.senders
    }

    pub fn receivers(&self) -> &Mutex<VecDeque<ThreadPtr>> {
        &self.receivers
    }

    /// The rendezvous invariant: at most one queue is non-empty.
    pub fn rendezvous_holds(&self) -> bool {
        self.senders.lock().is_empty() || self.receivers.lock().is_empty()
    }
}

/// Handle to a slab-allocated endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPtr(NonNull<Endpoint>);

// SAFETY: single-CPU kernel; endpoint internals are interior-mutable behind
// locks and atomics.
unsafe impl Send for EndpointPtr {}
// SAFETY: same reasoning as Send.
unsafe impl Sync for EndpointPtr {}

impl EndpointPtr {
    pub fn get(&self) -> &'static Endpoint {
        // SAFETY: endpoints live at stable slab addresses and are freed
        // only when their reference count reaches zero, at which point no
        // handle remains.
        unsafe { &*self.0.as_ptr() }
    }
}

lazy_static! {
    static ref ENDPOINT_CACHE: Mutex<ObjectCache<Endpoint>> =
        Mutex::new(ObjectCache::new("endpoint"));
}

/// Allocate a new endpoint with reference count zero.
///
/// Allocation pressure surfaces as `EAGAIN`: the caller can close
/// descriptors and retry.
pub fn create_endpoint() -> KernelResult<EndpointPtr> {
    let endpoint = Endpoint {
        header: ObjectHeader::new(ObjectKind::Endpoint),
        senders: Mutex::new(VecDeque::new()),
        receivers: Mutex::new(VecDeque::new()),
        receivers_count: AtomicU32::new(0),
    };

    let mut cache = ENDPOINT_CACHE.lock();
    let mut frames = PAGE_ALLOCATOR.lock();
    let ptr = cache.alloc(&mut frames, endpoint).ok_or(Errno::Again)?;
    Ok(EndpointPtr(ptr))
}

/// Free an endpoint whose reference count reached zero.
pub(crate) fn free_endpoint(endpoint: EndpointPtr) {
    debug_assert!(endpoint.get().senders.lock().is_empty());
    debug_assert!(endpoint.get().receivers.lock().is_empty());

    let mut cache = ENDPOINT_CACHE.lock();
    // SAFETY: the last reference is gone; nothing can reach this endpoint
    // anymore.
    unsafe { cache.free(endpoint.0) };
}
