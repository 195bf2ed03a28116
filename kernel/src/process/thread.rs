//! Threads
//!
//! A thread owns itself from construction until exit: it is created with
//! reference count 1 and that self-pin is only dropped after its final
//! context switch, by the thread that switches in. Each thread has one
//! pinned 4 KiB kernel stack; the running thread is identified by the
//! per-CPU current-thread pointer the scheduler maintains.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::arch::ThreadContext;
use crate::error::{Errno, KernelResult};
use crate::ipc::message::MessageBuffer;
use crate::mm::slab::ObjectCache;
use crate::mm::{PhysAddr, VirtAddr, PAGE_ALLOCATOR, PAGE_SIZE};
use crate::object::{ObjectHeader, ObjectKind};

use super::ProcessPtr;

/// Thread scheduling state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Constructed, not yet given an entry point
    Created = 0,
    /// Entry point, user stack and argument installed
    Prepared = 1,
    /// On the ready queue
    Ready = 2,
    /// The one thread executing on the CPU
    Running = 3,
    /// Parked on a wait queue or on a receiver
    Blocked = 4,
    /// Exited, awaiting join
    Zombie = 5,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Prepared,
            2 => Self::Ready,
            3 => Self::Running,
            4 => Self::Blocked,
            5 => Self::Zombie,
            _ => unreachable!("invalid thread state"),
        }
    }
}

/// Entry point, user stack and argument installed by `prepare`
#[derive(Debug, Clone, Copy)]
pub struct ThreadParams {
    pub entry: VirtAddr,
    pub user_stack: VirtAddr,
    pub arg: usize,
}

/// Thread-local storage window
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLocalStorage {
    pub addr: VirtAddr,
    pub size: usize,
}

/// Status stored in `wake_status` while a thread is still parked
const WAKE_PENDING: i32 = i32::MIN;

/// A thread
pub struct Thread {
    header: ObjectHeader,
    /// Owning process; uncounted, invalidated when the process is torn
    /// down after its last thread exits
    process: ProcessPtr,
    state: AtomicU8,
    /// Pinned one-page kernel stack
    kstack: PhysAddr,
    context: Mutex<ThreadContext>,
    params: Mutex<Option<ThreadParams>>,
    tls: Mutex<ThreadLocalStorage>,
    /// The sender this thread is servicing, when receiving
    current_sender: Mutex<Option<ThreadPtr>>,
    /// Set while a matched delivery sits in the staging buffer that user
    /// space has not observed yet; cleared once the receive hands it over
    pending_delivery: AtomicBool,
    /// The thread joining this one; at most one
    joined: Mutex<Option<ThreadPtr>>,
    exit_value: AtomicUsize,
    /// Per-thread message staging buffer
    staging: Mutex<MessageBuffer>,
    /// Status delivered by whoever wakes this thread
    wake_status: AtomicI32,
}

impl Thread {
    #[inline]
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    #[inline]
    pub fn process(&self) -> ProcessPtr {
        self.process
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn context(&self) -> &Mutex<ThreadContext> {
        &self.context
    }

    pub fn kstack(&self) -> PhysAddr {
        self.kstack
    }

    /// Install the entry point, user stack and argument.
    ///
    /// The initial saved stack pointer is the top of the kernel stack; the
    /// entry trampoline reads the parameters from the thread structure when
    /// the thread is first switched in.
    pub fn prepare(&self, params: ThreadParams) -> KernelResult<()> {
        if self.state() != ThreadState::Created {
            return Err(Errno::Busy);
        }

        *self.params.lock() = Some(params);
        self.context.lock().saved_stack_pointer =
            crate::mm::phys_to_virt(self.kstack) as usize + PAGE_SIZE;
        self.set_state(ThreadState::Prepared);
        Ok(())
    }

    pub fn params(&self) -> Option<ThreadParams> {
        *self.params.lock()
    }

    pub fn set_thread_local(&self, addr: VirtAddr, size: usize) {
        *self.tls.lock() = ThreadLocalStorage { addr, size };
    }

    pub fn thread_local(&self) -> ThreadLocalStorage {
        *self.tls.lock()
    }

    pub fn current_sender(&self) -> &Mutex<Option<ThreadPtr>> {
        &self.current_sender
    }

    pub fn set_pending_delivery(&self, pending: bool) {
        self.pending_delivery.store(pending, Ordering::Relaxed);
    }

    /// Whether a matched delivery is still waiting to be handed over
    pub fn has_pending_delivery(&self) -> bool {
        self.pending_delivery.load(Ordering::Relaxed)
    }

    pub fn joined(&self) -> &Mutex<Option<ThreadPtr>> {
        &self.joined
    }

    pub fn set_exit_value(&self, value: usize) {
        self.exit_value.store(value, Ordering::Relaxed);
    }

    pub fn exit_value(&self) -> usize {
        self.exit_value.load(Ordering::Relaxed)
    }

    pub fn staging(&self) -> &Mutex<MessageBuffer> {
        &self.staging
    }

    /// Clear the wake status before parking.
    pub fn clear_wake_status(&self) {
        self.wake_status.store(WAKE_PENDING, Ordering::Relaxed);
    }

    /// Record the status the parked thread will observe when it resumes.
    pub fn set_wake_status(&self, status: Result<i32, Errno>) {
        let value = match status {
            Ok(v) => v,
            Err(errno) => -errno.code(),
        };
        self.wake_status.store(value, Ordering::Relaxed);
    }

    /// Status stored by whoever woke this thread, `None` while parked.
    pub fn wake_status(&self) -> Option<Result<i32, Errno>> {
        match self.wake_status.load(Ordering::Relaxed) {
            WAKE_PENDING => None,
            value if value >= 0 => Some(Ok(value)),
            value => Some(Err(Errno::from_code(-value).unwrap_or(Errno::Protocol))),
        }
    }
}

/// Handle to a slab-allocated thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPtr(NonNull<Thread>);

// SAFETY: single-CPU kernel; thread internals are interior-mutable behind
// locks and atomics.
unsafe impl Send for ThreadPtr {}
// SAFETY: same reasoning as Send.
unsafe impl Sync for ThreadPtr {}

impl ThreadPtr {
    pub fn get(&self) -> &'static Thread {
        // SAFETY: threads live at stable slab addresses and are freed only
        // when their reference count reaches zero, at which point no
        // handle remains.
        unsafe { &*self.0.as_ptr() }
    }
}

lazy_static! {
    static ref THREAD_CACHE: Mutex<ObjectCache<Thread>> = Mutex::new(ObjectCache::new("thread"));
}

/// Construct a thread in state `Created` with reference count 1.
///
/// The self-pin keeps the thread alive until it exits; it is released by
/// the thread that switches in after the final switch.
pub fn construct_thread(process: ProcessPtr) -> KernelResult<ThreadPtr> {
    // Lock order everywhere: object cache, then page allocator.
    let mut cache = THREAD_CACHE.lock();
    let mut frames = PAGE_ALLOCATOR.lock();

    let kstack = frames.alloc_page().ok_or(Errno::Again)?;

    let thread = Thread {
        header: ObjectHeader::new(ObjectKind::Thread),
        process,
        state: AtomicU8::new(ThreadState::Created as u8),
        kstack,
        context: Mutex::new(ThreadContext::new()),
        params: Mutex::new(None),
        tls: Mutex::new(ThreadLocalStorage::default()),
        current_sender: Mutex::new(None),
        pending_delivery: AtomicBool::new(false),
        joined: Mutex::new(None),
        exit_value: AtomicUsize::new(0),
        staging: Mutex::new(MessageBuffer::new()),
        wake_status: AtomicI32::new(WAKE_PENDING),
    };

    let ptr = match cache.alloc(&mut frames, thread) {
        Some(ptr) => ptr,
        None => {
            frames.free_page(kstack);
            return Err(Errno::Again);
        }
    };

    let ptr = ThreadPtr(ptr);
    ptr.get().header.add_ref();
    process.get().thread_created();
    Ok(ptr)
}

/// Free a thread whose reference count reached zero.
pub(crate) fn free_thread(thread: ThreadPtr) {
    let kstack = thread.get().kstack;

    let mut cache = THREAD_CACHE.lock();
    let mut frames = PAGE_ALLOCATOR.lock();
    // SAFETY: the last reference is gone; nothing can reach this thread
    // anymore.
    unsafe { cache.free(thread.0) };
    frames.free_page(kstack);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_env;

    #[test]
    fn construction_self_pins() {
        let env = test_env::init();
        let process = test_env::spawn_process(env);
        let thread = construct_thread(process).unwrap();

        assert_eq!(thread.get().state(), ThreadState::Created);
        assert_eq!(thread.get().header().ref_count(), 1);
        assert_eq!(thread.get().process(), process);
        assert!(thread.get().kstack().is_page_aligned());
    }

    #[test]
    fn prepare_moves_created_to_prepared() {
        let env = test_env::init();
        let process = test_env::spawn_process(env);
        let thread = construct_thread(process).unwrap();

        let params = ThreadParams {
            entry: VirtAddr::new(0x0800_0000),
            user_stack: VirtAddr::new(0x3000_0000),
            arg: 7,
        };
        thread.get().prepare(params).unwrap();

        assert_eq!(thread.get().state(), ThreadState::Prepared);
        assert_eq!(thread.get().params().unwrap().arg, 7);

        // The initial kernel stack pointer is the top of the pinned page.
        let expected = crate::mm::phys_to_virt(thread.get().kstack()) as usize + PAGE_SIZE;
        assert_eq!(thread.get().context().lock().saved_stack_pointer, expected);
    }

    #[test]
    fn prepare_twice_is_busy() {
        let env = test_env::init();
        let process = test_env::spawn_process(env);
        let thread = construct_thread(process).unwrap();

        let params = ThreadParams {
            entry: VirtAddr::new(0x1000),
            user_stack: VirtAddr::new(0x2000),
            arg: 0,
        };
        thread.get().prepare(params).unwrap();
        assert_eq!(thread.get().prepare(params), Err(Errno::Busy));
    }

    #[test]
    fn thread_local_storage_round_trip() {
        let env = test_env::init();
        let process = test_env::spawn_process(env);
        let thread = construct_thread(process).unwrap();

        assert_eq!(thread.get().thread_local().addr, VirtAddr::new(0));

        thread.get().set_thread_local(VirtAddr::new(0x2000_0000), 4096);
        let tls = thread.get().thread_local();
        assert_eq!(tls.addr, VirtAddr::new(0x2000_0000));
        assert_eq!(tls.size, 4096);
    }

    #[test]
    fn wake_status_round_trip() {
        let env = test_env::init();
        let process = test_env::spawn_process(env);
        let thread = construct_thread(process).unwrap();

        assert_eq!(thread.get().wake_status(), None);

        thread.get().set_wake_status(Ok(12));
        assert_eq!(thread.get().wake_status(), Some(Ok(12)));

        thread.get().set_wake_status(Err(Errno::Io));
        assert_eq!(thread.get().wake_status(), Some(Err(Errno::Io)));

        thread.get().clear_wake_status();
        assert_eq!(thread.get().wake_status(), None);
    }

    #[test]
    fn construction_counts_threads() {
        let env = test_env::init();
        let process = test_env::spawn_process(env);

        let before = process.get().thread_count();
        let _a = construct_thread(process).unwrap();
        let _b = construct_thread(process).unwrap();
        assert_eq!(process.get().thread_count(), before + 2);
    }
}
