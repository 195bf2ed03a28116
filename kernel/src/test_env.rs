//! Shared environment for host unit tests
//!
//! Entity tests go through the global page allocator and slab caches, so
//! the pool behind them is seeded exactly once per test binary, mirroring
//! the boot sequence: paging initialised from an early bump region, the
//! free stack seeded afterwards.

use std::boxed::Box;
use std::sync::OnceLock;

use crate::mm::paging::{PaePolicy, Paging};
use crate::mm::pfalloc::KERNEL_PAGE_STACK_SIZE;
use crate::mm::test_pool::TestPool;
use crate::mm::{PageFrameAllocator, PAGE_ALLOCATOR};
use crate::process::thread::{construct_thread, ThreadPtr};
use crate::process::{create_process, ProcessPtr};

pub struct Env {
    pub paging: &'static Paging,
}

static ENV: OnceLock<Env> = OnceLock::new();

/// Pages reserved for the paging template at the front of the pool
const EARLY_PAGES: usize = 700;

pub fn init() -> &'static Env {
    ENV.get_or_init(|| {
        let pool = Box::leak(Box::new(TestPool::new(EARLY_PAGES + KERNEL_PAGE_STACK_SIZE)));

        let mut early = PageFrameAllocator::new();
        early.set_early_range(pool.frame(0), pool.frame(EARLY_PAGES));
        let paging = Paging::select(PaePolicy::Disable, false, &mut early).unwrap();

        let mut frames = PAGE_ALLOCATOR.lock();
        for i in EARLY_PAGES..EARLY_PAGES + KERNEL_PAGE_STACK_SIZE {
            frames.seed(pool.frame(i));
        }
        frames.switch_to_normal();

        Env {
            paging: Box::leak(Box::new(paging)),
        }
    })
}

/// A process that stays alive for the remainder of the test binary
pub fn spawn_process(env: &Env) -> ProcessPtr {
    let process = create_process(env.paging).expect("test process creation failed");
    // Pin it so descriptor churn in tests can never free it.
    process.get().header().add_ref();
    process
}

/// A thread in state `Created`, pinned by its construction reference
pub fn spawn_thread(process: ProcessPtr) -> ThreadPtr {
    construct_thread(process).expect("test thread creation failed")
}
