//! Physical page-frame allocator
//!
//! Hands out and reclaims 4 KiB-aligned physical page frames for page tables
//! and kernel objects. Two modes: an early linear-bump mode used before the
//! free stack is populated, and the normal LIFO-stack mode used for the rest
//! of the kernel's lifetime. The switch is one way and happens immediately
//! after the free stack is seeded during boot.

use spin::Mutex;

use super::{PhysAddr, PAGE_SIZE};

/// Capacity of the free-frame stack
pub const KERNEL_PAGE_STACK_SIZE: usize = 1024;

/// Number of frames seeded onto the stack during boot
pub const KERNEL_PAGE_STACK_INIT: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Bump allocation through the kernel image's trailing region
    Early,
    /// LIFO free-frame stack
    Normal,
}

/// The allocator proper
///
/// Global state lives in [`PAGE_ALLOCATOR`]; tests construct their own
/// instances.
pub struct PageFrameAllocator {
    stack: [PhysAddr; KERNEL_PAGE_STACK_SIZE],
    count: usize,
    mode: Mode,
    early_cursor: PhysAddr,
    early_limit: PhysAddr,
}

impl PageFrameAllocator {
    pub const fn new() -> Self {
        Self {
            stack: [PhysAddr::new(0); KERNEL_PAGE_STACK_SIZE],
            count: 0,
            mode: Mode::Early,
            early_cursor: PhysAddr::new(0),
            early_limit: PhysAddr::new(0),
        }
    }

    /// Set the physical range the early bump cursor walks through.
    ///
    /// Must be called before the first allocation.
    pub fn set_early_range(&mut self, base: PhysAddr, limit: PhysAddr) {
        debug_assert!(self.mode == Mode::Early);
        debug_assert!(base.is_page_aligned() && limit.is_page_aligned());
        self.early_cursor = base;
        self.early_limit = limit;
    }

    /// Allocate one page frame.
    ///
    /// Returns `None` when no frame is available; out of memory is fatal
    /// during boot (callers `expect`) and surfaces as `ENOMEM` at runtime.
    pub fn alloc_page(&mut self) -> Option<PhysAddr> {
        match self.mode {
            Mode::Early => {
                if self.early_cursor >= self.early_limit {
                    return None;
                }
                let frame = self.early_cursor;
                self.early_cursor = frame.add(PAGE_SIZE);
                Some(frame)
            }
            Mode::Normal => {
                if self.count == 0 {
                    return None;
                }
                self.count -= 1;
                Some(self.stack[self.count])
            }
        }
    }

    /// Return a page frame to the free stack.
    ///
    /// When the stack is full the frame is silently dropped: leaking a page
    /// is preferable to taking the kernel down.
    pub fn free_page(&mut self, paddr: PhysAddr) {
        debug_assert!(self.mode == Mode::Normal, "free_page in early mode");
        debug_assert!(paddr.is_page_aligned());

        if self.count >= KERNEL_PAGE_STACK_SIZE {
            return;
        }

        self.stack[self.count] = paddr;
        self.count += 1;
    }

    /// Seed the free stack with one frame during boot.
    ///
    /// Unlike [`free_page`](Self::free_page), seeding is legal in early mode;
    /// it is how the stack gets its initial `KERNEL_PAGE_STACK_INIT` frames.
    pub fn seed(&mut self, paddr: PhysAddr) {
        debug_assert!(self.mode == Mode::Early, "seed after mode switch");
        debug_assert!(paddr.is_page_aligned());

        if self.count >= KERNEL_PAGE_STACK_SIZE {
            return;
        }

        self.stack[self.count] = paddr;
        self.count += 1;
    }

    /// One-way switch from early bump mode to normal stack mode.
    pub fn switch_to_normal(&mut self) {
        debug_assert!(self.mode == Mode::Early, "mode switch is one way");
        self.mode = Mode::Normal;
    }

    /// Number of frames currently on the free stack
    pub fn free_count(&self) -> usize {
        self.count
    }
}

impl Default for PageFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global page-frame allocator
///
/// Initialised during boot: early range set first, then the stack is seeded
/// with `KERNEL_PAGE_STACK_INIT` frames and the mode switched to normal.
pub static PAGE_ALLOCATOR: Mutex<PageFrameAllocator> = Mutex::new(PageFrameAllocator::new());
