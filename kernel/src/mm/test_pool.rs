//! Page-frame pool backing mm unit tests on the host target
//!
//! On the host, `phys_to_virt` is the identity, so frames carved out of an
//! ordinary page-aligned allocation behave exactly like physical frames.
//! The backing memory is intentionally leaked: frames may still be
//! referenced by structures that outlive the pool binding.

use super::{virt_to_phys, PageFrameAllocator, PhysAddr, PAGE_SIZE};

pub struct TestPool {
    base: *mut u8,
    pages: usize,
}

// SAFETY: the pool only hands out addresses; all access goes through the
// structures under test.
unsafe impl Send for TestPool {}
// SAFETY: same reasoning as Send.
unsafe impl Sync for TestPool {}

impl TestPool {
    pub fn new(pages: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout has non-zero size and page alignment.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null(), "test pool allocation failed");
        Self { base, pages }
    }

    pub fn base(&self) -> PhysAddr {
        virt_to_phys(self.base)
    }

    pub fn limit(&self) -> PhysAddr {
        self.base().add(self.pages * PAGE_SIZE)
    }

    pub fn frame(&self, index: usize) -> PhysAddr {
        assert!(index < self.pages);
        self.base().add(index * PAGE_SIZE)
    }

    /// Seed `alloc` with every frame of the pool and switch it to normal
    /// mode, mirroring the boot sequence.
    pub fn seed_all(&self, alloc: &mut PageFrameAllocator) {
        for i in 0..self.pages {
            alloc.seed(self.frame(i));
        }
        alloc.switch_to_normal();
    }

    /// Allocator running in early mode over the whole pool
    pub fn early_allocator(&self) -> PageFrameAllocator {
        let mut alloc = PageFrameAllocator::new();
        alloc.set_early_range(self.base(), self.limit());
        alloc
    }
}
