//! Address spaces
//!
//! An address space is one root page table plus the shared kernel upper
//! half. The paging variant selected at boot owns all page-table memory;
//! this module is the kernel-object-facing wrapper plus the global paging
//! singleton.

use spin::Once;

use super::paging::{Paging, PagingRoot, PaePolicy};
use super::{PageFrameAllocator, PhysAddr, Prot, VirtAddr};
use crate::arch::CpuFeatures;
use crate::error::KernelResult;

/// The paging variant selected at boot
///
/// Initialised exactly once, before the first process is created.
static PAGING: Once<Paging> = Once::new();

/// Select and install the paging variant.
///
/// A `Require` policy on a CPU without PAE fails; boot treats the error as
/// fatal.
pub fn init(
    policy: PaePolicy,
    features: CpuFeatures,
    frames: &mut PageFrameAllocator,
) -> KernelResult<()> {
    let paging = Paging::select(policy, features.contains(CpuFeatures::PAE), frames)?;
    log::info!(
        "paging: {} mode",
        if paging.is_pae() { "PAE" } else { "classical" }
    );
    PAGING.call_once(|| paging);
    Ok(())
}

/// The installed paging variant. Panics before [`init`] has run.
pub fn paging() -> &'static Paging {
    PAGING.get().expect("paging not initialised")
}

/// One process's address space
pub struct AddrSpace {
    root: PagingRoot,
}

impl AddrSpace {
    /// Allocate a fresh root sharing the kernel template's upper half.
    pub fn create(paging: &Paging, frames: &mut PageFrameAllocator) -> KernelResult<Self> {
        let root = paging.create_addr_space(frames)?;
        Ok(Self { root })
    }

    /// Free the user half's page tables and the root. Leaf frames stay with
    /// whoever mapped them. Idempotent.
    pub fn destroy(&mut self, paging: &Paging, frames: &mut PageFrameAllocator) {
        if self.root.0.as_u64() == 0 {
            return;
        }
        paging.destroy_addr_space(frames, self.root);
        self.root = PagingRoot(PhysAddr::new(0));
    }

    #[inline]
    pub fn root(&self) -> PagingRoot {
        self.root
    }

    /// Install a contiguous run of user mappings; atomic on failure.
    pub fn map(
        &self,
        paging: &Paging,
        frames: &mut PageFrameAllocator,
        vaddr: VirtAddr,
        length: usize,
        paddr: PhysAddr,
        prot: Prot,
    ) -> KernelResult<()> {
        paging.map_user(frames, self.root, vaddr, length, paddr, prot)
    }

    /// Remove a run of user mappings.
    pub fn unmap(
        &self,
        paging: &Paging,
        frames: &mut PageFrameAllocator,
        vaddr: VirtAddr,
        length: usize,
    ) {
        paging.unmap_user(frames, self.root, vaddr, length)
    }

    /// Share a run of mappings from `src`, without copying frames.
    #[allow(clippy::too_many_arguments)]
    pub fn clone_from(
        &self,
        paging: &Paging,
        frames: &mut PageFrameAllocator,
        dest_vaddr: VirtAddr,
        src: &AddrSpace,
        src_vaddr: VirtAddr,
        length: usize,
        prot: Prot,
    ) -> KernelResult<()> {
        paging.clone_user(
            frames, self.root, dest_vaddr, src.root, src_vaddr, length, prot,
        )
    }

    /// Translate a user virtual address.
    pub fn lookup(
        &self,
        paging: &Paging,
        frames: &mut PageFrameAllocator,
        vaddr: VirtAddr,
    ) -> Option<PhysAddr> {
        paging.lookup_user(frames, self.root, vaddr)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::paging::PteFlags;
    use crate::mm::test_pool::TestPool;
    use crate::mm::{KLIMIT, PAGE_SIZE};

    /// Boot-like setup: paging initialised from an early bump allocator,
    /// then a normal-mode allocator seeded with the remaining frames.
    fn setup(policy: PaePolicy, has_pae: bool) -> (TestPool, Paging, PageFrameAllocator) {
        let pool = TestPool::new(1200);
        let mut early = PageFrameAllocator::new();
        early.set_early_range(pool.frame(0), pool.frame(700));
        let paging = Paging::select(policy, has_pae, &mut early).unwrap();

        let mut frames = PageFrameAllocator::new();
        for i in 700..1200 {
            frames.seed(pool.frame(i));
        }
        frames.switch_to_normal();
        (pool, paging, frames)
    }

    fn setup_nopae() -> (TestPool, Paging, PageFrameAllocator) {
        setup(PaePolicy::Disable, false)
    }

    fn setup_pae() -> (TestPool, Paging, PageFrameAllocator) {
        setup(PaePolicy::Require, true)
    }

    #[test]
    fn pae_selection_matrix() {
        let pool = TestPool::new(1200);

        let mut early = pool.early_allocator();
        assert!(Paging::select(PaePolicy::Require, false, &mut early).is_err());

        let mut early = pool.early_allocator();
        assert!(!Paging::select(PaePolicy::Auto, false, &mut early)
            .unwrap()
            .is_pae());

        let mut early = pool.early_allocator();
        assert!(Paging::select(PaePolicy::Auto, true, &mut early)
            .unwrap()
            .is_pae());

        let mut early = pool.early_allocator();
        assert!(!Paging::select(PaePolicy::Disable, true, &mut early)
            .unwrap()
            .is_pae());
    }

    #[test]
    fn map_unmap_round_trip_nopae() {
        let (_pool, paging, mut frames) = setup_nopae();
        let space = AddrSpace::create(&paging, &mut frames).unwrap();

        let vaddr = VirtAddr::new(0x4000_0000);
        let frame = PhysAddr::new(0x0080_0000);

        assert!(space.lookup(&paging, &mut frames, vaddr).is_none());

        space
            .map(
                &paging,
                &mut frames,
                vaddr,
                PAGE_SIZE,
                frame,
                Prot::READ | Prot::WRITE,
            )
            .unwrap();
        assert_eq!(space.lookup(&paging, &mut frames, vaddr), Some(frame));

        space.unmap(&paging, &mut frames, vaddr, PAGE_SIZE);
        assert!(space.lookup(&paging, &mut frames, vaddr).is_none());
    }

    #[test]
    fn map_unmap_round_trip_pae() {
        let (_pool, paging, mut frames) = setup_pae();
        let space = AddrSpace::create(&paging, &mut frames).unwrap();

        let vaddr = VirtAddr::new(0x4000_0000);
        // A frame above 4 GiB, expressible only with PAE.
        let frame = PhysAddr::new(0x1_0040_0000);

        space
            .map(&paging, &mut frames, vaddr, PAGE_SIZE, frame, Prot::READ)
            .unwrap();
        assert_eq!(space.lookup(&paging, &mut frames, vaddr), Some(frame));

        space.unmap(&paging, &mut frames, vaddr, PAGE_SIZE);
        assert!(space.lookup(&paging, &mut frames, vaddr).is_none());
    }

    #[test]
    fn multi_page_run_translates_contiguously() {
        let (_pool, paging, mut frames) = setup_nopae();
        let space = AddrSpace::create(&paging, &mut frames).unwrap();

        let vaddr = VirtAddr::new(0x1000_0000);
        let frame = PhysAddr::new(0x0200_0000);
        let length = 8 * PAGE_SIZE;

        space
            .map(&paging, &mut frames, vaddr, length, frame, Prot::READ)
            .unwrap();

        for i in 0..8 {
            assert_eq!(
                space.lookup(&paging, &mut frames, vaddr.add(i * PAGE_SIZE)),
                Some(frame.add(i * PAGE_SIZE))
            );
        }

        // Offsets within a page carry through.
        assert_eq!(
            space.lookup(&paging, &mut frames, vaddr.add(PAGE_SIZE + 0x123)),
            Some(frame.add(PAGE_SIZE + 0x123))
        );
    }

    #[test]
    fn create_destroy_leaves_frame_count_unchanged() {
        type Setup = fn() -> (TestPool, Paging, PageFrameAllocator);
        for (pool_setup, name) in [(setup_nopae as Setup, "nopae"), (setup_pae as Setup, "pae")] {
            let (_pool, paging, mut frames) = pool_setup();
            let before = frames.free_count();

            let mut space = AddrSpace::create(&paging, &mut frames).unwrap();
            space
                .map(
                    &paging,
                    &mut frames,
                    VirtAddr::new(0x1000_0000),
                    4 * PAGE_SIZE,
                    PhysAddr::new(0x0200_0000),
                    Prot::READ | Prot::WRITE,
                )
                .unwrap();
            space.destroy(&paging, &mut frames);

            assert_eq!(frames.free_count(), before, "frame leak in {name} mode");
        }
    }

    #[test]
    fn kernel_half_is_shared_between_spaces() {
        type Setup = fn() -> (TestPool, Paging, PageFrameAllocator);
        for setup_fn in [setup_nopae as Setup, setup_pae as Setup] {
            let (_pool, paging, mut frames) = setup_fn();

            let a = AddrSpace::create(&paging, &mut frames).unwrap();
            let b = AddrSpace::create(&paging, &mut frames).unwrap();
            assert!(paging.kernel_half_shared(a.root()));
            assert!(paging.kernel_half_shared(b.root()));
        }
    }

    #[test]
    fn kernel_mapping_round_trip() {
        let (_pool, paging, _frames) = setup_nopae();

        let vaddr = VirtAddr::new(KLIMIT + 0x20_0000);
        let frame = PhysAddr::new(0x0030_0000);

        assert!(paging.lookup_kernel(vaddr).is_none());
        paging.map_kernel(vaddr, frame, Prot::READ | Prot::WRITE);
        assert_eq!(paging.lookup_kernel(vaddr), Some(frame));

        paging.unmap_kernel(vaddr);
        assert!(paging.lookup_kernel(vaddr).is_none());
    }

    #[test]
    fn prot_none_tracks_without_present() {
        let (_pool, paging, mut frames) = setup_pae();
        let space = AddrSpace::create(&paging, &mut frames).unwrap();

        let vaddr = VirtAddr::new(0x2000_0000);
        let frame = PhysAddr::new(0x0040_0000);

        space
            .map(&paging, &mut frames, vaddr, PAGE_SIZE, frame, Prot::NONE)
            .unwrap();

        // Still tracked for bookkeeping, so the translation exists.
        assert_eq!(space.lookup(&paging, &mut frames, vaddr), Some(frame));

        let flags = paging
            .user_entry_flags(&mut frames, space.root(), vaddr)
            .unwrap();
        assert!(flags.contains(PteFlags::PROT_NONE));
        assert!(!flags.contains(PteFlags::PRESENT));
    }

    #[test]
    fn protection_transition_keeps_the_frame() {
        let (_pool, paging, mut frames) = setup_nopae();
        let space = AddrSpace::create(&paging, &mut frames).unwrap();

        let vaddr = VirtAddr::new(0x3000_0000);
        let frame = PhysAddr::new(0x0050_0000);

        space
            .map(
                &paging,
                &mut frames,
                vaddr,
                PAGE_SIZE,
                frame,
                Prot::READ | Prot::WRITE,
            )
            .unwrap();
        let writable = paging
            .user_entry_flags(&mut frames, space.root(), vaddr)
            .unwrap();
        assert!(writable.contains(PteFlags::WRITABLE));

        space
            .map(&paging, &mut frames, vaddr, PAGE_SIZE, frame, Prot::READ)
            .unwrap();
        let readonly = paging
            .user_entry_flags(&mut frames, space.root(), vaddr)
            .unwrap();
        assert!(!readonly.contains(PteFlags::WRITABLE));
        assert_eq!(space.lookup(&paging, &mut frames, vaddr), Some(frame));
    }

    #[test]
    fn nx_applied_only_with_pae() {
        let vaddr = VirtAddr::new(0x2800_0000);
        let frame = PhysAddr::new(0x0060_0000);

        let (_pool, paging, mut frames) = setup_pae();
        let space = AddrSpace::create(&paging, &mut frames).unwrap();
        space
            .map(&paging, &mut frames, vaddr, PAGE_SIZE, frame, Prot::READ)
            .unwrap();
        let flags = paging
            .user_entry_flags(&mut frames, space.root(), vaddr)
            .unwrap();
        assert!(flags.contains(PteFlags::NO_EXECUTE));

        let (_pool, paging, mut frames) = setup_nopae();
        let space = AddrSpace::create(&paging, &mut frames).unwrap();
        space
            .map(&paging, &mut frames, vaddr, PAGE_SIZE, frame, Prot::READ)
            .unwrap();
        let flags = paging
            .user_entry_flags(&mut frames, space.root(), vaddr)
            .unwrap();
        assert!(!flags.contains(PteFlags::NO_EXECUTE));
    }

    #[test]
    fn clone_shares_frames_with_reduced_protection() {
        let (_pool, paging, mut frames) = setup_nopae();
        let src = AddrSpace::create(&paging, &mut frames).unwrap();
        let dest = AddrSpace::create(&paging, &mut frames).unwrap();

        let src_vaddr = VirtAddr::new(0x1000_0000);
        let dest_vaddr = VirtAddr::new(0x5000_0000);
        let frame = PhysAddr::new(0x0070_0000);

        src.map(
            &paging,
            &mut frames,
            src_vaddr,
            2 * PAGE_SIZE,
            frame,
            Prot::READ | Prot::WRITE,
        )
        .unwrap();

        dest.clone_from(
            &paging,
            &mut frames,
            dest_vaddr,
            &src,
            src_vaddr,
            2 * PAGE_SIZE,
            Prot::READ,
        )
        .unwrap();

        // Same frames, no copy.
        assert_eq!(
            dest.lookup(&paging, &mut frames, dest_vaddr),
            src.lookup(&paging, &mut frames, src_vaddr)
        );
        let flags = paging
            .user_entry_flags(&mut frames, dest.root(), dest_vaddr)
            .unwrap();
        assert!(!flags.contains(PteFlags::WRITABLE));
    }

    #[test]
    fn failed_map_rolls_back_installed_pages() {
        let (_pool, paging, mut frames) = setup_nopae();
        let space = AddrSpace::create(&paging, &mut frames).unwrap();

        // Starve the allocator down to a single frame. The run below spans
        // two page-directory entries, so it needs two page tables.
        while frames.free_count() > 1 {
            frames.alloc_page().unwrap();
        }

        let vaddr = VirtAddr::new(0x403f_f000);
        let result = space.map(
            &paging,
            &mut frames,
            vaddr,
            2 * PAGE_SIZE,
            PhysAddr::new(0x0090_0000),
            Prot::READ,
        );
        assert!(result.is_err());

        // Nothing from the failed run remains mapped.
        assert!(space.lookup(&paging, &mut frames, vaddr).is_none());
        assert!(space
            .lookup(&paging, &mut frames, vaddr.add(PAGE_SIZE))
            .is_none());
    }
}
