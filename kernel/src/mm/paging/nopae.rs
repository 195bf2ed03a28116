//! Classical two-level i686 paging
//!
//! 32-bit entries, 1024 per table, one page directory per address space.
//! Physical addresses are limited to 4 GiB and there is no NX bit.

use bit_field::BitField;

use super::{alloc_table, read_entry, write_entry, PagingRoot, PagingVariant, PtEntry, PteFlags};
use crate::error::KernelResult;
use crate::mm::{PageFrameAllocator, PhysAddr, VirtAddr, KLIMIT};

/// Entries per page table and per page directory
pub const TABLE_ENTRIES: usize = 1024;

/// First page-directory entry of the kernel half
pub const KERNEL_PD_FIRST: usize = KLIMIT >> 22;

/// 32-bit page-table entry
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry32(u32);

impl PtEntry for Entry32 {
    fn new(paddr: PhysAddr, flags: PteFlags) -> Self {
        debug_assert!(paddr.as_u64() < 1 << 32, "frame above 4 GiB without PAE");
        // The NX bit does not exist in this variant; everything else fits
        // the low flag bits.
        let flag_bits = (flags & !PteFlags::NO_EXECUTE).bits() as u32;
        Self((paddr.as_u64() as u32 & 0xffff_f000) | (flag_bits & 0xfff))
    }

    fn zero() -> Self {
        Self(0)
    }

    fn raw(self) -> u64 {
        self.0 as u64
    }

    fn paddr(self) -> PhysAddr {
        PhysAddr::new((self.0 & 0xffff_f000) as u64)
    }

    fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate((self.0 & 0xfff) as u64)
    }
}

/// The classical paging variant
///
/// Holds the template page directory whose kernel half every address space
/// shares. All 256 kernel page tables are preallocated at initialisation so
/// kernel-half directory entries never change after boot, which is what
/// makes kernel mappings visible in every space.
pub struct NoPaePaging {
    template_pd: PhysAddr,
}

impl NoPaePaging {
    pub fn init(frames: &mut PageFrameAllocator) -> KernelResult<Self> {
        let template_pd = alloc_table(frames)?;

        for index in KERNEL_PD_FIRST..TABLE_ENTRIES {
            let table = alloc_table(frames)?;
            write_entry(
                template_pd,
                index,
                Entry32::new(table, PteFlags::PRESENT | PteFlags::WRITABLE),
            );
        }

        Ok(Self { template_pd })
    }

    /// Physical address of the template page directory
    pub fn template_pd(&self) -> PhysAddr {
        self.template_pd
    }
}

impl PagingVariant for NoPaePaging {
    type Entry = Entry32;

    const TABLE_ENTRIES: usize = TABLE_ENTRIES;
    const NX_SUPPORTED: bool = false;

    fn pd_index(vaddr: VirtAddr) -> usize {
        vaddr.as_usize().get_bits(22..32)
    }

    fn pt_index(vaddr: VirtAddr) -> usize {
        vaddr.as_usize().get_bits(12..22)
    }

    fn create_root(&self, frames: &mut PageFrameAllocator) -> KernelResult<PagingRoot> {
        let pd = alloc_table(frames)?;

        // Share the kernel half: the directory entries are copied, so both
        // directories point at the same physical page tables.
        for index in KERNEL_PD_FIRST..TABLE_ENTRIES {
            let entry: Entry32 = read_entry(self.template_pd, index);
            write_entry(pd, index, entry);
        }

        Ok(PagingRoot(pd))
    }

    fn destroy_root(&self, frames: &mut PageFrameAllocator, root: PagingRoot) {
        // Walk only the user half; the kernel half's tables are shared.
        for index in 0..KERNEL_PD_FIRST {
            let entry: Entry32 = read_entry(root.0, index);
            if entry.is_present() {
                frames.free_page(entry.paddr());
            }
        }
        frames.free_page(root.0);
    }

    fn directory(
        &self,
        root: PagingRoot,
        _vaddr: VirtAddr,
        _create: bool,
        _frames: &mut PageFrameAllocator,
    ) -> KernelResult<Option<PhysAddr>> {
        Ok(Some(root.0))
    }

    fn template_root(&self) -> PagingRoot {
        PagingRoot(self.template_pd)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn address_split() {
        let vaddr = VirtAddr::new(0xc040_3123);
        assert_eq!(NoPaePaging::pd_index(vaddr), 0x301);
        assert_eq!(NoPaePaging::pt_index(vaddr), 0x003);
        assert_eq!(vaddr.page_offset(), 0x123);
    }

    #[test]
    fn kernel_half_starts_at_768() {
        assert_eq!(KERNEL_PD_FIRST, 768);
        assert_eq!(NoPaePaging::pd_index(VirtAddr::new(KLIMIT)), 768);
        assert_eq!(NoPaePaging::pd_index(VirtAddr::new(KLIMIT - 1)), 767);
    }

    #[test]
    fn entry_round_trip() {
        let entry = Entry32::new(
            PhysAddr::new(0x1234_5000),
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
        );
        assert_eq!(entry.paddr(), PhysAddr::new(0x1234_5000));
        assert!(entry.is_present());
        assert!(entry.flags().contains(PteFlags::WRITABLE | PteFlags::USER));
    }

    #[test]
    fn nx_is_dropped() {
        let entry = Entry32::new(
            PhysAddr::new(0x1000),
            PteFlags::PRESENT | PteFlags::NO_EXECUTE,
        );
        assert!(!entry.flags().contains(PteFlags::NO_EXECUTE));
    }

    #[test]
    fn prot_none_entry_is_tracked_not_present() {
        let entry = Entry32::new(PhysAddr::new(0x2000), PteFlags::PROT_NONE);
        assert!(!entry.is_present());
        assert!(entry.is_tracked());
        assert_eq!(entry.paddr(), PhysAddr::new(0x2000));
    }
}
