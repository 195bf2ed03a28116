//! PAE three-level i686 paging
//!
//! 64-bit entries, 512 per table, a four-entry page-directory-pointer table
//! as the root. Physical addresses may exceed 4 GiB and the NX bit is
//! available. The kernel half is exactly the fourth gigabyte, so one shared
//! kernel page directory covers it.

use bit_field::BitField;
use spin::Mutex;

use super::{alloc_table, read_entry, write_entry, PagingRoot, PagingVariant, PtEntry, PteFlags};
use crate::arch::tlb;
use crate::error::{Errno, KernelResult};
use crate::mm::slab::{SlabCache, SlabFlags};
use crate::mm::{phys_to_virt, virt_to_phys, PageFrameAllocator, PhysAddr, VirtAddr, KLIMIT};

/// Entries per page table and per page directory
pub const TABLE_ENTRIES: usize = 512;

/// Entries in the page-directory-pointer table
pub const PDPT_ENTRIES: usize = 4;

/// The PDPT entry covering the kernel half (the fourth gigabyte)
pub const KERNEL_PDPT_INDEX: usize = KLIMIT >> 30;

/// 64-bit page-table entry
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry64(u64);

impl PtEntry for Entry64 {
    fn new(paddr: PhysAddr, flags: PteFlags) -> Self {
        Self((paddr.as_u64() & 0x000f_ffff_ffff_f000) | flags.bits())
    }

    fn zero() -> Self {
        Self(0)
    }

    fn raw(self) -> u64 {
        self.0
    }

    fn paddr(self) -> PhysAddr {
        PhysAddr::new(self.0 & 0x000f_ffff_ffff_f000)
    }

    fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & (0xfff | PteFlags::NO_EXECUTE.bits()))
    }
}

/// The PAE paging variant
///
/// Page-directory-pointer tables are 32-byte objects with their own slab
/// cache; the kernel page directory and all of its page tables are
/// preallocated at initialisation, so PDPT entry 3 is identical in every
/// address space and kernel directory entries never change after boot.
pub struct PaePaging {
    kernel_pd: PhysAddr,
    template_pdpt: PhysAddr,
    pdpt_cache: Mutex<SlabCache>,
}

impl PaePaging {
    pub fn init(frames: &mut PageFrameAllocator) -> KernelResult<Self> {
        let kernel_pd = alloc_table(frames)?;

        for index in 0..TABLE_ENTRIES {
            let table = alloc_table(frames)?;
            write_entry(
                kernel_pd,
                index,
                Entry64::new(table, PteFlags::PRESENT | PteFlags::WRITABLE),
            );
        }

        let mut pdpt_cache = SlabCache::new("pdpt", 32, 32, None, None, SlabFlags::ZERO);
        let template_pdpt = Self::alloc_pdpt(&mut pdpt_cache, kernel_pd, frames)?;

        Ok(Self {
            kernel_pd,
            template_pdpt,
            pdpt_cache: Mutex::new(pdpt_cache),
        })
    }

    /// Physical address of the shared kernel page directory
    pub fn kernel_pd(&self) -> PhysAddr {
        self.kernel_pd
    }

    fn alloc_pdpt(
        cache: &mut SlabCache,
        kernel_pd: PhysAddr,
        frames: &mut PageFrameAllocator,
    ) -> KernelResult<PhysAddr> {
        let obj = cache.alloc(frames).ok_or(Errno::NoMemory)?;
        let pdpt = virt_to_phys(obj.as_ptr());

        for index in 0..PDPT_ENTRIES - 1 {
            write_entry(pdpt, index, Entry64::zero());
        }
        write_entry(
            pdpt,
            KERNEL_PDPT_INDEX,
            Entry64::new(kernel_pd, PteFlags::PRESENT),
        );

        Ok(pdpt)
    }
}

impl PagingVariant for PaePaging {
    type Entry = Entry64;

    const TABLE_ENTRIES: usize = TABLE_ENTRIES;
    const NX_SUPPORTED: bool = true;

    fn pd_index(vaddr: VirtAddr) -> usize {
        vaddr.as_usize().get_bits(21..30)
    }

    fn pt_index(vaddr: VirtAddr) -> usize {
        vaddr.as_usize().get_bits(12..21)
    }

    fn create_root(&self, frames: &mut PageFrameAllocator) -> KernelResult<PagingRoot> {
        let mut cache = self.pdpt_cache.lock();
        let pdpt = Self::alloc_pdpt(&mut cache, self.kernel_pd, frames)?;
        Ok(PagingRoot(pdpt))
    }

    fn destroy_root(&self, frames: &mut PageFrameAllocator, root: PagingRoot) {
        // Walk only the user-half directories; the kernel directory behind
        // entry 3 is shared.
        for pdpt_index in 0..KERNEL_PDPT_INDEX {
            let pdpte: Entry64 = read_entry(root.0, pdpt_index);
            if !pdpte.is_present() {
                continue;
            }

            let pd = pdpte.paddr();
            for pd_index in 0..TABLE_ENTRIES {
                let pde: Entry64 = read_entry(pd, pd_index);
                if pde.is_present() {
                    frames.free_page(pde.paddr());
                }
            }
            frames.free_page(pd);
        }

        let obj = core::ptr::NonNull::new(phys_to_virt(root.0)).unwrap();
        self.pdpt_cache.lock().free(obj);
    }

    fn directory(
        &self,
        root: PagingRoot,
        vaddr: VirtAddr,
        create: bool,
        frames: &mut PageFrameAllocator,
    ) -> KernelResult<Option<PhysAddr>> {
        let pdpt_index = vaddr.as_usize() >> 30;
        let pdpte: Entry64 = read_entry(root.0, pdpt_index);

        if pdpte.is_present() {
            return Ok(Some(pdpte.paddr()));
        }
        if !create {
            return Ok(None);
        }

        let pd = alloc_table(frames)?;
        write_entry(root.0, pdpt_index, Entry64::new(pd, PteFlags::PRESENT));
        // The processor caches PDPT entries when CR3 is loaded, so changing
        // one requires a full reload rather than an invlpg.
        tlb::reload_cr3();
        Ok(Some(pd))
    }

    fn template_root(&self) -> PagingRoot {
        PagingRoot(self.template_pdpt)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn address_split() {
        let vaddr = VirtAddr::new(0x4060_5234);
        assert_eq!(vaddr.as_usize() >> 30, 1);
        assert_eq!(PaePaging::pd_index(vaddr), 0x003);
        assert_eq!(PaePaging::pt_index(vaddr), 0x005);
        assert_eq!(vaddr.page_offset(), 0x234);
    }

    #[test]
    fn kernel_half_is_the_fourth_gigabyte() {
        assert_eq!(KERNEL_PDPT_INDEX, 3);
        assert_eq!(VirtAddr::new(KLIMIT).as_usize() >> 30, 3);
        assert_eq!(VirtAddr::new(KLIMIT - 1).as_usize() >> 30, 2);
    }

    #[test]
    fn entry_round_trip_above_4g() {
        let paddr = PhysAddr::new(0x1_2345_6000);
        let entry = Entry64::new(paddr, PteFlags::PRESENT | PteFlags::NO_EXECUTE);
        assert_eq!(entry.paddr(), paddr);
        assert!(entry.flags().contains(PteFlags::NO_EXECUTE));
    }

    #[test]
    fn flags_do_not_bleed_into_address() {
        let entry = Entry64::new(
            PhysAddr::new(0x8000),
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER | PteFlags::NO_EXECUTE,
        );
        assert_eq!(entry.paddr(), PhysAddr::new(0x8000));
        assert_eq!(entry.raw() & 0x7, 0x7);
    }
}
