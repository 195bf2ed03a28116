//! TLB invalidation
//!
//! Single-page `invlpg` after every mapping mutation; a full CR3 reload when
//! PAE page-directory-pointer entries change.

use crate::mm::{PhysAddr, VirtAddr};

/// Invalidate the TLB entry for one page on the current CPU.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn invlpg(vaddr: VirtAddr) {
    // SAFETY: invlpg is always safe; it only drops a TLB entry.
    unsafe {
        core::arch::asm!("invlpg [{0}]", in(reg) vaddr.as_usize(), options(nostack, preserves_flags));
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn invlpg(_vaddr: VirtAddr) {}

/// Reload CR3 with its current value, flushing all non-global TLB entries.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn reload_cr3() {
    // SAFETY: writing back the current CR3 value only flushes the TLB.
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn reload_cr3() {}

/// Load a new address-space root into CR3.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn load_root(root: PhysAddr) {
    // SAFETY: the caller guarantees root names a valid page directory (or
    // PDPT in PAE mode) whose kernel half maps the executing code.
    unsafe {
        core::arch::asm!("mov cr3, {0}", in(reg) root.as_u64() as u32, options(nostack, preserves_flags));
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn load_root(_root: PhysAddr) {}
