//! Page-table management
//!
//! Two paging variants exist on i686: classical two-level paging with 32-bit
//! entries, and PAE three-level paging with 64-bit entries. One of them is
//! selected at boot and never changes; each variant is a monomorphic
//! implementation of [`PagingVariant`] behind the small dispatching
//! [`Paging`] enum, so the hot mapping path has no indirect calls.
//!
//! Page tables are only ever accessed through the permanent direct mapping
//! of RAM in the kernel upper half; there is no recursive self-mapping.

pub mod nopae;
pub mod pae;

use bitflags::bitflags;

use crate::arch::tlb;
use crate::error::{Errno, KernelResult};
use crate::mm::{phys_to_virt, PageFrameAllocator, PhysAddr, Prot, VirtAddr, PAGE_SIZE};

pub use nopae::NoPaePaging;
pub use pae::PaePaging;

bitflags! {
    /// Architectural page-table entry flags
    ///
    /// Bit positions follow the hardware layout so an entry's raw value is
    /// simply the frame address or'ed with the flag bits. `PROT_NONE` is the
    /// kernel-reserved "ignored" bit marking a mapping that is tracked for
    /// bookkeeping but faults on every access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const GLOBAL        = 1 << 8;
        const PROT_NONE     = 1 << 9;
        /// PAE only; silently dropped by the classical variant
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PteFlags {
    /// Whether the entry participates in address translation bookkeeping
    #[inline]
    pub fn is_tracked(self) -> bool {
        self.intersects(PteFlags::PRESENT | PteFlags::PROT_NONE)
    }
}

/// Translate mapping protections into entry flags.
///
/// Write implies the writable bit; absence of exec becomes NX where the
/// variant supports it; the empty protection set becomes the tracked-but-
/// faulting `PROT_NONE` encoding. Kernel mappings are global, user mappings
/// user-accessible.
pub fn prot_to_flags(prot: Prot, user: bool, nx_supported: bool) -> PteFlags {
    if prot.is_empty() {
        let mut flags = PteFlags::PROT_NONE;
        if user {
            flags |= PteFlags::USER;
        }
        return flags;
    }

    let mut flags = PteFlags::PRESENT;
    if prot.contains(Prot::WRITE) {
        flags |= PteFlags::WRITABLE;
    }
    if user {
        flags |= PteFlags::USER;
    } else {
        flags |= PteFlags::GLOBAL;
    }
    if nx_supported && !prot.contains(Prot::EXEC) {
        flags |= PteFlags::NO_EXECUTE;
    }
    flags
}

/// One page-table entry, 32 or 64 bits wide depending on the variant
pub trait PtEntry: Copy + Eq {
    fn new(paddr: PhysAddr, flags: PteFlags) -> Self;
    fn zero() -> Self;
    fn raw(self) -> u64;
    fn paddr(self) -> PhysAddr;
    fn flags(self) -> PteFlags;

    #[inline]
    fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// Present, or mapped-but-prot-none
    #[inline]
    fn is_tracked(self) -> bool {
        self.flags().is_tracked()
    }
}

/// Root of one address space's page tables
///
/// The page directory for the classical variant, the page-directory-pointer
/// table for PAE. The raw value is what CR3 is loaded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingRoot(pub PhysAddr);

impl PagingRoot {
    #[inline]
    pub fn cr3_value(self) -> u64 {
        self.0.as_u64()
    }
}

/// One paging variant's structure: table geometry, root lifecycle, and the
/// location of the page directory covering a given address.
///
/// The generic walkers below implement mapping, unmapping, lookup and
/// cloning on top of these operations; they are monomorphised per variant.
pub trait PagingVariant {
    type Entry: PtEntry;

    /// Entries per page table and per page directory
    const TABLE_ENTRIES: usize;

    /// Whether entries carry the NX bit
    const NX_SUPPORTED: bool;

    fn pd_index(vaddr: VirtAddr) -> usize;
    fn pt_index(vaddr: VirtAddr) -> usize;

    /// Create a root whose kernel half shares the template's page tables.
    fn create_root(&self, frames: &mut PageFrameAllocator) -> KernelResult<PagingRoot>;

    /// Free the user half's page tables and the root itself. Leaf frames
    /// are not freed; they belong to whoever mapped them.
    fn destroy_root(&self, frames: &mut PageFrameAllocator, root: PagingRoot);

    /// Physical address of the page directory covering `vaddr` in `root`,
    /// allocating it on demand when `create` is set (PAE only; the
    /// classical variant has a single directory).
    fn directory(
        &self,
        root: PagingRoot,
        vaddr: VirtAddr,
        create: bool,
        frames: &mut PageFrameAllocator,
    ) -> KernelResult<Option<PhysAddr>>;

    /// Root of the kernel template, used by kernel-half operations.
    fn template_root(&self) -> PagingRoot;
}

/// Allocate one zeroed page-table page.
pub(super) fn alloc_table(frames: &mut PageFrameAllocator) -> KernelResult<PhysAddr> {
    let page = frames.alloc_page().ok_or(Errno::NoMemory)?;
    // SAFETY: the frame was just handed out and is unaliased.
    unsafe { core::ptr::write_bytes(phys_to_virt(page), 0, PAGE_SIZE) };
    Ok(page)
}

/// Pointer to the entry at `index` of the table page at `table`.
///
/// # Safety
///
/// `table` must be a live table page of entry type `E` and `index` within
/// the variant's table geometry.
unsafe fn entry_ptr<E: PtEntry>(table: PhysAddr, index: usize) -> *mut E {
    // SAFETY: per contract, the offset stays within one page.
    unsafe { phys_to_virt(table).cast::<E>().add(index) }
}

/// Read the entry at `index` of `table`.
fn read_entry<E: PtEntry>(table: PhysAddr, index: usize) -> E {
    // SAFETY: callers pass tables obtained from a live root walk.
    unsafe { entry_ptr::<E>(table, index).read() }
}

/// Write the entry at `index` of `table`.
fn write_entry<E: PtEntry>(table: PhysAddr, index: usize, entry: E) {
    // SAFETY: callers pass tables obtained from a live root walk.
    unsafe { entry_ptr::<E>(table, index).write(entry) }
}

/// Install a single mapping. Allocates the intermediate page table on first
/// access; an existing entry is overwritten.
fn map_page<V: PagingVariant>(
    variant: &V,
    root: PagingRoot,
    vaddr: VirtAddr,
    paddr: PhysAddr,
    flags: PteFlags,
    frames: &mut PageFrameAllocator,
) -> KernelResult<()> {
    let dir = variant
        .directory(root, vaddr, true, frames)?
        .expect("directory walk with create cannot miss");

    let pde: V::Entry = read_entry(dir, V::pd_index(vaddr));
    let table = if pde.is_present() {
        pde.paddr()
    } else {
        let table = alloc_table(frames)?;
        let mut pde_flags = PteFlags::PRESENT | PteFlags::WRITABLE;
        if vaddr.is_user() {
            pde_flags |= PteFlags::USER;
        }
        write_entry(dir, V::pd_index(vaddr), V::Entry::new(table, pde_flags));
        table
    };

    write_entry(table, V::pt_index(vaddr), V::Entry::new(paddr, flags));
    tlb::invlpg(vaddr);
    Ok(())
}

/// Remove a single mapping. Empty intermediate tables are deliberately left
/// in place: they cannot be reused for a different purpose and freeing them
/// would race the page-fault path.
fn unmap_page<V: PagingVariant>(
    variant: &V,
    root: PagingRoot,
    vaddr: VirtAddr,
    frames: &mut PageFrameAllocator,
) -> bool {
    let dir = match variant.directory(root, vaddr, false, frames) {
        Ok(Some(dir)) => dir,
        _ => return false,
    };

    let pde: V::Entry = read_entry(dir, V::pd_index(vaddr));
    if !pde.is_present() {
        return false;
    }

    let table = pde.paddr();
    let pte: V::Entry = read_entry(table, V::pt_index(vaddr));
    if !pte.is_tracked() {
        return false;
    }

    write_entry(table, V::pt_index(vaddr), V::Entry::zero());
    tlb::invlpg(vaddr);
    true
}

/// Translate `vaddr` through `root`.
fn lookup_page<V: PagingVariant>(
    variant: &V,
    root: PagingRoot,
    vaddr: VirtAddr,
    frames: &mut PageFrameAllocator,
) -> Option<(PhysAddr, PteFlags)> {
    let dir = variant.directory(root, vaddr, false, frames).ok()??;

    let pde: V::Entry = read_entry(dir, V::pd_index(vaddr));
    if !pde.is_present() {
        return None;
    }

    let pte: V::Entry = read_entry(pde.paddr(), V::pt_index(vaddr));
    if !pte.is_tracked() {
        return None;
    }
    Some((pte.paddr().add(vaddr.page_offset()), pte.flags()))
}

/// Install a contiguous run of user mappings.
///
/// Atomic: when page-table allocation fails partway, the pages this call
/// already installed are unmapped before the error is returned.
fn map_user_range<V: PagingVariant>(
    variant: &V,
    root: PagingRoot,
    vaddr: VirtAddr,
    length: usize,
    paddr: PhysAddr,
    prot: Prot,
    frames: &mut PageFrameAllocator,
) -> KernelResult<()> {
    assert!(vaddr.is_user(), "map_user into the kernel half");
    assert!(vaddr.is_page_aligned() && paddr.is_page_aligned());
    assert!(
        vaddr.as_usize() + length <= crate::mm::KLIMIT,
        "map_user run crosses into the kernel half"
    );

    let flags = prot_to_flags(prot, true, V::NX_SUPPORTED);
    let pages = length / PAGE_SIZE;

    for i in 0..pages {
        let page_vaddr = vaddr.add(i * PAGE_SIZE);
        let page_paddr = paddr.add(i * PAGE_SIZE);
        if let Err(errno) = map_page(variant, root, page_vaddr, page_paddr, flags, frames) {
            for j in 0..i {
                unmap_page(variant, root, vaddr.add(j * PAGE_SIZE), frames);
            }
            return Err(errno);
        }
    }
    Ok(())
}

/// Remove a run of user mappings.
fn unmap_user_range<V: PagingVariant>(
    variant: &V,
    root: PagingRoot,
    vaddr: VirtAddr,
    length: usize,
    frames: &mut PageFrameAllocator,
) {
    assert!(vaddr.is_user(), "unmap_user in the kernel half");
    assert!(vaddr.is_page_aligned());

    for i in 0..length / PAGE_SIZE {
        unmap_page(variant, root, vaddr.add(i * PAGE_SIZE), frames);
    }
}

/// Duplicate a run of mappings across address spaces, sharing the frames.
///
/// Source pages that are not mapped are skipped. Subject to the same
/// atomicity rule as [`map_user_range`].
#[allow(clippy::too_many_arguments)]
fn clone_user_range<V: PagingVariant>(
    variant: &V,
    dest_root: PagingRoot,
    dest_vaddr: VirtAddr,
    src_root: PagingRoot,
    src_vaddr: VirtAddr,
    length: usize,
    prot: Prot,
    frames: &mut PageFrameAllocator,
) -> KernelResult<()> {
    assert!(dest_vaddr.is_user() && src_vaddr.is_user());
    assert!(dest_vaddr.is_page_aligned() && src_vaddr.is_page_aligned());

    let flags = prot_to_flags(prot, true, V::NX_SUPPORTED);
    let pages = length / PAGE_SIZE;

    for i in 0..pages {
        let offset = i * PAGE_SIZE;
        let frame = match lookup_page(variant, src_root, src_vaddr.add(offset), frames) {
            Some((paddr, _)) => PhysAddr::new(paddr.as_u64() & !(crate::mm::PAGE_MASK as u64)),
            None => continue,
        };

        if let Err(errno) = map_page(variant, dest_root, dest_vaddr.add(offset), frame, flags, frames)
        {
            unmap_user_range(variant, dest_root, dest_vaddr, offset, frames);
            return Err(errno);
        }
    }
    Ok(())
}

/// PAE policy requested on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaePolicy {
    /// PAE iff the CPU reports support
    #[default]
    Auto,
    /// Classical two-level paging regardless of CPU support
    Disable,
    /// PAE or refuse to boot
    Require,
}

/// The selected paging variant
pub enum Paging {
    NoPae(NoPaePaging),
    Pae(PaePaging),
}

impl Paging {
    /// Select and initialise the paging variant for this boot.
    ///
    /// Fails with `ENOTSUP` when PAE is required but the CPU lacks it; boot
    /// treats that as fatal.
    pub fn select(
        policy: PaePolicy,
        cpu_has_pae: bool,
        frames: &mut PageFrameAllocator,
    ) -> KernelResult<Self> {
        match policy {
            PaePolicy::Require if !cpu_has_pae => Err(Errno::NotSupported),
            PaePolicy::Disable => Ok(Self::NoPae(NoPaePaging::init(frames)?)),
            PaePolicy::Auto if !cpu_has_pae => Ok(Self::NoPae(NoPaePaging::init(frames)?)),
            _ => Ok(Self::Pae(PaePaging::init(frames)?)),
        }
    }

    pub fn is_pae(&self) -> bool {
        matches!(self, Self::Pae(_))
    }

    pub fn create_addr_space(&self, frames: &mut PageFrameAllocator) -> KernelResult<PagingRoot> {
        match self {
            Self::NoPae(v) => v.create_root(frames),
            Self::Pae(v) => v.create_root(frames),
        }
    }

    pub fn destroy_addr_space(&self, frames: &mut PageFrameAllocator, root: PagingRoot) {
        match self {
            Self::NoPae(v) => v.destroy_root(frames, root),
            Self::Pae(v) => v.destroy_root(frames, root),
        }
    }

    /// Install a mapping in the shared kernel half, visible in every
    /// address space. Panics when `vaddr` is not a kernel address.
    pub fn map_kernel(&self, vaddr: VirtAddr, paddr: PhysAddr, prot: Prot) {
        assert!(vaddr.is_kernel(), "map_kernel below KLIMIT");
        assert!(vaddr.is_page_aligned() && paddr.is_page_aligned());

        // The kernel half's page tables are preallocated at boot, so this
        // cannot need memory; the dummy allocator enforces that.
        let mut no_frames = PageFrameAllocator::new();
        match self {
            Self::NoPae(v) => {
                let flags = prot_to_flags(prot, false, NoPaePaging::NX_SUPPORTED);
                map_page(v, v.template_root(), vaddr, paddr, flags, &mut no_frames)
            }
            Self::Pae(v) => {
                let flags = prot_to_flags(prot, false, PaePaging::NX_SUPPORTED);
                map_page(v, v.template_root(), vaddr, paddr, flags, &mut no_frames)
            }
        }
        .expect("kernel page tables are preallocated");
    }

    /// Remove a kernel mapping and invalidate the TLB entry.
    pub fn unmap_kernel(&self, vaddr: VirtAddr) {
        assert!(vaddr.is_kernel(), "unmap_kernel below KLIMIT");

        let mut no_frames = PageFrameAllocator::new();
        match self {
            Self::NoPae(v) => {
                unmap_page(v, v.template_root(), vaddr, &mut no_frames);
            }
            Self::Pae(v) => {
                unmap_page(v, v.template_root(), vaddr, &mut no_frames);
            }
        }
    }

    /// Translate a kernel virtual address.
    pub fn lookup_kernel(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        assert!(vaddr.is_kernel(), "lookup_kernel below KLIMIT");

        let mut no_frames = PageFrameAllocator::new();
        match self {
            Self::NoPae(v) => {
                lookup_page(v, v.template_root(), vaddr, &mut no_frames).map(|(p, _)| p)
            }
            Self::Pae(v) => lookup_page(v, v.template_root(), vaddr, &mut no_frames).map(|(p, _)| p),
        }
    }

    pub fn map_user(
        &self,
        frames: &mut PageFrameAllocator,
        root: PagingRoot,
        vaddr: VirtAddr,
        length: usize,
        paddr: PhysAddr,
        prot: Prot,
    ) -> KernelResult<()> {
        match self {
            Self::NoPae(v) => map_user_range(v, root, vaddr, length, paddr, prot, frames),
            Self::Pae(v) => map_user_range(v, root, vaddr, length, paddr, prot, frames),
        }
    }

    pub fn unmap_user(
        &self,
        frames: &mut PageFrameAllocator,
        root: PagingRoot,
        vaddr: VirtAddr,
        length: usize,
    ) {
        match self {
            Self::NoPae(v) => unmap_user_range(v, root, vaddr, length, frames),
            Self::Pae(v) => unmap_user_range(v, root, vaddr, length, frames),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn clone_user(
        &self,
        frames: &mut PageFrameAllocator,
        dest_root: PagingRoot,
        dest_vaddr: VirtAddr,
        src_root: PagingRoot,
        src_vaddr: VirtAddr,
        length: usize,
        prot: Prot,
    ) -> KernelResult<()> {
        match self {
            Self::NoPae(v) => clone_user_range(
                v, dest_root, dest_vaddr, src_root, src_vaddr, length, prot, frames,
            ),
            Self::Pae(v) => clone_user_range(
                v, dest_root, dest_vaddr, src_root, src_vaddr, length, prot, frames,
            ),
        }
    }

    /// Translate a user virtual address through `root`.
    pub fn lookup_user(
        &self,
        frames: &mut PageFrameAllocator,
        root: PagingRoot,
        vaddr: VirtAddr,
    ) -> Option<PhysAddr> {
        match self {
            Self::NoPae(v) => lookup_page(v, root, vaddr, frames).map(|(p, _)| p),
            Self::Pae(v) => lookup_page(v, root, vaddr, frames).map(|(p, _)| p),
        }
    }

    /// Whether `root`'s kernel half references the same physical page
    /// tables as the kernel template.
    ///
    /// Holds for every address space by construction; this is the
    /// diagnostic check behind that invariant.
    pub fn kernel_half_shared(&self, root: PagingRoot) -> bool {
        match self {
            Self::NoPae(v) => (nopae::KERNEL_PD_FIRST..nopae::TABLE_ENTRIES).all(|index| {
                let ours: nopae::Entry32 = read_entry(root.0, index);
                let template: nopae::Entry32 = read_entry(v.template_pd(), index);
                ours == template
            }),
            Self::Pae(v) => {
                let pdpte: pae::Entry64 = read_entry(root.0, pae::KERNEL_PDPT_INDEX);
                pdpte.is_present() && pdpte.paddr() == v.kernel_pd()
            }
        }
    }

    /// Flags of the entry mapping `vaddr`, for diagnostics and tests.
    pub fn user_entry_flags(
        &self,
        frames: &mut PageFrameAllocator,
        root: PagingRoot,
        vaddr: VirtAddr,
    ) -> Option<PteFlags> {
        match self {
            Self::NoPae(v) => lookup_page(v, root, vaddr, frames).map(|(_, f)| f),
            Self::Pae(v) => lookup_page(v, root, vaddr, frames).map(|(_, f)| f),
        }
    }
}
