//! Kernel binary entry
//!
//! The platform bring-up code (boot protocol parsing, console drivers,
//! interrupt controllers, GDT/IDT) runs first and calls [`kernel_main`]
//! with the validated boot-information record.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod boot {
    use core::sync::atomic::{AtomicU8, Ordering};

    use helium_kernel::arch::{self, SyscallMechanism};
    use helium_kernel::bootinfo::{self, BootInfo, MemoryKind};
    use helium_kernel::cmdline::{self, PanicAction};
    use helium_kernel::mm::addr_space;
    use helium_kernel::mm::pfalloc::KERNEL_PAGE_STACK_INIT;
    use helium_kernel::mm::{phys_to_virt, PhysAddr, VirtAddr, PAGE_ALLOCATOR, PAGE_SIZE};
    use helium_kernel::object::descriptor::Descriptor;
    use helium_kernel::object::ObjRef;
    use helium_kernel::process::thread::{construct_thread, ThreadParams};
    use helium_kernel::process::{self, MAIN_THREAD_FD, SELF_PROCESS_FD};
    use helium_kernel::sched::SCHEDULER;
    use helium_kernel::{logging, println};

    /// Kernel heap size, carved from the early allocator
    const KERNEL_HEAP_PAGES: usize = 256;

    /// The user-space loader is linked at a fixed address; the bring-up
    /// code has already copied its image there.
    const LOADER_ENTRY: usize = 0x0800_0000;
    const LOADER_STACK: usize = 0x3000_0000;

    static PANIC_ACTION: AtomicU8 = AtomicU8::new(0);

    fn set_panic_action(action: PanicAction) {
        PANIC_ACTION.store(action as u8, Ordering::Relaxed);
    }

    /// Entry from the platform glue.
    ///
    /// Global initialisation order (each step depends on the previous
    /// ones):
    ///   1. boot record validation and publication
    ///   2. command line, logger, panic policy
    ///   3. page-frame allocator in early mode over the boot heap tail
    ///   4. kernel heap
    ///   5. paging variant selection and the kernel template
    ///   6. free-stack seeding and the one-way switch to normal mode
    ///   7. syscall entry mechanism
    ///   8. first process, loader thread, scheduler hand-off
    /// Slab caches initialise lazily on first use, after step 6.
    #[no_mangle]
    pub extern "C" fn kernel_main(info: &'static BootInfo) -> ! {
        info.validate().expect("invalid boot information record");
        bootinfo::set(info);

        let config = cmdline::parse(info.cmdline);
        logging::init(config.log_level);
        set_panic_action(config.on_panic);
        log::info!("helium starting, cmdline: '{}'", info.cmdline);

        {
            let mut frames = PAGE_ALLOCATOR.lock();
            frames.set_early_range(info.page_cursor, info.boot_heap.end);

            // The heap needs a contiguous region; the early bump cursor
            // provides one.
            let heap_start = frames.alloc_page().expect("out of boot memory");
            for _ in 1..KERNEL_HEAP_PAGES {
                frames.alloc_page().expect("out of boot memory");
            }
            helium_kernel::init_heap(
                phys_to_virt(heap_start),
                KERNEL_HEAP_PAGES * PAGE_SIZE,
            );

            addr_space::init(config.pae, info.features, &mut frames)
                .expect("paging initialisation failed");

            seed_page_stack(&mut frames, info);
            frames.switch_to_normal();
        }

        let mechanism = SyscallMechanism::select(info.features);
        arch::syscall_entry::install(mechanism);
        log::info!("syscalls: {:?} entry", mechanism);

        let first = spawn_loader();
        arch::interrupts::enable();

        // Hand the CPU to the loader; from here on everything happens in
        // syscalls and interrupts.
        let context = {
            let mut sched = SCHEDULER.lock();
            sched.adopt_first(first);
            first.get().context().lock().saved_stack_pointer
        };

        extern "C" {
            /// Platform trampoline: switches to the prepared stack and
            /// drops to user mode at the thread's entry point.
            fn start_first_thread(saved_stack_pointer: usize) -> !;
        }
        // SAFETY: the context was prepared by thread preparation and the
        // scheduler adopted the thread as current.
        unsafe { start_first_thread(context) }
    }

    /// Seed the free-frame stack from the available memory ranges above
    /// the boot heap.
    fn seed_page_stack(
        frames: &mut helium_kernel::mm::PageFrameAllocator,
        info: &BootInfo,
    ) {
        let floor = info.boot_heap.end.as_u64();
        let mut seeded = 0;

        for range in info.ranges_of(MemoryKind::Available) {
            let mut frame = range.range.start.as_u64().max(floor);
            frame = (frame + (PAGE_SIZE as u64 - 1)) & !(PAGE_SIZE as u64 - 1);

            while frame + PAGE_SIZE as u64 <= range.range.end.as_u64() {
                if seeded == KERNEL_PAGE_STACK_INIT {
                    return;
                }
                frames.seed(PhysAddr::new(frame));
                seeded += 1;
                frame += PAGE_SIZE as u64;
            }
        }

        assert!(seeded > 0, "no available memory to seed the page stack");
    }

    /// Create the first process and its main thread, with the designated
    /// descriptors a fresh program expects.
    fn spawn_loader() -> helium_kernel::process::thread::ThreadPtr {
        let process =
            process::create_process(addr_space::paging()).expect("loader process creation");
        let thread = construct_thread(process).expect("loader thread creation");

        let table = process.get().descriptors();
        table.reserve(SELF_PROCESS_FD).expect("descriptor table is fresh");
        table.open(SELF_PROCESS_FD, Descriptor::owner(ObjRef::Process(process)));
        table.reserve(MAIN_THREAD_FD).expect("descriptor table is fresh");
        table.open(MAIN_THREAD_FD, Descriptor::owner(ObjRef::Thread(thread)));

        thread
            .get()
            .prepare(ThreadParams {
                entry: VirtAddr::new(LOADER_ENTRY),
                user_stack: VirtAddr::new(LOADER_STACK),
                arg: 0,
            })
            .expect("fresh thread is preparable");

        thread
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        println!("kernel panic: {}", info);
        if PANIC_ACTION.load(Ordering::Relaxed) == PanicAction::Reboot as u8 {
            helium_kernel::arch::reboot();
        }
        helium_kernel::arch::halt();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("helium-kernel is a bare-metal i686 binary; build it for the kernel target");
}
