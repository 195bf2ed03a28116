//! CPU feature probing and machine control
//!
//! The boot-information record carries the feature bits the bring-up code
//! detected; [`CpuFeatures`] is the core's view of them.

use bitflags::bitflags;

bitflags! {
    /// Detected CPU features relevant to the core
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFeatures: u32 {
        /// Physical Address Extension
        const PAE = 1 << 0;
        /// NX bit usable (PAE mode only)
        const NX = 1 << 1;
        /// SYSENTER/SYSEXIT available
        const SYSENTER = 1 << 2;
        /// SYSCALL/SYSRET available
        const SYSCALL = 1 << 3;
        /// Global pages
        const GLOBAL_PAGES = 1 << 4;
    }
}

/// Halt the CPU until the next interrupt, forever.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn halt() -> ! {
    loop {
        // SAFETY: hlt waits for an interrupt; with interrupts masked it
        // parks the CPU for good, which is the intent.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Reboot through the keyboard controller's reset line.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn reboot() -> ! {
    // SAFETY: port 0x64 command 0xfe pulses the CPU reset line; nothing
    // after this executes.
    unsafe {
        core::arch::asm!("out 0x64, al", in("al") 0xfeu8, options(nomem, nostack));
    }
    halt()
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn reboot() -> ! {
    panic!("reboot requested");
}
