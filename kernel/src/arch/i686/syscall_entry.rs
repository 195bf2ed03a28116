//! System-call entry mechanisms
//!
//! Three entry paths coexist: the software interrupt 0x80 is always
//! available; SYSENTER/SYSEXIT and SYSCALL/SYSRET are faster and selected
//! once at boot when the CPU supports them. All three converge on the same
//! dispatcher; only the selection logic lives in the core.

use super::cpu::CpuFeatures;

/// Software interrupt vector for system calls
pub const SYSCALL_IRQ: u8 = 0x80;

/// Mechanism identifiers, part of the user-space ABI
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallMechanism {
    /// int 0x80, always available
    Interrupt = 0,
    /// SYSCALL/SYSRET (AMD-capable CPUs)
    FastAmd = 1,
    /// SYSENTER/SYSEXIT (Intel-capable CPUs)
    FastIntel = 2,
}

impl SyscallMechanism {
    /// Pick the fastest mechanism the CPU supports.
    pub fn select(features: CpuFeatures) -> Self {
        if features.contains(CpuFeatures::SYSENTER) {
            Self::FastIntel
        } else if features.contains(CpuFeatures::SYSCALL) {
            Self::FastAmd
        } else {
            Self::Interrupt
        }
    }
}

/// Program the MSRs of the selected fast path. The interrupt gate for
/// vector 0x80 is installed unconditionally by the platform glue.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn install(mechanism: SyscallMechanism) {
    extern "C" {
        fn setup_sysenter_entry();
        fn setup_syscall_entry();
    }

    match mechanism {
        SyscallMechanism::Interrupt => {}
        // SAFETY: the trampolines only write the entry-point MSRs.
        SyscallMechanism::FastIntel => unsafe { setup_sysenter_entry() },
        // SAFETY: same.
        SyscallMechanism::FastAmd => unsafe { setup_syscall_entry() },
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn install(_mechanism: SyscallMechanism) {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn interrupt_is_the_fallback() {
        assert_eq!(
            SyscallMechanism::select(CpuFeatures::empty()),
            SyscallMechanism::Interrupt
        );
    }

    #[test]
    fn sysenter_wins_when_both_fast_paths_exist() {
        let features = CpuFeatures::SYSENTER | CpuFeatures::SYSCALL;
        assert_eq!(
            SyscallMechanism::select(features),
            SyscallMechanism::FastIntel
        );
        assert_eq!(
            SyscallMechanism::select(CpuFeatures::SYSCALL),
            SyscallMechanism::FastAmd
        );
    }
}
