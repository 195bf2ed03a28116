//! Context switch contract
//!
//! A switch is a pure register-save and stack-switch. The assembly
//! trampoline saves the callee-saved registers on the outgoing stack,
//! stores the stack pointer into the outgoing context, loads the incoming
//! context's stack pointer and pops the incoming registers. The scheduler
//! performs any post-switch reclamation on the incoming thread's stack,
//! after the outgoing stack is no longer active.

/// Saved execution state of a suspended thread
///
/// Only the kernel stack pointer is stored here; everything else lives on
/// the thread's pinned kernel stack.
#[derive(Debug)]
#[repr(C)]
pub struct ThreadContext {
    pub saved_stack_pointer: usize,
}

impl ThreadContext {
    pub const fn new() -> Self {
        Self {
            saved_stack_pointer: 0,
        }
    }
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" {
    /// Assembly trampoline provided by the platform glue.
    fn do_switch_context(from: *mut ThreadContext, to: *const ThreadContext);
}

/// Switch from the current thread's context to `to`.
///
/// Returns when something switches back to `from`.
///
/// # Safety
///
/// Both contexts must describe valid pinned kernel stacks; `to` must have
/// been set up by a previous switch or by thread preparation.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn switch_context(from: *mut ThreadContext, to: *const ThreadContext) {
    // SAFETY: forwarded contract.
    unsafe { do_switch_context(from, to) };
}

/// Host builds never switch stacks; scheduler state is exercised directly.
///
/// # Safety
///
/// Same contract as the bare-metal version; the stub has no effect.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub unsafe fn switch_context(_from: *mut ThreadContext, _to: *const ThreadContext) {}
