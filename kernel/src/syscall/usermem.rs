//! User-memory access
//!
//! Every pointer argument a syscall receives is validated against the user
//! half before it is dereferenced. The kernel runs with the calling
//! process's address space loaded, so a validated user range is directly
//! addressable; an unmapped page inside it faults in kernel mode and is
//! fatal, which is the contract: user space vouches for its own pointers'
//! mappings, the kernel only vouches for never touching the kernel half on
//! their behalf.

use crate::error::{Errno, KernelResult};
use crate::mm::KLIMIT;

/// Upper bound of user addresses: the kernel half starts at `KLIMIT` on
/// the kernel target. Host builds (unit tests) have no kernel half, so
/// only null pointers and overflow are rejected there and test buffers
/// can live anywhere in the host address space.
#[cfg(all(target_arch = "x86", target_os = "none"))]
const USER_LIMIT: usize = KLIMIT;
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
const USER_LIMIT: usize = usize::MAX;

/// Check that `[addr, addr + len)` lies entirely in the user half.
pub fn check_range(addr: usize, len: usize) -> KernelResult<()> {
    check_range_below(addr, len, USER_LIMIT)
}

/// Range check against an explicit upper bound.
fn check_range_below(addr: usize, len: usize, limit: usize) -> KernelResult<()> {
    if addr == 0 {
        return Err(Errno::Invalid);
    }
    let end = addr.checked_add(len).ok_or(Errno::Invalid)?;
    if end > limit {
        return Err(Errno::Invalid);
    }
    Ok(())
}

/// Borrow a validated user range.
pub fn user_slice(addr: usize, len: usize) -> KernelResult<&'static [u8]> {
    check_range(addr, len)?;
    // SAFETY: the range is in the user half of the loaded address space.
    Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
}

/// Borrow a validated user range mutably.
pub fn user_slice_mut(addr: usize, len: usize) -> KernelResult<&'static mut [u8]> {
    check_range(addr, len)?;
    // SAFETY: the range is in the user half of the loaded address space.
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

/// Copy a `repr(C)` argument structure out of user memory.
pub fn read_user_struct<T: Copy>(addr: usize) -> KernelResult<T> {
    check_range(addr, core::mem::size_of::<T>())?;
    // SAFETY: the range is in the user half; unaligned reads are allowed.
    Ok(unsafe { core::ptr::read_unaligned(addr as *const T) })
}

/// Copy a `repr(C)` result structure into user memory.
pub fn write_user_struct<T: Copy>(addr: usize, value: &T) -> KernelResult<()> {
    check_range(addr, core::mem::size_of::<T>())?;
    // SAFETY: the range is in the user half; unaligned writes are allowed.
    unsafe { core::ptr::write_unaligned(addr as *mut T, *value) };
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn null_pointer_is_rejected() {
        assert_eq!(check_range(0, 16), Err(Errno::Invalid));
    }

    #[test]
    fn kernel_half_is_rejected() {
        assert_eq!(check_range_below(KLIMIT, 1, KLIMIT), Err(Errno::Invalid));
        assert_eq!(check_range_below(KLIMIT - 8, 16, KLIMIT), Err(Errno::Invalid));
        assert!(check_range_below(KLIMIT - 16, 16, KLIMIT).is_ok());
    }

    #[test]
    fn overflow_is_rejected() {
        assert_eq!(check_range(usize::MAX - 4, 16), Err(Errno::Invalid));
        assert_eq!(
            check_range_below(usize::MAX - 4, 16, KLIMIT),
            Err(Errno::Invalid)
        );
    }

    #[test]
    fn user_half_passes() {
        assert!(check_range_below(0x1000, 4096, KLIMIT).is_ok());
        assert!(check_range_below(0x4000_0000, 2048, KLIMIT).is_ok());
        assert!(check_range(0x1000, 4096).is_ok());
    }
}
