//! Stack information a mutator publishes for the collector's stack scan.
//!
//! On entering a saferegion a mutator records where its managed frames end
//! (frame address and program counter). Together with the thread's stack
//! bounds this tells a root scanner which part of the stack to walk.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackBounds {
    /// The bottom of the stack (highest address).
    pub bottom: usize,
    /// The top of the stack (lowest address).
    pub top: usize,
}

impl StackBounds {
    /// Returns `true` if `addr` lies inside the stack.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.top && addr < self.bottom
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(miri)]
pub fn current_stack_bounds() -> StackBounds {
    // Miri does not support direct access to the stack bounds.
    StackBounds::default()
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(target_os = "linux", not(miri)))]
pub fn current_stack_bounds() -> StackBounds {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    // SAFETY: `attr` is initialised by `pthread_getattr_np` before use and
    // destroyed exactly once on every path.
    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return StackBounds::default();
        }

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return StackBounds::default();
        }

        let top = stackaddr as usize;
        StackBounds {
            bottom: top + stacksize,
            top,
        }
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(target_os = "macos", not(miri)))]
pub fn current_stack_bounds() -> StackBounds {
    // SAFETY: Both calls only read attributes of the calling thread.
    unsafe {
        let this = libc::pthread_self();
        let bottom = libc::pthread_get_stackaddr_np(this) as usize;
        let size = libc::pthread_get_stacksize_np(this);
        StackBounds {
            bottom,
            top: bottom - size,
        }
    }
}

/// Retrieve the stack bounds for the current thread (empty elsewhere).
#[cfg(all(not(target_os = "linux"), not(target_os = "macos"), not(miri)))]
pub fn current_stack_bounds() -> StackBounds {
    StackBounds::default()
}

/// Where the managed part of a stack ended when the mutator stopped
/// touching the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnwindContext {
    /// Frame address of the frame that entered the saferegion.
    pub frame_address: usize,
    /// Program counter inside that frame.
    pub pc: usize,
}

impl UnwindContext {
    /// Capture the caller's frame address and program counter.
    #[inline(always)]
    #[must_use]
    pub fn capture() -> Self {
        #[cfg(all(target_arch = "x86_64", not(miri)))]
        {
            let frame_address: usize;
            let pc: usize;
            // SAFETY: Reads rbp and the current rip; no memory is touched.
            unsafe {
                std::arch::asm!(
                    "mov {0}, rbp",
                    "lea {1}, [rip]",
                    out(reg) frame_address,
                    out(reg) pc,
                    options(nomem, nostack, preserves_flags),
                );
            }
            Self { frame_address, pc }
        }
        #[cfg(all(target_arch = "aarch64", not(miri)))]
        {
            let frame_address: usize;
            let pc: usize;
            // SAFETY: Reads x29 and the current pc; no memory is touched.
            unsafe {
                std::arch::asm!(
                    "mov {0}, x29",
                    "adr {1}, .",
                    out(reg) frame_address,
                    out(reg) pc,
                    options(nomem, nostack, preserves_flags),
                );
            }
            Self { frame_address, pc }
        }
        #[cfg(any(not(any(target_arch = "x86_64", target_arch = "aarch64")), miri))]
        {
            // The address of a local is a close enough frame marker.
            let marker = 0usize;
            Self {
                frame_address: std::ptr::addr_of!(marker) as usize,
                pc: 0,
            }
        }
    }
}

/// Atomic storage for an [`UnwindContext`].
///
/// Written by the owning mutator before it publishes its saferegion state
/// with a sequentially consistent store, read by the collector after it
/// observed that state.
#[derive(Debug, Default)]
pub(crate) struct UnwindSlot {
    frame_address: AtomicUsize,
    pc: AtomicUsize,
}

impl UnwindSlot {
    pub(crate) fn store(&self, context: UnwindContext) {
        self.frame_address
            .store(context.frame_address, Ordering::Relaxed);
        self.pc.store(context.pc, Ordering::Relaxed);
    }

    pub(crate) fn load(&self) -> UnwindContext {
        UnwindContext {
            frame_address: self.frame_address.load(Ordering::Relaxed),
            pc: self.pc.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(all(any(target_os = "linux", target_os = "macos"), not(miri)))]
    fn test_current_frame_lies_within_stack_bounds() {
        let bounds = current_stack_bounds();
        let local = 0u64;
        assert!(bounds.top < bounds.bottom);
        assert!(bounds.contains(std::ptr::addr_of!(local) as usize));
    }

    #[test]
    fn test_unwind_slot_stores_last_context() {
        let slot = UnwindSlot::default();
        let context = UnwindContext {
            frame_address: 0x7000,
            pc: 0x4000,
        };
        slot.store(context);
        assert_eq!(slot.load(), context);
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    fn test_capture_reports_a_program_counter() {
        let context = UnwindContext::capture();
        assert_ne!(context.pc, 0);
    }
}
