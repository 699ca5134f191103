//! # Saved Register Frames
//!
//! The trap stub pushes the application's registers onto the kernel stack in
//! this layout before calling into Rust; [`crate::Kernel::exception`]
//! receives a reference to it and copies it into the faulting process's
//! descriptor.

/// Kernel code segment selector.
pub const KERNEL_CS: u64 = 0x08;

/// User code segment selector (RPL 3).
pub const USER_CS: u64 = 0x1b;

/// User stack segment selector (RPL 3).
pub const USER_SS: u64 = 0x23;

/// RFLAGS interrupt-enable bit; user code always runs with it set.
pub const RFLAGS_IF: u64 = 1 << 9;

/// Register state saved at exception time.
///
/// Pushed by the stub: the general-purpose registers, then the interrupt
/// number and error code; the CPU itself supplies `rip` through `ss` on
/// entry. `#[repr(C)]` because the stub builds it in assembly.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct Registers {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Trap number the stub dispatched on.
    pub intno: u64,
    /// Hardware error code (zero for traps that push none).
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Registers {
    /// A fresh user-mode frame: user segments, interrupts enabled,
    /// everything else zero until the loader fills in `rip`/`rsp`.
    #[must_use]
    pub fn new_user() -> Self {
        Self {
            cs: USER_CS,
            ss: USER_SS,
            rflags: RFLAGS_IF,
            ..Self::default()
        }
    }

    /// Did this frame come from user mode?
    #[inline]
    #[must_use]
    pub const fn from_user(&self) -> bool {
        self.cs & 3 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_frame_shape() {
        let r = Registers::new_user();
        assert!(r.from_user());
        assert_eq!(r.rflags & RFLAGS_IF, RFLAGS_IF);
        assert_eq!(r.rax, 0);
    }
}
