//! # System Call ABI
//!
//! Numbers and wire structures shared between the kernel's trap dispatcher
//! and the user-side library. Everything here crosses a privilege boundary;
//! keep layouts `#[repr(C)]` and integer sizes fixed.
//!
//! Calling convention: the trap number selects the service, `rdi` carries
//! the first argument, `rsi` the second, and the result (where there is
//! one) comes back in `rax`. `-1` in `rax` signals failure.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

/// Hardware timer interrupt vector (PIT line after PIC remap).
pub const INT_TIMER: u64 = 32;

/// Page-fault exception vector.
pub const INT_PAGEFAULT: u64 = 14;

/// General-protection-fault exception vector.
pub const INT_GPF: u64 = 13;

/// System call trap numbers.
///
/// These live above the hardware vectors; the dispatcher treats any other
/// number as an unexpected exception.
#[repr(u64)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Syscall {
    /// Terminate the machine with a message copied from user memory
    /// (`rdi` = pointer, or null).
    Panic = 48,
    /// Return the caller's pid in `rax`.
    GetPid = 49,
    /// Give up the CPU.
    Yield = 50,
    /// Map a fresh user page at `rdi`.
    PageAlloc = 51,
    /// Duplicate the caller; child gets 0, parent the child pid.
    Fork = 52,
    /// Release the caller and everything it owns.
    Exit = 53,
    /// Write the translation of `rsi` into user memory at `rdi`.
    Mapping = 54,
    /// Toggle memory-viewer display flags (`rdi` = 0 for the global flag,
    /// else the caller's own pid).
    MemTog = 55,
    /// Set the program break to `rdi`.
    Brk = 56,
    /// Adjust the program break by the signed increment in `rdi`; old break
    /// returned in `rax`.
    Sbrk = 57,
}

impl Syscall {
    /// Decode a trap number, if it names a system call.
    #[must_use]
    pub const fn from_intno(intno: u64) -> Option<Self> {
        Some(match intno {
            48 => Self::Panic,
            49 => Self::GetPid,
            50 => Self::Yield,
            51 => Self::PageAlloc,
            52 => Self::Fork,
            53 => Self::Exit,
            54 => Self::Mapping,
            55 => Self::MemTog,
            56 => Self::Brk,
            57 => Self::Sbrk,
            _ => return None,
        })
    }
}

/// Most bytes the `Panic` service will copy out of user memory.
pub const PANIC_MSG_MAX: usize = 160;

/// Frame number sentinel meaning "unmapped" in [`VaMapping`].
pub const PAGE_NUMBER_INVALID: i64 = -1;

/// Result of a virtual-to-physical translation, as written into user memory
/// by the `Mapping` service.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VaMapping {
    /// Physical frame number, or [`PAGE_NUMBER_INVALID`].
    pub pn: i64,
    /// Physical address (frame base plus the in-page offset of the queried
    /// virtual address). Zero when unmapped.
    pub pa: u64,
    /// Permission bits of the mapping (the architectural PTE low bits).
    pub perm: u64,
}

impl VaMapping {
    /// The "no such mapping" value.
    pub const UNMAPPED: Self = Self { pn: PAGE_NUMBER_INVALID, pa: 0, perm: 0 };

    /// Does this describe a live mapping?
    #[inline]
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.pn >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_round_trip() {
        for n in 0..70 {
            if let Some(sc) = Syscall::from_intno(n) {
                assert_eq!(sc as u64, n);
            }
        }
        assert_eq!(Syscall::from_intno(48), Some(Syscall::Panic));
        assert_eq!(Syscall::from_intno(57), Some(Syscall::Sbrk));
        assert_eq!(Syscall::from_intno(58), None);
        assert_eq!(Syscall::from_intno(INT_TIMER), None);
    }

    #[test]
    fn unmapped_sentinel() {
        assert!(!VaMapping::UNMAPPED.is_present());
        assert!(VaMapping { pn: 3, pa: 0x3000, perm: 7 }.is_present());
    }
}
