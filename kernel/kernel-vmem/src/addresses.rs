//! # Virtual and Physical Memory Addresses

use core::fmt;
use core::ops::{Add, AddAssign};
use kernel_info::memory::PAGESIZE;

/// A **physical** memory address (machine bus address).
///
/// Newtype over `u64` to prevent mixing with virtual addresses. No alignment
/// guarantees by itself; when stored in a page-table entry the low 12 bits
/// must be zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// A **virtual** memory address (process or kernel address space).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The frame number of the page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_number(self) -> usize {
        (self.0 / PAGESIZE) as usize
    }

    /// The base address of frame `pn`.
    #[inline]
    #[must_use]
    pub const fn from_page_number(pn: usize) -> Self {
        Self(pn as u64 * PAGESIZE)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGESIZE == 0
    }

    /// Round down to the containing page boundary.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(crate::align_down(self.0, PAGESIZE))
    }
}

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The page number of the page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_number(self) -> usize {
        (self.0 / PAGESIZE) as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGESIZE == 0
    }

    /// Round down to the containing page boundary.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(crate::align_down(self.0, PAGESIZE))
    }

    /// Round up to the next page boundary.
    #[inline]
    #[must_use]
    pub const fn page_round_up(self) -> Self {
        Self(crate::align_up(self.0, PAGESIZE))
    }

    /// Byte offset within the containing page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 % PAGESIZE
    }

    /// PML4 index (bits 47–39).
    #[inline]
    #[must_use]
    pub const fn pml4_index(self) -> usize {
        ((self.0 >> 39) & 0x1ff) as usize
    }

    /// PDPT index (bits 38–30).
    #[inline]
    #[must_use]
    pub const fn pdpt_index(self) -> usize {
        ((self.0 >> 30) & 0x1ff) as usize
    }

    /// PD index (bits 29–21).
    #[inline]
    #[must_use]
    pub const fn pd_index(self) -> usize {
        ((self.0 >> 21) & 0x1ff) as usize
    }

    /// PT index (bits 20–12).
    #[inline]
    #[must_use]
    pub const fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x1ff) as usize
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("PhysicalAddress add"))
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("VirtualAddress add"))
    }
}

impl AddAssign<u64> for PhysicalAddress {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl AddAssign<u64> for VirtualAddress {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl PartialEq<u64> for PhysicalAddress {
    fn eq(&self, other: &u64) -> bool {
        self.0 == *other
    }
}

impl PartialEq<u64> for VirtualAddress {
    fn eq(&self, other: &u64) -> bool {
        self.0 == *other
    }
}

impl From<u64> for PhysicalAddress {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<u64> for VirtualAddress {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x} (physical)", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x} (virtual)", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_arithmetic() {
        let pa = PhysicalAddress::new(0x1234);
        assert_eq!(pa.page_number(), 1);
        assert_eq!(pa.page_base(), 0x1000);
        assert!(!pa.is_page_aligned());
        assert_eq!(PhysicalAddress::from_page_number(3), 0x3000);

        let va = VirtualAddress::new(0x2fff);
        assert_eq!(va.page_base(), 0x2000);
        assert_eq!(va.page_round_up(), 0x3000);
        assert_eq!(va.page_offset(), 0xfff);
    }

    #[test]
    fn walk_indices() {
        let va = VirtualAddress::new(0x0000_7fff_ffff_ffff);
        assert_eq!(va.pml4_index(), 255);
        assert_eq!(va.pdpt_index(), 511);
        assert_eq!(va.pd_index(), 511);
        assert_eq!(va.pt_index(), 511);

        // A low address as used by this kernel: everything below 1 GiB
        // shares PML4 and PDPT slot zero.
        let va = VirtualAddress::new(0x2f_f000);
        assert_eq!(va.pml4_index(), 0);
        assert_eq!(va.pdpt_index(), 0);
        assert_eq!(va.pd_index(), 1);
        assert_eq!(va.pt_index(), 0xff);
    }
}
