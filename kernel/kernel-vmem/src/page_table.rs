//! # Page Tables and Their Entries

use crate::addresses::PhysicalAddress;
use core::fmt;

/// Entries per table at every level.
pub const N_PAGE_TABLE_ENTRIES: usize = 512;

bitflags::bitflags! {
    /// Page table entry flags used in x86-64 virtual memory.
    ///
    /// These apply to all paging levels (PTE, PDE, PDPTE, PML4E), except
    /// where noted.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct Flags: u64 {
        /// Page is present in physical memory. Cleared entries fault on
        /// access (used here for demand paging).
        const PRESENT  = 1 << 0;

        /// Page is writable. If cleared, the page is read-only.
        const WRITABLE = 1 << 1;

        /// Page is accessible from user mode (CPL=3). If cleared, only
        /// supervisor code can touch it.
        const USER     = 1 << 2;

        /// Write-through caching.
        const WT       = 1 << 3;

        /// Caching disabled (MMIO regions).
        const CD       = 1 << 4;

        /// Set by the processor on access.
        const ACCESSED = 1 << 5;

        /// Set by the processor on first write.
        const DIRTY    = 1 << 6;

        /// Large-page leaf in a PDE/PDPTE. Never set by this kernel.
        const PS       = 1 << 7;

        /// TLB entry survives CR3 reloads (with CR4.PGE).
        const GLOBAL   = 1 << 8;
    }
}

impl Flags {
    /// The access bits a translation must carry at **every** level of the
    /// walk: a lookup result ANDs these across all four entries.
    pub const ACCESS: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// PRESENT | WRITABLE, the kernel's read-write mapping.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);

    /// PRESENT | WRITABLE | USER, the ordinary user data mapping.
    pub const USER_RW: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
}

/// One 64-bit page-table entry: a frame base address plus [`Flags`].
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Bits 51..12 hold the physical frame base.
    const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

    /// An all-zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build an entry for `pa` with `flags`. `pa` must be page-aligned.
    #[inline]
    #[must_use]
    pub fn new(pa: PhysicalAddress, flags: Flags) -> Self {
        debug_assert!(pa.is_page_aligned(), "entry address not page aligned");
        Self((pa.as_u64() & Self::ADDR_MASK) | flags.bits())
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_unused(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn addr(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & Self::ADDR_MASK)
    }

    /// Flags of this entry, ignoring unknown bits.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> Flags {
        Flags::from_bits_truncate(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn present(self) -> bool {
        self.0 & Flags::PRESENT.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn writable(self) -> bool {
        self.0 & Flags::WRITABLE.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn user(self) -> bool {
        self.0 & Flags::USER.bits() != 0
    }

    /// Overwrite with `pa` + `flags`.
    #[inline]
    pub fn set(&mut self, pa: PhysicalAddress, flags: Flags) {
        *self = Self::new(pa, flags);
    }

    /// Zero the entry (non-present).
    #[inline]
    pub const fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageTableEntry({} | {:?})", self.addr(), self.flags())
    }
}

/// A 4 KiB page-table node: 512 entries, page-aligned so a frame can be
/// reinterpreted as a table in place.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; N_PAGE_TABLE_ENTRIES],
}

impl PageTable {
    /// Zero every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries = [PageTableEntry::empty(); N_PAGE_TABLE_ENTRIES];
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    #[must_use]
    pub const fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    /// Iterate over `(index, entry)` pairs of the present entries.
    pub fn present_entries(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.present())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_packs_address_and_flags() {
        let e = PageTableEntry::new(PhysicalAddress::new(0x5000), Flags::USER_RW);
        assert!(e.present() && e.writable() && e.user());
        assert_eq!(e.addr(), 0x5000);
        assert_eq!(e.flags(), Flags::USER_RW);

        let mut e = e;
        e.clear();
        assert!(e.is_unused());
        assert!(!e.present());
    }

    #[test]
    fn table_is_one_frame() {
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
        assert_eq!(core::mem::align_of::<PageTable>(), 4096);
    }
}
