//! # Physical Frame Table
//!
//! One [`PageInfo`] record per physical frame, tracking who owns the frame
//! and how many live references point at it. The two are tied together by
//! the central invariant:
//!
//! > `refcount == 0` **iff** the owner is [`PageOwner::Free`].
//!
//! References are user-page mappings, page-table node frames (one each),
//! and sharers of the console frame and of the kernel root table. Reserved
//! frames (the null page, the I/O hole with the console) are classified at
//! boot and never handed out again.
//!
//! The [`OwnedFrames`] adapter binds the table to a specific owner and
//! implements the page-table engine's [`FrameAlloc`] seam, so intermediate
//! page-table nodes get charged to whichever process owns the root being
//! grown.

#![cfg_attr(not(test), no_std)]

use kernel_info::boot::BootLayout;
use kernel_info::memory::{MEMSIZE_PHYSICAL, NPAGES, PAGESIZE, physical_memory_reserved};
use kernel_vmem::{FrameAlloc, PhysicalAddress};

/// Process identifier; index into the process table.
pub type Pid = usize;

/// Who a physical frame belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageOwner {
    /// Unused, available to [`FrameTable::palloc`].
    Free,
    /// Use dictated by hardware (BIOS, I/O, console); never reallocated.
    Reserved,
    /// Kernel image, kernel stack, or kernel page-table node.
    Kernel,
    /// Owned by the process with this pid.
    Process(Pid),
}

impl PageOwner {
    #[inline]
    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free)
    }

    /// The owning pid, if a process owns the frame.
    #[inline]
    #[must_use]
    pub const fn pid(self) -> Option<Pid> {
        match self {
            Self::Process(pid) => Some(pid),
            _ => None,
        }
    }
}

/// Per-frame bookkeeping record.
#[derive(Copy, Clone, Debug)]
pub struct PageInfo {
    pub owner: PageOwner,
    /// Number of live references; 0 means the frame is free.
    pub refcount: u16,
}

/// Rejected [`FrameTable::assign`] request.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum AssignError {
    #[error("physical address not page aligned")]
    Unaligned,
    #[error("physical address out of range")]
    OutOfRange,
    #[error("frame already in use")]
    InUse,
}

/// The frame table: one entry per physical frame.
pub struct FrameTable {
    pages: [PageInfo; NPAGES],
}

impl FrameTable {
    /// Classify the whole physical range.
    ///
    /// Reserved memory (per [`physical_memory_reserved`]) stays reserved;
    /// the kernel image and the kernel stack page belong to the kernel;
    /// everything else starts free. `refcount` is 1 exactly for the
    /// non-free frames.
    #[must_use]
    pub fn new(layout: &BootLayout) -> Self {
        let mut pages = [PageInfo { owner: PageOwner::Free, refcount: 0 }; NPAGES];
        let mut pa = 0u64;
        while pa < MEMSIZE_PHYSICAL {
            let owner = if physical_memory_reserved(pa) {
                PageOwner::Reserved
            } else if (pa >= layout.kernel_start && pa < layout.kernel_end)
                || pa == layout.stack_page()
            {
                PageOwner::Kernel
            } else {
                PageOwner::Free
            };
            let pn = (pa / PAGESIZE) as usize;
            pages[pn] = PageInfo { owner, refcount: u16::from(!owner.is_free()) };
            pa += PAGESIZE;
        }
        Self { pages }
    }

    /// Bookkeeping record for frame `pn`. Panics on an out-of-range frame
    /// number; the table covers all of physical memory.
    #[inline]
    #[must_use]
    pub fn info(&self, pn: usize) -> PageInfo {
        self.pages[pn]
    }

    /// Number of frames currently free.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.pages.iter().filter(|p| p.refcount == 0).count()
    }

    /// Claim the specific frame at `pa` for `owner`.
    ///
    /// Used by the program loader, which places images at fixed physical
    /// offsets.
    ///
    /// # Errors
    /// Misaligned or out-of-range addresses, or a frame whose refcount is
    /// not zero.
    pub fn assign(&mut self, pa: PhysicalAddress, owner: PageOwner) -> Result<(), AssignError> {
        debug_assert!(!owner.is_free(), "assigning a frame to nobody");
        if !pa.is_page_aligned() {
            return Err(AssignError::Unaligned);
        }
        if pa.as_u64() >= MEMSIZE_PHYSICAL {
            return Err(AssignError::OutOfRange);
        }
        let info = &mut self.pages[pa.page_number()];
        if info.refcount != 0 {
            return Err(AssignError::InUse);
        }
        *info = PageInfo { owner, refcount: 1 };
        Ok(())
    }

    /// Find a free frame, claim it for `owner`, and return its address.
    ///
    /// The ascending scan naturally skips reserved and kernel frames:
    /// their refcounts are nonzero from boot on. `None` when physical
    /// memory is exhausted.
    pub fn palloc(&mut self, owner: PageOwner) -> Option<PhysicalAddress> {
        debug_assert!(!owner.is_free(), "allocating a frame to nobody");
        let pn = self.pages.iter().position(|p| p.refcount == 0)?;
        self.pages[pn] = PageInfo { owner, refcount: 1 };
        Some(PhysicalAddress::from_page_number(pn))
    }

    /// Drop one reference to the frame containing `pa`; a frame whose
    /// refcount reaches zero becomes free.
    ///
    /// A null or out-of-range address, or a frame that is already free, is
    /// a logged error but not fatal.
    pub fn freepage(&mut self, pa: PhysicalAddress) {
        if pa == 0 {
            log::error!("attempted to free the null page");
            return;
        }
        let base = pa.page_base();
        if base.as_u64() >= MEMSIZE_PHYSICAL {
            log::error!("freepage: physical address {pa} out of bounds");
            return;
        }
        let info = &mut self.pages[base.page_number()];
        if info.refcount == 0 {
            log::error!("attempted to free unallocated page at {pa}");
            return;
        }
        info.refcount -= 1;
        if info.refcount == 0 {
            info.owner = PageOwner::Free;
            log::trace!("page {pn} ({base}) freed", pn = base.page_number());
        }
    }

    /// Add one reference to an already-live frame (console sharing, kernel
    /// root sharing).
    pub fn retain(&mut self, pa: PhysicalAddress) {
        let info = &mut self.pages[pa.page_base().page_number()];
        debug_assert!(info.refcount > 0, "retaining a free frame");
        info.refcount += 1;
    }

    /// Iterate `(frame number, info)` over the whole table.
    pub fn iter(&self) -> impl Iterator<Item = (usize, PageInfo)> + '_ {
        self.pages.iter().copied().enumerate()
    }
}

/// A frame source bound to one owner.
///
/// Implements the page-table engine's [`FrameAlloc`] so that intermediate
/// page-table nodes allocated during a mapping are charged (with refcount 1)
/// to the process owning the root table.
pub struct OwnedFrames<'a> {
    table: &'a mut FrameTable,
    owner: PageOwner,
}

impl<'a> OwnedFrames<'a> {
    #[must_use]
    pub fn new(table: &'a mut FrameTable, owner: PageOwner) -> Self {
        Self { table, owner }
    }
}

impl FrameAlloc for OwnedFrames<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.table.palloc(self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::memory::{CONSOLE_ADDR, KERNEL_START_ADDR};

    fn table() -> FrameTable {
        FrameTable::new(&BootLayout::whole_kernel_window(0x8000))
    }

    #[test]
    fn boot_classification() {
        let t = table();
        assert_eq!(t.info(0).owner, PageOwner::Reserved);
        assert_eq!(t.info(1).owner, PageOwner::Free);
        assert_eq!(t.info(1).refcount, 0);
        assert_eq!(
            t.info(PhysicalAddress::new(KERNEL_START_ADDR).page_number()).owner,
            PageOwner::Kernel
        );
        assert_eq!(
            t.info(PhysicalAddress::new(CONSOLE_ADDR).page_number()).owner,
            PageOwner::Reserved
        );
        // refcount == 0 iff free, everywhere.
        for (_, info) in t.iter() {
            assert_eq!(info.refcount == 0, info.owner.is_free());
        }
    }

    #[test]
    fn assign_validates_its_argument() {
        let mut t = table();
        let owner = PageOwner::Process(1);
        assert_eq!(
            t.assign(PhysicalAddress::new(0x1001), owner),
            Err(AssignError::Unaligned)
        );
        assert_eq!(
            t.assign(PhysicalAddress::new(MEMSIZE_PHYSICAL), owner),
            Err(AssignError::OutOfRange)
        );
        assert_eq!(
            t.assign(PhysicalAddress::new(CONSOLE_ADDR), owner),
            Err(AssignError::InUse)
        );

        assert_eq!(t.assign(PhysicalAddress::new(0x1000), owner), Ok(()));
        assert_eq!(t.info(1).owner, owner);
        assert_eq!(t.info(1).refcount, 1);
        // Double assign is refused.
        assert_eq!(
            t.assign(PhysicalAddress::new(0x1000), owner),
            Err(AssignError::InUse)
        );
    }

    #[test]
    fn palloc_skips_reserved_and_kernel() {
        let mut t = table();
        let pa = t.palloc(PageOwner::Process(2)).unwrap();
        assert!(!physical_memory_reserved(pa.as_u64()));
        assert_eq!(t.info(pa.page_number()).owner, PageOwner::Process(2));

        // Exhaust everything; every handed-out frame is distinct and the
        // classification of reserved/kernel frames never changes.
        let mut count = 1;
        while t.palloc(PageOwner::Process(2)).is_some() {
            count += 1;
        }
        assert!(count > 0);
        assert_eq!(t.free_frames(), 0);
        assert_eq!(t.info(0).owner, PageOwner::Reserved);
        assert_eq!(
            t.info(PhysicalAddress::new(KERNEL_START_ADDR).page_number()).owner,
            PageOwner::Kernel
        );
    }

    #[test]
    fn freepage_refcounts_down_to_free() {
        let mut t = table();
        let pa = t.palloc(PageOwner::Process(1)).unwrap();
        t.retain(pa);
        assert_eq!(t.info(pa.page_number()).refcount, 2);

        t.freepage(pa);
        assert_eq!(t.info(pa.page_number()).refcount, 1);
        assert_eq!(t.info(pa.page_number()).owner, PageOwner::Process(1));

        // Unaligned frees resolve to the containing frame.
        t.freepage(pa + 0x123);
        assert_eq!(t.info(pa.page_number()).refcount, 0);
        assert_eq!(t.info(pa.page_number()).owner, PageOwner::Free);
    }

    #[test]
    fn bad_frees_are_harmless() {
        let mut t = table();
        let before: Vec<_> = t.iter().map(|(_, i)| (i.owner, i.refcount)).collect();

        t.freepage(PhysicalAddress::new(0));
        t.freepage(PhysicalAddress::new(MEMSIZE_PHYSICAL + PAGESIZE));
        t.freepage(PhysicalAddress::new(0x1000)); // already free

        let after: Vec<_> = t.iter().map(|(_, i)| (i.owner, i.refcount)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn owned_frames_charge_their_owner() {
        let mut t = table();
        let pa = {
            let mut source = OwnedFrames::new(&mut t, PageOwner::Process(3));
            kernel_vmem::FrameAlloc::alloc_4k(&mut source).unwrap()
        };
        assert_eq!(t.info(pa.page_number()).owner, PageOwner::Process(3));
        assert_eq!(t.info(pa.page_number()).refcount, 1);
    }
}
