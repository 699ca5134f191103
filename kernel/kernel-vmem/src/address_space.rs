//! # Virtual Address Space
//!
//! [`AddressSpace`] is a view over one page-table tree rooted at a PML4. It
//! does not own the frames; allocation goes through [`FrameAlloc`] and all
//! access to table frames goes through the caller's [`PhysMapper`], which
//! keeps this code independent of how the kernel reaches physical memory.
//!
//! Newly created intermediate entries are installed as
//! PRESENT | WRITABLE | USER; the leaf entry alone decides the effective
//! permissions of a mapping, because a lookup ANDs the access bits across
//! all four levels.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::page_table::Flags;
use crate::{FrameAlloc, PhysMapper, get_table};
use kernel_info::memory::PAGESIZE;

/// A successful virtual-to-physical translation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Translation {
    /// Physical frame number of the leaf.
    pub pn: usize,
    /// Frame base plus the in-page offset of the queried address.
    pub pa: PhysicalAddress,
    /// Access bits ANDed across all four levels for
    /// {PRESENT, WRITABLE, USER}, plus the leaf's remaining bits.
    pub perm: Flags,
}

/// Failure installing a mapping.
///
/// On error, pages already installed by the same call remain visible; the
/// caller decides whether to roll back or tear the whole space down.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory allocating {level} table")]
    OutOfMemory { level: &'static str },
}

/// A handle to one concrete address space (page-table tree).
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalAddress,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Bind a view to the tree rooted at `root`.
    #[inline]
    pub const fn new(mapper: &'m M, root: PhysicalAddress) -> Self {
        Self { root, mapper }
    }

    /// Physical address of the PML4 frame.
    #[inline]
    #[must_use]
    pub const fn root_phys(&self) -> PhysicalAddress {
        self.root
    }

    /// Ensure the non-leaf chain for `va` exists down to the PT, allocating
    /// any missing intermediate tables (zeroed). Returns the PT frame.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] naming the level that could not be
    /// allocated.
    fn ensure_chain<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, MapError> {
        let link = Flags::PRESENT | Flags::WRITABLE | Flags::USER;

        // PML4 → PDPT
        let pml4 = unsafe { get_table(self.mapper, self.root) };
        let e4 = pml4.entry(va.pml4_index());
        let pdpt_phys = if e4.present() {
            e4.addr()
        } else {
            let f = alloc.alloc_4k().ok_or(MapError::OutOfMemory { level: "PDPT" })?;
            unsafe { get_table(self.mapper, f) }.zero();
            pml4.entry_mut(va.pml4_index()).set(f, link);
            f
        };

        // PDPT → PD
        let pdpt = unsafe { get_table(self.mapper, pdpt_phys) };
        let e3 = pdpt.entry(va.pdpt_index());
        let pd_phys = if e3.present() {
            e3.addr()
        } else {
            let f = alloc.alloc_4k().ok_or(MapError::OutOfMemory { level: "PD" })?;
            unsafe { get_table(self.mapper, f) }.zero();
            pdpt.entry_mut(va.pdpt_index()).set(f, link);
            f
        };

        // PD → PT
        let pd = unsafe { get_table(self.mapper, pd_phys) };
        let e2 = pd.entry(va.pd_index());
        let pt_phys = if e2.present() {
            e2.addr()
        } else {
            let f = alloc.alloc_4k().ok_or(MapError::OutOfMemory { level: "PT" })?;
            unsafe { get_table(self.mapper, f) }.zero();
            pd.entry_mut(va.pd_index()).set(f, link);
            f
        };

        Ok(pt_phys)
    }

    /// Install a single `va → pa` 4 KiB mapping with `flags`.
    ///
    /// Empty `flags` clears the leaf instead (see [`Self::clear_one`]).
    ///
    /// # Errors
    /// Propagates allocation failures from the chain walk.
    pub fn map_one<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: Flags,
    ) -> Result<(), MapError> {
        if flags.is_empty() {
            self.clear_one(va);
            return Ok(());
        }
        debug_assert!(va.is_page_aligned(), "virtual address not page aligned");
        debug_assert!(pa.is_page_aligned(), "physical address not page aligned");

        let pt_phys = self.ensure_chain(alloc, va)?;
        let pt = unsafe { get_table(self.mapper, pt_phys) };
        pt.entry_mut(va.pt_index()).set(pa, flags | Flags::PRESENT);
        Ok(())
    }

    /// Install mappings covering `size` bytes starting at `va → pa`, one
    /// page at a time. Empty `flags` clears every covered leaf.
    ///
    /// # Errors
    /// On failure the pages already installed remain visible; the caller is
    /// responsible for rolling back.
    pub fn map_range<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: u64,
        flags: Flags,
    ) -> Result<(), MapError> {
        let mut offset = 0;
        while offset < size {
            self.map_one(alloc, va + offset, pa + offset, flags)?;
            offset += PAGESIZE;
        }
        Ok(())
    }

    /// Walk the four levels for `va`. Any missing entry short-circuits to
    /// `None`.
    #[must_use]
    pub fn lookup(&self, va: VirtualAddress) -> Option<Translation> {
        let pml4 = unsafe { get_table(self.mapper, self.root) };
        let e4 = pml4.entry(va.pml4_index());
        if !e4.present() {
            return None;
        }

        let pdpt = unsafe { get_table(self.mapper, e4.addr()) };
        let e3 = pdpt.entry(va.pdpt_index());
        if !e3.present() {
            return None;
        }

        let pd = unsafe { get_table(self.mapper, e3.addr()) };
        let e2 = pd.entry(va.pd_index());
        if !e2.present() {
            return None;
        }

        let pt = unsafe { get_table(self.mapper, e2.addr()) };
        let e1 = pt.entry(va.pt_index());
        if !e1.present() {
            return None;
        }

        let access =
            e4.flags() & e3.flags() & e2.flags() & e1.flags() & Flags::ACCESS;
        let perm = (e1.flags() - Flags::ACCESS) | access;
        Some(Translation {
            pn: e1.addr().page_number(),
            pa: e1.addr() + va.page_offset(),
            perm,
        })
    }

    /// Zero the leaf entry for `va`. A miss anywhere along the walk is a
    /// no-op; intermediate tables are never freed here.
    pub fn clear_one(&self, va: VirtualAddress) {
        let pml4 = unsafe { get_table(self.mapper, self.root) };
        let e4 = pml4.entry(va.pml4_index());
        if !e4.present() {
            return;
        }
        let pdpt = unsafe { get_table(self.mapper, e4.addr()) };
        let e3 = pdpt.entry(va.pdpt_index());
        if !e3.present() {
            return;
        }
        let pd = unsafe { get_table(self.mapper, e3.addr()) };
        let e2 = pd.entry(va.pd_index());
        if !e2.present() {
            return;
        }
        let pt = unsafe { get_table(self.mapper, e2.addr()) };
        pt.entry_mut(va.pt_index()).clear();
    }

    /// Remove the mapping for `va`, returning what was mapped so the caller
    /// can release the frame. `None` (and no change) if `va` was unmapped.
    pub fn unmap_one(&self, va: VirtualAddress) -> Option<Translation> {
        let translation = self.lookup(va)?;
        self.clear_one(va);
        Some(translation)
    }

    /// Visit every page-table node frame of this tree (the PT, PD and PDPT
    /// interiors and finally the root) in post-order (children before
    /// parents), with the node's depth (0 = PML4 root .. 3 = PT).
    ///
    /// Leaf *data* frames are not visited.
    pub fn visit_table_frames(&self, f: &mut impl FnMut(usize, PhysicalAddress)) {
        self.visit_node(self.root, 0, f);
    }

    fn visit_node(
        &self,
        node: PhysicalAddress,
        depth: usize,
        f: &mut impl FnMut(usize, PhysicalAddress),
    ) {
        if depth < 3 {
            let table = unsafe { get_table::<M>(self.mapper, node) };
            for (_, entry) in table.present_entries() {
                self.visit_node(entry.addr(), depth + 1, f);
            }
        }
        f(depth, node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BumpAlloc, TestPhys};

    fn fresh_space<'a>(phys: &'a TestPhys, alloc: &mut BumpAlloc) -> AddressSpace<'a, TestPhys> {
        let root = alloc.alloc_4k().unwrap();
        unsafe { get_table(phys, root) }.zero();
        AddressSpace::new(phys, root)
    }

    #[test]
    fn map_then_lookup_round_trips() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = fresh_space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x10_0000);
        let pa = PhysicalAddress::new(0x1f_0000);
        aspace.map_one(&mut alloc, va, pa, Flags::USER_RW).unwrap();

        let t = aspace.lookup(va).expect("mapped");
        assert_eq!(t.pa, pa);
        assert_eq!(t.pn, pa.page_number());
        assert_eq!(t.perm, Flags::USER_RW);

        // In-page offsets carry through.
        let t = aspace.lookup(va + 0x123).expect("mapped");
        assert_eq!(t.pa, pa + 0x123);
    }

    #[test]
    fn lookup_misses_on_unmapped() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = fresh_space(&phys, &mut alloc);

        assert!(aspace.lookup(VirtualAddress::new(0x10_0000)).is_none());

        aspace
            .map_one(
                &mut alloc,
                VirtualAddress::new(0x10_0000),
                PhysicalAddress::new(0x1000),
                Flags::KERNEL_RW,
            )
            .unwrap();
        // Same PT, different slot: still a miss.
        assert!(aspace.lookup(VirtualAddress::new(0x10_1000)).is_none());
    }

    #[test]
    fn permissions_and_across_levels() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = fresh_space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x10_0000);
        aspace
            .map_one(&mut alloc, va, PhysicalAddress::new(0x2000), Flags::PRESENT)
            .unwrap();

        // Leaf grants neither WRITABLE nor USER, so neither survives the
        // AND even though the intermediate links carry both.
        let t = aspace.lookup(va).unwrap();
        assert_eq!(t.perm, Flags::PRESENT);

        // Strip USER from the PML4 link: a USER leaf no longer reads as
        // user-accessible.
        let va2 = VirtualAddress::new(0x10_1000);
        aspace
            .map_one(&mut alloc, va2, PhysicalAddress::new(0x3000), Flags::USER_RW)
            .unwrap();
        let pml4 = unsafe { get_table(&phys, aspace.root_phys()) };
        let link = pml4.entry(va2.pml4_index());
        pml4
            .entry_mut(va2.pml4_index())
            .set(link.addr(), Flags::PRESENT | Flags::WRITABLE);
        let t = aspace.lookup(va2).unwrap();
        assert!(!t.perm.contains(Flags::USER));
        assert!(t.perm.contains(Flags::WRITABLE));
    }

    #[test]
    fn clear_and_unmap() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = fresh_space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x20_0000);
        let pa = PhysicalAddress::new(0x4000);
        aspace.map_one(&mut alloc, va, pa, Flags::USER_RW).unwrap();

        let old = aspace.unmap_one(va).expect("was mapped");
        assert_eq!(old.pa, pa);
        assert!(aspace.lookup(va).is_none());

        // Unmapping a miss is a no-op.
        assert!(aspace.unmap_one(va).is_none());
        aspace.clear_one(VirtualAddress::new(0x28_0000));
    }

    #[test]
    fn empty_flags_clear_the_leaf() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = fresh_space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x10_0000);
        aspace
            .map_one(&mut alloc, va, PhysicalAddress::new(0x5000), Flags::USER_RW)
            .unwrap();
        aspace
            .map_one(&mut alloc, va, PhysicalAddress::new(0), Flags::empty())
            .unwrap();
        assert!(aspace.lookup(va).is_none());
    }

    #[test]
    fn chain_allocation_failure_reports_level() {
        let phys = TestPhys::with_frames(8);
        // Room for the root and the PDPT, nothing more.
        let mut alloc = BumpAlloc::new(0, 2 << 12);
        let aspace = fresh_space(&phys, &mut alloc);

        let err = aspace
            .map_one(
                &mut alloc,
                VirtualAddress::new(0x10_0000),
                PhysicalAddress::new(0x1000),
                Flags::USER_RW,
            )
            .unwrap_err();
        assert_eq!(err, MapError::OutOfMemory { level: "PD" });

        // The PDPT it did allocate stays linked; the caller owns cleanup.
        let pml4 = unsafe { get_table(&phys, aspace.root_phys()) };
        assert!(pml4.entry(VirtualAddress::new(0x10_0000).pml4_index()).present());
    }

    #[test]
    fn visit_covers_every_node_post_order() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = fresh_space(&phys, &mut alloc);

        // Two mappings sharing PDPT/PD but hitting two different PTs.
        aspace
            .map_one(
                &mut alloc,
                VirtualAddress::new(0x10_0000),
                PhysicalAddress::new(0x1000),
                Flags::USER_RW,
            )
            .unwrap();
        aspace
            .map_one(
                &mut alloc,
                VirtualAddress::new(0x20_0000),
                PhysicalAddress::new(0x2000),
                Flags::USER_RW,
            )
            .unwrap();

        let mut nodes = Vec::new();
        aspace.visit_table_frames(&mut |depth, pa| nodes.push((depth, pa)));

        // Root + PDPT + PD + two PTs.
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes.last().unwrap().0, 0);
        assert_eq!(nodes.last().unwrap().1, aspace.root_phys());
        assert_eq!(nodes.iter().filter(|(d, _)| *d == 3).count(), 2);
    }
}
