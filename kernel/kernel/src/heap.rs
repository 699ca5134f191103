//! # Demand-Paged Heap
//!
//! The kernel side of `brk`/`sbrk`. Growth never allocates: the break just
//! moves, and the page-fault handler materializes pages on first touch.
//! Shrinking unmaps and frees every page boundary the break retreats over.

use crate::Kernel;
use kernel_frames::Pid;
use kernel_info::memory::{MEMSIZE_VIRTUAL, PAGESIZE};
use kernel_vmem::{AddressSpace, PhysMapper, VirtualAddress, align_up};

/// Rejected break adjustment.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum SbrkError {
    #[error("program break out of range")]
    OutOfRange,
}

impl<'m, M: PhysMapper> Kernel<'m, M> {
    /// Adjust pid's program break by `increment` bytes.
    ///
    /// The new break must stay in `[original_break, MEMSIZE_VIRTUAL -
    /// PAGESIZE)`; the top page is the user stack.
    ///
    /// # Errors
    /// [`SbrkError::OutOfRange`]; the break is unchanged.
    pub fn sbrk_internal(&mut self, pid: Pid, increment: i64) -> Result<(), SbrkError> {
        let p = self.processes[pid];
        let old = p.program_break.as_u64();
        let Some(new) = old.checked_add_signed(increment) else {
            return Err(SbrkError::OutOfRange);
        };
        if new < p.original_break.as_u64() || new >= MEMSIZE_VIRTUAL - PAGESIZE {
            return Err(SbrkError::OutOfRange);
        }

        if new < old {
            // Heap shrinking: give back every page the break retreats over.
            let mapper = self.mapper;
            let aspace = AddressSpace::new(mapper, p.pagetable);
            let frames = &mut self.frames;
            let mut addr = align_up(new, PAGESIZE);
            let end = align_up(old, PAGESIZE);
            while addr < end {
                if let Some(t) = aspace.unmap_one(VirtualAddress::new(addr)) {
                    frames.freepage(t.pa.page_base());
                }
                addr += PAGESIZE;
            }
        }
        // Growing just moves the break; pages fault in lazily.

        self.processes[pid].program_break = VirtualAddress::new(new);
        Ok(())
    }
}
