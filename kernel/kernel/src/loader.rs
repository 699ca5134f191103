//! # Program Loading
//!
//! Program images come from outside the core: the boot loader embeds a
//! small set of programs and hands them over as [`ProgramSet`]. The kernel
//! side of loading lives here: claiming the fixed physical window, copying
//! the bytes, mapping pages with the right permissions, and placing the
//! break.

use crate::{Kernel, phys_write, phys_zero_page};
use kernel_frames::{AssignError, OwnedFrames, PageOwner, Pid};
use kernel_info::memory::{PAGESIZE, PROC_SIZE, PROC_START_ADDR};
use kernel_vmem::{
    AddressSpace, Flags, MapError, PhysMapper, PhysicalAddress, VirtualAddress, align_down,
    align_up,
};

/// One loadable piece of a program image.
#[derive(Copy, Clone, Debug)]
pub struct Segment<'a> {
    /// Destination virtual address of the first byte.
    pub va: u64,
    /// Initialized bytes; may be shorter than `mem_size` (the rest is
    /// zero-filled, bss style).
    pub data: &'a [u8],
    /// Total in-memory size of the segment.
    pub mem_size: u64,
    /// Data segments are writable; text segments are not.
    pub writable: bool,
}

/// A program image: an entry point plus its segments.
#[derive(Copy, Clone, Debug)]
pub struct Program<'a> {
    pub entry: u64,
    pub segments: &'a [Segment<'a>],
}

/// The external loader's catalogue of embedded programs.
pub trait ProgramSet {
    /// Program image number `number`, if it exists.
    fn program(&self, number: usize) -> Option<Program<'_>>;
}

/// Failure loading a program image.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("segment outside the process image window")]
    SegmentOutOfRange,
    #[error("image frame unavailable: {0}")]
    Assign(#[from] AssignError),
    #[error(transparent)]
    Map(#[from] MapError),
}

impl<'m, M: PhysMapper> Kernel<'m, M> {
    /// Copy `program` into pid's fixed physical window at
    /// `PROC_START_ADDR + (pid-1) * PROC_SIZE`, map it, set `rip`, and
    /// place both breaks at the page-rounded end of the image.
    ///
    /// # Errors
    /// Segments that do not fit the window, image frames already taken, or
    /// page-table allocation failure.
    pub fn process_load(&mut self, pid: Pid, program: &Program<'_>) -> Result<(), LoadError> {
        let phys_base = PROC_START_ADDR + (pid as u64 - 1) * PROC_SIZE;
        let mapper = self.mapper;
        let root = self.processes[pid].pagetable;
        let mut image_end = PROC_START_ADDR;

        for seg in program.segments {
            let mem_size = seg.mem_size.max(seg.data.len() as u64);
            let in_window = seg.va >= PROC_START_ADDR
                && seg
                    .va
                    .checked_add(mem_size)
                    .is_some_and(|end| end <= PROC_START_ADDR + PROC_SIZE);
            if !in_window {
                return Err(LoadError::SegmentOutOfRange);
            }

            let start = align_down(seg.va, PAGESIZE);
            let end = align_up(seg.va + mem_size, PAGESIZE);
            let mut va = start;
            while va < end {
                let pa = PhysicalAddress::new(phys_base + (va - PROC_START_ADDR));
                match self.frames.assign(pa, PageOwner::Process(pid)) {
                    Ok(()) => phys_zero_page(mapper, pa),
                    // Overlapping segments may share a page this process
                    // already claimed.
                    Err(AssignError::InUse)
                        if self.frames.info(pa.page_number()).owner
                            == PageOwner::Process(pid) => {}
                    Err(e) => return Err(e.into()),
                }

                let flags = if seg.writable {
                    Flags::USER_RW
                } else {
                    Flags::PRESENT | Flags::USER
                };
                let aspace = AddressSpace::new(mapper, root);
                let mut alloc = OwnedFrames::new(&mut self.frames, PageOwner::Process(pid));
                aspace.map_one(&mut alloc, VirtualAddress::new(va), pa, flags)?;
                va += PAGESIZE;
            }

            phys_write(
                mapper,
                PhysicalAddress::new(phys_base + (seg.va - PROC_START_ADDR)),
                seg.data,
            );
            image_end = image_end.max(seg.va + mem_size);
        }

        let p = &mut self.processes[pid];
        p.regs.rip = program.entry;
        let brk = VirtualAddress::new(align_up(image_end, PAGESIZE));
        p.original_break = brk;
        p.program_break = brk;
        Ok(())
    }
}
