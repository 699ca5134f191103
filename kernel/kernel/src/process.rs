//! # Process Table and Lifecycle
//!
//! `processes[0]` is never used; pids 1.. are real slots. A slot cycles
//! `Free → Runnable → Free` through setup and exit, with `Broken` as the
//! terminal state after an unrecoverable fault; broken slots are skipped
//! by the scheduler but keep their memory until the end of time.

use crate::registers::Registers;
use crate::{Kernel, phys_copy_page, phys_zero_page};
use kernel_frames::{PageOwner, Pid};
use kernel_info::memory::{CONSOLE_ADDR, MEMSIZE_VIRTUAL, NPROC, PAGESIZE, PROC_START_ADDR};
use kernel_vmem::{AddressSpace, Flags, MapError, PhysMapper, PhysicalAddress, VirtualAddress};
use kernel_frames::OwnedFrames;

/// Scheduling state of a process slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcState {
    /// Slot unused.
    Free,
    /// Eligible for the scheduler.
    Runnable,
    /// Dead after an unrecoverable fault; never scheduled again.
    Broken,
}

/// One process descriptor.
#[derive(Copy, Clone, Debug)]
pub struct Process {
    pub pid: Pid,
    pub state: ProcState,
    /// Register frame saved at the last trap.
    pub regs: Registers,
    /// Root of the process's page table; the kernel's table until
    /// configured.
    pub pagetable: PhysicalAddress,
    /// End of the loaded image, page-rounded. The heap floor.
    pub original_break: VirtualAddress,
    /// Current heap top. Pages in `[original_break, program_break)` are
    /// reserved but faulted in lazily.
    pub program_break: VirtualAddress,
    /// Include this process in the memory viewer rotation.
    pub display_status: bool,
}

impl Process {
    pub(crate) fn new(pid: Pid) -> Self {
        Self {
            pid,
            state: ProcState::Free,
            regs: Registers::default(),
            pagetable: PhysicalAddress::new(0),
            original_break: VirtualAddress::new(0),
            program_break: VirtualAddress::new(0),
            display_status: true,
        }
    }
}

/// Failure configuring a process's memory.
#[derive(Debug, thiserror::Error)]
pub enum ProcessSetupError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("bad page address")]
    BadAddress,
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Failure duplicating a process.
#[derive(Debug, thiserror::Error)]
pub enum ForkError {
    #[error("no free process slot")]
    NoFreeSlot,
    #[error("out of physical memory")]
    OutOfMemory,
}

impl<'m, M: PhysMapper> Kernel<'m, M> {
    /// Reset slot `pid` to a blank user process sharing the kernel table.
    pub fn process_init(&mut self, pid: Pid) {
        let p = &mut self.processes[pid];
        *p = Process::new(pid);
        p.regs = Registers::new_user();
        p.pagetable = self.kernel_pagetable;
    }

    /// Give `pid` a private page-table tree carrying the kernel identity
    /// map. Every node frame is owned by `pid` with refcount 1; the shared
    /// console frame gains a reference.
    ///
    /// # Errors
    /// Out of memory; the partial tree is torn down before returning.
    pub fn process_config_tables(&mut self, pid: Pid) -> Result<(), ProcessSetupError> {
        let mapper = self.mapper;
        let Some(root) = self.frames.palloc(PageOwner::Process(pid)) else {
            return Err(ProcessSetupError::OutOfMemory);
        };
        phys_zero_page(mapper, root);

        if let Err(e) = self.install_identity_map(root, PageOwner::Process(pid)) {
            let frames = &mut self.frames;
            AddressSpace::new(mapper, root)
                .visit_table_frames(&mut |_, node| frames.freepage(node));
            return Err(e.into());
        }

        self.processes[pid].pagetable = root;
        self.frames.retain(PhysicalAddress::new(CONSOLE_ADDR));
        Ok(())
    }

    /// Map the single-page user stack at the top of the user region and
    /// point `rsp` past it.
    pub fn process_setup_stack(&mut self, pid: Pid) -> Result<(), ProcessSetupError> {
        let stack_va = VirtualAddress::new(MEMSIZE_VIRTUAL - PAGESIZE);
        let mapper = self.mapper;
        let root = self.processes[pid].pagetable;

        let Some(pa) = self.frames.palloc(PageOwner::Process(pid)) else {
            return Err(ProcessSetupError::OutOfMemory);
        };
        phys_zero_page(mapper, pa);

        let aspace = AddressSpace::new(mapper, root);
        let mut alloc = OwnedFrames::new(&mut self.frames, PageOwner::Process(pid));
        if let Err(e) = aspace.map_one(&mut alloc, stack_va, pa, Flags::USER_RW) {
            self.frames.freepage(pa);
            return Err(e.into());
        }
        self.processes[pid].regs.rsp = MEMSIZE_VIRTUAL;
        Ok(())
    }

    /// Fork the current process into a free slot.
    ///
    /// Every present user mapping is copied into a freshly allocated frame
    /// with identical permissions; the kernel identity map (console
    /// included) is shared via the child's own table, not copied. The child
    /// inherits the register frame with `rax = 0`.
    ///
    /// # Errors
    /// No free slot, or out of memory; in the latter case the half-built child
    /// is rolled back completely.
    pub fn process_fork(&mut self) -> Result<Pid, ForkError> {
        let parent = self.current;
        let Some(child) = (1..NPROC).find(|&i| self.processes[i].state == ProcState::Free)
        else {
            return Err(ForkError::NoFreeSlot);
        };

        self.process_init(child);
        if self.process_config_tables(child).is_err() {
            self.processes[child].state = ProcState::Free;
            return Err(ForkError::OutOfMemory);
        }

        let mapper = self.mapper;
        let parent_root = self.processes[parent].pagetable;
        let child_root = self.processes[child].pagetable;

        let mut va = PROC_START_ADDR;
        while va < MEMSIZE_VIRTUAL {
            let translation =
                AddressSpace::new(mapper, parent_root).lookup(VirtualAddress::new(va));
            if let Some(t) = translation {
                if t.perm.contains(Flags::PRESENT | Flags::USER) {
                    let Some(pa) = self.frames.palloc(PageOwner::Process(child)) else {
                        self.process_free(child);
                        return Err(ForkError::OutOfMemory);
                    };
                    phys_copy_page(mapper, t.pa.page_base(), pa);

                    let child_space = AddressSpace::new(mapper, child_root);
                    let mut alloc = OwnedFrames::new(&mut self.frames, PageOwner::Process(child));
                    if child_space
                        .map_one(&mut alloc, VirtualAddress::new(va), pa, t.perm)
                        .is_err()
                    {
                        self.frames.freepage(pa);
                        self.process_free(child);
                        return Err(ForkError::OutOfMemory);
                    }
                }
            }
            va += PAGESIZE;
        }

        let parent_proc = self.processes[parent];
        let p = &mut self.processes[child];
        p.regs = parent_proc.regs;
        p.regs.rax = 0;
        p.original_break = parent_proc.original_break;
        p.program_break = parent_proc.program_break;
        p.display_status = parent_proc.display_status;
        p.state = ProcState::Runnable;
        Ok(child)
    }

    /// Release everything slot `pid` owns and mark it free.
    ///
    /// Drops one reference from every present user-accessible mapping (user
    /// frames fall to zero and become free; the shared console just loses
    /// one sharer), then frees the page-table nodes, children before
    /// parents.
    pub fn process_free(&mut self, pid: Pid) {
        let root = self.processes[pid].pagetable;
        let kernel_root = self.kernel_pagetable;
        if root != kernel_root {
            let mapper = self.mapper;
            let frames = &mut self.frames;
            let aspace = AddressSpace::new(mapper, root);

            let mut va = 0u64;
            while va < MEMSIZE_VIRTUAL {
                if let Some(t) = aspace.lookup(VirtualAddress::new(va)) {
                    if t.perm.contains(Flags::PRESENT | Flags::USER) {
                        frames.freepage(t.pa.page_base());
                    }
                }
                va += PAGESIZE;
            }
            aspace.visit_table_frames(&mut |_, node| frames.freepage(node));
        }

        let p = &mut self.processes[pid];
        p.state = ProcState::Free;
        p.pagetable = kernel_root;
        p.original_break = VirtualAddress::new(0);
        p.program_break = VirtualAddress::new(0);
    }

    /// The `PageAlloc` service: map a fresh zeroed user page at `addr`.
    pub(crate) fn process_page_alloc(
        &mut self,
        pid: Pid,
        addr: u64,
    ) -> Result<(), ProcessSetupError> {
        if addr % PAGESIZE != 0 || addr < PROC_START_ADDR || addr >= MEMSIZE_VIRTUAL {
            return Err(ProcessSetupError::BadAddress);
        }
        let mapper = self.mapper;
        let root = self.processes[pid].pagetable;
        let Some(pa) = self.frames.palloc(PageOwner::Process(pid)) else {
            return Err(ProcessSetupError::OutOfMemory);
        };
        phys_zero_page(mapper, pa);

        let aspace = AddressSpace::new(mapper, root);
        let mut alloc = OwnedFrames::new(&mut self.frames, PageOwner::Process(pid));
        if let Err(e) = aspace.map_one(&mut alloc, VirtualAddress::new(addr), pa, Flags::USER_RW) {
            self.frames.freepage(pa);
            return Err(e.into());
        }
        Ok(())
    }
}
