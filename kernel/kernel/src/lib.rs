//! # Kernel Core
//!
//! The memory-management and process-isolation core: a frame table, one
//! four-level page table per process, a round-robin scheduler, a small
//! syscall surface, and a page-fault-driven demand-paged heap.
//!
//! All mutable kernel state lives in one [`Kernel`] aggregate owned by the
//! kernel entry point and passed by `&mut` into every operation. Interrupts
//! are masked whenever kernel code runs, so there is exactly one writer and
//! no locking.
//!
//! The world outside the core is reached through seams:
//!
//! - [`kernel_vmem::PhysMapper`]: how kernel code touches physical frames
//!   (identity mapping on the metal, simulated RAM under test);
//! - [`Machine`]: keyboard polling and the fault-address register;
//! - [`loader::ProgramSet`]: the program images the external loader ships.
//!
//! The boot loader, the trap save/restore stub, and the timer programmer
//! stay outside: the stub calls [`Kernel::exception`] with the saved
//! register frame and acts on the returned [`Resume`].

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

mod check;
mod exception;
mod heap;
pub mod loader;
mod memshow;
mod process;
pub mod registers;
mod sched;

pub use exception::{PageFaultCode, Trap};
pub use heap::SbrkError;
pub use process::{ForkError, ProcState, Process, ProcessSetupError};
pub use registers::Registers;

use core::fmt;
use kernel_abi::PANIC_MSG_MAX;
use kernel_frames::{FrameTable, OwnedFrames, PageOwner, Pid};
use kernel_info::boot::{BootLayout, parse_boot_command};
use kernel_info::memory::{CONSOLE_ADDR, NPROC, PAGESIZE, PROC_START_ADDR};
use kernel_vmem::{
    AddressSpace, Flags, MapError, PhysMapper, PhysicalAddress, VirtualAddress,
};
use loader::{LoadError, ProgramSet};
use memshow::MemshowState;

/// Hardware the core pokes but does not model: the keyboard and the
/// fault-address register.
pub trait Machine {
    /// Poll the keyboard. `true` means Control-C was typed and the virtual
    /// machine should exit.
    fn check_keyboard(&mut self) -> bool;

    /// The faulting address (CR2) of the most recent page fault.
    fn faulting_address(&self) -> VirtualAddress;
}

/// What the trap stub should do after the kernel handled an exception.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Resume {
    /// Load this process's page table and restore its registers.
    Run(Pid),
    /// Exit the virtual machine (Control-C).
    Halt,
    /// Unrecoverable; show the message and stop.
    Panic(PanicMessage),
}

/// A bounded panic message, possibly copied out of user memory.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PanicMessage {
    bytes: [u8; PANIC_MSG_MAX],
    len: usize,
}

impl PanicMessage {
    #[must_use]
    pub const fn empty() -> Self {
        Self { bytes: [0; PANIC_MSG_MAX], len: 0 }
    }

    /// Keep at most [`PANIC_MSG_MAX`] bytes of `src`.
    #[must_use]
    pub fn from_bytes(src: &[u8]) -> Self {
        let mut msg = Self::empty();
        let n = src.len().min(PANIC_MSG_MAX);
        msg.bytes[..n].copy_from_slice(&src[..n]);
        msg.len = n;
        msg
    }

    /// Format into the bounded buffer, truncating on overflow.
    #[must_use]
    pub fn from_args(args: fmt::Arguments<'_>) -> Self {
        struct Cursor<'a>(&'a mut PanicMessage);
        impl fmt::Write for Cursor<'_> {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                for &b in s.as_bytes() {
                    if self.0.len == PANIC_MSG_MAX {
                        break;
                    }
                    self.0.bytes[self.0.len] = b;
                    self.0.len += 1;
                }
                Ok(())
            }
        }
        let mut msg = Self::empty();
        let _ = fmt::write(&mut Cursor(&mut msg), args);
        msg
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.as_bytes() {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PanicMessage({self})")
    }
}

/// Boot failure. Nothing survives one of these; the machine has no state
/// worth keeping yet.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("boot layout rejected")]
    BadLayout,
    #[error("out of physical memory during boot")]
    OutOfMemory,
    #[error("boot command selects unknown program {0}")]
    UnknownProgram(usize),
    #[error(transparent)]
    Setup(#[from] ProcessSetupError),
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// The kernel aggregate: every piece of process-wide mutable state.
pub struct Kernel<'m, M: PhysMapper> {
    mapper: &'m M,
    layout: BootLayout,
    frames: FrameTable,
    processes: [Process; NPROC],
    current: Pid,
    ticks: u64,
    kernel_pagetable: PhysicalAddress,
    display_global: bool,
    memshow: MemshowState,
}

impl<'m, M: PhysMapper> Kernel<'m, M> {
    /// Initialize the hardware-facing state and the initial process set.
    ///
    /// Classifies physical memory, builds the kernel identity map, clears
    /// the console, and loads the processes named by the boot `command`.
    ///
    /// # Errors
    /// Any misconfiguration or out-of-memory during bring-up; the caller
    /// has nothing to clean up.
    pub fn boot(
        mapper: &'m M,
        layout: BootLayout,
        command: Option<&str>,
        programs: &impl ProgramSet,
    ) -> Result<Self, BootError> {
        if !layout.is_sane() {
            return Err(BootError::BadLayout);
        }

        let mut kernel = Self {
            mapper,
            layout,
            frames: FrameTable::new(&layout),
            processes: core::array::from_fn(Process::new),
            current: 1,
            ticks: 0,
            kernel_pagetable: PhysicalAddress::new(0),
            display_global: true,
            memshow: MemshowState::new(),
        };

        let root = kernel
            .frames
            .palloc(PageOwner::Kernel)
            .ok_or(BootError::OutOfMemory)?;
        phys_zero_page(mapper, root);
        kernel.kernel_pagetable = root;
        kernel
            .install_identity_map(root, PageOwner::Kernel)
            .map_err(ProcessSetupError::Map)?;

        // Everyone shares the kernel table until configured.
        for p in &mut kernel.processes {
            p.pagetable = root;
        }

        kernel.console_clear();

        let plan = parse_boot_command(command);
        for i in 0..plan.instances {
            kernel.process_setup(i + 1, plan.program, programs)?;
        }

        log::info!(
            "kernel up: {} free frames, {} initial process(es)",
            kernel.frames.free_frames(),
            plan.instances
        );
        Ok(kernel)
    }

    /// Hand the CPU to the first process.
    pub fn start(&mut self) -> Resume {
        self.run(1)
    }

    /// Install the kernel identity map into the table rooted at `root`,
    /// charging any page-table nodes to `owner`.
    ///
    /// The map is the same in every address space: everything below
    /// [`PROC_START_ADDR`] identity-mapped and kernel-only read-write,
    /// except the kernel text (read-only) and the console (additionally
    /// user-accessible).
    pub(crate) fn install_identity_map(
        &mut self,
        root: PhysicalAddress,
        owner: PageOwner,
    ) -> Result<(), MapError> {
        let layout = self.layout;
        let aspace = AddressSpace::new(self.mapper, root);
        let mut alloc = OwnedFrames::new(&mut self.frames, owner);

        aspace.map_range(
            &mut alloc,
            VirtualAddress::new(0),
            PhysicalAddress::new(0),
            PROC_START_ADDR,
            Flags::KERNEL_RW,
        )?;
        aspace.map_range(
            &mut alloc,
            VirtualAddress::new(layout.kernel_start),
            PhysicalAddress::new(layout.kernel_start),
            layout.kernel_data_start - layout.kernel_start,
            Flags::PRESENT,
        )?;
        aspace.map_one(
            &mut alloc,
            VirtualAddress::new(CONSOLE_ADDR),
            PhysicalAddress::new(CONSOLE_ADDR),
            Flags::USER_RW,
        )?;
        Ok(())
    }

    fn process_setup(
        &mut self,
        pid: Pid,
        program_number: usize,
        programs: &impl ProgramSet,
    ) -> Result<(), BootError> {
        self.process_init(pid);
        self.process_config_tables(pid)?;
        let program = programs
            .program(program_number)
            .ok_or(BootError::UnknownProgram(program_number))?;
        self.process_load(pid, &program)?;
        self.process_setup_stack(pid)?;
        self.processes[pid].state = ProcState::Runnable;
        Ok(())
    }

    /// The address space of an arbitrary root table.
    #[must_use]
    pub fn address_space(&self, root: PhysicalAddress) -> AddressSpace<'m, M> {
        AddressSpace::new(self.mapper, root)
    }

    #[must_use]
    pub fn process(&self, pid: Pid) -> &Process {
        &self.processes[pid]
    }

    #[must_use]
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    #[must_use]
    pub const fn current(&self) -> Pid {
        self.current
    }

    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    #[must_use]
    pub const fn kernel_pagetable(&self) -> PhysicalAddress {
        self.kernel_pagetable
    }

    #[must_use]
    pub const fn display_enabled(&self) -> bool {
        self.display_global
    }
}

/// Route `log` output to the emulator's debug console. The boot stub calls
/// this once, before [`Kernel::boot`]; hosted tests skip it and run with
/// logging disabled.
pub fn init_logging() {
    let _ = kernel_debugcon::DebugconLogger::new(log::LevelFilter::Info).init();
}

/// Zero the frame at `pa` (page-aligned).
pub(crate) fn phys_zero_page<M: PhysMapper>(mapper: &M, pa: PhysicalAddress) {
    debug_assert!(pa.is_page_aligned());
    let page: &mut [u8; PAGESIZE as usize] = unsafe { mapper.phys_to_mut(pa) };
    page.fill(0);
}

/// Copy one whole frame `src` → `dst` (both page-aligned, distinct).
pub(crate) fn phys_copy_page<M: PhysMapper>(
    mapper: &M,
    src: PhysicalAddress,
    dst: PhysicalAddress,
) {
    debug_assert!(src.is_page_aligned() && dst.is_page_aligned() && src != dst);
    let s = unsafe { mapper.phys_to_mut::<u8>(src) } as *mut u8 as *const u8;
    let d = unsafe { mapper.phys_to_mut::<u8>(dst) } as *mut u8;
    unsafe {
        core::ptr::copy_nonoverlapping(s, d, PAGESIZE as usize);
    }
}

/// Write `bytes` to physical memory starting at `pa`.
///
/// Chunked frame by frame: a [`PhysMapper`] only promises that single
/// frames are reachable, not that consecutive frames are adjacent in the
/// kernel's view.
pub(crate) fn phys_write<M: PhysMapper>(mapper: &M, pa: PhysicalAddress, bytes: &[u8]) {
    let mut off = 0usize;
    while off < bytes.len() {
        let cur = pa + off as u64;
        let in_page = (PAGESIZE - (cur.as_u64() % PAGESIZE)) as usize;
        let n = in_page.min(bytes.len() - off);
        let dst = unsafe { mapper.phys_to_mut::<u8>(cur) } as *mut u8;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr().add(off), dst, n);
        }
        off += n;
    }
}

/// Read physical memory starting at `pa` into `buf`, frame by frame.
pub(crate) fn phys_read<M: PhysMapper>(mapper: &M, pa: PhysicalAddress, buf: &mut [u8]) {
    let mut off = 0usize;
    while off < buf.len() {
        let cur = pa + off as u64;
        let in_page = (PAGESIZE - (cur.as_u64() % PAGESIZE)) as usize;
        let n = in_page.min(buf.len() - off);
        let src = unsafe { mapper.phys_to_mut::<u8>(cur) } as *mut u8 as *const u8;
        unsafe {
            core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr().add(off), n);
        }
        off += n;
    }
}
