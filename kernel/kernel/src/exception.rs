//! # Exception and System-Call Dispatch
//!
//! The trap stub saves the application's registers, switches to the kernel
//! stack and page table, and calls [`Kernel::exception`]. Hardware
//! interrupts stay masked for the whole visit. Each trap number decodes to
//! a [`Trap`] variant; the dispatcher is a total match returning what to do
//! next, and the tail is uniform: a still-runnable current process resumes,
//! anything else reschedules.

use crate::process::ProcState;
use crate::registers::Registers;
use crate::{Kernel, Machine, PanicMessage, Resume, phys_read, phys_write};
use bitfield_struct::bitfield;
use kernel_abi::{
    INT_GPF, INT_PAGEFAULT, INT_TIMER, PANIC_MSG_MAX, Syscall, VaMapping,
};
use kernel_frames::{OwnedFrames, PageOwner};
use kernel_info::memory::{NPROC, PAGESIZE};
use kernel_vmem::{AddressSpace, Flags, PhysMapper, VirtualAddress};
use crate::memshow::cpos;

/// Everything that can interrupt a process, decoded from the trap number.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trap {
    Syscall(Syscall),
    Timer,
    PageFault,
    Gpf,
    Unknown(u64),
}

impl Trap {
    #[must_use]
    pub const fn from_intno(intno: u64) -> Self {
        if let Some(syscall) = Syscall::from_intno(intno) {
            return Self::Syscall(syscall);
        }
        match intno {
            INT_TIMER => Self::Timer,
            INT_PAGEFAULT => Self::PageFault,
            INT_GPF => Self::Gpf,
            other => Self::Unknown(other),
        }
    }
}

/// Page-fault error code layout (x86-64).
///
/// Each bit describes the condition that caused the fault.
#[bitfield(u64)]
pub struct PageFaultCode {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool, // bit 0
    /// 0 = read or execute, 1 = write access.
    pub write: bool, // bit 1
    /// 0 = supervisor, 1 = user mode (CPL 3).
    pub user: bool, // bit 2
    /// Reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3
    /// Instruction fetch.
    pub instruction_fetch: bool, // bit 4
    #[bits(59)]
    __: u64,
}

impl PageFaultCode {
    #[must_use]
    pub const fn operation(self) -> &'static str {
        if self.write() { "write" } else { "read" }
    }

    #[must_use]
    pub const fn problem(self) -> &'static str {
        if self.present() { "protection problem" } else { "missing page" }
    }
}

/// What the dispatcher decided; the exception tail makes it a [`Resume`].
enum Action {
    /// Nothing forced a context switch; resume current if still runnable.
    Continue,
    /// Hand the CPU to the scheduler.
    Reschedule,
    /// Terminal.
    Panic(PanicMessage),
}

impl<'m, M: PhysMapper> Kernel<'m, M> {
    /// Handle one trap: `regs` is the frame the stub saved.
    ///
    /// Returns what the stub should do: resume a process, exit the VM, or
    /// die with a message.
    pub fn exception(&mut self, regs: &Registers, machine: &mut impl Machine) -> Resume {
        self.processes[self.current].regs = *regs;

        let trap = Trap::from_intno(regs.intno);
        let code = PageFaultCode::from_bits(regs.err);

        // The invariant sweep and the viewer stay away from kernel-mode
        // faults; the machine may be too broken to draw.
        if !matches!(trap, Trap::PageFault | Trap::Gpf) || code.user() {
            self.check_virtual_memory();
            if self.display_global {
                self.memshow_physical();
                self.memshow_virtual_animate();
            }
        }

        // Control-C exits the virtual machine.
        if machine.check_keyboard() {
            return Resume::Halt;
        }

        match self.dispatch(trap, machine) {
            Action::Panic(msg) => Resume::Panic(msg),
            Action::Reschedule => self.schedule(machine),
            Action::Continue => {
                if self.processes[self.current].state == ProcState::Runnable {
                    self.run(self.current)
                } else {
                    self.schedule(machine)
                }
            }
        }
    }

    fn dispatch(&mut self, trap: Trap, machine: &mut impl Machine) -> Action {
        let pid = self.current;
        match trap {
            Trap::Syscall(Syscall::Panic) => Action::Panic(self.panic_message()),

            Trap::Syscall(Syscall::GetPid) => {
                self.processes[pid].regs.rax = pid as u64;
                Action::Continue
            }

            Trap::Syscall(Syscall::Fork) => {
                let rax = match self.process_fork() {
                    Ok(child) => child as u64,
                    Err(e) => {
                        log::warn!("process {pid}: fork failed: {e}");
                        u64::MAX
                    }
                };
                self.processes[pid].regs.rax = rax;
                Action::Continue
            }

            Trap::Syscall(Syscall::Exit) => {
                self.process_free(pid);
                Action::Reschedule
            }

            Trap::Syscall(Syscall::Yield) => Action::Reschedule,

            Trap::Syscall(Syscall::PageAlloc) => {
                let addr = self.processes[pid].regs.rdi;
                let rax = match self.process_page_alloc(pid, addr) {
                    Ok(()) => 0,
                    Err(e) => {
                        log::warn!("process {pid}: page_alloc({addr:#x}) failed: {e}");
                        u64::MAX
                    }
                };
                self.processes[pid].regs.rax = rax;
                Action::Continue
            }

            Trap::Syscall(Syscall::Brk) => {
                let requested = self.processes[pid].regs.rdi;
                let increment =
                    requested.wrapping_sub(self.processes[pid].program_break.as_u64()) as i64;
                self.processes[pid].regs.rax = match self.sbrk_internal(pid, increment) {
                    Ok(()) => 0,
                    Err(_) => u64::MAX,
                };
                Action::Continue
            }

            Trap::Syscall(Syscall::Sbrk) => {
                let increment = self.processes[pid].regs.rdi as i64;
                let old = self.processes[pid].program_break.as_u64();
                self.processes[pid].regs.rax = match self.sbrk_internal(pid, increment) {
                    Ok(()) => old,
                    Err(_) => u64::MAX,
                };
                Action::Continue
            }

            Trap::Syscall(Syscall::Mapping) => {
                self.syscall_mapping();
                Action::Continue
            }

            Trap::Syscall(Syscall::MemTog) => {
                self.syscall_mem_tog();
                Action::Continue
            }

            Trap::Timer => {
                self.ticks += 1;
                Action::Reschedule
            }

            Trap::PageFault => self.page_fault(machine),

            Trap::Gpf => {
                let regs = self.processes[pid].regs;
                if regs.from_user() {
                    self.console_printf(
                        cpos(24, 0),
                        0x0C00,
                        format_args!(
                            "Process {pid} general protection fault (rip={:#x})!",
                            regs.rip
                        ),
                    );
                    self.processes[pid].state = ProcState::Broken;
                    Action::Continue
                } else {
                    Action::Panic(PanicMessage::from_args(format_args!(
                        "Kernel general protection fault (rip={:#x})!",
                        regs.rip
                    )))
                }
            }

            Trap::Unknown(n) => {
                log::error!("process {pid}: unexpected exception {n}");
                self.console_printf(
                    cpos(24, 0),
                    0x0C00,
                    format_args!("Process {pid} unexpected exception {n}!"),
                );
                self.processes[pid].state = ProcState::Broken;
                Action::Continue
            }
        }
    }

    /// Demand-page the heap, or break the process.
    fn page_fault(&mut self, machine: &mut impl Machine) -> Action {
        let pid = self.current;
        let addr = machine.faulting_address();
        let regs = self.processes[pid].regs;
        let code = PageFaultCode::from_bits(regs.err);

        if !code.user() {
            return Action::Panic(PanicMessage::from_args(format_args!(
                "Kernel page fault for {addr} ({} {}, rip={:#x})!",
                code.operation(),
                code.problem(),
                regs.rip
            )));
        }

        let p = self.processes[pid];
        if addr.as_u64() >= p.original_break.as_u64()
            && addr.as_u64() < p.program_break.as_u64()
        {
            let page = addr.page_base();
            let mapper = self.mapper;
            let aspace = AddressSpace::new(mapper, p.pagetable);

            // Already present: spurious fault, just keep going.
            if aspace.lookup(page).is_some() {
                self.processes[pid].state = ProcState::Runnable;
                return Action::Continue;
            }

            let Some(pa) = self.frames.palloc(PageOwner::Process(pid)) else {
                self.console_printf(
                    cpos(24, 0),
                    0x0C00,
                    format_args!("Process {pid} out of physical memory!"),
                );
                self.processes[pid].state = ProcState::Broken;
                return Action::Continue;
            };
            crate::phys_zero_page(mapper, pa);

            let mut alloc = OwnedFrames::new(&mut self.frames, PageOwner::Process(pid));
            if aspace.map_one(&mut alloc, page, pa, Flags::USER_RW).is_err() {
                self.frames.freepage(pa);
                self.processes[pid].state = ProcState::Broken;
                return Action::Continue;
            }

            self.processes[pid].state = ProcState::Runnable;
            return Action::Continue;
        }

        self.console_printf(
            cpos(24, 0),
            0x0C00,
            format_args!(
                "Process {pid} page fault for {addr} ({} {}, rip={:#x})!",
                code.operation(),
                code.problem(),
                regs.rip
            ),
        );
        self.processes[pid].state = ProcState::Broken;
        Action::Continue
    }

    /// Build the `Panic` service's message: up to [`PANIC_MSG_MAX`] bytes
    /// from the caller's pointer, NUL-terminated, never crossing the mapped
    /// page.
    fn panic_message(&self) -> PanicMessage {
        let p = &self.processes[self.current];
        let ptr = p.regs.rdi;
        if ptr == 0 {
            return PanicMessage::empty();
        }
        let va = VirtualAddress::new(ptr);
        let Some(t) = AddressSpace::new(self.mapper, p.pagetable).lookup(va) else {
            return PanicMessage::empty();
        };

        let mut buf = [0u8; PANIC_MSG_MAX];
        let in_page = (PAGESIZE - va.page_offset()) as usize;
        let n = in_page.min(PANIC_MSG_MAX);
        phys_read(self.mapper, t.pa, &mut buf[..n]);
        let len = buf[..n].iter().position(|&b| b == 0).unwrap_or(n);
        PanicMessage::from_bytes(&buf[..len])
    }

    /// The `Mapping` service: write the translation of `rsi` to user memory
    /// at `rdi`.
    ///
    /// The whole destination must be mapped USER|WRITABLE; anything less is
    /// a silent no-op. The write goes through the destination's own
    /// translations page by page, so a destination straddling a page
    /// boundary works even when its frames are not physically adjacent.
    fn syscall_mapping(&mut self) {
        let p = self.processes[self.current];
        let dst = p.regs.rdi;
        let query = p.regs.rsi;
        let size = core::mem::size_of::<VaMapping>();

        let Some(last) = dst.checked_add(size as u64 - 1) else {
            return;
        };
        let aspace = AddressSpace::new(self.mapper, p.pagetable);

        let needed = Flags::PRESENT | Flags::WRITABLE | Flags::USER;
        let mut page = VirtualAddress::new(dst).page_base().as_u64();
        while page <= last {
            match aspace.lookup(VirtualAddress::new(page)) {
                Some(t) if t.perm.contains(needed) => {}
                _ => return,
            }
            let Some(next) = page.checked_add(PAGESIZE) else {
                return;
            };
            page = next;
        }

        let result = aspace
            .lookup(VirtualAddress::new(query))
            .map_or(VaMapping::UNMAPPED, |t| VaMapping {
                pn: t.pn as i64,
                pa: t.pa.as_u64(),
                perm: t.perm.bits(),
            });
        let bytes = unsafe {
            core::slice::from_raw_parts((&raw const result).cast::<u8>(), size)
        };

        let mut off = 0usize;
        while off < size {
            let va = VirtualAddress::new(dst + off as u64);
            let Some(t) = aspace.lookup(va) else {
                return;
            };
            let in_page = (PAGESIZE - va.page_offset()) as usize;
            let n = in_page.min(size - off);
            phys_write(self.mapper, t.pa, &bytes[off..off + n]);
            off += n;
        }
    }

    /// The `MemTog` service: argument 0 toggles the global viewer flag;
    /// otherwise a process may only toggle its own `display_status`.
    fn syscall_mem_tog(&mut self) {
        let pid = self.current;
        let arg = self.processes[pid].regs.rdi;
        if arg == 0 {
            self.display_global = !self.display_global;
        } else {
            if arg > NPROC as u64 || arg as usize != pid {
                return;
            }
            let p = &mut self.processes[pid];
            p.display_status = !p.display_status;
        }
    }
}
