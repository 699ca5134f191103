//! # Round-Robin Scheduler
//!
//! One time quantum = one timer tick. The search starts just past the
//! current pid and takes the first runnable slot; pid 0 is never eligible
//! (it is permanently free) and broken slots are skipped by the same state
//! test. With nothing runnable the scheduler spins, still polling the
//! keyboard so Control-C can end the virtual machine.

use crate::process::ProcState;
use crate::{Kernel, Machine, Resume};
use kernel_info::memory::NPROC;
use kernel_frames::Pid;
use kernel_vmem::PhysMapper;
use crate::memshow::cpos;

impl<'m, M: PhysMapper> Kernel<'m, M> {
    /// Pick the next runnable process and run it.
    pub fn schedule(&mut self, machine: &mut impl Machine) -> Resume {
        let mut pid = self.current;
        loop {
            pid = (pid + 1) % NPROC;
            if self.processes[pid].state == ProcState::Runnable {
                return self.run(pid);
            }
            // Nothing may ever become runnable again; keep the exit path
            // alive while spinning.
            if machine.check_keyboard() {
                return Resume::Halt;
            }
        }
    }

    /// Make `pid` current and tell the stub to restore its registers.
    pub(crate) fn run(&mut self, pid: Pid) -> Resume {
        assert_eq!(
            self.processes[pid].state,
            ProcState::Runnable,
            "running a non-runnable process"
        );
        self.current = pid;

        // Show the running pid in the console's bottom-right corner.
        let digit = b'0' + (pid % 10) as u8;
        let attr = crate::memshow::memstate_color_for_pid(pid) & 0xFF00;
        self.console_set_cell(cpos(24, 79), attr | u16::from(digit));

        Resume::Run(pid)
    }
}
