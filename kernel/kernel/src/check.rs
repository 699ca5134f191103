//! # Virtual-Memory Invariant Sweep
//!
//! Asserted on every fault boundary (except kernel-mode faults, where the
//! machine may be too damaged to inspect). These are debugging aids: at
//! steady state every one of them holds, and a violation means kernel
//! bookkeeping went wrong, not the user program.

use crate::Kernel;
use crate::process::ProcState;
use kernel_frames::{PageOwner, Pid};
use kernel_info::memory::{NPROC, PAGESIZE};
use kernel_vmem::{AddressSpace, Flags, PhysMapper, PhysicalAddress, VirtualAddress};

impl<'m, M: PhysMapper> Kernel<'m, M> {
    /// Check every operating-system invariant about virtual memory; panic
    /// on the first violation.
    pub fn check_virtual_memory(&self) {
        // Process 0 must never be used.
        assert!(
            self.processes[0].state == ProcState::Free,
            "process 0 must stay free"
        );

        self.check_page_table_mappings(self.kernel_pagetable);
        self.check_page_table_ownership(self.kernel_pagetable, None);

        for pid in 0..NPROC {
            let p = &self.processes[pid];
            if p.state != ProcState::Free && p.pagetable != self.kernel_pagetable {
                self.check_page_table_mappings(p.pagetable);
                self.check_page_table_ownership(p.pagetable, Some(pid));
            }
        }

        // Every referenced page owned by a process refers to a live one.
        for (pn, info) in self.frames.iter() {
            if info.refcount > 0 {
                if let Some(pid) = info.owner.pid() {
                    assert!(
                        self.processes[pid].state != ProcState::Free,
                        "frame {pn} owned by free process {pid}"
                    );
                }
            }
        }
    }

    /// Kernel memory is identity mapped in `root`; data and the kernel
    /// stack are writable, text is not expected to be.
    fn check_page_table_mappings(&self, root: PhysicalAddress) {
        let aspace = AddressSpace::new(self.mapper, root);
        let layout = self.layout;

        let mut va = layout.kernel_start;
        while va < layout.kernel_end {
            let t = aspace
                .lookup(VirtualAddress::new(va))
                .unwrap_or_else(|| panic!("kernel page {va:#x} unmapped"));
            assert!(t.pa == va, "kernel page {va:#x} not identity mapped");
            if va >= layout.kernel_data_start {
                assert!(
                    t.perm.contains(Flags::WRITABLE),
                    "kernel data page {va:#x} not writable"
                );
            }
            va += PAGESIZE;
        }

        let kstack = layout.stack_page();
        let t = aspace
            .lookup(VirtualAddress::new(kstack))
            .expect("kernel stack unmapped");
        assert!(t.pa == kstack, "kernel stack not identity mapped");
        assert!(t.perm.contains(Flags::WRITABLE), "kernel stack not writable");
    }

    /// Every node of the tree at `root` is owned by the root's owner. The
    /// root's refcount is 1, or, for the kernel table, 1 plus the number
    /// of live processes still sharing it. Interior nodes always have
    /// refcount 1.
    fn check_page_table_ownership(&self, root: PhysicalAddress, pid: Option<Pid>) {
        let expected_owner = pid.map_or(PageOwner::Kernel, PageOwner::Process);
        let mut expected_root_refcount: u16 = 1;
        if root == self.kernel_pagetable {
            for p in &self.processes {
                if p.state != ProcState::Free && p.pagetable == self.kernel_pagetable {
                    expected_root_refcount += 1;
                }
            }
        }

        let aspace = AddressSpace::new(self.mapper, root);
        aspace.visit_table_frames(&mut |depth, node| {
            let info = self.frames.info(node.page_number());
            assert!(
                info.owner == expected_owner,
                "page-table node {node} owned by {:?}, expected {:?}",
                info.owner,
                expected_owner
            );
            let expected = if depth == 0 { expected_root_refcount } else { 1 };
            assert!(
                info.refcount == expected,
                "page-table node {node} refcount {}, expected {expected}",
                info.refcount
            );
        });
    }
}
