//! # Console Memory Viewer
//!
//! Paints the frame table and one process's virtual address space onto the
//! CGA text console: one cell per page, coloured by owner. Not on any
//! critical path; everything here is best-effort display.

use crate::Kernel;
use core::fmt;
use kernel_frames::{PageOwner, Pid};
use kernel_info::memory::{
    CONSOLE_ADDR, CONSOLE_COLUMNS, CONSOLE_ROWS, HZ, MEMSIZE_VIRTUAL, NPROC, PAGESIZE,
};
use kernel_vmem::{AddressSpace, Flags, PhysMapper, PhysicalAddress, VirtualAddress};

/// Total number of console cells.
pub(crate) const CONSOLE_CELLS: usize = CONSOLE_COLUMNS * CONSOLE_ROWS;

/// Cell index of `(row, col)`.
#[inline]
pub(crate) const fn cpos(row: usize, col: usize) -> usize {
    row * CONSOLE_COLUMNS + col
}

/// Blank cell: space on light grey.
const BLANK: u16 = 0x0700 | b' ' as u16;

/// Cell templates per owner kind: kernel, reserved, free, then one per
/// pid. The final entry marks shared frames.
const MEMSTATE_COLORS: [u16; 19] = [
    0x0D00 | b'K' as u16,
    0x0700 | b'R' as u16,
    0x0700 | b'.' as u16,
    0x0C00 | b'1' as u16,
    0x0A00 | b'2' as u16,
    0x0900 | b'3' as u16,
    0x0E00 | b'4' as u16,
    0x0F00 | b'5' as u16,
    0x0C00 | b'6' as u16,
    0x0A00 | b'7' as u16,
    0x0900 | b'8' as u16,
    0x0E00 | b'9' as u16,
    0x0F00 | b'A' as u16,
    0x0C00 | b'B' as u16,
    0x0A00 | b'C' as u16,
    0x0900 | b'D' as u16,
    0x0E00 | b'E' as u16,
    0x0F00 | b'F' as u16,
    b'S' as u16,
];

const SHARED_COLOR: u16 = MEMSTATE_COLORS[18];

/// Cell template for a frame owned by `owner`.
fn memstate_color(owner: PageOwner) -> u16 {
    let index = match owner {
        PageOwner::Kernel => 0,
        PageOwner::Reserved => 1,
        PageOwner::Free => 2,
        PageOwner::Process(pid) => 2 + pid,
    };
    MEMSTATE_COLORS[index]
}

pub(crate) fn memstate_color_for_pid(pid: Pid) -> u16 {
    memstate_color(PageOwner::Process(pid))
}

/// Animation cursor of the virtual-space display.
#[derive(Copy, Clone, Debug)]
pub(crate) struct MemshowState {
    last_ticks: u64,
    showing: usize,
}

impl MemshowState {
    pub(crate) const fn new() -> Self {
        Self { last_ticks: 0, showing: 1 }
    }
}

impl<'m, M: PhysMapper> Kernel<'m, M> {
    fn console(&self) -> &'m mut [u16; CONSOLE_CELLS] {
        unsafe { self.mapper.phys_to_mut(PhysicalAddress::new(CONSOLE_ADDR)) }
    }

    /// Blank the whole console.
    pub(crate) fn console_clear(&self) {
        self.console().fill(BLANK);
    }

    pub(crate) fn console_set_cell(&self, pos: usize, cell: u16) {
        if pos < CONSOLE_CELLS {
            self.console()[pos] = cell;
        }
    }

    /// Formatted print starting at cell `pos`, every character carrying
    /// `attr` in its high byte. Clipped at the end of the console.
    pub(crate) fn console_printf(&self, pos: usize, attr: u16, args: fmt::Arguments<'_>) {
        struct CellWriter<'a> {
            cells: &'a mut [u16; CONSOLE_CELLS],
            pos: usize,
            attr: u16,
        }
        impl fmt::Write for CellWriter<'_> {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                for ch in s.chars() {
                    if self.pos >= CONSOLE_CELLS {
                        break;
                    }
                    self.cells[self.pos] = self.attr | u16::from(ch as u8);
                    self.pos += 1;
                }
                Ok(())
            }
        }
        let mut w = CellWriter { cells: self.console(), pos, attr };
        let _ = fmt::write(&mut w, args);
    }

    /// Draw the frame table: 64 frames per row, coloured by owner, shared
    /// frames (other than the console) in the distinct shared colour.
    pub(crate) fn memshow_physical(&self) {
        self.console_printf(cpos(0, 32), 0x0F00, format_args!("PHYSICAL MEMORY"));
        let console_pn = PhysicalAddress::new(CONSOLE_ADDR).page_number();

        for (pn, info) in self.frames.iter() {
            if pn % 64 == 0 {
                self.console_printf(
                    cpos(1 + pn / 64, 3),
                    0x0F00,
                    format_args!("0x{:06X} ", pn << 12),
                );
            }
            let owner = if info.refcount == 0 { PageOwner::Free } else { info.owner };
            let mut color = memstate_color(owner);
            if info.refcount > 1 && pn != console_pn {
                color = SHARED_COLOR | 0x0F00;
            }
            self.console_set_cell(cpos(1 + pn / 64, 12 + pn % 64), color);
        }
    }

    /// Draw one process's virtual address space. User-accessible pages get
    /// reversed fore/background nibbles; shared frames the shared colour.
    pub(crate) fn memshow_virtual(&self, root: PhysicalAddress, pid: Pid) {
        self.console_printf(
            cpos(10, 26),
            0x0F00,
            format_args!("VIRTUAL ADDRESS SPACE FOR {pid} "),
        );
        let aspace = AddressSpace::new(self.mapper, root);

        let mut pn = 0usize;
        while (pn as u64) * PAGESIZE < MEMSIZE_VIRTUAL {
            let va = VirtualAddress::new(pn as u64 * PAGESIZE);
            let color = match aspace.lookup(va) {
                None => BLANK,
                Some(t) => {
                    let info = self.frames.info(t.pn);
                    let owner = if info.refcount == 0 { PageOwner::Free } else { info.owner };
                    let mut color = memstate_color(owner);
                    if t.perm.contains(Flags::USER) {
                        // reverse video for user-accessible pages
                        color = ((color & 0x0F00) << 4)
                            | ((color & 0xF000) >> 4)
                            | (color & 0x00FF);
                    }
                    if info.refcount > 1 && va != CONSOLE_ADDR {
                        color = SHARED_COLOR | (color & 0xF000);
                        if !t.perm.contains(Flags::USER) {
                            color |= 0x0F00;
                        }
                    }
                    color
                }
            };
            if pn % 64 == 0 {
                self.console_printf(
                    cpos(11 + pn / 64, 3),
                    0x0F00,
                    format_args!("0x{:06X} ", va.as_u64()),
                );
            }
            self.console_set_cell(cpos(11 + pn / 64, 12 + pn % 64), color);
            pn += 1;
        }
    }

    /// Rotate the virtual-space display to a new process every quarter
    /// second of ticks, skipping free slots and processes that asked not to
    /// be shown.
    pub(crate) fn memshow_virtual_animate(&mut self) {
        if self.memshow.last_ticks == 0
            || self.ticks - self.memshow.last_ticks >= u64::from(HZ / 4)
        {
            self.memshow.last_ticks = self.ticks;
            self.memshow.showing += 1;
        }

        while self.memshow.showing <= 2 * NPROC
            && self.processes[self.memshow.showing % NPROC].state
                == crate::process::ProcState::Free
        {
            self.memshow.showing += 1;
        }
        self.memshow.showing %= NPROC;

        let showing = self.memshow.showing;
        let p = &self.processes[showing];
        if p.state != crate::process::ProcState::Free && p.display_status {
            self.memshow_virtual(p.pagetable, showing);
        }
    }
}
