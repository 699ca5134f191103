//! # Memory Layout
//!
//! Physical layout:
//!
//! ```text
//! 0x00_0000 ┌─────────────────────────────────┐
//!           │  Low memory / BIOS              │
//! 0x04_0000 ├─────────────────────────────────┤ KERNEL_START_ADDR
//!           │  Kernel code + data             │
//!           │  Kernel stack (top at 0x80000)  │
//! 0x08_0000 ├─────────────────────────────────┤ KERNEL_STACK_TOP
//!           │  Reserved                       │
//! 0x0A_0000 ├─────────────────────────────────┤ RESERVED_IO_START
//!           │  I/O memory, CGA console        │
//! 0x10_0000 ├─────────────────────────────────┤ PROC_START_ADDR
//!           │  Process images, one PROC_SIZE  │
//!           │  window per initial process     │
//! 0x20_0000 └─────────────────────────────────┘ MEMSIZE_PHYSICAL
//! ```
//!
//! Per-process virtual layout: the region below [`PROC_START_ADDR`] is the
//! kernel identity map; user code and data start at [`PROC_START_ADDR`]; the
//! heap grows upward from the end of the loaded image; the single-page user
//! stack sits at the top of the user region, just below [`MEMSIZE_VIRTUAL`].

/// Size of a physical frame and of a virtual page, in bytes.
pub const PAGESIZE: u64 = 4096;

/// Total physical memory managed by the frame table.
pub const MEMSIZE_PHYSICAL: u64 = 0x20_0000;

/// Number of physical frames.
pub const NPAGES: usize = (MEMSIZE_PHYSICAL / PAGESIZE) as usize;

/// Top of every process's virtual address space (exclusive).
pub const MEMSIZE_VIRTUAL: u64 = 0x30_0000;

/// Number of virtual pages per process address space.
pub const N_VIRTUAL_PAGES: usize = (MEMSIZE_VIRTUAL / PAGESIZE) as usize;

/// Where the kernel image begins in physical memory.
pub const KERNEL_START_ADDR: u64 = 0x4_0000;

/// Top of the kernel stack; the stack occupies the single page below it.
pub const KERNEL_STACK_TOP: u64 = 0x8_0000;

/// Start of the reserved I/O hole (inclusive).
pub const RESERVED_IO_START: u64 = 0xA_0000;

/// End of the reserved I/O hole (exclusive).
pub const RESERVED_IO_END: u64 = 0x10_0000;

/// Physical address of the CGA text console frame.
pub const CONSOLE_ADDR: u64 = 0xB_8000;

/// First user virtual address; also where the loader places process images
/// in physical memory.
pub const PROC_START_ADDR: u64 = 0x10_0000;

/// Size of the physical window the loader reserves per initial process.
pub const PROC_SIZE: u64 = 0x4_0000;

/// Number of process-table slots. Slot 0 is permanently free.
pub const NPROC: usize = 16;

/// Timer interrupt frequency (ticks per second).
pub const HZ: u32 = 100;

/// Console geometry: 80×25 cells of 16 bits (low byte ASCII, high byte
/// colour attribute).
pub const CONSOLE_COLUMNS: usize = 80;
pub const CONSOLE_ROWS: usize = 25;

/// Is this physical address inside memory whose use is dictated by the
/// hardware? Covers the null page and the I/O hole (which contains the
/// console). Reserved frames are never handed out by the frame allocator.
#[inline]
#[must_use]
pub const fn physical_memory_reserved(pa: u64) -> bool {
    pa == 0 || (pa >= RESERVED_IO_START && pa < RESERVED_IO_END)
}

const _: () = {
    assert!(MEMSIZE_PHYSICAL % PAGESIZE == 0);
    assert!(MEMSIZE_VIRTUAL % PAGESIZE == 0);
    assert!(KERNEL_START_ADDR % PAGESIZE == 0);
    assert!(KERNEL_STACK_TOP % PAGESIZE == 0);
    assert!(CONSOLE_ADDR % PAGESIZE == 0);
    assert!(CONSOLE_ADDR >= RESERVED_IO_START && CONSOLE_ADDR < RESERVED_IO_END);
    assert!(PROC_START_ADDR == RESERVED_IO_END);
    assert!(MEMSIZE_VIRTUAL > MEMSIZE_PHYSICAL);
    assert!(NPROC >= 2);
    assert!(2 * CONSOLE_COLUMNS * CONSOLE_ROWS <= PAGESIZE as usize);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_predicate() {
        assert!(physical_memory_reserved(0));
        assert!(!physical_memory_reserved(PAGESIZE));
        assert!(!physical_memory_reserved(KERNEL_START_ADDR));
        assert!(physical_memory_reserved(RESERVED_IO_START));
        assert!(physical_memory_reserved(CONSOLE_ADDR));
        assert!(physical_memory_reserved(RESERVED_IO_END - 1));
        assert!(!physical_memory_reserved(RESERVED_IO_END));
        assert!(!physical_memory_reserved(PROC_START_ADDR));
    }
}
