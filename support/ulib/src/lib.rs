//! # User-Side Runtime
//!
//! The small library user programs link against: raw system-call wrappers
//! (`int` gates into the kernel) and the heap allocator backing
//! `malloc`/`free`/`calloc`/`realloc` on top of the `Sbrk` system call.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

pub mod heap;
pub mod syscall;

pub use heap::{AllocRecord, HEAP_INFO_CAPACITY, Heap, HeapInfo, HeapInfoError, LockedHeap, Sbrk};
