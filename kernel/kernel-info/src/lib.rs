//! # Kernel Configuration and Boot Interface
//!
//! This crate is the authoritative source for the machine's memory map and
//! the small amount of configuration that varies at boot time. It is shared
//! by every other crate in the tree: the frame table sizes its arrays from
//! it, the page-table engine takes its page geometry from it, and the kernel
//! proper builds its identity map from it.
//!
//! The crate is organized into two modules:
//!
//! * [`memory`]: compile-time constants describing the physical and virtual
//!   memory layout, with build-time assertions tying them together.
//! * [`boot`]: the `#[repr(C)]` handoff structure the loader fills in
//!   (where exactly the kernel image ends is only known at link/load time),
//!   plus boot command parsing.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
