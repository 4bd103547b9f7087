//! An instructional operating-system kernel over a simulated machine.
//!
//! The kernel hosts user programs on the MIPS-like machine the `mimic`
//! crate simulates, giving them virtual memory, CPU time, and files:
//!
//! - [`frame`] and [`addrspace`] manage physical frames and per-process
//!   page tables, load NOFF executable images page by page, and
//!   translate user addresses with a full exception taxonomy.
//! - [`thread`] and [`sched`] implement threads and a three-level
//!   feedback scheduler: preemptive shortest-remaining-time-first on
//!   top, preemptive priority in the middle, round-robin at the bottom,
//!   with aging to promote long-waiting threads.
//! - [`fs`] plugs the machine's disk into the `index_fs` file system;
//!   [`syscall`] exposes the file operations to user programs.
//! - [`kernel`] ties everything into one explicit context and drives
//!   context switches and timer ticks.
//!
//! Mutual exclusion is interrupt disabling: the machine is a single
//! simulated CPU, so code holding an `InterruptGuard` cannot be
//! preempted, and every scheduler entry point asserts interrupts are
//! off.

#![deny(missing_docs)]

pub mod addrspace;
pub mod frame;
pub mod fs;
pub mod kernel;
pub mod noff;
pub mod sched;
pub mod syscall;
pub mod thread;

pub use kernel::{Handoff, Kernel};
