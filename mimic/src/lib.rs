//! The simulated machine that the kernel drives.
//!
//! This crate plays the role of the hardware: a byte-addressed main
//! memory, a MIPS-like register file, a synchronous sector disk, an
//! interrupt enable flag, and a tick counter. The kernel never touches
//! host resources directly; everything it "executes against" lives here.
//!
//! The instruction interpreter itself is not part of this crate. The
//! machine only exposes the state the interpreter and the kernel agree
//! on: memory, registers, the published page table of the running
//! process, and the exception taxonomy raised on bad accesses.

pub mod disk;
pub mod interrupt;
pub mod machine;
pub mod stats;
