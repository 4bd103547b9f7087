//! Machine state: main memory, the register file, and the page table
//! published by the running process.
//!
//! Memory is divided into [`NUM_PHYS_PAGES`] frames of [`PAGE_SIZE`]
//! bytes. The register file follows the MIPS convention: 32 general
//! purpose registers followed by the special registers used by the
//! interpreter (Hi/Lo, the three program counters of the branch-delay
//! pipeline, the delayed-load pair, and the bad-address latch).
//!
//! On a context switch the kernel publishes the incoming process's page
//! table into the machine, and harvests it back when the process is
//! switched out. The machine keeps its own copy of the entries; the two
//! sync points replace the raw table pointer a real MMU would hold.

/// Bytes per page. Equal to the disk sector size.
pub const PAGE_SIZE: usize = 128;
/// Number of physical page frames in main memory.
pub const NUM_PHYS_PAGES: usize = 128;
/// Total bytes of simulated main memory.
pub const MEMORY_SIZE: usize = NUM_PHYS_PAGES * PAGE_SIZE;

/// Number of general purpose registers.
pub const NUM_GP_REGS: usize = 32;
/// User stack pointer.
pub const STACK_REG: usize = 29;
/// Return address register.
pub const RET_ADDR_REG: usize = 31;
/// Multiply/divide high word.
pub const HI_REG: usize = 32;
/// Multiply/divide low word.
pub const LO_REG: usize = 33;
/// Current program counter.
pub const PC_REG: usize = 34;
/// Next program counter, one branch-delay slot ahead.
pub const NEXT_PC_REG: usize = 35;
/// Previous program counter, for debugging faulted instructions.
pub const PREV_PC_REG: usize = 36;
/// Destination register of an in-flight delayed load.
pub const LOAD_REG: usize = 37;
/// Value of an in-flight delayed load.
pub const LOAD_VALUE_REG: usize = 38;
/// Latched virtual address of the last faulting access.
pub const BAD_VADDR_REG: usize = 39;
/// Total registers saved and restored across a context switch.
pub const NUM_TOTAL_REGS: usize = 40;

/// Faults the machine can raise on a user memory access or image load.
///
/// A successful translation carries no exception; failure paths return
/// one of these so the exception hook can decide whether to kill the
/// process or retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// Virtual page number outside the address space.
    AddressError,
    /// Write to a page whose read-only bit is set.
    ReadOnly,
    /// Translation produced a physical page number outside main memory.
    BusError,
    /// Process image needs more pages than there are free frames.
    MemoryLimit,
    /// Access to a non-resident page. Never raised here: every valid
    /// page is resident, there is no demand paging.
    PageFault,
}

impl core::fmt::Display for Exception {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Exception::AddressError => write!(f, "address error"),
            Exception::ReadOnly => write!(f, "write to read-only page"),
            Exception::BusError => write!(f, "bus error"),
            Exception::MemoryLimit => write!(f, "out of physical memory"),
            Exception::PageFault => write!(f, "page fault"),
        }
    }
}

bitflags::bitflags! {
    /// Status bits of a page table entry.
    pub struct PteFlags: u8 {
        /// Entry maps a resident page.
        const VALID = 1 << 0;
        /// Page was referenced since the bit was last cleared.
        const USE = 1 << 1;
        /// Page was written since the bit was last cleared.
        const DIRTY = 1 << 2;
        /// Writes to the page fault with [`Exception::ReadOnly`].
        const READ_ONLY = 1 << 3;
    }
}

/// One virtual-to-physical page mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    /// Virtual page number. Equals the entry's index in its table.
    pub virtual_page: usize,
    /// Physical frame backing the page.
    pub physical_page: usize,
    /// Status bits.
    pub flags: PteFlags,
}

/// The machine: memory, registers, and the active page table slot.
pub struct Machine {
    main_memory: Vec<u8>,
    registers: [i32; NUM_TOTAL_REGS],
    page_table: Vec<PageTableEntry>,
}

impl Machine {
    /// Create a machine with zeroed memory and registers and no
    /// published page table.
    pub fn new() -> Self {
        Self {
            main_memory: vec![0; MEMORY_SIZE],
            registers: [0; NUM_TOTAL_REGS],
            page_table: Vec::new(),
        }
    }

    /// Read register `reg`.
    #[inline]
    pub fn read_register(&self, reg: usize) -> i32 {
        self.registers[reg]
    }

    /// Write `value` into register `reg`.
    #[inline]
    pub fn write_register(&mut self, reg: usize, value: i32) {
        self.registers[reg] = value;
    }

    /// Main memory, read-only.
    #[inline]
    pub fn memory(&self) -> &[u8] {
        &self.main_memory
    }

    /// Main memory, writable.
    #[inline]
    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.main_memory
    }

    /// The backing bytes of physical frame `frame`.
    pub fn frame_mut(&mut self, frame: usize) -> &mut [u8] {
        assert!(frame < NUM_PHYS_PAGES, "frame {} out of range", frame);
        let base = frame * PAGE_SIZE;
        &mut self.main_memory[base..base + PAGE_SIZE]
    }

    /// Publish `entries` as the active page table. Called when the
    /// owning process is switched in.
    pub fn publish_page_table(&mut self, entries: &[PageTableEntry]) {
        self.page_table.clear();
        self.page_table.extend_from_slice(entries);
    }

    /// The currently published page table. The switched-out process
    /// harvests use/dirty bits from here.
    pub fn page_table(&self) -> &[PageTableEntry] {
        &self.page_table
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_read_back() {
        let mut m = Machine::new();
        m.write_register(STACK_REG, 0x1000);
        m.write_register(PC_REG, 4);
        assert_eq!(m.read_register(STACK_REG), 0x1000);
        assert_eq!(m.read_register(PC_REG), 4);
        assert_eq!(m.read_register(RET_ADDR_REG), 0);
    }

    #[test]
    fn frame_slices_do_not_overlap() {
        let mut m = Machine::new();
        m.frame_mut(1).fill(0xaa);
        assert!(m.memory()[..PAGE_SIZE].iter().all(|&b| b == 0));
        assert!(m.memory()[PAGE_SIZE..2 * PAGE_SIZE].iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn page_table_publication_is_a_copy() {
        let mut m = Machine::new();
        let entries = [PageTableEntry {
            virtual_page: 0,
            physical_page: 3,
            flags: PteFlags::VALID,
        }];
        m.publish_page_table(&entries);
        assert_eq!(m.page_table(), &entries[..]);
    }
}
