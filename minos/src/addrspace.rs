//! Address spaces: per-process page tables and executable loading.
//!
//! An address space owns a flat page table covering the contiguous
//! virtual range `[0, num_pages)`. Loading an executable claims one
//! physical frame per page up front, then copies each segment in page
//! by page: consecutive virtual pages land on whatever frames the
//! allocator handed out, so a segment spanning several pages cannot be
//! transferred with one bulk read.
//!
//! Address translation reports failures as [`Exception`] values
//! instead of aborting; the exception hook of the machine decides what
//! to do with a faulting process.

use crate::frame::{Frame, FrameAllocator};
use crate::noff::{NoffError, NoffHeader, Segment};
use index_fs::{Disk, OpenFile};
use log::debug;
use mimic::machine::{
    Exception, Machine, PageTableEntry, PteFlags, MEMORY_SIZE, NEXT_PC_REG, NUM_PHYS_PAGES,
    NUM_TOTAL_REGS, PAGE_SIZE, PC_REG, STACK_REG,
};

/// Bytes of user stack appended past the loaded image.
pub const USER_STACK_SIZE: usize = 1024;

/// Ways loading an executable image can fail.
#[derive(Debug)]
pub enum LoadError {
    /// The NOFF header is missing or malformed.
    Noff(NoffError),
    /// The executable file could not be read.
    Fs(index_fs::Error),
    /// The image needs more pages than there are free frames. Nothing
    /// was allocated.
    MemoryLimit,
    /// A segment named a virtual address outside the computed image.
    Translate(Exception),
    /// A segment's file span ends before its declared size.
    Truncated,
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LoadError::Noff(e) => write!(f, "{}", e),
            LoadError::Fs(e) => write!(f, "reading executable: {}", e),
            LoadError::MemoryLimit => write!(f, "{}", Exception::MemoryLimit),
            LoadError::Translate(e) => write!(f, "loading segment: {}", e),
            LoadError::Truncated => write!(f, "truncated segment"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<NoffError> for LoadError {
    fn from(e: NoffError) -> Self {
        LoadError::Noff(e)
    }
}

/// A process's virtual memory: the page table and the frames behind it.
pub struct AddressSpace {
    page_table: Vec<PageTableEntry>,
}

impl AddressSpace {
    /// Load the NOFF image in `executable` into freshly claimed frames.
    ///
    /// The image size is the four segment sizes plus
    /// [`USER_STACK_SIZE`], rounded up to whole pages. If that many
    /// frames are not free the load fails with
    /// [`LoadError::MemoryLimit`] before anything is claimed.
    pub fn load<D: Disk>(
        executable: &OpenFile<'_, D>,
        frames: &mut FrameAllocator,
        machine: &mut Machine,
    ) -> Result<Self, LoadError> {
        let noff = NoffHeader::read_from(executable)?;
        let size = [
            &noff.code,
            &noff.readonly_data,
            &noff.init_data,
            &noff.uninit_data,
        ]
        .iter()
        .map(|seg| seg.size.max(0) as usize)
        .sum::<usize>()
            + USER_STACK_SIZE;
        let num_pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        debug!(
            target: "addr",
            "initializing address space: {} pages, {} bytes",
            num_pages,
            num_pages * PAGE_SIZE
        );
        if num_pages > frames.free_count() {
            return Err(LoadError::MemoryLimit);
        }

        let mut page_table = Vec::with_capacity(num_pages);
        for vpn in 0..num_pages {
            let frame = frames
                .alloc(machine)
                .expect("free-frame count was just checked");
            page_table.push(PageTableEntry {
                virtual_page: vpn,
                physical_page: frame.0,
                flags: PteFlags::VALID,
            });
        }

        let mut space = Self { page_table };
        space.load_segment(executable, machine, &noff.code, "code", true)?;
        space.load_segment(executable, machine, &noff.readonly_data, "rodata", true)?;
        space.load_segment(executable, machine, &noff.init_data, "data", false)?;
        // Uninitialized data and the stack stay as the allocator left
        // them: zero.
        Ok(space)
    }

    /// Copy one segment in, a page at a time, and stamp each touched
    /// page's read-only bit.
    fn load_segment<D: Disk>(
        &mut self,
        executable: &OpenFile<'_, D>,
        machine: &mut Machine,
        seg: &Segment,
        what: &str,
        read_only: bool,
    ) -> Result<(), LoadError> {
        if seg.size <= 0 {
            return Ok(());
        }
        debug!(
            target: "addr",
            "loading {} segment: vaddr {}, {} bytes",
            what, seg.virtual_addr, seg.size
        );
        let mut remaining = seg.size as usize;
        let mut vaddr = seg.virtual_addr as usize;
        let mut file_pos = seg.in_file_addr as usize;
        while remaining > 0 {
            let chunk = remaining.min(PAGE_SIZE - vaddr % PAGE_SIZE);
            let paddr = self
                .translate(vaddr, false)
                .map_err(LoadError::Translate)?;
            let n = executable
                .read_at(&mut machine.memory_mut()[paddr..paddr + chunk], file_pos)
                .map_err(LoadError::Fs)?;
            if n != chunk {
                return Err(LoadError::Truncated);
            }
            let vpn = vaddr / PAGE_SIZE;
            self.page_table[vpn].flags.set(PteFlags::READ_ONLY, read_only);
            remaining -= chunk;
            vaddr += chunk;
            file_pos += chunk;
        }
        Ok(())
    }

    /// Number of pages in the space.
    #[inline]
    pub fn num_pages(&self) -> usize {
        self.page_table.len()
    }

    /// The page table.
    #[inline]
    pub fn page_table(&self) -> &[PageTableEntry] {
        &self.page_table
    }

    /// Translate `vaddr` into a physical byte address, recording the
    /// access in the page's use bit and, for writes, its dirty bit.
    pub fn translate(&mut self, vaddr: usize, is_write: bool) -> Result<usize, Exception> {
        let vpn = vaddr / PAGE_SIZE;
        let offset = vaddr % PAGE_SIZE;
        if vpn >= self.page_table.len() {
            return Err(Exception::AddressError);
        }
        let pte = &mut self.page_table[vpn];
        if is_write && pte.flags.contains(PteFlags::READ_ONLY) {
            return Err(Exception::ReadOnly);
        }
        if pte.physical_page >= NUM_PHYS_PAGES {
            debug!(target: "addr", "illegal physical page {}", pte.physical_page);
            return Err(Exception::BusError);
        }
        pte.flags.insert(PteFlags::USE);
        if is_write {
            pte.flags.insert(PteFlags::DIRTY);
        }
        let paddr = pte.physical_page * PAGE_SIZE + offset;
        debug_assert!(paddr < MEMORY_SIZE);
        Ok(paddr)
    }

    /// Set up the machine registers for the first user instruction:
    /// everything zero, the program counter at virtual address zero
    /// (with its branch-delay successor at four), and the stack pointer
    /// just shy of the top of the space.
    pub fn init_registers(&self, machine: &mut Machine) {
        for reg in 0..NUM_TOTAL_REGS {
            machine.write_register(reg, 0);
        }
        machine.write_register(PC_REG, 0);
        machine.write_register(NEXT_PC_REG, 4);
        let sp = self.num_pages() * PAGE_SIZE - 16;
        machine.write_register(STACK_REG, sp as i32);
        debug!(target: "addr", "initializing stack pointer: {}", sp);
    }

    /// Harvest the use/dirty bits the machine accumulated while this
    /// space's table was published. Called when the owning thread is
    /// switched out.
    pub fn save_state(&mut self, machine: &Machine) {
        for (pte, published) in self.page_table.iter_mut().zip(machine.page_table()) {
            pte.flags = published.flags;
        }
    }

    /// Publish this space's page table to the machine. Called when the
    /// owning thread is switched in.
    pub fn restore_state(&self, machine: &mut Machine) {
        machine.publish_page_table(&self.page_table);
    }

    /// Tear the space down, returning every frame to the allocator.
    pub fn release(self, frames: &mut FrameAllocator) {
        for pte in &self.page_table {
            frames.free(Frame(pte.physical_page));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::KernelDisk;
    use crate::noff::NOFF_MAGIC;
    use index_fs::FileSystem;
    use mimic::disk::SynchDisk;

    /// Build a NOFF image with a code segment at vaddr 0 and an
    /// initialized-data segment right behind it.
    fn noff_image(code: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut word = |v: i32| out.extend(v.to_le_bytes());
        word(NOFF_MAGIC as i32);
        let code_off = NoffHeader::SIZE as i32;
        word(0); // code
        word(code_off);
        word(code.len() as i32);
        word(0); // no read-only data
        word(0);
        word(0);
        word(code.len() as i32); // init data
        word(code_off + code.len() as i32);
        word(data.len() as i32);
        word((code.len() + data.len()) as i32); // uninit data
        word(0);
        word(64);
        out.extend_from_slice(code);
        out.extend_from_slice(data);
        out
    }

    fn fs_with_image(image: &[u8]) -> FileSystem<KernelDisk> {
        let mut fs = FileSystem::format(KernelDisk::new(SynchDisk::scratch())).unwrap();
        fs.create("/prog", image.len()).unwrap();
        let id = fs.open("/prog").unwrap();
        assert_eq!(fs.write(id, image).unwrap(), image.len());
        fs.close_file(id).unwrap();
        fs
    }

    #[test]
    fn load_places_segments_through_the_page_table() {
        let code: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let data: Vec<u8> = (0..60).map(|i| (0xff - i) as u8).collect();
        let fs = fs_with_image(&noff_image(&code, &data));
        let mut machine = Machine::new();
        let mut frames = FrameAllocator::new();

        let exe = fs.open_file("/prog").unwrap();
        let mut space = AddressSpace::load(&exe, &mut frames, &mut machine).unwrap();

        // 200 code + 60 data + 64 bss + 1024 stack = 1348 -> 11 pages.
        assert_eq!(space.num_pages(), 11);
        assert_eq!(frames.free_count(), NUM_PHYS_PAGES - 11);

        for (vaddr, expect) in (0..).zip(code.iter()) {
            let paddr = space.translate(vaddr, false).unwrap();
            assert_eq!(machine.memory()[paddr], *expect);
        }
        for (i, expect) in data.iter().enumerate() {
            let paddr = space.translate(code.len() + i, false).unwrap();
            assert_eq!(machine.memory()[paddr], *expect);
        }

        // Page 0 holds only code; page 1 was later overwritten by the
        // data pass and ends writable.
        let table = space.page_table();
        assert!(table[0].flags.contains(PteFlags::READ_ONLY));
        assert!(!table[1].flags.contains(PteFlags::READ_ONLY));
        assert!(!table[10].flags.contains(PteFlags::READ_ONLY));
    }

    #[test]
    fn image_larger_than_free_frames_claims_nothing() {
        let fs = fs_with_image(&noff_image(&[0u8; 64], &[]));
        let mut machine = Machine::new();
        let mut frames = FrameAllocator::new();
        // Leave fewer frames than the 9 the image needs.
        let mut held = Vec::new();
        for _ in 0..NUM_PHYS_PAGES - 3 {
            held.push(frames.alloc(&mut machine).unwrap());
        }

        let exe = fs.open_file("/prog").unwrap();
        assert!(matches!(
            AddressSpace::load(&exe, &mut frames, &mut machine),
            Err(LoadError::MemoryLimit)
        ));
        assert_eq!(frames.free_count(), 3);
    }

    #[test]
    fn translate_orders_its_failures() {
        let fs = fs_with_image(&noff_image(&[0x42u8; 64], &[]));
        let mut machine = Machine::new();
        let mut frames = FrameAllocator::new();
        let exe = fs.open_file("/prog").unwrap();
        let mut space = AddressSpace::load(&exe, &mut frames, &mut machine).unwrap();

        let top = space.num_pages() * PAGE_SIZE;
        assert_eq!(space.translate(top, false), Err(Exception::AddressError));

        // Writing code faults and must not mark the page dirty.
        assert_eq!(space.translate(0, true), Err(Exception::ReadOnly));
        assert!(!space.page_table()[0].flags.contains(PteFlags::DIRTY));

        // A corrupt frame number is a bus error.
        space.page_table[2].physical_page = NUM_PHYS_PAGES + 7;
        assert_eq!(
            space.translate(2 * PAGE_SIZE, false),
            Err(Exception::BusError)
        );

        // A legal write sets both use and dirty.
        let vaddr = 3 * PAGE_SIZE + 5;
        space.translate(vaddr, true).unwrap();
        let flags = space.page_table()[3].flags;
        assert!(flags.contains(PteFlags::USE));
        assert!(flags.contains(PteFlags::DIRTY));
    }

    #[test]
    fn registers_start_at_the_conventional_values() {
        let fs = fs_with_image(&noff_image(&[1u8; 32], &[]));
        let mut machine = Machine::new();
        let mut frames = FrameAllocator::new();
        let exe = fs.open_file("/prog").unwrap();
        let space = AddressSpace::load(&exe, &mut frames, &mut machine).unwrap();

        machine.write_register(5, 99);
        space.init_registers(&mut machine);
        assert_eq!(machine.read_register(5), 0);
        assert_eq!(machine.read_register(PC_REG), 0);
        assert_eq!(machine.read_register(NEXT_PC_REG), 4);
        assert_eq!(
            machine.read_register(STACK_REG),
            (space.num_pages() * PAGE_SIZE - 16) as i32
        );
    }

    #[test]
    fn state_round_trips_through_the_machine() {
        let fs = fs_with_image(&noff_image(&[7u8; 16], &[]));
        let mut machine = Machine::new();
        let mut frames = FrameAllocator::new();
        let exe = fs.open_file("/prog").unwrap();
        let mut space = AddressSpace::load(&exe, &mut frames, &mut machine).unwrap();

        space.restore_state(&mut machine);
        assert_eq!(machine.page_table().len(), space.num_pages());

        // The interpreter would flip bits in the published copy; a
        // save harvests them.
        let mut published = machine.page_table().to_vec();
        published[1].flags.insert(PteFlags::DIRTY);
        machine.publish_page_table(&published);
        space.save_state(&machine);
        assert!(space.page_table()[1].flags.contains(PteFlags::DIRTY));
    }

    #[test]
    fn live_spaces_never_share_a_frame() {
        let fs = fs_with_image(&noff_image(&[9u8; 128], &[4u8; 32]));
        let mut machine = Machine::new();
        let mut frames = FrameAllocator::new();
        let exe = fs.open_file("/prog").unwrap();
        let a = AddressSpace::load(&exe, &mut frames, &mut machine).unwrap();
        let b = AddressSpace::load(&exe, &mut frames, &mut machine).unwrap();

        let held: std::collections::HashSet<usize> = a
            .page_table()
            .iter()
            .map(|pte| pte.physical_page)
            .collect();
        assert_eq!(held.len(), a.num_pages());
        assert!(b
            .page_table()
            .iter()
            .all(|pte| !held.contains(&pte.physical_page)));
        for (vpn, pte) in b.page_table().iter().enumerate() {
            assert_eq!(pte.virtual_page, vpn);
        }
    }

    #[test]
    fn release_returns_every_frame() {
        let fs = fs_with_image(&noff_image(&[3u8; 256], &[]));
        let mut machine = Machine::new();
        let mut frames = FrameAllocator::new();
        let exe = fs.open_file("/prog").unwrap();
        let space = AddressSpace::load(&exe, &mut frames, &mut machine).unwrap();
        assert!(frames.free_count() < NUM_PHYS_PAGES);
        space.release(&mut frames);
        assert_eq!(frames.free_count(), NUM_PHYS_PAGES);
    }
}
