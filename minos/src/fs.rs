//! Bridge from the machine's disk to the file system's `Disk` trait.

use index_fs::{Disk, Error, Sector, SECTOR_SIZE};
use mimic::disk::SynchDisk;
use std::cell::RefCell;

// The kernel, the machine, and the file system must agree on geometry.
const _: () = assert!(SECTOR_SIZE == mimic::disk::SECTOR_SIZE);
const _: () = assert!(index_fs::NUM_SECTORS == mimic::disk::NUM_SECTORS);

/// The machine's synchronous disk, presented as a file-system device.
pub struct KernelDisk {
    inner: RefCell<SynchDisk>,
}

impl KernelDisk {
    /// Wrap `disk` for the file system.
    pub fn new(disk: SynchDisk) -> Self {
        Self {
            inner: RefCell::new(disk),
        }
    }
}

impl Disk for KernelDisk {
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error> {
        self.inner
            .borrow()
            .read_sector(sector.into_usize(), buf)
            .map_err(|_| Error::Disk)
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), Error> {
        self.inner
            .borrow_mut()
            .write_sector(sector.into_usize(), buf)
            .map_err(|_| Error::Disk)
    }
}
