//! The file header, this file system's i-node.
//!
//! A header is a fixed table of sector numbers plus the file length,
//! sized to exactly one sector. How the table is interpreted depends on
//! the header's indirection level: at [`IndirectLevel::Direct`] every
//! slot is a data sector; at deeper levels every slot points to a
//! sector holding a child header, and each child covers the byte span
//! of the next level down. A four-deep tree addresses
//! `NUM_DIRECT^4` sectors.
//!
//! The level is recorded explicitly when a header is built or fetched,
//! derived once from the file length; the on-disk record stays two
//! words plus the slot table.

use crate::{
    div_round_up, Bitmap, ByteRw, Disk, Error, Sector, BYTES_IN_LEVEL1, BYTES_IN_LEVEL2,
    BYTES_IN_LEVEL3, NUM_DIRECT, SECTOR_SIZE,
};

/// How a header's slot table is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectLevel {
    /// Slots are data sectors.
    Direct,
    /// Slots are child headers, each covering [`BYTES_IN_LEVEL1`].
    Single,
    /// Slots are child headers, each covering [`BYTES_IN_LEVEL2`].
    Double,
    /// Slots are child headers, each covering [`BYTES_IN_LEVEL3`].
    Triple,
}

impl IndirectLevel {
    /// The level a file of `size` bytes needs.
    pub fn for_size(size: usize) -> Self {
        if size <= BYTES_IN_LEVEL1 {
            IndirectLevel::Direct
        } else if size <= BYTES_IN_LEVEL2 {
            IndirectLevel::Single
        } else if size <= BYTES_IN_LEVEL3 {
            IndirectLevel::Double
        } else {
            IndirectLevel::Triple
        }
    }

    /// Bytes covered by one child of a header at this level.
    fn child_capacity(self) -> usize {
        match self {
            IndirectLevel::Direct => SECTOR_SIZE,
            IndirectLevel::Single => BYTES_IN_LEVEL1,
            IndirectLevel::Double => BYTES_IN_LEVEL2,
            IndirectLevel::Triple => BYTES_IN_LEVEL3,
        }
    }
}

/// A file header: length, leaf-sector count, and the slot table.
#[derive(Clone)]
pub struct FileHeader {
    num_bytes: usize,
    num_sectors: usize,
    level: IndirectLevel,
    data_sectors: [i32; NUM_DIRECT],
}

impl FileHeader {
    /// An empty header describing a zero-length file.
    pub fn new() -> Self {
        Self {
            num_bytes: 0,
            num_sectors: 0,
            level: IndirectLevel::Direct,
            data_sectors: [0; NUM_DIRECT],
        }
    }

    /// Number of bytes in the file.
    #[inline]
    pub fn file_length(&self) -> usize {
        self.num_bytes
    }

    /// Number of data sectors the file occupies.
    #[inline]
    pub fn num_sectors(&self) -> usize {
        self.num_sectors
    }

    /// The header's indirection level.
    #[inline]
    pub fn level(&self) -> IndirectLevel {
        self.level
    }

    /// Sectors a file of `size` bytes will consume beyond its own
    /// header: data sectors plus every descendant header.
    pub fn sectors_required(size: usize) -> usize {
        let level = IndirectLevel::for_size(size);
        match level {
            IndirectLevel::Direct => div_round_up(size, SECTOR_SIZE),
            _ => {
                let cap = level.child_capacity();
                let mut remaining = size;
                let mut total = 0;
                while remaining > 0 {
                    let child = remaining.min(cap);
                    total += 1 + Self::sectors_required(child);
                    remaining -= child;
                }
                total
            }
        }
    }

    /// Initialize a fresh header for a file of `file_size` bytes,
    /// claiming data blocks out of `free_map`.
    ///
    /// Fails with [`Error::OutOfSpace`] without allocating anything
    /// when the free map cannot cover the file. Child headers are
    /// written to their sectors as they are built; the free map itself
    /// stays in memory, so an abandoned allocation leaves the disk
    /// consistent.
    pub fn allocate<D: Disk>(
        &mut self,
        disk: &D,
        free_map: &mut Bitmap,
        file_size: usize,
    ) -> Result<(), Error> {
        if free_map.num_clear() < Self::sectors_required(file_size) {
            return Err(Error::OutOfSpace);
        }
        self.build(disk, free_map, file_size)
    }

    // Allocation after the space pre-check; recursion re-checking at
    // every child would be quadratic in the tree size.
    fn build<D: Disk>(
        &mut self,
        disk: &D,
        free_map: &mut Bitmap,
        file_size: usize,
    ) -> Result<(), Error> {
        self.num_bytes = file_size;
        self.num_sectors = div_round_up(file_size, SECTOR_SIZE);
        self.level = IndirectLevel::for_size(file_size);
        match self.level {
            IndirectLevel::Direct => {
                for slot in self.data_sectors.iter_mut().take(self.num_sectors) {
                    let sector = free_map.find_and_set().ok_or(Error::OutOfSpace)?;
                    *slot = sector.into_usize() as i32;
                }
            }
            level => {
                let cap = level.child_capacity();
                let mut remaining = file_size;
                let mut idx = 0;
                while remaining > 0 {
                    let sector = free_map.find_and_set().ok_or(Error::OutOfSpace)?;
                    self.data_sectors[idx] = sector.into_usize() as i32;
                    let mut child = FileHeader::new();
                    child.build(disk, free_map, remaining.min(cap))?;
                    child.write_back(disk, sector)?;
                    remaining -= remaining.min(cap);
                    idx += 1;
                }
            }
        }
        Ok(())
    }

    /// Release every sector reachable from this header back to
    /// `free_map`: the data blocks and, below the direct level, the
    /// child-header sectors as well.
    pub fn deallocate<D: Disk>(&self, disk: &D, free_map: &mut Bitmap) -> Result<(), Error> {
        match self.level {
            IndirectLevel::Direct => {
                for slot in self.data_sectors.iter().take(self.num_sectors) {
                    let sector = Sector(*slot as usize);
                    assert!(free_map.test(sector));
                    free_map.clear(sector);
                }
            }
            level => {
                let cap = level.child_capacity();
                let mut remaining = self.num_bytes;
                let mut idx = 0;
                while remaining > 0 {
                    let sector = Sector(self.data_sectors[idx] as usize);
                    let child = FileHeader::fetch_from(disk, sector)?;
                    child.deallocate(disk, free_map)?;
                    free_map.clear(sector);
                    remaining -= remaining.min(cap);
                    idx += 1;
                }
            }
        }
        Ok(())
    }

    /// Which disk sector stores the byte at `offset` within the file.
    pub fn byte_to_sector<D: Disk>(&self, disk: &D, offset: usize) -> Result<Sector, Error> {
        if offset >= self.num_bytes {
            return Err(Error::BadOffset);
        }
        match self.level {
            IndirectLevel::Direct => Ok(Sector(self.data_sectors[offset / SECTOR_SIZE] as usize)),
            level => {
                let cap = level.child_capacity();
                let idx = offset / cap;
                let child = FileHeader::fetch_from(disk, Sector(self.data_sectors[idx] as usize))?;
                child.byte_to_sector(disk, offset - idx * cap)
            }
        }
    }

    /// Total header sectors describing the file, this one included.
    pub fn count_header<D: Disk>(&self, disk: &D) -> Result<usize, Error> {
        match self.level {
            IndirectLevel::Direct => Ok(1),
            level => {
                let cap = level.child_capacity();
                let mut remaining = self.num_bytes;
                let mut idx = 0;
                let mut count = 1;
                while remaining > 0 {
                    let child =
                        FileHeader::fetch_from(disk, Sector(self.data_sectors[idx] as usize))?;
                    count += child.count_header(disk)?;
                    remaining -= remaining.min(cap);
                    idx += 1;
                }
                Ok(count)
            }
        }
    }

    /// Fetch a header from its disk sector.
    pub fn fetch_from<D: Disk>(disk: &D, sector: Sector) -> Result<Self, Error> {
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read(sector, &mut buf)?;
        let rw = ByteRw::new(&mut buf);
        let num_bytes = rw.read_i32(0) as usize;
        let num_sectors = rw.read_i32(4) as usize;
        let mut data_sectors = [0i32; NUM_DIRECT];
        for (i, slot) in data_sectors.iter_mut().enumerate() {
            *slot = rw.read_i32(8 + i * 4);
        }
        Ok(Self {
            num_bytes,
            num_sectors,
            level: IndirectLevel::for_size(num_bytes),
            data_sectors,
        })
    }

    /// Write the header to its disk sector.
    pub fn write_back<D: Disk>(&self, disk: &D, sector: Sector) -> Result<(), Error> {
        let mut buf = [0u8; SECTOR_SIZE];
        let mut rw = ByteRw::new(&mut buf);
        rw.write_i32(0, self.num_bytes as i32);
        rw.write_i32(4, self.num_sectors as i32);
        for (i, slot) in self.data_sectors.iter().enumerate() {
            rw.write_i32(8 + i * 4, *slot);
        }
        disk.write(sector, &buf)
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}
