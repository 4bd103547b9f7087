//! The file system proper: path resolution over the directory tree and
//! the create/open/remove/list operations.
//!
//! The free-sector bitmap and the root directory are ordinary files
//! whose headers live at the two well-known sectors, so the file
//! system can find them at mount time. Operations that mutate the
//! directory tree or the bitmap work on in-memory copies and write
//! them back only once every step has succeeded; on failure the copies
//! are simply dropped and the on-disk state is unchanged.
//!
//! Opening a file registers it in a per-file-system table keyed by the
//! sector of its header, which is also the id handed to callers; reads
//! and writes address the table through that id.

use crate::{
    Bitmap, Directory, Disk, Error, FileHeader, Sector, DIRECTORY_FILE_SIZE, DIRECTORY_SECTOR,
    FREE_MAP_FILE_SIZE, FREE_MAP_SECTOR, NUM_SECTORS, SECTOR_SIZE,
};
use log::debug;
use std::cell::Cell;

/// Id of an open file: the sector its header lives in.
pub type FileId = Sector;

/// An open file: the in-memory header plus a byte-seek position.
///
/// The handle is independent of the on-disk state; the header is fixed
/// at creation, so closing a file flushes nothing.
pub struct OpenFile<'a, D: Disk> {
    disk: &'a D,
    hdr: FileHeader,
    pos: Cell<usize>,
}

impl<'a, D: Disk> OpenFile<'a, D> {
    /// An open file over an already-fetched header.
    pub fn new(disk: &'a D, hdr: FileHeader) -> Self {
        Self {
            disk,
            hdr,
            pos: Cell::new(0),
        }
    }

    /// Open the file whose header lives at `sector`.
    pub fn open_sector(disk: &'a D, sector: Sector) -> Result<Self, Error> {
        Ok(Self::new(disk, FileHeader::fetch_from(disk, sector)?))
    }

    /// The file's header.
    pub fn header(&self) -> &FileHeader {
        &self.hdr
    }

    /// Number of bytes in the file.
    pub fn length(&self) -> usize {
        self.hdr.file_length()
    }

    /// Move the seek position to `pos`.
    pub fn seek(&self, pos: usize) {
        self.pos.set(pos);
    }

    /// The current seek position.
    pub fn tell(&self) -> usize {
        self.pos.get()
    }

    /// Read from the seek position, advancing it. Returns the number
    /// of bytes read, short at end of file.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = self.read_at(buf, self.pos.get())?;
        self.pos.set(self.pos.get() + n);
        Ok(n)
    }

    /// Write at the seek position, advancing it. Returns the number of
    /// bytes written, short at end of file.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        let n = self.write_at(buf, self.pos.get())?;
        self.pos.set(self.pos.get() + n);
        Ok(n)
    }

    /// Read up to `buf.len()` bytes starting at byte `offset`.
    ///
    /// The file's pages sit on whatever sectors the free map handed
    /// out, so the transfer walks the index tree one sector at a time.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, Error> {
        let len = buf.len().min(self.length().saturating_sub(offset));
        let mut sec = [0u8; SECTOR_SIZE];
        let mut done = 0;
        while done < len {
            let pos = offset + done;
            let sector = self.hdr.byte_to_sector(self.disk, pos)?;
            let sector_off = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_off).min(len - done);
            self.disk.read(sector, &mut sec)?;
            buf[done..done + chunk].copy_from_slice(&sec[sector_off..sector_off + chunk]);
            done += chunk;
        }
        Ok(len)
    }

    /// Write up to `buf.len()` bytes starting at byte `offset`. Partial
    /// sectors are read back first so the bytes around the span
    /// survive.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, Error> {
        let len = buf.len().min(self.length().saturating_sub(offset));
        let mut sec = [0u8; SECTOR_SIZE];
        let mut done = 0;
        while done < len {
            let pos = offset + done;
            let sector = self.hdr.byte_to_sector(self.disk, pos)?;
            let sector_off = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_off).min(len - done);
            if chunk < SECTOR_SIZE {
                self.disk.read(sector, &mut sec)?;
            }
            sec[sector_off..sector_off + chunk].copy_from_slice(&buf[done..done + chunk]);
            self.disk.write(sector, &sec)?;
            done += chunk;
        }
        Ok(len)
    }
}

struct OpenSlot {
    sector: Sector,
    hdr: FileHeader,
    pos: usize,
}

/// Where a path walk ended.
enum Resolved<'p> {
    /// Every component named a directory; `dir` is the final directory
    /// itself. `name` is the last component (`None` for the root),
    /// whose entry lives in the directory at `parent_sector`.
    Dir {
        dir: Directory,
        sector: Sector,
        parent_sector: Sector,
        name: Option<&'p str>,
    },
    /// The walk stopped at `name`, which is not a sub-directory of
    /// `dir`; `sector` backs `dir` and is the write-back target for
    /// mutations.
    Entry {
        dir: Directory,
        sector: Sector,
        name: &'p str,
    },
}

/// The root file system over a disk.
pub struct FileSystem<D: Disk> {
    disk: D,
    free_map_hdr: FileHeader,
    directory_hdr: FileHeader,
    open_table: Vec<OpenSlot>,
}

impl<D: Disk> FileSystem<D> {
    /// Format `disk` and mount the empty file system.
    ///
    /// Marks the two well-known header sectors, allocates the free-map
    /// and root-directory files, and writes headers, bitmap, and the
    /// empty root directory back.
    pub fn format(disk: D) -> Result<Self, Error> {
        debug!(target: "fs", "formatting the file system");
        let mut free_map = Bitmap::new(NUM_SECTORS);
        let mut map_hdr = FileHeader::new();
        let mut dir_hdr = FileHeader::new();

        free_map.mark(FREE_MAP_SECTOR);
        free_map.mark(DIRECTORY_SECTOR);
        map_hdr.allocate(&disk, &mut free_map, FREE_MAP_FILE_SIZE)?;
        dir_hdr.allocate(&disk, &mut free_map, DIRECTORY_FILE_SIZE)?;

        map_hdr.write_back(&disk, FREE_MAP_SECTOR)?;
        dir_hdr.write_back(&disk, DIRECTORY_SECTOR)?;

        let fs = Self {
            disk,
            free_map_hdr: map_hdr,
            directory_hdr: dir_hdr,
            open_table: Vec::new(),
        };
        free_map.write_back(&fs.free_map_file())?;
        Directory::new().write_back(&fs.directory_file())?;
        Ok(fs)
    }

    /// Mount a previously formatted disk by opening the two well-known
    /// files.
    pub fn mount(disk: D) -> Result<Self, Error> {
        let free_map_hdr = FileHeader::fetch_from(&disk, FREE_MAP_SECTOR)?;
        let directory_hdr = FileHeader::fetch_from(&disk, DIRECTORY_SECTOR)?;
        Ok(Self {
            disk,
            free_map_hdr,
            directory_hdr,
            open_table: Vec::new(),
        })
    }

    /// Unmount, giving the disk back.
    pub fn close(self) -> D {
        self.disk
    }

    fn free_map_file(&self) -> OpenFile<'_, D> {
        OpenFile::new(&self.disk, self.free_map_hdr.clone())
    }

    fn directory_file(&self) -> OpenFile<'_, D> {
        OpenFile::new(&self.disk, self.directory_hdr.clone())
    }

    fn dir_file(&self, sector: Sector) -> Result<OpenFile<'_, D>, Error> {
        if sector == DIRECTORY_SECTOR {
            Ok(self.directory_file())
        } else {
            OpenFile::open_sector(&self.disk, sector)
        }
    }

    fn read_free_map(&self) -> Result<Bitmap, Error> {
        Bitmap::read_from(&self.free_map_file(), NUM_SECTORS)
    }

    /// Walk `path` from the root. Each component that names a
    /// sub-directory is descended; the walk ends at the first component
    /// that does not, or at the final directory when every component
    /// matched.
    fn resolve<'p>(&self, path: &'p str) -> Result<Resolved<'p>, Error> {
        let mut dir = Directory::fetch_from(&self.directory_file())?;
        let mut dir_sector = DIRECTORY_SECTOR;
        let mut parent_sector = DIRECTORY_SECTOR;
        let mut matched = None;
        for token in path.split('/').filter(|t| !t.is_empty()) {
            match dir.find_dir(token) {
                Some(next) => {
                    let file = OpenFile::open_sector(&self.disk, next)?;
                    dir = Directory::fetch_from(&file)?;
                    parent_sector = dir_sector;
                    dir_sector = next;
                    matched = Some(token);
                }
                None => {
                    return Ok(Resolved::Entry {
                        dir,
                        sector: dir_sector,
                        name: token,
                    })
                }
            }
        }
        Ok(Resolved::Dir {
            dir,
            sector: dir_sector,
            parent_sector,
            name: matched,
        })
    }

    /// Create a file of `initial_size` bytes at `path`.
    ///
    /// The size is fixed for the file's lifetime. On any failure the
    /// in-memory bitmap and directory deltas are discarded and the
    /// disk is unchanged.
    pub fn create(&mut self, path: &str, initial_size: usize) -> Result<(), Error> {
        debug!(target: "fs", "creating file {} ({} bytes)", path, initial_size);
        let (mut dir, dir_sector, name) = match self.resolve(path)? {
            Resolved::Entry { dir, sector, name } => (dir, sector, name),
            Resolved::Dir { .. } => return Err(Error::AlreadyExists),
        };
        if dir.find(name).is_some() {
            return Err(Error::AlreadyExists);
        }
        let mut free_map = self.read_free_map()?;
        let hdr_sector = free_map.find_and_set().ok_or(Error::OutOfSpace)?;
        dir.add(name, hdr_sector)?;
        let mut hdr = FileHeader::new();
        hdr.allocate(&self.disk, &mut free_map, initial_size)?;

        hdr.write_back(&self.disk, hdr_sector)?;
        dir.write_back(&self.dir_file(dir_sector)?)?;
        free_map.write_back(&self.free_map_file())?;
        Ok(())
    }

    /// Create an empty sub-directory at `path`.
    pub fn create_dir(&mut self, path: &str) -> Result<(), Error> {
        debug!(target: "fs", "creating directory {}", path);
        let (mut dir, dir_sector, name) = match self.resolve(path)? {
            Resolved::Entry { dir, sector, name } => (dir, sector, name),
            Resolved::Dir { .. } => return Err(Error::AlreadyExists),
        };
        let mut free_map = self.read_free_map()?;
        let hdr_sector = free_map.find_and_set().ok_or(Error::OutOfSpace)?;
        dir.add_dir(name, hdr_sector)?;
        let mut hdr = FileHeader::new();
        hdr.allocate(&self.disk, &mut free_map, DIRECTORY_FILE_SIZE)?;

        hdr.write_back(&self.disk, hdr_sector)?;
        Directory::new().write_back(&OpenFile::new(&self.disk, hdr))?;
        dir.write_back(&self.dir_file(dir_sector)?)?;
        free_map.write_back(&self.free_map_file())?;
        Ok(())
    }

    /// Open the file at `path` as a borrowed handle, without touching
    /// the open-file table.
    pub fn open_file(&self, path: &str) -> Result<OpenFile<'_, D>, Error> {
        match self.resolve(path)? {
            Resolved::Entry { dir, name, .. } => {
                let sector = dir.find(name).ok_or(Error::NotFound)?;
                OpenFile::open_sector(&self.disk, sector)
            }
            Resolved::Dir { .. } => Err(Error::IsADirectory),
        }
    }

    /// Open the file at `path`, registering it in the open-file table.
    /// The returned id is the sector of the file's header. Re-opening
    /// an already-open file rewinds its position.
    pub fn open(&mut self, path: &str) -> Result<FileId, Error> {
        let sector = match self.resolve(path)? {
            Resolved::Entry { dir, name, .. } => dir.find(name).ok_or(Error::NotFound)?,
            Resolved::Dir { .. } => return Err(Error::IsADirectory),
        };
        debug!(target: "fs", "opening {} (header sector {})", path, sector.into_usize());
        match self.open_table.iter_mut().find(|s| s.sector == sector) {
            Some(slot) => slot.pos = 0,
            None => {
                let hdr = FileHeader::fetch_from(&self.disk, sector)?;
                self.open_table.push(OpenSlot {
                    sector,
                    hdr,
                    pos: 0,
                });
            }
        }
        Ok(sector)
    }

    /// Read from the open file `id` at its current position.
    pub fn read(&mut self, id: FileId, buf: &mut [u8]) -> Result<usize, Error> {
        let slot = self
            .open_table
            .iter_mut()
            .find(|s| s.sector == id)
            .ok_or(Error::BadHandle)?;
        let file = OpenFile::new(&self.disk, slot.hdr.clone());
        let n = file.read_at(buf, slot.pos)?;
        slot.pos += n;
        Ok(n)
    }

    /// Write to the open file `id` at its current position.
    pub fn write(&mut self, id: FileId, buf: &[u8]) -> Result<usize, Error> {
        let slot = self
            .open_table
            .iter_mut()
            .find(|s| s.sector == id)
            .ok_or(Error::BadHandle)?;
        let file = OpenFile::new(&self.disk, slot.hdr.clone());
        let n = file.write_at(buf, slot.pos)?;
        slot.pos += n;
        Ok(n)
    }

    /// Move the position of the open file `id`.
    pub fn seek(&mut self, id: FileId, pos: usize) -> Result<(), Error> {
        let slot = self
            .open_table
            .iter_mut()
            .find(|s| s.sector == id)
            .ok_or(Error::BadHandle)?;
        slot.pos = pos;
        Ok(())
    }

    /// Drop the open file `id` from the table.
    pub fn close_file(&mut self, id: FileId) -> Result<(), Error> {
        let i = self
            .open_table
            .iter()
            .position(|s| s.sector == id)
            .ok_or(Error::BadHandle)?;
        self.open_table.remove(i);
        Ok(())
    }

    /// Delete the file at `path`: release its data and header sectors
    /// and drop its directory entry.
    pub fn remove(&mut self, path: &str) -> Result<(), Error> {
        debug!(target: "fs", "removing file {}", path);
        let (mut dir, dir_sector, name) = match self.resolve(path)? {
            Resolved::Entry { dir, sector, name } => (dir, sector, name),
            Resolved::Dir { .. } => return Err(Error::IsADirectory),
        };
        let sector = dir.find(name).ok_or(Error::NotFound)?;
        let hdr = FileHeader::fetch_from(&self.disk, sector)?;
        let mut free_map = self.read_free_map()?;
        hdr.deallocate(&self.disk, &mut free_map)?;
        free_map.clear(sector);
        dir.remove(name)?;

        free_map.write_back(&self.free_map_file())?;
        dir.write_back(&self.dir_file(dir_sector)?)?;
        Ok(())
    }

    /// Delete the empty directory at `path`. Refuses a directory that
    /// still has entries; trees come down through [`Self::recur_remove`].
    pub fn remove_dir(&mut self, path: &str) -> Result<(), Error> {
        debug!(target: "fs", "removing directory {}", path);
        let (target, target_sector, parent_sector, name) = match self.resolve(path)? {
            Resolved::Dir {
                dir,
                sector,
                parent_sector,
                name,
            } => (dir, sector, parent_sector, name.ok_or(Error::NotFound)?),
            Resolved::Entry { .. } => return Err(Error::NotADirectory),
        };
        if target.entries().next().is_some() {
            return Err(Error::NotEmpty);
        }
        let hdr = FileHeader::fetch_from(&self.disk, target_sector)?;
        let mut free_map = self.read_free_map()?;
        hdr.deallocate(&self.disk, &mut free_map)?;
        free_map.clear(target_sector);
        let mut parent = Directory::fetch_from(&self.dir_file(parent_sector)?)?;
        parent.remove(name)?;

        free_map.write_back(&self.free_map_file())?;
        parent.write_back(&self.dir_file(parent_sector)?)?;
        Ok(())
    }

    /// Delete the file or directory tree at `path`, depth-first.
    pub fn recur_remove(&mut self, path: &str) -> Result<(), Error> {
        match self.resolve(path)? {
            Resolved::Dir { dir, name, .. } => {
                if name.is_none() {
                    // The root itself cannot be removed.
                    return Err(Error::NotFound);
                }
                let children: Vec<(String, bool)> = dir
                    .entries()
                    .map(|e| (e.name.clone(), e.is_dir))
                    .collect();
                let base = path.trim_end_matches('/');
                for (child, is_dir) in children {
                    let child_path = format!("{}/{}", base, child);
                    if is_dir {
                        self.recur_remove(&child_path)?;
                    } else {
                        self.remove(&child_path)?;
                    }
                }
                self.remove_dir(path)
            }
            Resolved::Entry { dir, name, .. } => {
                if dir.find(name).is_some() {
                    self.remove(path)
                } else {
                    Err(Error::NotFound)
                }
            }
        }
    }

    /// Render the entries of the directory at `path`, one per line.
    pub fn list(&self, path: &str) -> Result<String, Error> {
        let dir = match self.resolve(path)? {
            Resolved::Dir { dir, .. } => dir,
            Resolved::Entry { dir, .. } => dir,
        };
        let mut out = String::new();
        dir.list(&mut out);
        Ok(out)
    }

    /// Render the directory tree at `path` depth-first, indented by
    /// nesting depth.
    pub fn recur_list(&self, path: &str) -> Result<String, Error> {
        let dir = match self.resolve(path)? {
            Resolved::Dir { dir, .. } => dir,
            Resolved::Entry { dir, .. } => dir,
        };
        let mut out = String::new();
        dir.recur_list(&self.disk, 0, &mut out)?;
        Ok(out)
    }

    /// File length and total header sectors (indirect blocks included)
    /// of the file at `path`.
    pub fn count_header_size(&self, path: &str) -> Result<(usize, usize), Error> {
        match self.resolve(path)? {
            Resolved::Entry { dir, name, .. } => {
                let sector = dir.find(name).ok_or(Error::NotFound)?;
                let hdr = FileHeader::fetch_from(&self.disk, sector)?;
                Ok((hdr.file_length(), hdr.count_header(&self.disk)?))
            }
            Resolved::Dir { .. } => Err(Error::IsADirectory),
        }
    }
}
