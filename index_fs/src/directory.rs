//! Directories: fixed tables of name-to-header-sector entries.
//!
//! A directory is the payload of an ordinary file, so the table size is
//! fixed when the file system is formatted. Entries record whether they
//! name a file or a sub-directory; sub-directories are themselves files
//! holding another table, which is how the tree nests.

use crate::{
    ByteRw, Disk, Error, OpenFile, Sector, DIRECTORY_FILE_SIZE, FILE_NAME_MAX_LEN, NUM_DIR_ENTRIES,
    SECTOR_SIZE,
};
use std::fmt::Write;

/// One slot of a directory table.
#[derive(Clone)]
pub struct DirectoryEntry {
    /// Whether this slot holds a live entry.
    pub in_use: bool,
    /// Whether the entry names a sub-directory.
    pub is_dir: bool,
    /// Entry name, at most [`FILE_NAME_MAX_LEN`] bytes.
    pub name: String,
    /// Sector of the entry's file header.
    pub sector: Sector,
}

impl DirectoryEntry {
    /// Bytes one entry occupies on disk: the two flag bytes, the name
    /// field, and the header sector number.
    pub const SIZE: usize = 1 + 1 + FILE_NAME_MAX_LEN + 4;

    fn empty() -> Self {
        Self {
            in_use: false,
            is_dir: false,
            name: String::new(),
            sector: Sector(0),
        }
    }
}

/// A fixed-capacity directory table.
pub struct Directory {
    table: Vec<DirectoryEntry>,
}

impl Directory {
    /// An empty directory of [`NUM_DIR_ENTRIES`] slots.
    pub fn new() -> Self {
        Self {
            table: (0..NUM_DIR_ENTRIES).map(|_| DirectoryEntry::empty()).collect(),
        }
    }

    /// Read the directory table out of `file`.
    pub fn fetch_from<D: Disk>(file: &OpenFile<'_, D>) -> Result<Self, Error> {
        let mut bytes = vec![0u8; DIRECTORY_FILE_SIZE];
        file.read_at(&mut bytes, 0)?;
        let rw = ByteRw::new(&mut bytes);
        let mut table = Vec::with_capacity(NUM_DIR_ENTRIES);
        for i in 0..NUM_DIR_ENTRIES {
            let base = i * DirectoryEntry::SIZE;
            let name_bytes = &rw.inner()[base + 2..base + 2 + FILE_NAME_MAX_LEN];
            let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(FILE_NAME_MAX_LEN);
            table.push(DirectoryEntry {
                in_use: rw.read_u8(base) != 0,
                is_dir: rw.read_u8(base + 1) != 0,
                name: String::from_utf8_lossy(&name_bytes[..end]).into_owned(),
                sector: Sector(rw.read_i32(base + 2 + FILE_NAME_MAX_LEN) as usize),
            });
        }
        Ok(Self { table })
    }

    /// Write the directory table back into `file`.
    pub fn write_back<D: Disk>(&self, file: &OpenFile<'_, D>) -> Result<(), Error> {
        let mut bytes = vec![0u8; DIRECTORY_FILE_SIZE];
        let mut rw = ByteRw::new(&mut bytes);
        for (i, entry) in self.table.iter().enumerate() {
            let base = i * DirectoryEntry::SIZE;
            rw.write_u8(base, entry.in_use as u8);
            rw.write_u8(base + 1, entry.is_dir as u8);
            let name = entry.name.as_bytes();
            rw.inner_mut()[base + 2..base + 2 + name.len()].copy_from_slice(name);
            rw.write_i32(base + 2 + FILE_NAME_MAX_LEN, entry.sector.into_usize() as i32);
        }
        file.write_at(&bytes, 0)?;
        Ok(())
    }

    /// Table index of the entry called `name`, if any.
    pub fn find_index(&self, name: &str) -> Option<usize> {
        self.table
            .iter()
            .position(|e| e.in_use && e.name == name)
    }

    /// Table index of the sub-directory called `name`, if any.
    pub fn find_dir_index(&self, name: &str) -> Option<usize> {
        self.table
            .iter()
            .position(|e| e.in_use && e.is_dir && e.name == name)
    }

    /// Header sector of the entry called `name`, file or directory.
    pub fn find(&self, name: &str) -> Option<Sector> {
        self.find_index(name).map(|i| self.table[i].sector)
    }

    /// Header sector of the sub-directory called `name`.
    pub fn find_dir(&self, name: &str) -> Option<Sector> {
        self.find_dir_index(name).map(|i| self.table[i].sector)
    }

    /// Add a file entry. Rejects duplicates and signals a full table.
    pub fn add(&mut self, name: &str, sector: Sector) -> Result<(), Error> {
        self.add_entry(name, sector, false)
    }

    /// Add a sub-directory entry. Rejects duplicates and signals a
    /// full table.
    pub fn add_dir(&mut self, name: &str, sector: Sector) -> Result<(), Error> {
        self.add_entry(name, sector, true)
    }

    fn add_entry(&mut self, name: &str, sector: Sector, is_dir: bool) -> Result<(), Error> {
        if name.len() > FILE_NAME_MAX_LEN {
            return Err(Error::NameTooLong);
        }
        if self.find_index(name).is_some() {
            return Err(Error::AlreadyExists);
        }
        match self.table.iter_mut().find(|e| !e.in_use) {
            Some(entry) => {
                entry.in_use = true;
                entry.is_dir = is_dir;
                entry.name = name.to_string();
                entry.sector = sector;
                Ok(())
            }
            None => Err(Error::DirectoryFull),
        }
    }

    /// Remove the entry called `name`.
    pub fn remove(&mut self, name: &str) -> Result<(), Error> {
        let i = self.find_index(name).ok_or(Error::NotFound)?;
        self.table[i].in_use = false;
        self.table[i].is_dir = false;
        Ok(())
    }

    /// The live entries of the table.
    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.table.iter().filter(|e| e.in_use)
    }

    /// Render the table's entries into `out`, one per line.
    pub fn list(&self, out: &mut String) {
        let mut empty = true;
        for entry in self.entries() {
            empty = false;
            let tag = if entry.is_dir { "[D]" } else { "[F]" };
            let _ = writeln!(out, "{} {}", tag, entry.name);
        }
        if empty {
            let _ = writeln!(out, "the directory is empty");
        }
    }

    /// Render the table depth-first into `out`, descending every
    /// sub-directory and indenting by nesting depth.
    pub fn recur_list<D: Disk>(
        &self,
        disk: &D,
        depth: usize,
        out: &mut String,
    ) -> Result<(), Error> {
        let mut empty = true;
        for entry in self.entries() {
            empty = false;
            let tag = if entry.is_dir { "[D]" } else { "[F]" };
            let _ = writeln!(out, "{}{} {}", "   ".repeat(depth), tag, entry.name);
            if entry.is_dir {
                let file = OpenFile::open_sector(disk, entry.sector)?;
                Directory::fetch_from(&file)?.recur_list(disk, depth + 1, out)?;
            }
        }
        if empty {
            let _ = writeln!(out, "{}the directory is empty", "   ".repeat(depth));
        }
        Ok(())
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

// The table must fit the directory file, which in turn must stay a
// direct-level file.
const _: () = assert!(DIRECTORY_FILE_SIZE <= crate::BYTES_IN_LEVEL1);
const _: () = assert!(DirectoryEntry::SIZE < SECTOR_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_find_remove() {
        let mut dir = Directory::new();
        dir.add("a", Sector(10)).unwrap();
        dir.add_dir("d", Sector(11)).unwrap();
        assert_eq!(dir.find("a"), Some(Sector(10)));
        assert_eq!(dir.find_dir("a"), None);
        assert_eq!(dir.find_dir("d"), Some(Sector(11)));
        assert_eq!(dir.find("d"), Some(Sector(11)));
        dir.remove("a").unwrap();
        assert_eq!(dir.find("a"), None);
        assert_eq!(dir.remove("a"), Err(Error::NotFound));
    }

    #[test]
    fn duplicates_and_overlong_names_are_rejected() {
        let mut dir = Directory::new();
        dir.add("x", Sector(2)).unwrap();
        assert_eq!(dir.add("x", Sector(3)), Err(Error::AlreadyExists));
        assert_eq!(dir.add_dir("x", Sector(3)), Err(Error::AlreadyExists));
        assert_eq!(dir.add("much-too-long", Sector(4)), Err(Error::NameTooLong));
    }

    #[test]
    fn full_table_signals() {
        let mut dir = Directory::new();
        for i in 0..NUM_DIR_ENTRIES {
            dir.add(&format!("f{}", i), Sector(i + 2)).unwrap();
        }
        assert_eq!(dir.add("more", Sector(100)), Err(Error::DirectoryFull));
    }

    #[test]
    fn listing_tags_files_and_directories() {
        let mut dir = Directory::new();
        let mut out = String::new();
        dir.list(&mut out);
        assert_eq!(out, "the directory is empty\n");

        dir.add_dir("d", Sector(2)).unwrap();
        dir.add("a", Sector(3)).unwrap();
        out.clear();
        dir.list(&mut out);
        assert_eq!(out, "[D] d\n[F] a\n");
    }
}
