//! The NOFF executable format.
//!
//! NOFF is a stripped-down object format: a fixed header naming four
//! flat segments (code, read-only data, initialized data, uninitialized
//! data), each a span of the file to place at a virtual address. The
//! header is little-endian on disk; if the magic word only matches
//! after a byte swap, every field is swapped, so images built on either
//! endianness load.

use index_fs::{Disk, OpenFile};

/// Magic word identifying a NOFF image.
pub const NOFF_MAGIC: u32 = 0xbadfad;

/// One flat segment of the executable.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    /// Virtual address the segment is placed at.
    pub virtual_addr: i32,
    /// Byte offset of the segment's contents in the file.
    pub in_file_addr: i32,
    /// Segment length in bytes. Zero for an absent segment.
    pub size: i32,
}

/// The fixed NOFF header.
#[derive(Debug, Clone, Copy)]
pub struct NoffHeader {
    /// Executable instructions.
    pub code: Segment,
    /// Read-only data.
    pub readonly_data: Segment,
    /// Initialized data.
    pub init_data: Segment,
    /// Uninitialized data; occupies no file bytes.
    pub uninit_data: Segment,
}

/// Ways reading a NOFF header can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum NoffError {
    /// The magic word matches in neither byte order.
    BadMagic(u32),
    /// The file ends before the header does.
    Truncated,
    /// The underlying file could not be read.
    Fs(index_fs::Error),
}

impl core::fmt::Display for NoffError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NoffError::BadMagic(m) => write!(f, "bad NOFF magic {:#x}", m),
            NoffError::Truncated => write!(f, "truncated NOFF header"),
            NoffError::Fs(e) => write!(f, "reading executable: {}", e),
        }
    }
}

impl std::error::Error for NoffError {}

impl From<index_fs::Error> for NoffError {
    fn from(e: index_fs::Error) -> Self {
        NoffError::Fs(e)
    }
}

impl NoffHeader {
    /// Bytes the header occupies at the front of the image.
    pub const SIZE: usize = 4 + 4 * 12;

    /// Decode a header from its on-disk bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, NoffError> {
        if bytes.len() < Self::SIZE {
            return Err(NoffError::Truncated);
        }
        let word = |pos: usize, big: bool| -> i32 {
            let raw: [u8; 4] = bytes[pos..pos + 4].try_into().unwrap();
            if big {
                i32::from_be_bytes(raw)
            } else {
                i32::from_le_bytes(raw)
            }
        };
        let magic = word(0, false) as u32;
        let big = if magic == NOFF_MAGIC {
            false
        } else if magic.swap_bytes() == NOFF_MAGIC {
            true
        } else {
            return Err(NoffError::BadMagic(magic));
        };
        let segment = |pos: usize| Segment {
            virtual_addr: word(pos, big),
            in_file_addr: word(pos + 4, big),
            size: word(pos + 8, big),
        };
        Ok(Self {
            code: segment(4),
            readonly_data: segment(16),
            init_data: segment(28),
            uninit_data: segment(40),
        })
    }

    /// Read and decode the header at the front of `executable`.
    pub fn read_from<D: Disk>(executable: &OpenFile<'_, D>) -> Result<Self, NoffError> {
        let mut bytes = [0u8; Self::SIZE];
        if executable.read_at(&mut bytes, 0)? != Self::SIZE {
            return Err(NoffError::Truncated);
        }
        Self::parse(&bytes)
    }
}
