//! The system-call surface for user programs.
//!
//! Ids handed back by `Open` are the disk sectors of the opened files'
//! headers; `Read`, `Write`, and `Close` address the file system's
//! open-file table through them. Failures come back as the
//! conventional `-1` rather than an error type, matching what the
//! syscall stubs deliver to user code.

use crate::kernel::Kernel;
use index_fs::FileId;
use log::{debug, info};

impl Kernel {
    /// `Halt`: stop the machine.
    pub fn halt(&self) {
        info!("machine halting at tick {}", self.stats.total_ticks());
    }

    /// `Create(name, size)`: make a file of `size` bytes.
    pub fn sys_create(&mut self, path: &str, size: usize) -> bool {
        match self.fs.create(path, size) {
            Ok(()) => true,
            Err(e) => {
                debug!(target: "syscall", "create {} failed: {}", path, e);
                false
            }
        }
    }

    /// `Open(name)`: open a file, returning its id.
    pub fn sys_open(&mut self, path: &str) -> Option<FileId> {
        match self.fs.open(path) {
            Ok(id) => Some(id),
            Err(e) => {
                debug!(target: "syscall", "open {} failed: {}", path, e);
                None
            }
        }
    }

    /// `Read(buf, size, id)`: read into `buf` from the open file `id`.
    /// Returns the byte count, or -1 for a bad id.
    pub fn sys_read(&mut self, id: FileId, buf: &mut [u8]) -> i32 {
        match self.fs.read(id, buf) {
            Ok(n) => n as i32,
            Err(_) => -1,
        }
    }

    /// `Write(buf, size, id)`: write `buf` to the open file `id`.
    /// Returns the byte count, or -1 for a bad id.
    pub fn sys_write(&mut self, id: FileId, buf: &[u8]) -> i32 {
        match self.fs.write(id, buf) {
            Ok(n) => n as i32,
            Err(_) => -1,
        }
    }

    /// `Close(id)`: drop the open file `id`. Returns 1, or -1 for a
    /// bad id.
    pub fn sys_close(&mut self, id: FileId) -> i32 {
        match self.fs.close_file(id) {
            Ok(()) => 1,
            Err(_) => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimic::disk::SynchDisk;

    #[test]
    fn files_flow_through_the_syscall_surface() {
        let mut kernel = Kernel::format(SynchDisk::scratch()).unwrap();
        assert!(kernel.sys_create("/data", 64));
        assert!(!kernel.sys_create("/data", 64));

        let id = kernel.sys_open("/data").unwrap();
        assert_eq!(kernel.sys_write(id, b"hello"), 5);

        // Ids address their own handles: a second open rewinds.
        let id2 = kernel.sys_open("/data").unwrap();
        assert_eq!(id, id2);
        let mut buf = [0u8; 5];
        assert_eq!(kernel.sys_read(id2, &mut buf), 5);
        assert_eq!(&buf, b"hello");

        assert_eq!(kernel.sys_close(id), 1);
        assert_eq!(kernel.sys_close(id), -1);
        assert_eq!(kernel.sys_read(id, &mut buf), -1);
        assert_eq!(kernel.sys_open("/absent"), None);
    }
}
