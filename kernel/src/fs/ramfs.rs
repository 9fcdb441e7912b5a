//! In-memory filesystem
//!
//! A flat-namespace filesystem used by tests and early boot. It hosts
//! regular files, a handful of directory entries (enough to exercise
//! `chdir`), the console device at [`CONSOLE_PATH`], and [`RamDisk`], a
//! fixed-size block-device double that can serve as the swap device.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    string::{String, ToString},
    sync::Arc,
    vec,
    vec::Vec,
};

use spin::Mutex as SpinMutex;

use super::{Console, FileSystem, NodeType, OpenFlags, Stat, Vnode, CONSOLE_PATH};
use crate::error::Errno;

/// A regular file backed by a growable byte vector.
pub struct RamFile {
    data: SpinMutex<Vec<u8>>,
}

impl RamFile {
    pub fn new() -> Arc<RamFile> {
        Arc::new(RamFile {
            data: SpinMutex::new(Vec::new()),
        })
    }

    fn truncate(&self) {
        self.data.lock().clear();
    }
}

impl Vnode for RamFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let count = buf.len().min(data.len() - offset);
        buf[..count].copy_from_slice(&data[offset..offset + count]);
        Ok(count)
    }

    fn write_at(&self, offset: u64, new_data: &[u8]) -> Result<usize, Errno> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if offset > data.len() {
            // Sparse write: zero-fill the gap.
            data.resize(offset, 0);
        }
        let end = offset + new_data.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(new_data);
        Ok(new_data.len())
    }

    fn stat(&self) -> Result<Stat, Errno> {
        Ok(Stat {
            size: self.data.lock().len() as u64,
            node_type: NodeType::File,
        })
    }
}

/// Directory marker node. Reads and writes are refused; it exists so
/// `lookup` can answer `chdir`.
struct RamDir;

impl Vnode for RamDir {
    fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::Einval)
    }

    fn write_at(&self, _offset: u64, _data: &[u8]) -> Result<usize, Errno> {
        Err(Errno::Einval)
    }

    fn stat(&self) -> Result<Stat, Errno> {
        Ok(Stat {
            size: 0,
            node_type: NodeType::Directory,
        })
    }
}

/// Fixed-capacity block-device double. Reads and writes are clamped to the
/// capacity; `stat` reports the capacity, which is what sizes the swap
/// bitmap when this backs the swap area.
pub struct RamDisk {
    data: SpinMutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(capacity: usize) -> RamDisk {
        RamDisk {
            data: SpinMutex::new(vec![0u8; capacity]),
        }
    }
}

impl Vnode for RamDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let count = buf.len().min(data.len() - offset);
        buf[..count].copy_from_slice(&data[offset..offset + count]);
        Ok(count)
    }

    fn write_at(&self, offset: u64, new_data: &[u8]) -> Result<usize, Errno> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Err(Errno::Enospc);
        }
        let count = new_data.len().min(data.len() - offset);
        data[offset..offset + count].copy_from_slice(&new_data[..count]);
        Ok(count)
    }

    fn stat(&self) -> Result<Stat, Errno> {
        Ok(Stat {
            size: self.data.lock().len() as u64,
            node_type: NodeType::BlockDevice,
        })
    }
}

/// The in-memory filesystem.
pub struct RamFs {
    files: SpinMutex<BTreeMap<String, Arc<RamFile>>>,
    dirs: SpinMutex<BTreeSet<String>>,
    console: Arc<Console>,
}

impl RamFs {
    pub fn new() -> Arc<RamFs> {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Arc::new(RamFs {
            files: SpinMutex::new(BTreeMap::new()),
            dirs: SpinMutex::new(dirs),
            console: Arc::new(Console::new()),
        })
    }

    /// The console device this filesystem serves at `"con:"`.
    pub fn console(&self) -> Arc<Console> {
        self.console.clone()
    }

    /// Register a directory entry so `chdir` can resolve it.
    pub fn add_dir(&self, path: &str) {
        self.dirs.lock().insert(path.to_string());
    }
}

impl FileSystem for RamFs {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Arc<dyn Vnode>, Errno> {
        if path == CONSOLE_PATH {
            return Ok(self.console.clone());
        }
        if path.is_empty() {
            return Err(Errno::Einval);
        }
        let mut files = self.files.lock();
        match files.get(path) {
            Some(file) => {
                if flags.create && flags.exclusive {
                    return Err(Errno::Eexist);
                }
                if flags.truncate {
                    file.truncate();
                }
                Ok(file.clone())
            }
            None => {
                if !flags.create {
                    return Err(Errno::Enoent);
                }
                let file = RamFile::new();
                files.insert(path.to_string(), file.clone());
                Ok(file)
            }
        }
    }

    fn lookup(&self, path: &str) -> Result<Arc<dyn Vnode>, Errno> {
        if path == CONSOLE_PATH {
            return Ok(self.console.clone());
        }
        if self.dirs.lock().contains(path) {
            return Ok(Arc::new(RamDir));
        }
        self.files
            .lock()
            .get(path)
            .map(|file| file.clone() as Arc<dyn Vnode>)
            .ok_or(Errno::Enoent)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn open_create_read_back() {
        let fs = RamFs::new();
        let missing = fs.open("/a", OpenFlags::read_only());
        assert_eq!(missing.err(), Some(Errno::Enoent));

        let file = fs
            .open("/a", OpenFlags::write_only().creating())
            .expect("create should succeed");
        assert_eq!(file.write_at(0, b"hello"), Ok(5));

        let again = fs
            .open("/a", OpenFlags::read_only())
            .expect("existing file should open");
        let mut buf = [0u8; 5];
        assert_eq!(again.read_at(0, &mut buf), Ok(5));
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn exclusive_create_refuses_existing() {
        let fs = RamFs::new();
        let mut flags = OpenFlags::write_only().creating();
        flags.exclusive = true;
        fs.open("/a", flags).expect("first create should succeed");
        assert_eq!(fs.open("/a", flags).err(), Some(Errno::Eexist));
    }

    #[test]
    fn truncate_discards_contents() {
        let fs = RamFs::new();
        let file = fs
            .open("/a", OpenFlags::write_only().creating())
            .expect("create should succeed");
        file.write_at(0, b"contents").expect("write should succeed");

        let mut flags = OpenFlags::write_only();
        flags.truncate = true;
        let truncated = fs.open("/a", flags).expect("reopen should succeed");
        assert_eq!(truncated.stat().expect("stat should succeed").size, 0);
    }

    #[test]
    fn sparse_writes_zero_fill() {
        let file = RamFile::new();
        file.write_at(8, b"xy").expect("sparse write should succeed");
        let mut buf = [0xFFu8; 10];
        assert_eq!(file.read_at(0, &mut buf), Ok(10));
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert_eq!(&buf[8..], b"xy");
    }

    #[test]
    fn lookup_distinguishes_dirs_and_files() {
        let fs = RamFs::new();
        fs.add_dir("/tmp");
        fs.open("/tmp/file", OpenFlags::write_only().creating())
            .expect("create should succeed");

        let dir = fs.lookup("/tmp").expect("dir should resolve");
        assert_eq!(dir.stat().expect("stat").node_type, NodeType::Directory);
        let file = fs.lookup("/tmp/file").expect("file should resolve");
        assert_eq!(file.stat().expect("stat").node_type, NodeType::File);
        assert_eq!(fs.lookup("/nope").err(), Some(Errno::Enoent));
    }

    #[test]
    fn ramdisk_is_fixed_size() {
        let disk = RamDisk::new(8192);
        assert_eq!(disk.stat().expect("stat").size, 8192);
        assert_eq!(disk.write_at(8190, b"abcd"), Ok(2)); // clamped
        assert_eq!(disk.write_at(8192, b"z").err(), Some(Errno::Enospc));
        let mut buf = [0u8; 4];
        assert_eq!(disk.read_at(8190, &mut buf), Ok(2));
        assert_eq!(&buf[..2], b"ab");
    }
}
