//! File descriptors.
//!
//! A fixed table of open-file slots; the lowest free index is reused after
//! close, which is the contract loaded programs see through the syscall
//! table.

use alloc::sync::Arc;

use super::{DirEntry, Metadata, NodeKind, VfsNode};
use crate::error::FsError;

/// Size of the descriptor table.
pub const MAX_FDS: usize = 64;

/// Open mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            truncate: false,
            append: false,
        }
    }

    pub fn write_create() -> Self {
        Self {
            read: false,
            write: true,
            create: true,
            truncate: true,
            append: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            truncate: false,
            append: false,
        }
    }

    pub fn append() -> Self {
        Self {
            read: false,
            write: true,
            create: true,
            truncate: false,
            append: true,
        }
    }

    /// Decode the bit form used across the syscall ABI.
    ///
    /// Bit 0 read, bit 1 write, bit 2 create, bit 3 truncate, bit 4 append.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            read: bits & 0x01 != 0,
            write: bits & 0x02 != 0,
            create: bits & 0x04 != 0,
            truncate: bits & 0x08 != 0,
            append: bits & 0x10 != 0,
        }
    }
}

/// Seek origin.
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(usize),
    Current(isize),
    End(isize),
}

/// One open file.
struct OpenFile {
    node: Arc<dyn VfsNode>,
    flags: OpenFlags,
    offset: usize,
    /// Opaque directory cursor for `readdir_next`.
    readdir_pos: usize,
}

/// Fixed descriptor table.
pub struct FdTable {
    slots: [Option<OpenFile>; MAX_FDS],
}

impl FdTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_FDS],
        }
    }

    fn slot(&mut self, fd: usize) -> Result<&mut OpenFile, FsError> {
        self.slots
            .get_mut(fd)
            .and_then(|s| s.as_mut())
            .ok_or(FsError::InvalidDescriptor)
    }

    /// Install an already-resolved node; returns the new descriptor.
    pub fn insert(&mut self, node: Arc<dyn VfsNode>, flags: OpenFlags) -> Result<usize, FsError> {
        let fd = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(FsError::NoSpace)?;
        self.slots[fd] = Some(OpenFile {
            node,
            flags,
            offset: 0,
            readdir_pos: 0,
        });
        Ok(fd)
    }

    pub fn close(&mut self, fd: usize) -> Result<(), FsError> {
        if fd >= MAX_FDS || self.slots[fd].is_none() {
            return Err(FsError::InvalidDescriptor);
        }
        self.slots[fd] = None;
        Ok(())
    }

    pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let file = self.slot(fd)?;
        if !file.flags.read {
            return Err(FsError::InvalidDescriptor);
        }
        let n = file.node.read(file.offset, buf)?;
        file.offset += n;
        Ok(n)
    }

    pub fn write(&mut self, fd: usize, data: &[u8]) -> Result<usize, FsError> {
        let file = self.slot(fd)?;
        if !file.flags.write {
            return Err(FsError::InvalidDescriptor);
        }
        if file.flags.append {
            file.offset = file.node.metadata()?.size;
        }
        let n = file.node.write(file.offset, data)?;
        file.offset += n;
        Ok(n)
    }

    pub fn seek(&mut self, fd: usize, from: SeekFrom) -> Result<usize, FsError> {
        let file = self.slot(fd)?;
        let size = file.node.metadata()?.size;
        let new_offset = match from {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => {
                let cur = file.offset as isize + delta;
                if cur < 0 {
                    return Err(FsError::InvalidPath);
                }
                cur as usize
            }
            SeekFrom::End(delta) => {
                let end = size as isize + delta;
                if end < 0 {
                    return Err(FsError::InvalidPath);
                }
                end as usize
            }
        };
        // Offsets stay within [0, size] for regular files.
        if file.node.kind() == NodeKind::File && new_offset > size {
            return Err(FsError::InvalidPath);
        }
        file.offset = new_offset;
        Ok(new_offset)
    }

    pub fn stat(&mut self, fd: usize) -> Result<Metadata, FsError> {
        self.slot(fd)?.node.metadata()
    }

    /// Step the directory cursor; `None` when exhausted.
    pub fn readdir_next(&mut self, fd: usize) -> Result<Option<DirEntry>, FsError> {
        let file = self.slot(fd)?;
        let entries = file.node.readdir()?;
        let entry = entries.get(file.readdir_pos).cloned();
        if entry.is_some() {
            file.readdir_pos += 1;
        }
        Ok(entry)
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ramfs::RamFs;
    use crate::fs::Filesystem;

    fn table_with_file(content: &[u8]) -> (FdTable, Arc<dyn VfsNode>) {
        let fs = RamFs::new();
        let root = fs.root();
        let node = root.create("f").unwrap();
        node.write(0, content).unwrap();
        (FdTable::new(), node)
    }

    #[test]
    fn descriptor_slots_are_reused_after_close() {
        let (mut table, node) = table_with_file(b"x");
        let a = table.insert(node.clone(), OpenFlags::read_only()).unwrap();
        let b = table.insert(node.clone(), OpenFlags::read_only()).unwrap();
        assert_eq!((a, b), (0, 1));

        table.close(a).unwrap();
        let c = table.insert(node, OpenFlags::read_only()).unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn read_advances_offset() {
        let (mut table, node) = table_with_file(b"hello world");
        let fd = table.insert(node, OpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(table.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(table.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b" worl");
    }

    #[test]
    fn seek_bounds_are_enforced() {
        let (mut table, node) = table_with_file(b"0123456789");
        let fd = table.insert(node, OpenFlags::read_write()).unwrap();
        assert_eq!(table.seek(fd, SeekFrom::End(0)).unwrap(), 10);
        assert_eq!(table.seek(fd, SeekFrom::Current(-4)).unwrap(), 6);
        assert!(table.seek(fd, SeekFrom::Start(11)).is_err());
        assert!(table.seek(fd, SeekFrom::Current(-100)).is_err());
    }

    #[test]
    fn append_writes_land_at_end() {
        let (mut table, node) = table_with_file(b"abc");
        let fd = table.insert(node.clone(), OpenFlags::append()).unwrap();
        table.write(fd, b"def").unwrap();
        assert_eq!(node.metadata().unwrap().size, 6);
        let mut buf = [0u8; 6];
        node.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn wrong_mode_is_rejected() {
        let (mut table, node) = table_with_file(b"abc");
        let r = table.insert(node.clone(), OpenFlags::read_only()).unwrap();
        assert!(table.write(r, b"x").is_err());
        let w = table
            .insert(
                node,
                OpenFlags {
                    read: false,
                    write: true,
                    create: false,
                    truncate: false,
                    append: false,
                },
            )
            .unwrap();
        let mut buf = [0u8; 1];
        assert!(table.read(w, &mut buf).is_err());
    }

    #[test]
    fn invalid_descriptor_is_rejected() {
        let mut table = FdTable::new();
        let mut buf = [0u8; 1];
        assert_eq!(table.read(7, &mut buf).unwrap_err(), FsError::InvalidDescriptor);
        assert_eq!(table.close(99).unwrap_err(), FsError::InvalidDescriptor);
    }

    #[test]
    fn readdir_cursor_walks_entries_once() {
        let fs = RamFs::new();
        let root = fs.root();
        root.create("one").unwrap();
        root.create("two").unwrap();

        let mut table = FdTable::new();
        let fd = table.insert(root, OpenFlags::read_only()).unwrap();
        let mut names = alloc::vec::Vec::new();
        while let Some(entry) = table.readdir_next(fd).unwrap() {
            names.push(entry.name);
        }
        assert_eq!(names.len(), 2);
        assert!(names.contains(&alloc::string::String::from("one")));
    }
}
