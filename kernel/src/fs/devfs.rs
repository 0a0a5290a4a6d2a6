//! Device filesystem.
//!
//! A fixed, hand-registered set of leaf nodes under `/dev`. Each node's
//! read/write goes straight to its device; there is no creation, deletion
//! or directory structure beyond the root.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{DirEntry, Filesystem, Metadata, NodeKind, VfsNode};
use crate::error::FsError;

/// Behavior of one device node.
trait DeviceOps: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<usize, FsError>;
    fn write(&self, data: &[u8]) -> Result<usize, FsError>;
}

/// `/dev/null`: reads EOF, writes vanish.
struct NullDevice;

impl DeviceOps for NullDevice {
    fn read(&self, _buf: &mut [u8]) -> Result<usize, FsError> {
        Ok(0)
    }

    fn write(&self, data: &[u8]) -> Result<usize, FsError> {
        Ok(data.len())
    }
}

/// `/dev/zero`: endless zeroes.
struct ZeroDevice;

impl DeviceOps for ZeroDevice {
    fn read(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write(&self, data: &[u8]) -> Result<usize, FsError> {
        Ok(data.len())
    }
}

/// `/dev/console`: writes print to the active console; reads drain pending
/// keyboard characters without blocking.
struct ConsoleDevice;

impl DeviceOps for ConsoleDevice {
    fn read(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut n = 0;
        while n < buf.len() {
            match crate::drivers::keyboard::read_event() {
                Some(event) if event.pressed => {
                    if let Some(ch) = event.character {
                        if ch.is_ascii() {
                            buf[n] = ch as u8;
                            n += 1;
                        }
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> Result<usize, FsError> {
        if let Ok(text) = core::str::from_utf8(data) {
            crate::print!("{}", text);
            Ok(data.len())
        } else {
            Err(FsError::Io)
        }
    }
}

struct DevNode {
    ops: Arc<dyn DeviceOps>,
}

impl VfsNode for DevNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Device
    }

    fn read(&self, _offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        self.ops.read(buf)
    }

    fn write(&self, _offset: usize, data: &[u8]) -> Result<usize, FsError> {
        self.ops.write(data)
    }

    fn metadata(&self) -> Result<Metadata, FsError> {
        Ok(Metadata {
            kind: NodeKind::Device,
            size: 0,
            mode: 0o666,
        })
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        Err(FsError::NotADirectory)
    }

    fn lookup(&self, _name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        Err(FsError::NotADirectory)
    }

    fn create(&self, _name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        Err(FsError::NotADirectory)
    }

    fn mkdir(&self, _name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        Err(FsError::NotADirectory)
    }

    fn unlink(&self, _name: &str) -> Result<(), FsError> {
        Err(FsError::NotADirectory)
    }

    fn truncate(&self, _size: usize) -> Result<(), FsError> {
        Ok(()) // devices ignore truncation
    }
}

struct DevRoot {
    nodes: BTreeMap<String, Arc<DevNode>>,
}

impl VfsNode for DevRoot {
    fn kind(&self) -> NodeKind {
        NodeKind::Directory
    }

    fn read(&self, _offset: usize, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::IsADirectory)
    }

    fn write(&self, _offset: usize, _data: &[u8]) -> Result<usize, FsError> {
        Err(FsError::IsADirectory)
    }

    fn metadata(&self) -> Result<Metadata, FsError> {
        Ok(Metadata {
            kind: NodeKind::Directory,
            size: 0,
            mode: 0o555,
        })
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        Ok(self
            .nodes
            .keys()
            .map(|name| DirEntry {
                name: name.clone(),
                kind: NodeKind::Device,
                size: 0,
            })
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        self.nodes
            .get(name)
            .map(|n| n.clone() as Arc<dyn VfsNode>)
            .ok_or(FsError::NotFound)
    }

    fn create(&self, _name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        Err(FsError::ReadOnly)
    }

    fn mkdir(&self, _name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        Err(FsError::ReadOnly)
    }

    fn unlink(&self, _name: &str) -> Result<(), FsError> {
        Err(FsError::ReadOnly)
    }

    fn truncate(&self, _size: usize) -> Result<(), FsError> {
        Err(FsError::IsADirectory)
    }
}

/// The `/dev` mount.
pub struct DevFs {
    root: Arc<DevRoot>,
}

impl DevFs {
    pub fn new() -> Self {
        let mut nodes: BTreeMap<String, Arc<DevNode>> = BTreeMap::new();
        nodes.insert(
            String::from("null"),
            Arc::new(DevNode {
                ops: Arc::new(NullDevice),
            }),
        );
        nodes.insert(
            String::from("zero"),
            Arc::new(DevNode {
                ops: Arc::new(ZeroDevice),
            }),
        );
        nodes.insert(
            String::from("console"),
            Arc::new(DevNode {
                ops: Arc::new(ConsoleDevice),
            }),
        );
        Self {
            root: Arc::new(DevRoot { nodes }),
        }
    }
}

impl Default for DevFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for DevFs {
    fn root(&self) -> Arc<dyn VfsNode> {
        self.root.clone() as Arc<dyn VfsNode>
    }

    fn name(&self) -> &str {
        "devfs"
    }

    fn is_readonly(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_swallows_writes_and_reads_eof() {
        let fs = DevFs::new();
        let null = fs.root().lookup("null").unwrap();
        assert_eq!(null.write(0, b"gone").unwrap(), 4);
        let mut buf = [1u8; 4];
        assert_eq!(null.read(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn zero_fills_reads() {
        let fs = DevFs::new();
        let zero = fs.root().lookup("zero").unwrap();
        let mut buf = [0xFFu8; 8];
        assert_eq!(zero.read(0, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn devfs_is_immutable() {
        let fs = DevFs::new();
        let root = fs.root();
        assert_eq!(root.create("new").unwrap_err(), FsError::ReadOnly);
        assert_eq!(root.unlink("null").unwrap_err(), FsError::ReadOnly);
        assert!(fs.is_readonly());
    }

    #[test]
    fn readdir_lists_registered_devices() {
        let fs = DevFs::new();
        let entries = fs.root().readdir().unwrap();
        let names: alloc::vec::Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"null"));
        assert!(names.contains(&"zero"));
        assert!(names.contains(&"console"));
    }
}
