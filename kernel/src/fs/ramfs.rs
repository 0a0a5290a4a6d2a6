//! RAM filesystem.
//!
//! The boot root: a tree of in-memory nodes, file bytes in heap-backed
//! vectors that grow on write. No persistence, no limits beyond the heap.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use super::{DirEntry, Filesystem, Metadata, NodeKind, VfsNode};
use crate::error::FsError;

struct RamNode {
    kind: NodeKind,
    mode: u16,
    data: RwLock<Vec<u8>>,
    children: RwLock<BTreeMap<String, Arc<RamNode>>>,
}

impl RamNode {
    fn new_file() -> Self {
        Self {
            kind: NodeKind::File,
            mode: 0o644,
            data: RwLock::new(Vec::new()),
            children: RwLock::new(BTreeMap::new()),
        }
    }

    fn new_directory() -> Self {
        Self {
            kind: NodeKind::Directory,
            mode: 0o755,
            data: RwLock::new(Vec::new()),
            children: RwLock::new(BTreeMap::new()),
        }
    }

    fn require_dir(&self) -> Result<(), FsError> {
        if self.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok(())
    }

    fn insert_child(&self, name: &str, node: RamNode) -> Result<Arc<dyn VfsNode>, FsError> {
        self.require_dir()?;
        if name.is_empty() || name.contains('/') {
            return Err(FsError::InvalidPath);
        }
        let mut children = self.children.write();
        if children.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        let node = Arc::new(node);
        children.insert(String::from(name), node.clone());
        Ok(node)
    }
}

impl VfsNode for RamNode {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.kind != NodeKind::File {
            return Err(FsError::NotAFile);
        }
        let data = self.data.read();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<usize, FsError> {
        if self.kind != NodeKind::File {
            return Err(FsError::NotAFile);
        }
        let mut bytes = self.data.write();
        if offset + data.len() > bytes.len() {
            bytes.resize(offset + data.len(), 0);
        }
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn metadata(&self) -> Result<Metadata, FsError> {
        Ok(Metadata {
            kind: self.kind,
            size: self.data.read().len(),
            mode: self.mode,
        })
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        self.require_dir()?;
        let children = self.children.read();
        Ok(children
            .iter()
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                kind: node.kind,
                size: node.data.read().len(),
            })
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        self.require_dir()?;
        self.children
            .read()
            .get(name)
            .map(|n| n.clone() as Arc<dyn VfsNode>)
            .ok_or(FsError::NotFound)
    }

    fn create(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        self.insert_child(name, RamNode::new_file())
    }

    fn mkdir(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        self.insert_child(name, RamNode::new_directory())
    }

    fn unlink(&self, name: &str) -> Result<(), FsError> {
        self.require_dir()?;
        let mut children = self.children.write();
        let node = children.get(name).ok_or(FsError::NotFound)?;
        if node.kind == NodeKind::Directory && !node.children.read().is_empty() {
            return Err(FsError::DirectoryNotEmpty);
        }
        children.remove(name);
        Ok(())
    }

    fn truncate(&self, size: usize) -> Result<(), FsError> {
        if self.kind != NodeKind::File {
            return Err(FsError::NotAFile);
        }
        self.data.write().resize(size, 0);
        Ok(())
    }
}

/// The filesystem handle.
pub struct RamFs {
    root: Arc<RamNode>,
}

impl RamFs {
    pub fn new() -> Self {
        Self {
            root: Arc::new(RamNode::new_directory()),
        }
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for RamFs {
    fn root(&self) -> Arc<dyn VfsNode> {
        self.root.clone() as Arc<dyn VfsNode>
    }

    fn name(&self) -> &str {
        "ramfs"
    }
}
