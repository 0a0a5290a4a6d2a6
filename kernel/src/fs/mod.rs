//! Virtual filesystem.
//!
//! A path-rooted tree of trait-object nodes. Each mount supplies its own
//! [`VfsNode`] implementation; the VFS walks components, switching vtables
//! at mount boundaries. Descriptors live in a fixed table with slot reuse
//! (see [`file`]).

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::RwLock;

pub mod blockcache;
pub mod blockdev;
pub mod devfs;
pub mod fat16;
pub mod file;
pub mod ramfs;

pub use file::{FdTable, OpenFlags, SeekFrom};

use crate::error::FsError;

/// Maximum length of one path component.
pub const NAME_MAX: usize = 255;

/// Node kinds the core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Device,
}

/// Metadata returned by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: NodeKind,
    pub size: usize,
    /// Unix-style mode bits; advisory only in a single-user kernel.
    pub mode: u16,
}

/// One `readdir` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub size: usize,
}

/// Per-node operations vtable. Every filesystem backend implements this.
pub trait VfsNode: Send + Sync {
    fn kind(&self) -> NodeKind;

    /// Read from `offset`; returns bytes read (0 at EOF).
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Write at `offset`, extending the file as needed.
    fn write(&self, offset: usize, data: &[u8]) -> Result<usize, FsError>;

    fn metadata(&self) -> Result<Metadata, FsError>;

    /// List entries (directories only).
    fn readdir(&self) -> Result<Vec<DirEntry>, FsError>;

    /// Look up a child by name (directories only).
    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError>;

    /// Create a file in this directory.
    fn create(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError>;

    /// Create a subdirectory.
    fn mkdir(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError>;

    /// Remove a file or empty directory.
    fn unlink(&self, name: &str) -> Result<(), FsError>;

    /// Resize a file; growth zero-fills.
    fn truncate(&self, size: usize) -> Result<(), FsError>;
}

impl core::fmt::Debug for dyn VfsNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VfsNode").field("kind", &self.kind()).finish()
    }
}

/// Per-mount operations.
pub trait Filesystem: Send + Sync {
    fn root(&self) -> Arc<dyn VfsNode>;
    fn name(&self) -> &str;

    fn is_readonly(&self) -> bool {
        false
    }

    /// Push pending state to backing storage.
    fn sync(&self) -> Result<(), FsError> {
        Ok(())
    }
}

/// Collapse `//`, `.` and `..` so equivalent spellings resolve to the same
/// node. Relative paths are anchored at `cwd`.
pub fn normalize_path(path: &str, cwd: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    let anchored;
    let full: &str = if path.starts_with('/') {
        path
    } else {
        anchored = alloc::format!("{}/{}", cwd, path);
        &anchored
    };

    for component in full.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            name => stack.push(name),
        }
    }

    if stack.is_empty() {
        String::from("/")
    } else {
        let mut out = String::new();
        for name in stack {
            out.push('/');
            out.push_str(name);
        }
        out
    }
}

/// Split a normalized path into parent path and final component.
pub fn split_parent(path: &str) -> Result<(&str, &str), FsError> {
    if path == "/" {
        return Err(FsError::InvalidPath);
    }
    let pos = path.rfind('/').ok_or(FsError::InvalidPath)?;
    let name = &path[pos + 1..];
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(FsError::InvalidPath);
    }
    Ok((if pos == 0 { "/" } else { &path[..pos] }, name))
}

/// The mount table and path walker.
pub struct Vfs {
    root_fs: Option<Arc<dyn Filesystem>>,
    mounts: BTreeMap<String, Arc<dyn Filesystem>>,
    cwd: String,
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            root_fs: None,
            mounts: BTreeMap::new(),
            cwd: String::from("/"),
        }
    }

    /// Attach the root filesystem.
    pub fn mount_root(&mut self, fs: Arc<dyn Filesystem>) -> Result<(), FsError> {
        if self.root_fs.is_some() {
            return Err(FsError::AlreadyExists);
        }
        self.root_fs = Some(fs);
        Ok(())
    }

    /// Attach a filesystem at `path` (which must already resolve to a
    /// directory on the parent mount).
    pub fn mount(&mut self, path: &str, fs: Arc<dyn Filesystem>) -> Result<(), FsError> {
        let normalized = normalize_path(path, "/");
        if self.root_fs.is_none() {
            return Err(FsError::NotFound);
        }
        if self.mounts.contains_key(&normalized) {
            return Err(FsError::AlreadyExists);
        }
        self.mounts.insert(normalized, fs);
        Ok(())
    }

    /// Detach the mount at `path`. Its filesystem syncs on the way out.
    pub fn unmount(&mut self, path: &str) -> Result<(), FsError> {
        let normalized = normalize_path(path, "/");
        match self.mounts.remove(&normalized) {
            Some(fs) => fs.sync(),
            None => Err(FsError::NotFound),
        }
    }

    /// Find the filesystem owning `path` and the path remainder below its
    /// mount point. Longest mount prefix wins.
    fn mount_for<'p>(&self, path: &'p str) -> Result<(Arc<dyn Filesystem>, &'p str), FsError> {
        for (mount_path, fs) in self.mounts.iter().rev() {
            if let Some(rest) = path.strip_prefix(mount_path.as_str()) {
                if rest.is_empty() || rest.starts_with('/') {
                    return Ok((fs.clone(), rest));
                }
            }
        }
        let root = self.root_fs.clone().ok_or(FsError::NotFound)?;
        Ok((root, path))
    }

    /// Resolve a path to a node. Normalization makes resolution idempotent:
    /// `/a//b/./c` and `/a/b/c` land on the same node.
    pub fn resolve(&self, path: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        let normalized = normalize_path(path, &self.cwd);
        let (fs, rest) = self.mount_for(&normalized)?;

        let mut node = fs.root();
        for component in rest.split('/').filter(|c| !c.is_empty()) {
            node = node.lookup(component)?;
        }
        Ok(node)
    }

    /// Resolve the parent directory of `path` and return it with the final
    /// component name.
    pub fn resolve_parent(&self, path: &str) -> Result<(Arc<dyn VfsNode>, String), FsError> {
        let normalized = normalize_path(path, &self.cwd);
        let (parent_path, name) = split_parent(&normalized)?;
        let parent = self.resolve(parent_path)?;
        if parent.kind() != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok((parent, String::from(name)))
    }

    /// Open a node, honoring create/truncate flags.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<Arc<dyn VfsNode>, FsError> {
        let node = match self.resolve(path) {
            Ok(node) => node,
            Err(FsError::NotFound) if flags.create => {
                let (parent, name) = self.resolve_parent(path)?;
                parent.create(&name)?
            }
            Err(e) => return Err(e),
        };

        if node.kind() == NodeKind::Directory && flags.write {
            return Err(FsError::IsADirectory);
        }
        if flags.truncate && flags.write && node.kind() == NodeKind::File {
            node.truncate(0)?;
        }
        Ok(node)
    }

    pub fn stat(&self, path: &str) -> Result<Metadata, FsError> {
        self.resolve(path)?.metadata()
    }

    pub fn mkdir(&self, path: &str) -> Result<(), FsError> {
        let (parent, name) = self.resolve_parent(path)?;
        parent.mkdir(&name).map(|_| ())
    }

    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        let (parent, name) = self.resolve_parent(path)?;
        parent.unlink(&name)
    }

    /// Change working directory; the target must be a directory.
    pub fn set_cwd(&mut self, path: &str) -> Result<(), FsError> {
        let normalized = normalize_path(path, &self.cwd);
        let node = self.resolve(&normalized)?;
        if node.kind() != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        self.cwd = normalized;
        Ok(())
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Sync the root and every mount.
    pub fn sync(&self) -> Result<(), FsError> {
        if let Some(root) = &self.root_fs {
            root.sync()?;
        }
        for fs in self.mounts.values() {
            fs.sync()?;
        }
        Ok(())
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Convenience helpers over whole files
// ---------------------------------------------------------------------------

/// Read a whole file, looping over partial transfers.
pub fn read_all(vfs: &Vfs, path: &str) -> Result<Vec<u8>, FsError> {
    let node = vfs.resolve(path)?;
    let meta = node.metadata()?;
    if meta.kind == NodeKind::Directory {
        return Err(FsError::IsADirectory);
    }
    let mut data = vec![0u8; meta.size];
    let mut done = 0;
    while done < data.len() {
        let n = node.read(done, &mut data[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    data.truncate(done);
    Ok(data)
}

/// Write a whole file (create + truncate), looping over partial transfers.
pub fn write_all(vfs: &Vfs, path: &str, data: &[u8]) -> Result<usize, FsError> {
    let node = vfs.open(
        path,
        OpenFlags {
            read: false,
            write: true,
            create: true,
            truncate: true,
            append: false,
        },
    )?;
    let mut done = 0;
    while done < data.len() {
        let n = node.write(done, &data[done..])?;
        if n == 0 {
            return Err(FsError::NoSpace);
        }
        done += n;
    }
    Ok(done)
}

// ---------------------------------------------------------------------------
// Kernel-global instance
// ---------------------------------------------------------------------------

use crate::sync::GlobalState;

static VFS: GlobalState<RwLock<Vfs>> = GlobalState::new();
static VFS_INIT: spin::Mutex<()> = spin::Mutex::new(());

/// The kernel VFS. Panics before [`init`].
pub fn get_vfs() -> &'static RwLock<Vfs> {
    VFS.with(|v| v).expect("VFS used before init")
}

/// Build the standard mount layout: RAMFS root with the usual directories,
/// DevFS at `/dev`. Idempotent; the tree is fully assembled before it is
/// published.
pub fn init() {
    let _guard = VFS_INIT.lock();
    if VFS.is_initialized() {
        return;
    }

    let mut vfs = Vfs::new();
    let root = Arc::new(ramfs::RamFs::new());
    for dir in ["bin", "dev", "disk", "home", "tmp"] {
        root.root().mkdir(dir).ok();
    }
    vfs.mount_root(root).ok();
    vfs.mount("/dev", Arc::new(devfs::DevFs::new())).ok();

    let _ = VFS.init(RwLock::new(vfs));
    log::info!("vfs: ramfs root mounted, devfs at /dev");
}

/// Probe ATA drives and mount the first FAT16 volume found at `/disk`.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn mount_disk() {
    use alloc::boxed::Box;

    use crate::drivers::ata::AtaDrive;

    let mut cache = blockcache::BlockCache::new(blockcache::DEFAULT_CAPACITY);
    let drive = AtaDrive::probe_primary_slave().or_else(AtaDrive::probe_primary);
    let Some(drive) = drive else {
        log::warn!("vfs: no ATA drive found, /disk not mounted");
        return;
    };
    let device_id = cache.add_device(Box::new(drive));
    let cache: blockcache::SharedCache = Arc::new(spin::Mutex::new(cache));

    match fat16::Fat16Fs::mount_auto(cache, device_id) {
        Ok(fs) => {
            get_vfs().write().mount("/disk", Arc::new(fs)).ok();
            log::info!("vfs: FAT16 volume mounted at /disk");
        }
        Err(e) => log::warn!("vfs: FAT16 mount failed: {:?}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram_vfs() -> Vfs {
        let mut vfs = Vfs::new();
        vfs.mount_root(Arc::new(ramfs::RamFs::new())).unwrap();
        vfs
    }

    #[test]
    fn normalize_collapses_dot_and_slash_runs() {
        assert_eq!(normalize_path("/a//b/./c", "/"), "/a/b/c");
        assert_eq!(normalize_path("/a/b/../c", "/"), "/a/c");
        assert_eq!(normalize_path("/../..", "/"), "/");
        assert_eq!(normalize_path("x/y", "/home"), "/home/x/y");
        assert_eq!(normalize_path(".", "/tmp"), "/tmp");
    }

    #[test]
    fn resolution_is_idempotent_across_spellings() {
        let vfs = ram_vfs();
        vfs.resolve("/").unwrap().mkdir("a").unwrap();
        vfs.resolve("/a").unwrap().mkdir("b").unwrap();
        vfs.resolve("/a/b").unwrap().create("c").unwrap();

        let direct = vfs.resolve("/a/b/c").unwrap();
        let twisty = vfs.resolve("/a//b/./c").unwrap();
        assert!(Arc::ptr_eq(&direct, &twisty));
    }

    #[test]
    fn open_with_create_builds_the_file() {
        let vfs = ram_vfs();
        let node = vfs.open("/new.txt", OpenFlags::write_create()).unwrap();
        node.write(0, b"hi").unwrap();
        assert_eq!(vfs.stat("/new.txt").unwrap().size, 2);
    }

    #[test]
    fn open_missing_without_create_fails() {
        let vfs = ram_vfs();
        assert_eq!(
            vfs.open("/ghost", OpenFlags::read_only()).unwrap_err(),
            FsError::NotFound
        );
    }

    #[test]
    fn mount_boundary_switches_vtable() {
        let mut vfs = ram_vfs();
        vfs.resolve("/").unwrap().mkdir("dev").unwrap();
        vfs.mount("/dev", Arc::new(devfs::DevFs::new())).unwrap();

        let null = vfs.resolve("/dev/null").unwrap();
        assert_eq!(null.kind(), NodeKind::Device);

        // A sibling name must not leak onto the mount.
        vfs.resolve("/").unwrap().mkdir("devx").unwrap();
        let devx = vfs.resolve("/devx").unwrap();
        assert_eq!(devx.kind(), NodeKind::Directory);
    }

    #[test]
    fn unmount_detaches() {
        let mut vfs = ram_vfs();
        vfs.resolve("/").unwrap().mkdir("dev").unwrap();
        vfs.mount("/dev", Arc::new(devfs::DevFs::new())).unwrap();
        vfs.unmount("/dev").unwrap();
        // Falls back to the (empty) ramfs directory.
        assert!(vfs.resolve("/dev/null").is_err());
    }

    #[test]
    fn cwd_anchors_relative_paths() {
        let mut vfs = ram_vfs();
        vfs.resolve("/").unwrap().mkdir("home").unwrap();
        vfs.set_cwd("/home").unwrap();
        vfs.open("notes", OpenFlags::write_create()).unwrap();
        assert!(vfs.resolve("/home/notes").is_ok());
    }

    #[test]
    fn set_cwd_rejects_files() {
        let vfs = {
            let v = ram_vfs();
            v.resolve("/").unwrap().create("f").unwrap();
            v
        };
        let mut vfs = vfs;
        assert_eq!(vfs.set_cwd("/f").unwrap_err(), FsError::NotADirectory);
    }

    #[test]
    fn read_all_write_all_round_trip() {
        let vfs = ram_vfs();
        let payload = b"the quick brown fox".repeat(100);
        write_all(&vfs, "/big", &payload).unwrap();
        assert_eq!(read_all(&vfs, "/big").unwrap(), payload);
    }

    #[test]
    fn split_parent_handles_root_children() {
        assert_eq!(split_parent("/a").unwrap(), ("/", "a"));
        assert_eq!(split_parent("/a/b").unwrap(), ("/a", "b"));
        assert!(split_parent("/").is_err());
    }
}
