//! FAT16 filesystem over the block cache.
//!
//! Standard on-disk layout: BPB, reserved sectors, two FATs, a fixed-size
//! root directory, then the cluster data area. 8.3 short names only; long
//! file name entries are skipped. The backend reads the BPB once at mount
//! and addresses everything through `(device, lba)` pairs on the shared
//! block cache, so dirty sectors ride the cache's write-back policy and
//! reach the disk on `sync`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use super::blockcache::SharedCache;
use super::{DirEntry, Filesystem, Metadata, NodeKind, VfsNode};
use crate::error::FsError;

const DIR_ENTRY_SIZE: usize = 32;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LFN: u8 = 0x0F;
const ENTRY_DELETED: u8 = 0xE5;
const ENTRY_END: u8 = 0x00;

const FAT_FREE: u16 = 0x0000;
const FAT_EOC: u16 = 0xFFFF;
const FAT_EOC_MIN: u16 = 0xFFF8;

/// BIOS parameter block fields the driver needs.
#[derive(Debug, Clone, Copy)]
pub struct Bpb {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entries: u16,
    pub total_sectors: u32,
    pub fat_size: u16,
}

impl Bpb {
    /// Parse and sanity-check a boot sector.
    pub fn parse(sector: &[u8]) -> Result<Bpb, FsError> {
        if sector.len() < 512 {
            return Err(FsError::Io);
        }
        let u16_at = |off: usize| u16::from_le_bytes([sector[off], sector[off + 1]]);
        let total16 = u16_at(19) as u32;
        let total32 = u32::from_le_bytes([sector[32], sector[33], sector[34], sector[35]]);

        let bpb = Bpb {
            bytes_per_sector: u16_at(11),
            sectors_per_cluster: sector[13],
            reserved_sectors: u16_at(14),
            num_fats: sector[16],
            root_entries: u16_at(17),
            total_sectors: if total16 != 0 { total16 } else { total32 },
            fat_size: u16_at(22),
        };

        if bpb.bytes_per_sector != 512
            || bpb.sectors_per_cluster == 0
            || !bpb.sectors_per_cluster.is_power_of_two()
            || bpb.num_fats == 0
            || bpb.root_entries == 0
            || bpb.fat_size == 0
            || bpb.total_sectors == 0
        {
            return Err(FsError::Io);
        }
        Ok(bpb)
    }

    fn root_dir_sectors(&self) -> u32 {
        (self.root_entries as u32 * DIR_ENTRY_SIZE as u32).div_ceil(self.bytes_per_sector as u32)
    }

    fn cluster_bytes(&self) -> usize {
        self.sectors_per_cluster as usize * self.bytes_per_sector as usize
    }
}

// ---------------------------------------------------------------------------
// 8.3 names
// ---------------------------------------------------------------------------

fn valid_83_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'~' | b'!' | b'#' | b'$' | b'%' | b'&')
}

/// Encode `name` into the 11-byte padded form, uppercasing as FAT demands.
pub fn encode_83(name: &str) -> Result<[u8; 11], FsError> {
    let (base, ext) = match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(pos) => (&name[..pos], &name[pos + 1..]),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return Err(FsError::NameTooLong);
    }

    let mut out = [b' '; 11];
    for (i, b) in base.bytes().enumerate() {
        if !valid_83_byte(b) {
            return Err(FsError::InvalidPath);
        }
        out[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().enumerate() {
        if !valid_83_byte(b) {
            return Err(FsError::InvalidPath);
        }
        out[8 + i] = b.to_ascii_uppercase();
    }
    Ok(out)
}

/// Decode the padded on-disk form back to `NAME.EXT`.
pub fn decode_83(raw: &[u8]) -> String {
    let base: &[u8] = &raw[..8];
    let ext: &[u8] = &raw[8..11];
    let base_end = base.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
    let ext_end = ext.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);

    let mut out = String::new();
    for &b in &base[..base_end] {
        out.push(b as char);
    }
    if ext_end > 0 {
        out.push('.');
        for &b in &ext[..ext_end] {
            out.push(b as char);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// Where a node's 32-byte directory entry lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryLoc {
    lba: u64,
    offset: usize,
}

/// Which sector run holds a directory's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirLocation {
    /// The fixed root directory region.
    Root,
    /// A cluster-chained subdirectory.
    Cluster(u16),
}

struct Volume {
    cache: SharedCache,
    device_id: usize,
    bpb: Bpb,
    fat_start: u64,
    root_start: u64,
    data_start: u64,
    cluster_count: u32,
    /// Serializes FAT/directory mutations across nodes.
    mutate: Mutex<()>,
}

impl Volume {
    fn read_sector(&self, lba: u64, buf: &mut [u8]) -> Result<(), FsError> {
        self.cache
            .lock()
            .read(self.device_id, lba, buf)
            .map_err(|_| FsError::Io)
    }

    fn write_sector(&self, lba: u64, buf: &[u8]) -> Result<(), FsError> {
        self.cache
            .lock()
            .write(self.device_id, lba, buf)
            .map_err(|_| FsError::Io)
    }

    fn cluster_lba(&self, cluster: u16) -> u64 {
        self.data_start + (cluster as u64 - 2) * self.bpb.sectors_per_cluster as u64
    }

    fn fat_get(&self, cluster: u16) -> Result<u16, FsError> {
        let byte_off = cluster as u64 * 2;
        let lba = self.fat_start + byte_off / self.bpb.bytes_per_sector as u64;
        let off = (byte_off % self.bpb.bytes_per_sector as u64) as usize;
        let mut sector = vec![0u8; self.bpb.bytes_per_sector as usize];
        self.read_sector(lba, &mut sector)?;
        Ok(u16::from_le_bytes([sector[off], sector[off + 1]]))
    }

    /// Write one FAT entry into every FAT copy.
    fn fat_set(&self, cluster: u16, value: u16) -> Result<(), FsError> {
        let byte_off = cluster as u64 * 2;
        let sector_in_fat = byte_off / self.bpb.bytes_per_sector as u64;
        let off = (byte_off % self.bpb.bytes_per_sector as u64) as usize;
        let mut sector = vec![0u8; self.bpb.bytes_per_sector as usize];
        for fat in 0..self.bpb.num_fats as u64 {
            let lba = self.fat_start + fat * self.bpb.fat_size as u64 + sector_in_fat;
            self.read_sector(lba, &mut sector)?;
            sector[off..off + 2].copy_from_slice(&value.to_le_bytes());
            self.write_sector(lba, &sector)?;
        }
        Ok(())
    }

    /// First-fit scan of the FAT free list.
    fn alloc_cluster(&self) -> Result<u16, FsError> {
        for cluster in 2..(self.cluster_count + 2).min(0xFFF0) as u16 {
            if self.fat_get(cluster)? == FAT_FREE {
                self.fat_set(cluster, FAT_EOC)?;
                return Ok(cluster);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Release a whole chain back to the free list.
    fn free_chain(&self, first: u16) -> Result<(), FsError> {
        let mut cluster = first;
        while (2..FAT_EOC_MIN).contains(&cluster) {
            let next = self.fat_get(cluster)?;
            self.fat_set(cluster, FAT_FREE)?;
            cluster = next;
        }
        Ok(())
    }

    fn zero_cluster(&self, cluster: u16) -> Result<(), FsError> {
        let zeroes = vec![0u8; self.bpb.bytes_per_sector as usize];
        let lba = self.cluster_lba(cluster);
        for s in 0..self.bpb.sectors_per_cluster as u64 {
            self.write_sector(lba + s, &zeroes)?;
        }
        Ok(())
    }

    /// Iterate the sectors of a directory, visiting each 32-byte entry.
    /// The visitor returns `true` to stop.
    fn walk_dir(
        &self,
        dir: DirLocation,
        mut visit: impl FnMut(EntryLoc, &[u8]) -> bool,
    ) -> Result<(), FsError> {
        let mut sector = vec![0u8; self.bpb.bytes_per_sector as usize];
        match dir {
            DirLocation::Root => {
                for s in 0..self.bpb.root_dir_sectors() as u64 {
                    let lba = self.root_start + s;
                    self.read_sector(lba, &mut sector)?;
                    for off in (0..sector.len()).step_by(DIR_ENTRY_SIZE) {
                        if visit(EntryLoc { lba, offset: off }, &sector[off..off + DIR_ENTRY_SIZE])
                        {
                            return Ok(());
                        }
                    }
                }
            }
            DirLocation::Cluster(first) => {
                let mut cluster = first;
                while (2..FAT_EOC_MIN).contains(&cluster) {
                    let base = self.cluster_lba(cluster);
                    for s in 0..self.bpb.sectors_per_cluster as u64 {
                        let lba = base + s;
                        self.read_sector(lba, &mut sector)?;
                        for off in (0..sector.len()).step_by(DIR_ENTRY_SIZE) {
                            if visit(
                                EntryLoc { lba, offset: off },
                                &sector[off..off + DIR_ENTRY_SIZE],
                            ) {
                                return Ok(());
                            }
                        }
                    }
                    cluster = self.fat_get(cluster)?;
                }
            }
        }
        Ok(())
    }

    /// Find the entry whose 8.3 name matches.
    fn find_entry(&self, dir: DirLocation, name83: &[u8; 11]) -> Result<Option<(EntryLoc, RawEntry)>, FsError> {
        let mut found = None;
        self.walk_dir(dir, |loc, raw| {
            if raw[0] == ENTRY_END {
                return true;
            }
            if raw[0] == ENTRY_DELETED || raw[11] == ATTR_LFN || raw[11] & ATTR_VOLUME_ID != 0 {
                return false;
            }
            if raw[..11] == name83[..] {
                found = Some((loc, RawEntry::decode(raw)));
                return true;
            }
            false
        })?;
        Ok(found)
    }

    /// Find a free directory slot, growing cluster-backed directories when
    /// they run out. The fixed root region cannot grow.
    fn find_free_slot(&self, dir: DirLocation) -> Result<EntryLoc, FsError> {
        let mut slot = None;
        self.walk_dir(dir, |loc, raw| {
            if raw[0] == ENTRY_END || raw[0] == ENTRY_DELETED {
                slot = Some(loc);
                return true;
            }
            false
        })?;
        if let Some(loc) = slot {
            return Ok(loc);
        }

        match dir {
            DirLocation::Root => Err(FsError::NoSpace),
            DirLocation::Cluster(first) => {
                // Append a fresh cluster to the directory chain.
                let mut tail = first;
                loop {
                    let next = self.fat_get(tail)?;
                    if !(2..FAT_EOC_MIN).contains(&next) {
                        break;
                    }
                    tail = next;
                }
                let fresh = self.alloc_cluster()?;
                self.zero_cluster(fresh)?;
                self.fat_set(tail, fresh)?;
                Ok(EntryLoc {
                    lba: self.cluster_lba(fresh),
                    offset: 0,
                })
            }
        }
    }

    /// Rewrite one directory entry in place.
    fn write_entry(&self, loc: EntryLoc, raw: &[u8; DIR_ENTRY_SIZE]) -> Result<(), FsError> {
        let mut sector = vec![0u8; self.bpb.bytes_per_sector as usize];
        self.read_sector(loc.lba, &mut sector)?;
        sector[loc.offset..loc.offset + DIR_ENTRY_SIZE].copy_from_slice(raw);
        self.write_sector(loc.lba, &sector)
    }
}

/// Decoded 32-byte directory entry.
#[derive(Debug, Clone, Copy)]
struct RawEntry {
    name83: [u8; 11],
    attr: u8,
    first_cluster: u16,
    size: u32,
}

impl RawEntry {
    fn decode(raw: &[u8]) -> Self {
        let mut name83 = [0u8; 11];
        name83.copy_from_slice(&raw[..11]);
        Self {
            name83,
            attr: raw[11],
            first_cluster: u16::from_le_bytes([raw[26], raw[27]]),
            size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[..11].copy_from_slice(&self.name83);
        raw[11] = self.attr;
        raw[26..28].copy_from_slice(&self.first_cluster.to_le_bytes());
        raw[28..32].copy_from_slice(&self.size.to_le_bytes());
        raw
    }

    fn is_directory(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

struct NodeState {
    first_cluster: u16,
    size: u32,
}

struct Fat16Node {
    vol: Arc<Volume>,
    kind: NodeKind,
    /// None for the root directory, which has no entry of its own.
    entry: Option<EntryLoc>,
    name83: [u8; 11],
    state: RwLock<NodeState>,
}

impl Fat16Node {
    fn root(vol: Arc<Volume>) -> Self {
        Self {
            vol,
            kind: NodeKind::Directory,
            entry: None,
            name83: [b' '; 11],
            state: RwLock::new(NodeState {
                first_cluster: 0,
                size: 0,
            }),
        }
    }

    fn from_entry(vol: Arc<Volume>, loc: EntryLoc, raw: RawEntry) -> Self {
        Self {
            vol,
            kind: if raw.is_directory() {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            entry: Some(loc),
            name83: raw.name83,
            state: RwLock::new(NodeState {
                first_cluster: raw.first_cluster,
                size: raw.size,
            }),
        }
    }

    fn dir_location(&self) -> DirLocation {
        match self.entry {
            None => DirLocation::Root,
            Some(_) => DirLocation::Cluster(self.state.read().first_cluster),
        }
    }

    /// Push size/first-cluster back into the on-disk directory entry.
    fn flush_entry(&self) -> Result<(), FsError> {
        let Some(loc) = self.entry else {
            return Ok(()); // root has no entry
        };
        let state = self.state.read();
        let raw = RawEntry {
            name83: self.name83,
            attr: if self.kind == NodeKind::Directory {
                ATTR_DIRECTORY
            } else {
                0
            },
            first_cluster: state.first_cluster,
            size: if self.kind == NodeKind::Directory {
                0
            } else {
                state.size
            },
        };
        self.vol.write_entry(loc, &raw.encode())
    }

    /// Walk the chain to the cluster holding byte `pos`, extending the
    /// chain with `extend` set. Returns the cluster number.
    fn cluster_for(&self, pos: usize, extend: bool) -> Result<u16, FsError> {
        let bpc = self.vol.bpb.cluster_bytes();
        let target_index = pos / bpc;

        let mut state = self.state.write();
        if state.first_cluster < 2 {
            if !extend {
                return Err(FsError::Io);
            }
            state.first_cluster = self.vol.alloc_cluster()?;
        }

        let mut cluster = state.first_cluster;
        for _ in 0..target_index {
            let next = self.vol.fat_get(cluster)?;
            cluster = if (2..FAT_EOC_MIN).contains(&next) {
                next
            } else if extend {
                let fresh = self.vol.alloc_cluster()?;
                self.vol.fat_set(cluster, fresh)?;
                fresh
            } else {
                return Err(FsError::Io);
            };
        }
        Ok(cluster)
    }
}

impl VfsNode for Fat16Node {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.kind != NodeKind::File {
            return Err(FsError::IsADirectory);
        }
        let size = self.state.read().size as usize;
        if offset >= size {
            return Ok(0);
        }
        let to_read = buf.len().min(size - offset);

        let bps = self.vol.bpb.bytes_per_sector as usize;
        let bpc = self.vol.bpb.cluster_bytes();
        let mut sector = vec![0u8; bps];

        let mut done = 0;
        while done < to_read {
            let pos = offset + done;
            // Re-walks the chain per step; fine at floppy scale.
            let cluster = self.cluster_for(pos, false)?;
            let within_cluster = pos % bpc;
            let lba = self.vol.cluster_lba(cluster) + (within_cluster / bps) as u64;
            let within_sector = within_cluster % bps;
            let chunk = (bps - within_sector).min(to_read - done);
            self.vol.read_sector(lba, &mut sector)?;
            buf[done..done + chunk].copy_from_slice(&sector[within_sector..within_sector + chunk]);
            done += chunk;
        }
        Ok(to_read)
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<usize, FsError> {
        if self.kind != NodeKind::File {
            return Err(FsError::IsADirectory);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let _guard = self.vol.mutate.lock();

        let bps = self.vol.bpb.bytes_per_sector as usize;
        let bpc = self.vol.bpb.cluster_bytes();
        let mut sector = vec![0u8; bps];

        let mut done = 0;
        while done < data.len() {
            let pos = offset + done;
            let cluster = self.cluster_for(pos, true)?;
            let within_cluster = pos % bpc;
            let lba = self.vol.cluster_lba(cluster) + (within_cluster / bps) as u64;
            let within_sector = within_cluster % bps;
            let chunk = (bps - within_sector).min(data.len() - done);

            if chunk == bps {
                self.vol.write_sector(lba, &data[done..done + chunk])?;
            } else {
                self.vol.read_sector(lba, &mut sector)?;
                sector[within_sector..within_sector + chunk]
                    .copy_from_slice(&data[done..done + chunk]);
                self.vol.write_sector(lba, &sector)?;
            }
            done += chunk;
        }

        {
            let mut state = self.state.write();
            state.size = state.size.max((offset + data.len()) as u32);
        }
        self.flush_entry()?;
        Ok(data.len())
    }

    fn metadata(&self) -> Result<Metadata, FsError> {
        Ok(Metadata {
            kind: self.kind,
            size: self.state.read().size as usize,
            mode: if self.kind == NodeKind::Directory {
                0o755
            } else {
                0o644
            },
        })
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        if self.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let mut entries = Vec::new();
        self.vol.walk_dir(self.dir_location(), |_loc, raw| {
            if raw[0] == ENTRY_END {
                return true;
            }
            if raw[0] == ENTRY_DELETED || raw[11] == ATTR_LFN || raw[11] & ATTR_VOLUME_ID != 0 {
                return false;
            }
            let entry = RawEntry::decode(raw);
            let name = decode_83(&entry.name83);
            if name != "." && name != ".." {
                entries.push(DirEntry {
                    name,
                    kind: if entry.is_directory() {
                        NodeKind::Directory
                    } else {
                        NodeKind::File
                    },
                    size: entry.size as usize,
                });
            }
            false
        })?;
        Ok(entries)
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        if self.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let name83 = encode_83(name)?;
        match self.vol.find_entry(self.dir_location(), &name83)? {
            Some((loc, raw)) => Ok(Arc::new(Fat16Node::from_entry(self.vol.clone(), loc, raw))),
            None => Err(FsError::NotFound),
        }
    }

    fn create(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        if self.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let name83 = encode_83(name)?;
        let _guard = self.vol.mutate.lock();

        if self.vol.find_entry(self.dir_location(), &name83)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let loc = self.vol.find_free_slot(self.dir_location())?;
        let raw = RawEntry {
            name83,
            attr: 0,
            first_cluster: 0,
            size: 0,
        };
        self.vol.write_entry(loc, &raw.encode())?;
        Ok(Arc::new(Fat16Node::from_entry(self.vol.clone(), loc, raw)))
    }

    fn mkdir(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        if self.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let name83 = encode_83(name)?;
        let _guard = self.vol.mutate.lock();

        if self.vol.find_entry(self.dir_location(), &name83)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let cluster = self.vol.alloc_cluster()?;
        self.vol.zero_cluster(cluster)?;

        // Seed "." and ".." so other FAT implementations accept the tree.
        let parent_cluster = match self.dir_location() {
            DirLocation::Root => 0,
            DirLocation::Cluster(c) => c,
        };
        let dot = RawEntry {
            name83: *b".          ",
            attr: ATTR_DIRECTORY,
            first_cluster: cluster,
            size: 0,
        };
        let dotdot = RawEntry {
            name83: *b"..         ",
            attr: ATTR_DIRECTORY,
            first_cluster: parent_cluster,
            size: 0,
        };
        let lba = self.vol.cluster_lba(cluster);
        let mut sector = vec![0u8; self.vol.bpb.bytes_per_sector as usize];
        self.vol.read_sector(lba, &mut sector)?;
        sector[..DIR_ENTRY_SIZE].copy_from_slice(&dot.encode());
        sector[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(&dotdot.encode());
        self.vol.write_sector(lba, &sector)?;

        let loc = self.vol.find_free_slot(self.dir_location())?;
        let raw = RawEntry {
            name83,
            attr: ATTR_DIRECTORY,
            first_cluster: cluster,
            size: 0,
        };
        self.vol.write_entry(loc, &raw.encode())?;
        Ok(Arc::new(Fat16Node::from_entry(self.vol.clone(), loc, raw)))
    }

    fn unlink(&self, name: &str) -> Result<(), FsError> {
        if self.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let name83 = encode_83(name)?;
        let _guard = self.vol.mutate.lock();

        let (loc, raw) = self
            .vol
            .find_entry(self.dir_location(), &name83)?
            .ok_or(FsError::NotFound)?;

        if raw.is_directory() {
            // Only "." and ".." may remain.
            let mut occupied = false;
            self.vol
                .walk_dir(DirLocation::Cluster(raw.first_cluster), |_loc, e| {
                    if e[0] == ENTRY_END {
                        return true;
                    }
                    if e[0] == ENTRY_DELETED || e[11] == ATTR_LFN {
                        return false;
                    }
                    let name = decode_83(&e[..11]);
                    if name != "." && name != ".." {
                        occupied = true;
                        return true;
                    }
                    false
                })?;
            if occupied {
                return Err(FsError::DirectoryNotEmpty);
            }
        }

        if raw.first_cluster >= 2 {
            self.vol.free_chain(raw.first_cluster)?;
        }

        let mut dead = raw.encode();
        dead[0] = ENTRY_DELETED;
        self.vol.write_entry(loc, &dead)
    }

    fn truncate(&self, size: usize) -> Result<(), FsError> {
        if self.kind != NodeKind::File {
            return Err(FsError::NotAFile);
        }
        let _guard = self.vol.mutate.lock();
        let old_size = self.state.read().size as usize;

        if size == 0 {
            let first = self.state.read().first_cluster;
            if first >= 2 {
                self.vol.free_chain(first)?;
            }
            let mut state = self.state.write();
            state.first_cluster = 0;
            state.size = 0;
        } else if size < old_size {
            // Cut the chain after the last needed cluster.
            let last = self.cluster_for(size - 1, false)?;
            let next = self.vol.fat_get(last)?;
            self.vol.fat_set(last, FAT_EOC)?;
            if (2..FAT_EOC_MIN).contains(&next) {
                self.vol.free_chain(next)?;
            }
            self.state.write().size = size as u32;
        } else if size > old_size {
            // Zero-fill the growth a sector at a time.
            let zeroes = vec![0u8; size - old_size];
            drop(_guard); // write() takes the lock itself
            self.write(old_size, &zeroes)?;
            self.state.write().size = size as u32;
            return self.flush_entry();
        }
        self.flush_entry()
    }
}

// ---------------------------------------------------------------------------
// Filesystem + mount
// ---------------------------------------------------------------------------

/// A mounted FAT16 volume.
pub struct Fat16Fs {
    vol: Arc<Volume>,
}

impl Fat16Fs {
    /// Mount a volume whose BPB sits at `start_lba`.
    pub fn mount(cache: SharedCache, device_id: usize, start_lba: u64) -> Result<Self, FsError> {
        let mut sector = [0u8; 512];
        cache
            .lock()
            .read(device_id, start_lba, &mut sector)
            .map_err(|_| FsError::Io)?;
        let bpb = Bpb::parse(&sector)?;

        let fat_start = start_lba + bpb.reserved_sectors as u64;
        let root_start = fat_start + bpb.num_fats as u64 * bpb.fat_size as u64;
        let data_start = root_start + bpb.root_dir_sectors() as u64;
        // A BPB claiming fewer sectors than its own metadata is garbage;
        // treat it as a zero-cluster volume rather than underflowing.
        let data_sectors = (bpb.total_sectors as u64).saturating_sub(data_start - start_lba);
        let cluster_count = (data_sectors / bpb.sectors_per_cluster as u64) as u32;

        // FAT16 proper lives between 4085 and 65524 clusters; we accept
        // smaller volumes (mkfs-produced test images) but not FAT32 sizes.
        if cluster_count >= 65525 {
            return Err(FsError::Io);
        }

        Ok(Self {
            vol: Arc::new(Volume {
                cache,
                device_id,
                bpb,
                fat_start,
                root_start,
                data_start,
                cluster_count,
                mutate: Mutex::new(()),
            }),
        })
    }

    /// Mount a bare volume at LBA 0, or fall back to the first FAT-bearing
    /// MBR partition (types 0x04/0x06/0x0E).
    pub fn mount_auto(cache: SharedCache, device_id: usize) -> Result<Self, FsError> {
        if let Ok(fs) = Self::mount(cache.clone(), device_id, 0) {
            return Ok(fs);
        }

        let mut mbr = [0u8; 512];
        cache
            .lock()
            .read(device_id, 0, &mut mbr)
            .map_err(|_| FsError::Io)?;
        if mbr[510] != 0x55 || mbr[511] != 0xAA {
            return Err(FsError::Io);
        }
        for entry in 0..4 {
            let off = 446 + entry * 16;
            let part_type = mbr[off + 4];
            let start =
                u32::from_le_bytes([mbr[off + 8], mbr[off + 9], mbr[off + 10], mbr[off + 11]]);
            if matches!(part_type, 0x04 | 0x06 | 0x0E) && start != 0 {
                return Self::mount(cache, device_id, start as u64);
            }
        }
        Err(FsError::Io)
    }
}

impl Filesystem for Fat16Fs {
    fn root(&self) -> Arc<dyn VfsNode> {
        Arc::new(Fat16Node::root(self.vol.clone()))
    }

    fn name(&self) -> &str {
        "fat16"
    }

    fn sync(&self) -> Result<(), FsError> {
        self.vol.cache.lock().sync().map_err(|_| FsError::Io)
    }
}

// ---------------------------------------------------------------------------
// mkfs
// ---------------------------------------------------------------------------

/// Format a blank FAT16 volume starting at LBA 0 of `device_id`.
///
/// Geometry: 512-byte sectors, fixed cluster size, two FATs, 512 root
/// entries. Used by tests and the ramdisk boot path.
pub fn mkfs(
    cache: &SharedCache,
    device_id: usize,
    total_sectors: u32,
    sectors_per_cluster: u8,
) -> Result<(), FsError> {
    const BPS: usize = 512;
    const ROOT_ENTRIES: u16 = 512;
    const RESERVED: u16 = 1;
    const NUM_FATS: u8 = 2;

    let root_sectors = (ROOT_ENTRIES as u32 * 32).div_ceil(BPS as u32);
    // Conservative FAT sizing: assume every remaining sector becomes a
    // cluster.
    let est_clusters = total_sectors / sectors_per_cluster as u32 + 2;
    let fat_size = (est_clusters * 2).div_ceil(BPS as u32) as u16;

    let mut boot = [0u8; BPS];
    boot[0] = 0xEB; // jmp short
    boot[1] = 0x3C;
    boot[2] = 0x90;
    boot[3..11].copy_from_slice(b"CUPIDOS ");
    boot[11..13].copy_from_slice(&(BPS as u16).to_le_bytes());
    boot[13] = sectors_per_cluster;
    boot[14..16].copy_from_slice(&RESERVED.to_le_bytes());
    boot[16] = NUM_FATS;
    boot[17..19].copy_from_slice(&ROOT_ENTRIES.to_le_bytes());
    if total_sectors <= u16::MAX as u32 {
        boot[19..21].copy_from_slice(&(total_sectors as u16).to_le_bytes());
    } else {
        boot[32..36].copy_from_slice(&total_sectors.to_le_bytes());
    }
    boot[21] = 0xF8; // media: fixed disk
    boot[22..24].copy_from_slice(&fat_size.to_le_bytes());
    boot[54..62].copy_from_slice(b"FAT16   ");
    boot[510] = 0x55;
    boot[511] = 0xAA;

    let mut guard = cache.lock();
    guard.write(device_id, 0, &boot).map_err(|_| FsError::Io)?;

    // Zero both FATs and the root directory.
    let zeroes = [0u8; BPS];
    let fat_start = RESERVED as u64;
    let total_meta = NUM_FATS as u64 * fat_size as u64 + root_sectors as u64;
    for s in 0..total_meta {
        guard
            .write(device_id, fat_start + s, &zeroes)
            .map_err(|_| FsError::Io)?;
    }

    // FAT[0] = media descriptor filler, FAT[1] = end-of-chain.
    let mut fat0 = [0u8; BPS];
    fat0[0] = 0xF8;
    fat0[1] = 0xFF;
    fat0[2] = 0xFF;
    fat0[3] = 0xFF;
    for fat in 0..NUM_FATS as u64 {
        guard
            .write(device_id, fat_start + fat * fat_size as u64, &fat0)
            .map_err(|_| FsError::Io)?;
    }
    guard.sync().map_err(|_| FsError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;
    use crate::fs::blockcache::BlockCache;
    use crate::fs::blockdev::RamDisk;

    fn fresh_volume(sectors: u64) -> (SharedCache, usize) {
        let mut cache = BlockCache::new(16);
        let id = cache.add_device(Box::new(RamDisk::new("rd0", 512, sectors)));
        let cache = Arc::new(Mutex::new(cache));
        mkfs(&cache, id, sectors as u32, 4).unwrap();
        (cache, id)
    }

    #[test]
    fn name_encoding_round_trips() {
        assert_eq!(encode_83("hello.txt").unwrap(), *b"HELLO   TXT");
        assert_eq!(encode_83("A.B").unwrap(), *b"A       B  ");
        assert_eq!(decode_83(b"HELLO   TXT"), "HELLO.TXT");
        assert_eq!(decode_83(b"NOEXT      "), "NOEXT");
        assert!(encode_83("toolongname.txt").is_err());
        assert!(encode_83("bad/name").is_err());
        assert!(encode_83("four.byte").is_err());
    }

    #[test]
    fn mkfs_then_mount_sees_empty_root() {
        let (cache, id) = fresh_volume(2048);
        let fs = Fat16Fs::mount(cache, id, 0).unwrap();
        let root = fs.root();
        assert_eq!(root.kind(), NodeKind::Directory);
        assert!(root.readdir().unwrap().is_empty());
    }

    #[test]
    fn create_write_read_round_trip() {
        let (cache, id) = fresh_volume(2048);
        let fs = Fat16Fs::mount(cache, id, 0).unwrap();
        let root = fs.root();

        let file = root.create("hello.txt").unwrap();
        file.write(0, b"hello fat16").unwrap();

        let found = root.lookup("hello.txt").unwrap();
        assert_eq!(found.metadata().unwrap().size, 11);
        let mut buf = [0u8; 32];
        let n = found.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello fat16");
    }

    #[test]
    fn lookup_is_case_insensitive_via_83_uppercasing() {
        let (cache, id) = fresh_volume(2048);
        let fs = Fat16Fs::mount(cache, id, 0).unwrap();
        let root = fs.root();
        root.create("Mixed.Txt").unwrap();
        assert!(root.lookup("mixed.txt").is_ok());
        assert!(root.lookup("MIXED.TXT").is_ok());
    }

    #[test]
    fn multi_cluster_file_follows_the_chain() {
        let (cache, id) = fresh_volume(4096);
        let fs = Fat16Fs::mount(cache, id, 0).unwrap();
        let root = fs.root();

        // 4 sectors/cluster -> 2048-byte clusters; 10_000 bytes spans 5.
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let file = root.create("big.bin").unwrap();
        file.write(0, &payload).unwrap();

        let reopened = root.lookup("big.bin").unwrap();
        assert_eq!(reopened.metadata().unwrap().size, 10_000);
        let mut buf = vec![0u8; 10_000];
        assert_eq!(reopened.read(0, &mut buf).unwrap(), 10_000);
        assert_eq!(buf, payload);
    }

    #[test]
    fn unlink_frees_clusters_for_reuse() {
        let (cache, id) = fresh_volume(1024);
        let fs = Fat16Fs::mount(cache, id, 0).unwrap();
        let root = fs.root();

        let file = root.create("a.bin").unwrap();
        file.write(0, &[1u8; 8192]).unwrap();
        root.unlink("a.bin").unwrap();
        assert!(root.lookup("a.bin").is_err());

        // The freed chain must be reusable by the next file.
        let file2 = root.create("b.bin").unwrap();
        file2.write(0, &[2u8; 8192]).unwrap();
        let mut buf = [0u8; 16];
        root.lookup("b.bin").unwrap().read(0, &mut buf).unwrap();
        assert_eq!(buf, [2u8; 16]);
    }

    #[test]
    fn subdirectories_nest() {
        let (cache, id) = fresh_volume(2048);
        let fs = Fat16Fs::mount(cache, id, 0).unwrap();
        let root = fs.root();

        let sub = root.mkdir("docs").unwrap();
        let file = sub.create("note.txt").unwrap();
        file.write(0, b"nested").unwrap();

        let again = root
            .lookup("docs")
            .unwrap()
            .lookup("note.txt")
            .unwrap();
        let mut buf = [0u8; 6];
        again.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"nested");

        // readdir hides "." and "..".
        let entries = root.lookup("docs").unwrap().readdir().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "NOTE.TXT");
    }

    #[test]
    fn nonempty_directory_cannot_be_unlinked() {
        let (cache, id) = fresh_volume(2048);
        let fs = Fat16Fs::mount(cache, id, 0).unwrap();
        let root = fs.root();
        let sub = root.mkdir("full").unwrap();
        sub.create("x").unwrap();
        assert_eq!(root.unlink("full").unwrap_err(), FsError::DirectoryNotEmpty);
        sub.unlink("x").unwrap();
        root.unlink("full").unwrap();
    }

    #[test]
    fn truncate_to_zero_releases_the_chain() {
        let (cache, id) = fresh_volume(2048);
        let fs = Fat16Fs::mount(cache, id, 0).unwrap();
        let root = fs.root();
        let file = root.create("t.bin").unwrap();
        file.write(0, &[9u8; 4096]).unwrap();
        file.truncate(0).unwrap();
        assert_eq!(file.metadata().unwrap().size, 0);
        let reopened = root.lookup("t.bin").unwrap();
        assert_eq!(reopened.metadata().unwrap().size, 0);
    }

    #[test]
    fn persistence_across_unmount_remount() {
        let (cache, id) = fresh_volume(4096);
        {
            let fs = Fat16Fs::mount(cache.clone(), id, 0).unwrap();
            let root = fs.root();
            let file = root.create("keep.dat").unwrap();
            file.write(0, &[b'A'; 10_000]).unwrap();
            fs.sync().unwrap();
        } // fs dropped: "unmount"

        let fs = Fat16Fs::mount(cache, id, 0).unwrap();
        let file = fs.root().lookup("keep.dat").unwrap();
        assert_eq!(file.metadata().unwrap().size, 10_000);
        let mut buf = vec![0u8; 10_000];
        assert_eq!(file.read(0, &mut buf).unwrap(), 10_000);
        assert!(buf.iter().all(|&b| b == b'A'));
    }

    #[test]
    fn mount_auto_finds_mbr_partition() {
        // Build a disk with an MBR pointing at a FAT16 partition at LBA 64.
        let mut cache = BlockCache::new(16);
        let id = cache.add_device(Box::new(RamDisk::new("hd0", 512, 4096)));
        let cache = Arc::new(Mutex::new(cache));

        let mut mbr = [0u8; 512];
        mbr[446 + 4] = 0x06; // FAT16 partition type
        mbr[446 + 8..446 + 12].copy_from_slice(&64u32.to_le_bytes());
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        cache.lock().write(id, 0, &mbr).unwrap();

        // Format the partition area by formatting a scratch volume and
        // copying its metadata sectors up by 64.
        let mut scratch_cache = BlockCache::new(16);
        let sid = scratch_cache.add_device(Box::new(RamDisk::new("scratch", 512, 2048)));
        let scratch = Arc::new(Mutex::new(scratch_cache));
        mkfs(&scratch, sid, 2048, 4).unwrap();
        let mut sector = [0u8; 512];
        for lba in 0..64u64 {
            scratch.lock().read(sid, lba, &mut sector).unwrap();
            cache.lock().write(id, 64 + lba, &sector).unwrap();
        }

        let fs = Fat16Fs::mount_auto(cache, id).unwrap();
        let root = fs.root();
        root.create("part.txt").unwrap();
        assert!(root.lookup("part.txt").is_ok());
    }
}
