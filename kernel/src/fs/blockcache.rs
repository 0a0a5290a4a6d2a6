//! Write-back block cache.
//!
//! Fixed number of sector-sized slots keyed by `(device, lba)`. Eviction is
//! least-recently-used by a logical access counter; dirty victims are
//! written back before their slot is reused. `sync` flushes everything.
//! Callers hold the cache behind one lock, so a read immediately after a
//! write always observes the written bytes, evictions included.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::blockdev::BlockDevice;
use crate::error::{KernelError, KernelResult};

/// Default slot count used by the kernel's cache instance.
pub const DEFAULT_CAPACITY: usize = 64;

/// Shared handle the FAT16 backend holds.
pub type SharedCache = Arc<Mutex<BlockCache>>;

struct CacheSlot {
    device_id: usize,
    lba: u64,
    data: Vec<u8>,
    dirty: bool,
    last_used: u64,
}

/// Statistics for the shell's `cache` diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writebacks: u64,
}

pub struct BlockCache {
    devices: Vec<Box<dyn BlockDevice>>,
    slots: Vec<CacheSlot>,
    capacity: usize,
    /// Logical access clock driving LRU.
    clock: u64,
    stats: CacheStats,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            devices: Vec::new(),
            slots: Vec::new(),
            capacity: capacity.max(1),
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    /// Register a device; the returned id keys every later access.
    pub fn add_device(&mut self, device: Box<dyn BlockDevice>) -> usize {
        self.devices.push(device);
        self.devices.len() - 1
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn sector_size(&self, device_id: usize) -> KernelResult<usize> {
        self.device(device_id).map(|d| d.sector_size())
    }

    pub fn sector_count(&self, device_id: usize) -> KernelResult<u64> {
        self.device(device_id).map(|d| d.sector_count())
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn device(&self, device_id: usize) -> KernelResult<&dyn BlockDevice> {
        self.devices
            .get(device_id)
            .map(|d| d.as_ref())
            .ok_or(KernelError::InvalidArgument {
                name: "device_id",
                value: "unregistered block device",
            })
    }

    fn touch(&mut self, slot: usize) {
        self.clock += 1;
        self.slots[slot].last_used = self.clock;
    }

    fn find(&self, device_id: usize, lba: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.device_id == device_id && s.lba == lba)
    }

    /// Return the slot index for `(device_id, lba)`, filling it from the
    /// device on a miss and evicting the LRU victim when the cache is full.
    fn slot_for(&mut self, device_id: usize, lba: u64, fill: bool) -> KernelResult<usize> {
        if let Some(idx) = self.find(device_id, lba) {
            self.stats.hits += 1;
            self.touch(idx);
            return Ok(idx);
        }
        self.stats.misses += 1;

        let sector_size = self.sector_size(device_id)?;
        let idx = if self.slots.len() < self.capacity {
            self.slots.push(CacheSlot {
                device_id,
                lba,
                data: vec![0u8; sector_size],
                dirty: false,
                last_used: 0,
            });
            self.slots.len() - 1
        } else {
            let victim = self
                .slots
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(i, _)| i)
                .expect("cache capacity is at least 1");
            self.writeback(victim)?;
            self.slots[victim].device_id = device_id;
            self.slots[victim].lba = lba;
            self.slots[victim].dirty = false;
            if self.slots[victim].data.len() != sector_size {
                self.slots[victim].data = vec![0u8; sector_size];
            }
            victim
        };

        if fill {
            let device = self.devices.get_mut(device_id).ok_or(
                KernelError::InvalidArgument {
                    name: "device_id",
                    value: "unregistered block device",
                },
            )?;
            device.read_sectors(lba, &mut self.slots[idx].data)?;
        } else {
            self.slots[idx].data.fill(0);
        }
        self.touch(idx);
        Ok(idx)
    }

    fn writeback(&mut self, slot: usize) -> KernelResult<()> {
        if !self.slots[slot].dirty {
            return Ok(());
        }
        let device_id = self.slots[slot].device_id;
        let lba = self.slots[slot].lba;
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or(KernelError::InvalidArgument {
                name: "device_id",
                value: "unregistered block device",
            })?;
        device.write_sectors(lba, &self.slots[slot].data)?;
        self.slots[slot].dirty = false;
        self.stats.writebacks += 1;
        Ok(())
    }

    /// Read one sector through the cache.
    pub fn read(&mut self, device_id: usize, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
        let idx = self.slot_for(device_id, lba, true)?;
        let sector = &self.slots[idx].data;
        if buf.len() != sector.len() {
            return Err(KernelError::InvalidArgument {
                name: "buf",
                value: "buffer is not one sector",
            });
        }
        buf.copy_from_slice(sector);
        Ok(())
    }

    /// Write one sector through the cache (write-back; the device is
    /// touched on eviction or sync).
    pub fn write(&mut self, device_id: usize, lba: u64, buf: &[u8]) -> KernelResult<()> {
        let sector_size = self.sector_size(device_id)?;
        if buf.len() != sector_size {
            return Err(KernelError::InvalidArgument {
                name: "buf",
                value: "buffer is not one sector",
            });
        }
        // A full-sector overwrite does not need the old contents.
        let idx = self.slot_for(device_id, lba, false)?;
        self.slots[idx].data.copy_from_slice(buf);
        self.slots[idx].dirty = true;
        Ok(())
    }

    /// Number of cached sectors currently resident.
    pub fn resident(&self) -> usize {
        self.slots.len()
    }

    /// Number of dirty sectors awaiting writeback.
    pub fn dirty_count(&self) -> usize {
        self.slots.iter().filter(|s| s.dirty).count()
    }

    /// Write every dirty slot back and flush the devices.
    pub fn sync(&mut self) -> KernelResult<()> {
        for slot in 0..self.slots.len() {
            self.writeback(slot)?;
        }
        for device in self.devices.iter_mut() {
            device.flush()?;
        }
        Ok(())
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::blockdev::RamDisk;

    fn cache_with_disk(capacity: usize, sectors: u64) -> (BlockCache, usize) {
        let mut cache = BlockCache::new(capacity);
        let id = cache.add_device(Box::new(RamDisk::new("rd0", 512, sectors)));
        (cache, id)
    }

    #[test]
    fn read_after_write_returns_written_bytes() {
        let (mut cache, dev) = cache_with_disk(4, 32);
        let data = [7u8; 512];
        cache.write(dev, 5, &data).unwrap();

        let mut out = [0u8; 512];
        cache.read(dev, 5, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn read_your_write_survives_eviction_pressure() {
        let (mut cache, dev) = cache_with_disk(2, 64);
        let data = [0xA5u8; 512];
        cache.write(dev, 0, &data).unwrap();

        // Push the written sector out through a tiny cache.
        let mut scratch = [0u8; 512];
        for lba in 10..20 {
            cache.read(dev, lba, &mut scratch).unwrap();
        }

        let mut out = [0u8; 512];
        cache.read(dev, 0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn capacity_plus_one_distinct_reads_evict_exactly_one() {
        let capacity = 4;
        let (mut cache, dev) = cache_with_disk(capacity, 64);
        let mut buf = [0u8; 512];
        for lba in 0..capacity as u64 + 1 {
            cache.read(dev, lba, &mut buf).unwrap();
        }
        assert_eq!(cache.resident(), capacity);
        // LBA 0 was the least recently used; it is the one gone.
        let misses_before = cache.stats().misses;
        cache.read(dev, 1, &mut buf).unwrap();
        assert_eq!(cache.stats().misses, misses_before);
        cache.read(dev, 0, &mut buf).unwrap();
        assert_eq!(cache.stats().misses, misses_before + 1);
    }

    #[test]
    fn sync_pushes_dirty_sectors_to_device() {
        let mut cache = BlockCache::new(8);
        let dev = cache.add_device(Box::new(RamDisk::new("rd0", 512, 16)));
        let data = [3u8; 512];
        cache.write(dev, 2, &data).unwrap();
        assert_eq!(cache.dirty_count(), 1);
        cache.sync().unwrap();
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn unknown_device_is_rejected() {
        let mut cache = BlockCache::new(4);
        let mut buf = [0u8; 512];
        assert!(cache.read(9, 0, &mut buf).is_err());
    }

    #[test]
    fn wrong_buffer_size_is_rejected() {
        let (mut cache, dev) = cache_with_disk(4, 16);
        let mut small = [0u8; 256];
        assert!(cache.read(dev, 0, &mut small).is_err());
        assert!(cache.write(dev, 0, &small).is_err());
    }
}
