//! ATA PIO block driver.
//!
//! LBA28 polled PIO on the legacy primary/secondary channels — no DMA, no
//! IRQ completion. Slow but dependency-free, and entirely sufficient for a
//! FAT16 volume behind the block cache.

#![cfg(all(target_arch = "x86", target_os = "none"))]

use alloc::string::String;

use crate::arch::x86::port::{inb, inw, outb, outw};
use crate::error::{KernelError, KernelResult};
use crate::fs::blockdev::BlockDevice;

/// Sector size every ATA transfer uses.
pub const SECTOR_SIZE: usize = 512;

const STATUS_BSY: u8 = 0x80;
const STATUS_DRQ: u8 = 0x08;
const STATUS_ERR: u8 = 0x01;
const STATUS_DF: u8 = 0x20;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;
const CMD_IDENTIFY: u8 = 0xEC;

/// One drive on a legacy ATA channel.
pub struct AtaDrive {
    name: String,
    io_base: u16,
    ctrl_base: u16,
    slave: bool,
    sectors: u32,
}

impl AtaDrive {
    /// Probe the primary-master position. Returns `None` when the bus
    /// floats or IDENTIFY fails.
    pub fn probe_primary() -> Option<AtaDrive> {
        Self::probe(0x1F0, 0x3F6, false, "hda")
    }

    /// Probe the primary-slave position (the FAT16 data disk in the default
    /// QEMU setup).
    pub fn probe_primary_slave() -> Option<AtaDrive> {
        Self::probe(0x1F0, 0x3F6, true, "hdb")
    }

    fn probe(io_base: u16, ctrl_base: u16, slave: bool, name: &str) -> Option<AtaDrive> {
        let mut drive = AtaDrive {
            name: String::from(name),
            io_base,
            ctrl_base,
            slave,
            sectors: 0,
        };

        // SAFETY: status read on the channel's fixed port.
        if unsafe { inb(io_base + 7) } == 0xFF {
            return None; // floating bus, nothing attached
        }

        drive.select(0);
        // SAFETY: IDENTIFY protocol: zero the sector registers and issue the
        // command.
        unsafe {
            outb(io_base + 2, 0);
            outb(io_base + 3, 0);
            outb(io_base + 4, 0);
            outb(io_base + 5, 0);
            outb(io_base + 7, CMD_IDENTIFY);
        }
        // SAFETY: status read.
        if unsafe { inb(io_base + 7) } == 0 {
            return None; // no device
        }
        if drive.wait_data().is_err() {
            return None;
        }

        let mut identify = [0u16; 256];
        for word in identify.iter_mut() {
            // SAFETY: IDENTIFY data register reads, exactly 256 words.
            *word = unsafe { inw(io_base) };
        }
        drive.sectors = identify[60] as u32 | (identify[61] as u32) << 16;
        if drive.sectors == 0 {
            return None;
        }
        log::info!(
            "ata: {} present, {} sectors ({} MiB)",
            drive.name,
            drive.sectors,
            drive.sectors as u64 * SECTOR_SIZE as u64 / (1024 * 1024)
        );
        Some(drive)
    }

    fn select(&self, lba: u32) {
        let drive_bits = if self.slave { 0xF0 } else { 0xE0 };
        // SAFETY: drive/head register write followed by the mandated
        // settling reads of the alternate status register.
        unsafe {
            outb(
                self.io_base + 6,
                drive_bits | ((lba >> 24) & 0x0F) as u8,
            );
            for _ in 0..4 {
                inb(self.ctrl_base);
            }
        }
    }

    /// Wait until BSY clears and DRQ sets, surfacing device errors.
    fn wait_data(&self) -> KernelResult<()> {
        for _ in 0..1_000_000 {
            // SAFETY: status register read.
            let status = unsafe { inb(self.io_base + 7) };
            if status & (STATUS_ERR | STATUS_DF) != 0 {
                // SAFETY: error register read for the failure code.
                let err = unsafe { inb(self.io_base + 1) };
                return Err(KernelError::Hardware {
                    device: "ata",
                    code: err as u16,
                });
            }
            if status & STATUS_BSY == 0 && status & STATUS_DRQ != 0 {
                return Ok(());
            }
        }
        Err(KernelError::Hardware {
            device: "ata",
            code: 0xFFFF, // timeout
        })
    }

    fn setup_transfer(&self, lba: u32, count: u8, command: u8) {
        self.select(lba);
        // SAFETY: LBA28 register programming followed by the command write.
        unsafe {
            outb(self.io_base + 2, count);
            outb(self.io_base + 3, lba as u8);
            outb(self.io_base + 4, (lba >> 8) as u8);
            outb(self.io_base + 5, (lba >> 16) as u8);
            outb(self.io_base + 7, command);
        }
    }
}

impl BlockDevice for AtaDrive {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn sector_count(&self) -> u64 {
        self.sectors as u64
    }

    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
        let count = buf.len() / SECTOR_SIZE;
        if count == 0 || buf.len() % SECTOR_SIZE != 0 || lba + count as u64 > self.sectors as u64 {
            return Err(KernelError::InvalidArgument {
                name: "lba/buf",
                value: "unaligned or out-of-range transfer",
            });
        }

        for sector in 0..count {
            self.setup_transfer(lba as u32 + sector as u32, 1, CMD_READ_SECTORS);
            self.wait_data()?;
            let base = sector * SECTOR_SIZE;
            for i in 0..SECTOR_SIZE / 2 {
                // SAFETY: DRQ is set; the data register yields one word per
                // read, 256 per sector.
                let word = unsafe { inw(self.io_base) };
                buf[base + i * 2] = word as u8;
                buf[base + i * 2 + 1] = (word >> 8) as u8;
            }
        }
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> KernelResult<()> {
        let count = buf.len() / SECTOR_SIZE;
        if count == 0 || buf.len() % SECTOR_SIZE != 0 || lba + count as u64 > self.sectors as u64 {
            return Err(KernelError::InvalidArgument {
                name: "lba/buf",
                value: "unaligned or out-of-range transfer",
            });
        }

        for sector in 0..count {
            self.setup_transfer(lba as u32 + sector as u32, 1, CMD_WRITE_SECTORS);
            self.wait_data()?;
            let base = sector * SECTOR_SIZE;
            for i in 0..SECTOR_SIZE / 2 {
                let word = buf[base + i * 2] as u16 | (buf[base + i * 2 + 1] as u16) << 8;
                // SAFETY: DRQ is set; one word per write, 256 per sector.
                unsafe { outw(self.io_base, word) };
            }
        }
        self.flush()
    }

    fn flush(&mut self) -> KernelResult<()> {
        // SAFETY: cache-flush command; completion is BSY clearing.
        unsafe { outb(self.io_base + 7, CMD_CACHE_FLUSH) };
        for _ in 0..1_000_000 {
            // SAFETY: status read.
            if unsafe { inb(self.io_base + 7) } & STATUS_BSY == 0 {
                return Ok(());
            }
        }
        Err(KernelError::Hardware {
            device: "ata",
            code: 0xFFFE,
        })
    }
}
