//! FAT16 end-to-end persistence over the block cache.

use std::sync::Arc;

use cupid_kernel::fs::blockcache::{BlockCache, SharedCache};
use cupid_kernel::fs::blockdev::RamDisk;
use cupid_kernel::fs::fat16::{mkfs, Fat16Fs};
use cupid_kernel::fs::{self, Filesystem, OpenFlags, Vfs, VfsNode};
use cupid_kernel::fs::ramfs::RamFs;

fn formatted_volume(sectors: u64) -> (SharedCache, usize) {
    let mut cache = BlockCache::new(32);
    let id = cache.add_device(Box::new(RamDisk::new("hdb", 512, sectors)));
    let cache = Arc::new(spin::Mutex::new(cache));
    mkfs(&cache, id, sectors as u32, 4).unwrap();
    (cache, id)
}

#[test]
fn ten_thousand_bytes_survive_unmount_and_remount() {
    let (cache, id) = formatted_volume(4096);
    let payload = vec![b'A'; 10_000];

    {
        let fat = Fat16Fs::mount(cache.clone(), id, 0).unwrap();
        let file = fat.root().create("keep.dat").unwrap();
        let mut written = 0;
        while written < payload.len() {
            written += file.write(written, &payload[written..]).unwrap();
        }
        fat.sync().unwrap();
    }

    let fat = Fat16Fs::mount(cache, id, 0).unwrap();
    let file = fat.root().lookup("keep.dat").unwrap();
    assert_eq!(file.metadata().unwrap().size, 10_000);

    let mut back = vec![0u8; 10_000];
    let mut read = 0;
    while read < back.len() {
        let n = file.read(read, &mut back[read..]).unwrap();
        assert!(n > 0);
        read += n;
    }
    assert_eq!(back, payload);
}

#[test]
fn fat16_mounts_into_the_vfs_tree() {
    let (cache, id) = formatted_volume(2048);
    let fat = Fat16Fs::mount(cache, id, 0).unwrap();

    let mut vfs = Vfs::new();
    vfs.mount_root(Arc::new(RamFs::new())).unwrap();
    vfs.resolve("/").unwrap().mkdir("disk").unwrap();
    vfs.mount("/disk", Arc::new(fat)).unwrap();

    // Write through the VFS path, read back through the VFS path.
    fs::write_all(&vfs, "/disk/NOTE.TXT", b"persisted via vfs").unwrap();
    let data = fs::read_all(&vfs, "/disk/NOTE.TXT").unwrap();
    assert_eq!(data, b"persisted via vfs");

    // 8.3 names normalize case.
    let node = vfs.open("/disk/note.txt", OpenFlags::read_only()).unwrap();
    assert_eq!(node.metadata().unwrap().size, 17);

    // Subdirectories work through the full stack.
    vfs.mkdir("/disk/docs").unwrap();
    fs::write_all(&vfs, "/disk/docs/a.txt", b"nested").unwrap();
    assert_eq!(fs::read_all(&vfs, "/disk/docs/a.txt").unwrap(), b"nested");

    vfs.unlink("/disk/docs/a.txt").unwrap();
    assert!(fs::read_all(&vfs, "/disk/docs/a.txt").is_err());
}

#[test]
fn dirty_sectors_reach_the_disk_only_after_sync_or_eviction() {
    let (cache, id) = formatted_volume(1024);
    let fat = Fat16Fs::mount(cache.clone(), id, 0).unwrap();
    let file = fat.root().create("d.bin").unwrap();
    file.write(0, &[7u8; 512]).unwrap();

    let dirty_before = cache.lock().dirty_count();
    assert!(dirty_before > 0);
    fat.sync().unwrap();
    assert_eq!(cache.lock().dirty_count(), 0);
}

#[test]
fn growing_and_shrinking_updates_the_chain() {
    let (cache, id) = formatted_volume(2048);
    let fat = Fat16Fs::mount(cache, id, 0).unwrap();
    let root = fat.root();
    let file = root.create("grow.bin").unwrap();

    // Grow across several clusters.
    file.write(0, &[1u8; 6000]).unwrap();
    assert_eq!(file.metadata().unwrap().size, 6000);

    // Truncate to a single cluster.
    file.truncate(100).unwrap();
    assert_eq!(root.lookup("grow.bin").unwrap().metadata().unwrap().size, 100);

    // The freed clusters are allocatable again.
    let other = root.create("other.bin").unwrap();
    other.write(0, &[2u8; 6000]).unwrap();
    let mut buf = [0u8; 64];
    root.lookup("other.bin").unwrap().read(0, &mut buf).unwrap();
    assert_eq!(buf, [2u8; 64]);
}
