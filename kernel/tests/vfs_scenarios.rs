//! Cross-layer VFS and process scenarios.

use std::sync::Arc;

use cupid_kernel::arch::RegisterFrame;
use cupid_kernel::fs::{self, ramfs::RamFs, FdTable, NodeKind, OpenFlags, SeekFrom, Vfs, VfsNode};
use cupid_kernel::process::{self, ProcessState};

fn fresh_vfs() -> Vfs {
    let mut vfs = Vfs::new();
    vfs.mount_root(Arc::new(RamFs::new())).unwrap();
    vfs.resolve("/").unwrap().mkdir("tmp").unwrap();
    vfs
}

#[test]
fn write_then_read_through_descriptors() {
    let vfs = fresh_vfs();
    let mut fds = FdTable::new();

    let node = vfs.open("/tmp/a", OpenFlags::write_create()).unwrap();
    let fd = fds.insert(node, OpenFlags::write_create()).unwrap();
    fds.write(fd, b"hello\n").unwrap();
    fds.close(fd).unwrap();

    let node = vfs.open("/tmp/a", OpenFlags::read_only()).unwrap();
    let fd = fds.insert(node, OpenFlags::read_only()).unwrap();
    let mut buf = [0u8; 16];
    let n = fds.read(fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello\n");

    assert_eq!(vfs.stat("/tmp/a").unwrap().size, 6);
    assert_eq!(vfs.stat("/tmp/a").unwrap().kind, NodeKind::File);
}

#[test]
fn descriptor_offsets_stay_within_bounds() {
    let vfs = fresh_vfs();
    let mut fds = FdTable::new();
    let node = vfs.open("/tmp/b", OpenFlags::write_create()).unwrap();
    node.write(0, b"0123456789").unwrap();

    let fd = fds.insert(node, OpenFlags::read_write()).unwrap();
    assert_eq!(fds.seek(fd, SeekFrom::End(0)).unwrap(), 10);
    assert!(fds.seek(fd, SeekFrom::Start(11)).is_err());
    assert!(fds.seek(fd, SeekFrom::Current(-11)).is_err());
    assert_eq!(fds.seek(fd, SeekFrom::Start(0)).unwrap(), 0);

    // Reads past EOF return 0, offset stays at size at most.
    fds.seek(fd, SeekFrom::End(0)).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fds.read(fd, &mut buf).unwrap(), 0);
}

#[test]
fn path_spellings_resolve_identically() {
    let vfs = fresh_vfs();
    vfs.resolve("/tmp").unwrap().mkdir("x").unwrap();
    vfs.open("/tmp/x/f", OpenFlags::write_create()).unwrap();

    let canonical = vfs.resolve("/tmp/x/f").unwrap();
    for spelling in ["/tmp//x/./f", "/tmp/x/../x/f", "//tmp/x/f"] {
        let node = vfs.resolve(spelling).unwrap();
        assert!(
            Arc::ptr_eq(&canonical, &node),
            "spelling {:?} resolved elsewhere",
            spelling
        );
    }
}

#[test]
fn program_fault_kills_only_the_faulting_process() {
    // Build a minimal image in the program window and attribute it to a
    // process, then hand the exception dispatcher a page fault whose EIP
    // lies inside that image.
    let code = vec![0x90u8; 32];
    let elf = cupid_kernel::elf::writer::write_exec(&code, 0x40_0000, &[], 0, 0x40_0000);
    let image = cupid_kernel::elf::parse(&elf).unwrap();
    let loaded = cupid_kernel::process::loader::claim_span(&image).unwrap();

    extern "C" fn victim_entry() -> i32 {
        0
    }
    let pid = process::create(victim_entry, "victim", 4096).unwrap();
    process::set_image(pid, loaded.base, loaded.size).unwrap();

    let mut frame = RegisterFrame::zeroed();
    frame.vector = 14; // page fault
    frame.error_code = 0; // not-present read
    frame.eip = 0x40_0010; // inside the image
    cupid_kernel::irq::interrupt_dispatch(&mut frame);

    // The process was terminated, not the kernel.
    let table = process::processes();
    let victim = table.iter().find(|p| p.pid == pid).unwrap();
    assert_eq!(victim.state, ProcessState::Terminated);
    process::loader::release_image(loaded.base);
}

#[test]
fn global_vfs_serves_the_standard_layout() {
    fs::init();
    let vfs = fs::get_vfs().read();
    assert_eq!(vfs.stat("/tmp").unwrap().kind, NodeKind::Directory);
    assert_eq!(vfs.stat("/dev/null").unwrap().kind, NodeKind::Device);
    let entries = vfs.resolve("/dev").unwrap().readdir().unwrap();
    assert!(entries.iter().any(|e| e.name == "console"));
}
