use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kite_core::drivers::mock::{MemBlockDevice, MemCharDevice};
use kite_core::fs::devfs::DevFs;
use kite_core::fs::ramfs::RamFs;
use kite_core::vfs::{
    NodeKind, NodeOps, OpenFlags, Vfs, VfsError, VfsNode, VfsResult, Whence, MAX_OPEN_FILES,
};

fn ram_vfs() -> Vfs {
    let mut vfs = Vfs::new();
    let ram = RamFs::new();
    vfs.mount_root(ram.root().unwrap()).unwrap();
    vfs
}

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Ram root with `/dev` holding `tty` and a four-sector `hd0`.
fn vfs_with_devices() -> (Vfs, &'static MemCharDevice, &'static MemBlockDevice) {
    let mut vfs = ram_vfs();
    vfs.mkdir("/dev").unwrap();
    let tty = leak(MemCharDevice::new("tty"));
    let disk = leak(MemBlockDevice::new("hd0", vec![0; 4 * 512], 512));
    let devfs = DevFs::new();
    devfs.register_char("tty", tty).unwrap();
    devfs.register_block("hd0", disk).unwrap();
    vfs.mount("/dev", devfs.root()).unwrap();
    (vfs, tty, disk)
}

fn write_file(vfs: &mut Vfs, path: &str, data: &[u8]) {
    let fd = vfs
        .open(path, OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC)
        .unwrap();
    assert_eq!(vfs.write(fd, data).unwrap(), data.len());
    vfs.close(fd).unwrap();
}

#[test]
fn root_is_mounted_once() {
    let mut vfs = ram_vfs();
    let other = RamFs::new();

    assert_eq!(vfs.mount_root(other.root().unwrap()), Err(VfsError::Busy));
    assert_eq!(vfs.resolve("/").unwrap().name(), "/");
}

#[test]
fn paths_walk_dot_and_dot_dot() {
    let mut vfs = ram_vfs();
    vfs.mkdir("/a").unwrap();
    vfs.mkdir("/a/b").unwrap();
    write_file(&mut vfs, "/a/b/file", b"data");

    let direct = vfs.resolve("/a/b/file").unwrap();
    let winding = vfs.resolve("/a/./b/../b//file").unwrap();
    assert!(Arc::ptr_eq(&direct, &winding));

    let root = vfs.resolve("/").unwrap();
    assert!(Arc::ptr_eq(&vfs.resolve("/..").unwrap(), &root));
    assert!(Arc::ptr_eq(&vfs.resolve("/a/../..").unwrap(), &root));
    assert_eq!(vfs.resolve("/a/missing").err(), Some(VfsError::NotFound));
    assert_eq!(vfs.resolve("/a/b/file/x").err(), Some(VfsError::NotADirectory));
    assert_eq!(vfs.resolve("").err(), Some(VfsError::InvalidPath));
}

#[test]
fn relative_paths_start_at_the_working_directory() {
    let mut vfs = ram_vfs();
    vfs.mkdir("/home").unwrap();
    write_file(&mut vfs, "/home/notes", b"hi");

    vfs.chdir("/home").unwrap();
    assert_eq!(vfs.read_all("notes").unwrap(), b"hi");
    assert_eq!(vfs.cwd().unwrap().name(), "home");

    write_file(&mut vfs, "todo", b"x");
    assert!(vfs.resolve("/home/todo").is_ok());
    assert_eq!(vfs.chdir("/home/notes"), Err(VfsError::NotADirectory));
}

#[test]
fn open_and_close_restore_the_reference_count() {
    let mut vfs = ram_vfs();
    write_file(&mut vfs, "/f", b"abc");
    let node = vfs.resolve("/f").unwrap();
    let before = node.open_count();

    let first = vfs.open("/f", OpenFlags::READ).unwrap();
    let second = vfs.open("/f", OpenFlags::READ).unwrap();
    assert_eq!(node.open_count(), before + 2);
    assert_eq!(vfs.stat("/f").unwrap().open_count, before + 2);

    vfs.close(first).unwrap();
    vfs.close(second).unwrap();
    assert_eq!(node.open_count(), before);
}

#[test]
fn read_write_and_offsets() {
    let mut vfs = ram_vfs();
    let fd = vfs.open("/log", OpenFlags::RDWR | OpenFlags::CREATE).unwrap();

    vfs.write(fd, b"hello world").unwrap();
    assert_eq!(vfs.tell(fd).unwrap(), 11);

    assert_eq!(vfs.seek(fd, 6, Whence::Set).unwrap(), 6);
    let mut buf = [0u8; 16];
    let count = vfs.read(fd, &mut buf).unwrap();
    assert_eq!(&buf[..count], b"world");
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 0);

    assert_eq!(vfs.seek(fd, -5, Whence::End).unwrap(), 6);
    assert_eq!(vfs.seek(fd, -2, Whence::Current).unwrap(), 4);
    assert_eq!(vfs.seek(fd, -100, Whence::Current).unwrap(), 0);

    vfs.seek(fd, 0, Whence::Set).unwrap();
    vfs.write(fd, b"J").unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(vfs.read_all("/log").unwrap(), b"Jello world");
}

#[test]
fn writing_past_the_end_zero_fills() {
    let mut vfs = ram_vfs();
    let fd = vfs.open("/sparse", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();

    vfs.seek(fd, 4, Whence::Set).unwrap();
    vfs.write(fd, b"x").unwrap();
    vfs.close(fd).unwrap();

    assert_eq!(vfs.read_all("/sparse").unwrap(), b"\0\0\0\0x");
    assert_eq!(vfs.stat("/sparse").unwrap().size, 5);
}

#[test]
fn append_writes_land_at_the_end() {
    let mut vfs = ram_vfs();
    write_file(&mut vfs, "/journal", b"one;");

    let fd = vfs.open("/journal", OpenFlags::APPEND).unwrap();
    vfs.write(fd, b"two;").unwrap();
    vfs.seek(fd, 0, Whence::Set).unwrap();
    vfs.write(fd, b"three;").unwrap();
    vfs.close(fd).unwrap();

    assert_eq!(vfs.read_all("/journal").unwrap(), b"one;two;three;");
}

#[test]
fn truncate_on_open() {
    let mut vfs = ram_vfs();
    write_file(&mut vfs, "/t", b"long contents");

    let fd = vfs.open("/t", OpenFlags::WRITE | OpenFlags::TRUNC).unwrap();
    vfs.write(fd, b"short").unwrap();
    vfs.close(fd).unwrap();

    assert_eq!(vfs.read_all("/t").unwrap(), b"short");
}

#[test]
fn descriptor_permissions() {
    let mut vfs = ram_vfs();
    write_file(&mut vfs, "/p", b"abc");
    vfs.mkdir("/d").unwrap();

    let read_only = vfs.open("/p", OpenFlags::READ).unwrap();
    assert_eq!(vfs.write(read_only, b"x"), Err(VfsError::PermissionDenied));

    let write_only = vfs.open("/p", OpenFlags::WRITE).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(vfs.read(write_only, &mut buf), Err(VfsError::PermissionDenied));

    assert_eq!(vfs.open("/d", OpenFlags::WRITE), Err(VfsError::IsADirectory));
    assert_eq!(vfs.open("/missing", OpenFlags::READ), Err(VfsError::NotFound));
    assert_eq!(
        vfs.open("/nowhere/new", OpenFlags::WRITE | OpenFlags::CREATE),
        Err(VfsError::NotFound)
    );
}

#[test]
fn closed_descriptors_are_rejected() {
    let mut vfs = ram_vfs();
    write_file(&mut vfs, "/f", b"abc");
    let fd = vfs.open("/f", OpenFlags::READ).unwrap();
    vfs.close(fd).unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(vfs.read(fd, &mut buf), Err(VfsError::BadDescriptor));
    assert_eq!(vfs.close(fd), Err(VfsError::BadDescriptor));
    assert_eq!(vfs.tell(fd), Err(VfsError::BadDescriptor));
    assert_eq!(vfs.seek(99, 0, Whence::Set), Err(VfsError::BadDescriptor));
}

#[test]
fn descriptor_table_is_bounded() {
    let mut vfs = ram_vfs();
    write_file(&mut vfs, "/f", b"abc");

    let fds: Vec<_> = (0..MAX_OPEN_FILES)
        .map(|_| vfs.open("/f", OpenFlags::READ).unwrap())
        .collect();
    assert_eq!(vfs.open_files(), MAX_OPEN_FILES);
    assert_eq!(vfs.open("/f", OpenFlags::READ), Err(VfsError::TooManyOpenFiles));

    vfs.close(fds[17]).unwrap();
    assert_eq!(vfs.open("/f", OpenFlags::READ).unwrap(), fds[17]);
    assert_eq!(vfs.resolve("/f").unwrap().open_count(), MAX_OPEN_FILES);
}

#[test]
fn directory_listing_through_a_descriptor() {
    let mut vfs = ram_vfs();
    vfs.mkdir("/etc").unwrap();
    write_file(&mut vfs, "/etc/motd", b"welcome");
    vfs.mkdir("/etc/init").unwrap();

    let fd = vfs.open("/etc", OpenFlags::READ).unwrap();
    let mut listing = Vec::new();
    let mut index = 0;
    while let Some(entry) = vfs.readdir(fd, index).unwrap() {
        listing.push((entry.name, entry.kind));
        index += 1;
    }
    vfs.close(fd).unwrap();

    assert_eq!(
        listing,
        vec![
            ("motd".to_string(), NodeKind::File),
            ("init".to_string(), NodeKind::Directory),
        ]
    );

    let file = vfs.open("/etc/motd", OpenFlags::READ).unwrap();
    assert_eq!(vfs.readdir(file, 0), Err(VfsError::NotADirectory));
}

#[test]
fn namespace_changes() {
    let mut vfs = ram_vfs();
    vfs.mkdir("/d").unwrap();
    write_file(&mut vfs, "/d/f", b"x");

    assert_eq!(vfs.mkdir("/d").err(), Some(VfsError::AlreadyExists));
    assert_eq!(vfs.create("/d/f").err(), Some(VfsError::AlreadyExists));
    assert_eq!(vfs.rmdir("/d"), Err(VfsError::NotEmpty));
    assert_eq!(vfs.unlink("/d"), Err(VfsError::IsADirectory));
    assert_eq!(vfs.rmdir("/d/f"), Err(VfsError::NotADirectory));
    assert_eq!(vfs.mkdir("/d/..").err(), Some(VfsError::InvalidPath));

    let fd = vfs.open("/d/f", OpenFlags::READ).unwrap();
    assert_eq!(vfs.unlink("/d/f"), Err(VfsError::Busy));
    vfs.close(fd).unwrap();

    vfs.unlink("/d/f").unwrap();
    vfs.rmdir("/d").unwrap();
    assert_eq!(vfs.resolve("/d").err(), Some(VfsError::NotFound));
}

#[test]
fn mounts_redirect_traversal() {
    let (vfs, _, _) = vfs_with_devices();

    let dev = vfs.resolve("/dev").unwrap();
    assert_eq!(dev.name(), "dev");
    assert_eq!(dev.kind(), NodeKind::Directory);
    assert_eq!(vfs.resolve("/dev/tty").unwrap().kind(), NodeKind::CharDevice);
    assert_eq!(vfs.stat("/dev/hd0").unwrap().size, 2048);

    let root = vfs.resolve("/").unwrap();
    assert!(Arc::ptr_eq(&vfs.resolve("/dev/..").unwrap(), &root));
    assert!(Arc::ptr_eq(&vfs.resolve("/dev/../dev/tty/..").unwrap(), &dev));
    assert_eq!(vfs.mount_count(), 1);
}

#[test]
fn covered_directory_reports_as_mountpoint() {
    let (vfs, _, _) = vfs_with_devices();
    let root = vfs.resolve("/").unwrap();

    let entry = root.ops().readdir(&root, 0).unwrap().unwrap();

    assert_eq!(entry.name, "dev");
    assert_eq!(entry.kind, NodeKind::Mountpoint);
}

#[test]
fn mount_rules() {
    let (mut vfs, _, _) = vfs_with_devices();
    write_file(&mut vfs, "/file", b"x");
    let extra = RamFs::new();

    assert_eq!(vfs.mount("/dev", extra.root().unwrap()), Err(VfsError::Busy));
    assert_eq!(vfs.mount("/file", extra.root().unwrap()), Err(VfsError::NotADirectory));
    assert_eq!(vfs.mount("/", extra.root().unwrap()), Err(VfsError::Busy));
    assert_eq!(vfs.unmount("/"), Err(VfsError::InvalidPath));
    assert_eq!(vfs.rmdir("/dev"), Err(VfsError::Busy));
}

#[test]
fn character_devices_move_bytes() {
    let (mut vfs, tty, _) = vfs_with_devices();
    tty.feed(b"typed");

    let fd = vfs.open("/dev/tty", OpenFlags::RDWR).unwrap();
    vfs.write(fd, b"Hello from user mode!\n").unwrap();
    let mut buf = [0u8; 8];
    let count = vfs.read(fd, &mut buf).unwrap();
    vfs.close(fd).unwrap();

    assert_eq!(tty.output(), b"Hello from user mode!\n");
    assert_eq!(&buf[..count], b"typed");
}

#[test]
fn block_devices_are_byte_addressable() {
    let (mut vfs, _, disk) = vfs_with_devices();

    let fd = vfs.open("/dev/hd0", OpenFlags::RDWR).unwrap();
    vfs.seek(fd, 500, Whence::Set).unwrap();
    vfs.write(fd, &[0x5A; 24]).unwrap();

    vfs.seek(fd, 2040, Whence::Set).unwrap();
    assert_eq!(vfs.write(fd, &[0x77; 16]).unwrap(), 8);
    assert_eq!(vfs.write(fd, &[0x77; 16]), Err(VfsError::NoSpace));

    vfs.seek(fd, 498, Whence::Set).unwrap();
    let mut buf = [0u8; 28];
    vfs.read(fd, &mut buf).unwrap();
    vfs.close(fd).unwrap();

    assert_eq!(&buf[..2], &[0, 0]);
    assert!(buf[2..26].iter().all(|&b| b == 0x5A));
    assert_eq!(&buf[26..], &[0, 0]);

    let image = disk.snapshot();
    assert!(image[500..524].iter().all(|&b| b == 0x5A));
    assert!(image[2040..].iter().all(|&b| b == 0x77));
    assert_eq!(image[499], 0);
}

#[test]
fn unmount_waits_for_descriptors() {
    let (mut vfs, _, _) = vfs_with_devices();
    let fd = vfs.open("/dev/tty", OpenFlags::WRITE).unwrap();

    assert_eq!(vfs.unmount("/dev"), Err(VfsError::Busy));

    vfs.close(fd).unwrap();
    vfs.unmount("/dev").unwrap();

    assert_eq!(vfs.mount_count(), 0);
    assert_eq!(vfs.resolve("/dev/tty").err(), Some(VfsError::NotFound));
    assert_eq!(vfs.resolve("/dev").unwrap().kind(), NodeKind::Directory);
}

#[test]
fn unmount_moves_the_working_directory_out() {
    let (mut vfs, _, _) = vfs_with_devices();
    vfs.chdir("/dev").unwrap();

    vfs.unmount("/dev").unwrap();

    assert_eq!(vfs.cwd().unwrap().name(), "/");
}

#[test]
fn devices_register_once() {
    let devfs = DevFs::new();
    let tty = leak(MemCharDevice::new("tty"));

    devfs.register_char("tty", tty).unwrap();

    assert_eq!(devfs.register_char("tty", tty), Err(VfsError::AlreadyExists));
    assert_eq!(devfs.len(), 1);
}

/// Node operations that only count open and close calls.
#[derive(Default)]
struct Counting {
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl NodeOps for Counting {
    fn open(&self, _node: &Arc<VfsNode>, _flags: OpenFlags) -> VfsResult<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self, _node: &Arc<VfsNode>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn descriptors_drive_the_node_operations() {
    let ops = Arc::new(Counting::default());
    let root = VfsNode::new("/", 1, NodeKind::Directory, 0o755, 0, 0, ops.clone(), None);
    let mut vfs = Vfs::new();
    vfs.mount_root(root).unwrap();

    let fd = vfs.open("/", OpenFlags::READ).unwrap();
    assert_eq!(vfs.readdir(fd, 0), Err(VfsError::Unsupported));
    vfs.close(fd).unwrap();

    assert_eq!(ops.opens.load(Ordering::SeqCst), 1);
    assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
    assert_eq!(vfs.create("/x").err(), Some(VfsError::Unsupported));
}
