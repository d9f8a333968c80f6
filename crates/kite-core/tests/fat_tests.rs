use std::sync::Arc;

use kite_core::drivers::mock::MemBlockDevice;
use kite_core::fs::fat::{self, FatError, FatFs, ATTR_READ_ONLY};
use kite_core::fs::ramfs::RamFs;
use kite_core::vfs::{NodeKind, OpenFlags, Vfs, VfsError};

const SECTOR_SIZE: usize = 512;

fn fat_image_with_hello(attr: u8) -> Vec<u8> {
    let mut image = vec![0u8; SECTOR_SIZE * 10];

    // BIOS Parameter Block for FAT16
    {
        let bpb = &mut image[0..SECTOR_SIZE];
        bpb[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        bpb[13] = 1; // sectors per cluster
        bpb[14..16].copy_from_slice(&(1u16).to_le_bytes()); // reserved sectors
        bpb[16] = 1; // number of FATs
        bpb[17..19].copy_from_slice(&(16u16).to_le_bytes()); // root entries
        bpb[19..21].copy_from_slice(&(10u16).to_le_bytes()); // total sectors
        bpb[21] = 0xF8; // media descriptor
        bpb[22..24].copy_from_slice(&(1u16).to_le_bytes()); // sectors per FAT
        bpb[510] = 0x55;
        bpb[511] = 0xAA;
    }

    // FAT table (sector 1)
    {
        let fat_sector = &mut image[SECTOR_SIZE..SECTOR_SIZE * 2];
        fat_sector[0] = 0xF8;
        fat_sector[1] = 0xFF;
        fat_sector[2] = 0xFF;
        fat_sector[3] = 0xFF;
        fat_sector[4] = 0xFF; // cluster 2: end of chain
        fat_sector[5] = 0xFF;
    }

    // Root directory (sector 2)
    {
        let root = &mut image[SECTOR_SIZE * 2..SECTOR_SIZE * 3];
        root[0..11].copy_from_slice(b"HELLO   TXT");
        root[11] = attr;
        root[26..28].copy_from_slice(&(2u16).to_le_bytes());
        root[28..32].copy_from_slice(&(5u32).to_le_bytes());
    }

    // Data cluster (cluster 2 -> sector 3)
    {
        let data = &mut image[SECTOR_SIZE * 3..SECTOR_SIZE * 4];
        data[..5].copy_from_slice(b"Hello");
    }

    image
}

/// Blank FAT16 volume: 2 KiB clusters, two FAT copies, 512 root entries.
fn formatted_image(total_sectors: u32) -> Vec<u8> {
    const RESERVED: u16 = 1;
    const FATS: u8 = 2;
    const ROOT_ENTRIES: u16 = 512;
    const SECTORS_PER_CLUSTER: u8 = 4;

    let root_sectors = (ROOT_ENTRIES as u32 * 32).div_ceil(SECTOR_SIZE as u32);
    let mut sectors_per_fat = 1u32;
    loop {
        let data = total_sectors - RESERVED as u32 - FATS as u32 * sectors_per_fat - root_sectors;
        let clusters = data / SECTORS_PER_CLUSTER as u32;
        if (clusters + 2) * 2 <= sectors_per_fat * SECTOR_SIZE as u32 {
            break;
        }
        sectors_per_fat += 1;
    }

    let mut image = vec![0u8; total_sectors as usize * SECTOR_SIZE];
    {
        let bpb = &mut image[0..SECTOR_SIZE];
        bpb[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        bpb[3..11].copy_from_slice(b"KITEFMT ");
        bpb[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        bpb[13] = SECTORS_PER_CLUSTER;
        bpb[14..16].copy_from_slice(&RESERVED.to_le_bytes());
        bpb[16] = FATS;
        bpb[17..19].copy_from_slice(&ROOT_ENTRIES.to_le_bytes());
        bpb[21] = 0xF8;
        bpb[22..24].copy_from_slice(&(sectors_per_fat as u16).to_le_bytes());
        bpb[32..36].copy_from_slice(&total_sectors.to_le_bytes());
        bpb[54..62].copy_from_slice(b"FAT16   ");
        bpb[510] = 0x55;
        bpb[511] = 0xAA;
    }
    for copy in 0..FATS as usize {
        let start = (RESERVED as usize + copy * sectors_per_fat as usize) * SECTOR_SIZE;
        image[start..start + 4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0xFF]);
    }
    image
}

fn leak_device(image: Vec<u8>) -> &'static MemBlockDevice {
    Box::leak(Box::new(MemBlockDevice::new("mem-fat", image, SECTOR_SIZE)))
}

fn mounted(dev: &'static MemBlockDevice) -> (FatFs, Vfs) {
    let fs = FatFs::mount(dev, 0).expect("mount");
    let mut vfs = Vfs::new();
    vfs.mount_root(fs.root()).expect("root");
    (fs, vfs)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn fat_copies(fs: &FatFs, dev: &MemBlockDevice) -> Vec<Vec<u8>> {
    let geometry = fs.geometry();
    let disk = dev.snapshot();
    let len = geometry.sectors_per_fat as usize * SECTOR_SIZE;
    (0..geometry.num_fats as usize)
        .map(|copy| {
            let start = (geometry.fat_lba as usize + copy * geometry.sectors_per_fat as usize) * SECTOR_SIZE;
            disk[start..start + len].to_vec()
        })
        .collect()
}

#[test]
fn short_name_conversion() {
    let short = fat::format_short_name("hello.txt").unwrap();
    assert_eq!(&short, b"HELLO   TXT");
    assert_eq!(fat::decode_short_name(&short), "HELLO.TXT");
    assert!(fat::format_short_name("too_long_name.ext").is_none());
    assert!(fat::format_short_name("a.b.c").is_none());
    assert!(fat::format_short_name("bad name").is_none());
}

#[test]
fn open_and_read_file() {
    let dev = leak_device(fat_image_with_hello(0x20));
    let (_fs, mut vfs) = mounted(dev);

    let fd = vfs.open("/HELLO.TXT", OpenFlags::READ).expect("open");
    let mut buf = [0u8; 8];
    let read = vfs.read(fd, &mut buf).expect("read");
    assert_eq!(read, 5);
    assert_eq!(&buf[..5], b"Hello");
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 0);
    vfs.close(fd).unwrap();
}

#[test]
fn lookup_is_case_insensitive() {
    let dev = leak_device(fat_image_with_hello(0x20));
    let (_fs, vfs) = mounted(dev);
    assert_eq!(vfs.read_all("/hello.txt").unwrap(), b"Hello");
}

#[test]
fn missing_file_errors() {
    let dev = leak_device(fat_image_with_hello(0x20));
    let (_fs, mut vfs) = mounted(dev);
    let result = vfs.open("/MISSING.TXT", OpenFlags::READ);
    assert!(matches!(result, Err(VfsError::NotFound)));
}

#[test]
fn bad_signature_is_rejected() {
    let mut image = fat_image_with_hello(0x20);
    image[510] = 0;
    let dev = leak_device(image);
    assert!(matches!(FatFs::mount(dev, 0), Err(FatError::BadSignature)));
}

#[test]
fn read_only_entry_refuses_writes() {
    let dev = leak_device(fat_image_with_hello(0x20 | ATTR_READ_ONLY));
    let (_fs, mut vfs) = mounted(dev);

    let stat = vfs.stat("/HELLO.TXT").unwrap();
    assert_eq!(stat.mode, 0o444);
    assert_eq!(stat.kind, NodeKind::File);
    assert_eq!(
        vfs.open("/HELLO.TXT", OpenFlags::WRITE),
        Err(VfsError::PermissionDenied)
    );
}

#[test]
fn repeated_lookups_share_a_node() {
    let dev = leak_device(fat_image_with_hello(0x20));
    let (_fs, vfs) = mounted(dev);
    let first = vfs.resolve("/HELLO.TXT").unwrap();
    let second = vfs.resolve("/hello.txt").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn round_trip_survives_remount() {
    let dev = leak_device(formatted_image(65_536));
    let payload = pattern(5000);

    {
        let (fs, mut vfs) = mounted(dev);
        let free_before = fs.free_clusters();
        vfs.mkdir("/docs").expect("mkdir");
        assert_eq!(fs.free_clusters(), free_before - 1);

        vfs.create("/docs/a.txt").expect("create");
        let fd = vfs.open("/docs/a.txt", OpenFlags::WRITE).expect("open");
        assert_eq!(vfs.write(fd, &payload).unwrap(), payload.len());
        vfs.close(fd).unwrap();

        assert_eq!(fs.free_clusters(), free_before - 1 - 3);
        assert!(!fs.is_dirty());
    }

    let (fs, mut vfs) = mounted(dev);
    let stat = vfs.stat("/docs/a.txt").unwrap();
    assert_eq!(stat.size, 5000);

    let fd = vfs.open("/docs/a.txt", OpenFlags::READ).unwrap();
    let mut buf = vec![0u8; 5000];
    let mut filled = 0;
    while filled < buf.len() {
        let count = vfs.read(fd, &mut buf[filled..]).unwrap();
        assert!(count > 0);
        filled += count;
    }
    assert_eq!(buf, payload);

    let copies = fat_copies(&fs, dev);
    assert_eq!(copies.len(), 2);
    assert_eq!(copies[0], copies[1]);
}

#[test]
fn chain_extension_charges_free_count_exactly() {
    let dev = leak_device(formatted_image(8192));
    let (fs, mut vfs) = mounted(dev);
    let cluster = fs.geometry().bytes_per_cluster;

    let fd = vfs.open("/grow.bin", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    let free = fs.free_clusters();
    vfs.write(fd, b"x").unwrap();
    assert_eq!(fs.free_clusters(), free - 1);

    let free = fs.free_clusters();
    vfs.write(fd, &pattern(cluster * 2)).unwrap();
    assert_eq!(fs.free_clusters(), free - 2);

    let node = vfs.resolve("/grow.bin").unwrap();
    assert_eq!(fs.chain(node.private() as u16).unwrap().len(), 3);
    vfs.close(fd).unwrap();

    let copies = fat_copies(&fs, dev);
    assert_eq!(copies[0], copies[1]);
}

#[test]
fn overwrite_in_the_middle_keeps_size() {
    let dev = leak_device(formatted_image(8192));
    let (_fs, mut vfs) = mounted(dev);

    let fd = vfs.open("/notes.txt", OpenFlags::RDWR | OpenFlags::CREATE).unwrap();
    vfs.write(fd, b"abcdefgh").unwrap();
    vfs.seek(fd, 2, kite_core::vfs::Whence::Set).unwrap();
    vfs.write(fd, b"XYZ").unwrap();
    vfs.close(fd).unwrap();

    assert_eq!(vfs.read_all("/notes.txt").unwrap(), b"abXYZfgh");
}

#[test]
fn truncate_on_open_releases_clusters() {
    let dev = leak_device(formatted_image(8192));
    let (fs, mut vfs) = mounted(dev);

    let fd = vfs.open("/big.bin", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    vfs.write(fd, &pattern(6000)).unwrap();
    vfs.close(fd).unwrap();
    let free = fs.free_clusters();

    let fd = vfs
        .open("/big.bin", OpenFlags::WRITE | OpenFlags::TRUNC)
        .unwrap();
    assert_eq!(vfs.stat("/big.bin").unwrap().size, 0);
    assert_eq!(fs.free_clusters(), free + 3);
    vfs.close(fd).unwrap();
}

#[test]
fn create_without_trunc_preserves_contents() {
    let dev = leak_device(formatted_image(8192));
    let (_fs, mut vfs) = mounted(dev);

    let fd = vfs.open("/keep.txt", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    vfs.write(fd, b"persist").unwrap();
    vfs.close(fd).unwrap();

    let fd = vfs.open("/keep.txt", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(vfs.read_all("/keep.txt").unwrap(), b"persist");
}

#[test]
fn unlink_frees_the_chain() {
    let dev = leak_device(formatted_image(8192));
    let (fs, mut vfs) = mounted(dev);
    let free = fs.free_clusters();

    let fd = vfs.open("/gone.txt", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    vfs.write(fd, &pattern(3000)).unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(fs.free_clusters(), free - 2);

    vfs.unlink("/gone.txt").unwrap();
    assert_eq!(fs.free_clusters(), free);
    assert!(matches!(vfs.stat("/gone.txt"), Err(VfsError::NotFound)));
}

#[test]
fn directories_list_without_dot_entries() {
    let dev = leak_device(formatted_image(8192));
    let (_fs, mut vfs) = mounted(dev);

    vfs.mkdir("/docs").unwrap();
    vfs.create("/docs/one.txt").unwrap();
    vfs.mkdir("/docs/sub").unwrap();

    let fd = vfs.open("/docs", OpenFlags::READ).unwrap();
    let mut names = Vec::new();
    let mut index = 0;
    while let Some(entry) = vfs.readdir(fd, index).unwrap() {
        names.push((entry.name, entry.kind));
        index += 1;
    }
    vfs.close(fd).unwrap();

    assert_eq!(
        names,
        vec![
            ("ONE.TXT".to_string(), NodeKind::File),
            ("SUB".to_string(), NodeKind::Directory),
        ]
    );
    assert!(Arc::ptr_eq(
        &vfs.resolve("/docs/sub/..").unwrap(),
        &vfs.resolve("/docs").unwrap()
    ));
}

#[test]
fn rmdir_requires_an_empty_directory() {
    let dev = leak_device(formatted_image(8192));
    let (fs, mut vfs) = mounted(dev);
    let free = fs.free_clusters();

    vfs.mkdir("/tmp").unwrap();
    vfs.create("/tmp/x").unwrap();
    assert_eq!(vfs.rmdir("/tmp"), Err(VfsError::NotEmpty));

    vfs.unlink("/tmp/x").unwrap();
    vfs.rmdir("/tmp").unwrap();
    assert_eq!(fs.free_clusters(), free);
    assert!(matches!(vfs.stat("/tmp"), Err(VfsError::NotFound)));
}

#[test]
fn subdirectory_grows_past_one_cluster() {
    let dev = leak_device(formatted_image(8192));
    let (fs, mut vfs) = mounted(dev);
    vfs.mkdir("/many").unwrap();

    // 2 KiB clusters hold 64 entries, two of them dot entries.
    for index in 0..70 {
        vfs.create(&format!("/many/f{index}.txt")).unwrap();
    }
    let dir = vfs.resolve("/many").unwrap();
    assert_eq!(fs.chain(dir.private() as u16).unwrap().len(), 2);
    assert!(vfs.stat("/many/f69.txt").is_ok());
}

#[test]
fn names_that_do_not_fit_are_rejected() {
    let dev = leak_device(formatted_image(8192));
    let (_fs, mut vfs) = mounted(dev);
    assert!(matches!(
        vfs.create("/much_too_long_name.text"),
        Err(VfsError::InvalidPath)
    ));
    assert!(matches!(vfs.create("/HELLO.TXT").and_then(|_| vfs.create("/hello.txt")), Err(VfsError::AlreadyExists)));
}

#[test]
fn oversized_write_is_refused_without_spending_clusters() {
    let dev = leak_device(formatted_image(8192));
    let (fs, mut vfs) = mounted(dev);
    let cluster = fs.geometry().bytes_per_cluster;

    let fd = vfs.open("/big.bin", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    vfs.write(fd, b"x").unwrap();
    let free = fs.free_clusters();

    let too_much = pattern((free as usize + 4) * cluster);
    assert!(matches!(vfs.write(fd, &too_much), Err(VfsError::NoSpace)));
    assert_eq!(fs.free_clusters(), free);

    let node = vfs.resolve("/big.bin").unwrap();
    assert_eq!(fs.chain(node.private() as u16).unwrap().len(), 1);
    assert_eq!(vfs.stat("/big.bin").unwrap().size, 1);
    vfs.close(fd).unwrap();

    drop(vfs);
    drop(fs);
    let (fs, _vfs) = mounted(dev);
    assert_eq!(fs.free_clusters(), free);
}

#[test]
fn failed_extension_returns_its_clusters() {
    let dev = leak_device(formatted_image(8192));
    let (fs, mut vfs) = mounted(dev);
    let cluster = fs.geometry().bytes_per_cluster;

    let fd = vfs.open("/grow.bin", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    vfs.write(fd, b"x").unwrap();
    let free = fs.free_clusters();

    dev.fail_writes_after(1);
    assert!(matches!(vfs.write(fd, &pattern(cluster * 3)), Err(VfsError::Io)));
    dev.fail_writes_after(usize::MAX);

    assert_eq!(fs.free_clusters(), free);
    let node = vfs.resolve("/grow.bin").unwrap();
    assert_eq!(fs.chain(node.private() as u16).unwrap().len(), 1);
    assert_eq!(vfs.stat("/grow.bin").unwrap().size, 1);

    vfs.write(fd, b"yz").unwrap();
    assert_eq!(fs.free_clusters(), free);
    vfs.close(fd).unwrap();
    assert_eq!(vfs.read_all("/grow.bin").unwrap(), b"xyz");
}

#[test]
fn failed_mkdir_returns_its_cluster() {
    let dev = leak_device(formatted_image(8192));
    let (fs, mut vfs) = mounted(dev);
    let free = fs.free_clusters();

    dev.fail_writes_after(0);
    assert!(matches!(vfs.mkdir("/docs"), Err(VfsError::Io)));
    dev.fail_writes_after(usize::MAX);

    assert_eq!(fs.free_clusters(), free);
    assert!(matches!(vfs.stat("/docs"), Err(VfsError::NotFound)));

    vfs.mkdir("/docs").unwrap();
    assert_eq!(fs.free_clusters(), free - 1);
}

#[test]
fn unmount_keeps_the_mount_when_the_flush_fails() {
    let dev = leak_device(formatted_image(8192));
    let fs = FatFs::mount(dev, 0).expect("mount");
    let cluster = fs.geometry().bytes_per_cluster;
    let mut vfs = Vfs::new();
    let ram = RamFs::new();
    vfs.mount_root(ram.root().unwrap()).unwrap();
    vfs.mkdir("/disk").unwrap();
    vfs.mount("/disk", fs.root()).unwrap();
    let mounts = vfs.mount_count();

    // A write that fails after allocating leaves the FAT dirty in memory.
    let fd = vfs.open("/disk/a.bin", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    dev.fail_writes_after(1);
    assert!(vfs.write(fd, &pattern(cluster * 2)).is_err());
    vfs.close(fd).unwrap();
    assert!(fs.is_dirty());

    dev.fail_writes_after(0);
    assert_eq!(vfs.unmount("/disk"), Err(VfsError::Io));
    assert_eq!(vfs.mount_count(), mounts);
    assert!(vfs.stat("/disk/a.bin").is_ok());

    dev.fail_writes_after(usize::MAX);
    vfs.unmount("/disk").unwrap();
    assert!(!fs.is_dirty());
    assert_eq!(vfs.mount_count(), mounts - 1);
}

#[test]
fn node_cache_forgets_dropped_nodes() {
    let dev = leak_device(formatted_image(8192));
    let (fs, mut vfs) = mounted(dev);
    for index in 0..300 {
        vfs.create(&format!("/n{index}.txt")).unwrap();
    }
    for index in 0..300 {
        assert!(vfs.stat(&format!("/n{index}.txt")).is_ok());
    }
    assert!(fs.cached_nodes() < 100, "cache holds {} entries", fs.cached_nodes());

    let held = vfs.resolve("/n7.txt").unwrap();
    for index in 0..300 {
        vfs.stat(&format!("/n{index}.txt")).unwrap();
    }
    assert!(Arc::ptr_eq(&held, &vfs.resolve("/n7.txt").unwrap()));
}
