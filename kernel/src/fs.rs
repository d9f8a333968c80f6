#![allow(dead_code)]

//! Filesystem bring-up: ramfs root, devfs at `/dev`, and the FAT16 volume
//! on the primary disk at `/disk`.

use kite_core::fs::devfs::DevFs;
use kite_core::fs::fat::FatFs;
use kite_core::fs::ramfs::RamFs;
use kite_core::vfs::{Vfs, VfsResult};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use spin::Mutex;

use crate::arch::x86::cpu::without_interrupts;
use crate::drivers::{self, DriverSlot};

pub const DEV_MOUNT: &str = "/dev";
pub const DISK_MOUNT: &str = "/disk";
const DISK_DEVICE: &str = "ata0";

static VFS: Mutex<Vfs> = Mutex::new(Vfs::new());
static DISK_MOUNTED: AtomicBool = AtomicBool::new(false);

pub fn init() {
    let root = match RamFs::new().root() {
        Ok(root) => root,
        Err(err) => panic!("[vfs] ramfs has no root: {:?}", err),
    };
    with_vfs(|vfs| {
        if let Err(err) = vfs.mount_root(root) {
            panic!("[vfs] cannot mount root: {:?}", err);
        }
        for dir in [DEV_MOUNT, DISK_MOUNT] {
            if let Err(err) = vfs.mkdir(dir) {
                warn!("[vfs] mkdir {} failed: {:?}", dir, err);
            }
        }
    });
    info!("[vfs] ramfs mounted at /");

    mount_devfs();
    mount_disk();
}

fn mount_devfs() {
    let devfs = DevFs::new();
    for slot in drivers::drivers() {
        let registered = match slot {
            DriverSlot::Char(dev) => devfs.register_char(dev.name(), dev),
            DriverSlot::Block(dev) => devfs.register_block(dev.name(), dev),
        };
        if let Err(err) = registered {
            warn!("[vfs] /dev/{} not created: {:?}", slot.name(), err);
        }
    }
    match with_vfs(|vfs| vfs.mount(DEV_MOUNT, devfs.root())) {
        Ok(()) => info!("[vfs] devfs mounted at {} ({} node(s))", DEV_MOUNT, devfs.len()),
        Err(err) => warn!("[vfs] devfs mount failed: {:?}", err),
    }
}

/// Mounts the FAT16 volume on the primary disk at `/disk`, reading its
/// metadata afresh. Returns false when there is no usable volume.
pub fn mount_disk() -> bool {
    let Some(device) = drivers::find_block(DISK_DEVICE) else {
        info!("[vfs] no {} device, {} stays empty", DISK_DEVICE, DISK_MOUNT);
        return false;
    };
    let fat = match FatFs::mount(device, 0) {
        Ok(fat) => fat,
        Err(err) => {
            warn!("[vfs] {} is not a FAT16 volume: {:?}", DISK_DEVICE, err);
            return false;
        }
    };
    match with_vfs(|vfs| vfs.mount(DISK_MOUNT, fat.root())) {
        Ok(()) => {
            info!(
                "[vfs] FAT16 volume on {} mounted at {}, {} free cluster(s)",
                DISK_DEVICE,
                DISK_MOUNT,
                fat.free_clusters()
            );
            DISK_MOUNTED.store(true, Ordering::Release);
            true
        }
        Err(err) => {
            warn!("[vfs] FAT16 mount failed: {:?}", err);
            false
        }
    }
}

/// Flushes and detaches the disk volume.
pub fn unmount_disk() -> VfsResult<()> {
    with_vfs(|vfs| {
        vfs.sync()?;
        vfs.unmount(DISK_MOUNT)
    })?;
    DISK_MOUNTED.store(false, Ordering::Release);
    info!("[vfs] {} unmounted", DISK_MOUNT);
    Ok(())
}

pub fn disk_mounted() -> bool {
    DISK_MOUNTED.load(Ordering::Acquire)
}

/// Runs `f` on the global VFS with interrupts off.
pub fn with_vfs<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
    without_interrupts(|| f(&mut VFS.lock()))
}
