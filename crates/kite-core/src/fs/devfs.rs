//! Device filesystem: one node per registered driver.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use log::info;
use spin::Mutex;

use crate::drivers::{BlockDevice, CharDevice};
use crate::vfs::{DirEntry, NodeKind, NodeOps, VfsError, VfsNode, VfsResult};

#[derive(Copy, Clone)]
enum Device {
    Char(&'static dyn CharDevice),
    Block(&'static dyn BlockDevice),
}

struct Entry {
    node: Arc<VfsNode>,
    device: Device,
}

struct DeviceTable {
    entries: Mutex<Vec<Entry>>,
}

pub struct DevFs {
    table: Arc<DeviceTable>,
    root: Arc<VfsNode>,
}

impl DevFs {
    pub fn new() -> Self {
        let table = Arc::new(DeviceTable {
            entries: Mutex::new(Vec::new()),
        });
        let root = VfsNode::new("dev", 1, NodeKind::Directory, 0o755, 0, 0, table.clone(), None);
        Self { table, root }
    }

    pub fn root(&self) -> Arc<VfsNode> {
        self.root.clone()
    }

    pub fn register_char(&self, name: &str, device: &'static dyn CharDevice) -> VfsResult<()> {
        self.register(name, NodeKind::CharDevice, 0, Device::Char(device))
    }

    pub fn register_block(&self, name: &str, device: &'static dyn BlockDevice) -> VfsResult<()> {
        let size = device.block_count() * device.block_size() as u64;
        self.register(name, NodeKind::BlockDevice, size, Device::Block(device))
    }

    fn register(&self, name: &str, kind: NodeKind, size: u64, device: Device) -> VfsResult<()> {
        let mut entries = self.table.entries.lock();
        if entries.iter().any(|entry| entry.node.name() == name) {
            return Err(VfsError::AlreadyExists);
        }
        let inode = entries.len() as u64 + 2;
        let node = VfsNode::new(
            name,
            inode,
            kind,
            0o666,
            size,
            inode,
            self.table.clone(),
            Some(&self.root),
        );
        entries.push(Entry { node, device });
        info!("[devfs] registered /dev/{}", name);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.table.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DevFs {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    fn device(&self, node: &VfsNode) -> VfsResult<Device> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.node.inode() == node.inode())
            .map(|entry| entry.device)
            .ok_or(VfsError::NotFound)
    }
}

impl NodeOps for DeviceTable {
    fn read(&self, node: &Arc<VfsNode>, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        match self.device(node)? {
            Device::Char(dev) => Ok(dev.read(buf)?),
            Device::Block(dev) => read_block(dev, node.size(), offset, buf),
        }
    }

    fn write(&self, node: &Arc<VfsNode>, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        match self.device(node)? {
            Device::Char(dev) => Ok(dev.write(buf)?),
            Device::Block(dev) => write_block(dev, node.size(), offset, buf),
        }
    }

    fn readdir(&self, _dir: &Arc<VfsNode>, index: usize) -> VfsResult<Option<DirEntry>> {
        Ok(self.entries.lock().get(index).map(|entry| DirEntry {
            name: entry.node.name().into(),
            inode: entry.node.inode(),
            kind: entry.node.kind(),
        }))
    }

    fn finddir(&self, _dir: &Arc<VfsNode>, name: &str) -> VfsResult<Arc<VfsNode>> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.node.name() == name)
            .map(|entry| entry.node.clone())
            .ok_or(VfsError::NotFound)
    }
}

fn read_block(dev: &dyn BlockDevice, size: u64, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
    if offset >= size {
        return Ok(0);
    }
    let block = dev.block_size() as u64;
    let count = (buf.len() as u64).min(size - offset) as usize;
    let mut scratch = vec![0u8; block as usize];
    let mut done = 0;
    while done < count {
        let pos = offset + done as u64;
        dev.read_blocks(pos / block, &mut scratch)?;
        let within = (pos % block) as usize;
        let chunk = (block as usize - within).min(count - done);
        buf[done..done + chunk].copy_from_slice(&scratch[within..within + chunk]);
        done += chunk;
    }
    Ok(count)
}

fn write_block(dev: &dyn BlockDevice, size: u64, offset: u64, buf: &[u8]) -> VfsResult<usize> {
    if offset >= size {
        return Err(VfsError::NoSpace);
    }
    let block = dev.block_size() as u64;
    let count = (buf.len() as u64).min(size - offset) as usize;
    let mut scratch = vec![0u8; block as usize];
    let mut done = 0;
    while done < count {
        let pos = offset + done as u64;
        let within = (pos % block) as usize;
        let chunk = (block as usize - within).min(count - done);
        if chunk < block as usize {
            dev.read_blocks(pos / block, &mut scratch)?;
        }
        scratch[within..within + chunk].copy_from_slice(&buf[done..done + chunk]);
        dev.write_blocks(pos / block, &scratch)?;
        done += chunk;
    }
    Ok(count)
}
