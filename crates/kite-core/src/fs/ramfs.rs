//! In-memory filesystem used as the boot root.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use crate::vfs::{DirEntry, NodeKind, NodeOps, OpenFlags, VfsError, VfsNode, VfsResult};

const FILE_MODE: u16 = 0o644;
const DIR_MODE: u16 = 0o755;

enum Contents {
    File(Vec<u8>),
    Dir(Vec<Arc<VfsNode>>),
}

struct RamState {
    next_inode: u64,
    contents: BTreeMap<u64, Contents>,
}

pub struct RamFs {
    state: Mutex<RamState>,
    root: Mutex<Option<Arc<VfsNode>>>,
    this: Weak<RamFs>,
}

impl RamFs {
    pub fn new() -> Arc<Self> {
        let fs = Arc::new_cyclic(|this| Self {
            state: Mutex::new(RamState {
                next_inode: 2,
                contents: BTreeMap::new(),
            }),
            root: Mutex::new(None),
            this: this.clone(),
        });
        let root = fs.make_node("/", NodeKind::Directory, None);
        *fs.root.lock() = Some(root);
        fs
    }

    pub fn root(&self) -> VfsResult<Arc<VfsNode>> {
        self.root.lock().clone().ok_or(VfsError::NotFound)
    }

    fn ops(&self) -> Arc<dyn NodeOps> {
        match self.this.upgrade() {
            Some(fs) => fs,
            None => unreachable!("ramfs used after drop"),
        }
    }

    fn make_node(&self, name: &str, kind: NodeKind, parent: Option<&Arc<VfsNode>>) -> Arc<VfsNode> {
        let mut state = self.state.lock();
        let inode = state.next_inode;
        state.next_inode += 1;
        let (mode, contents) = match kind {
            NodeKind::Directory => (DIR_MODE, Contents::Dir(Vec::new())),
            _ => (FILE_MODE, Contents::File(Vec::new())),
        };
        state.contents.insert(inode, contents);
        drop(state);
        VfsNode::new(name, inode, kind, mode, 0, inode, self.ops(), parent)
    }

    fn insert(&self, dir: &Arc<VfsNode>, name: &str, kind: NodeKind) -> VfsResult<Arc<VfsNode>> {
        if self.find(dir, name).is_some() {
            return Err(VfsError::AlreadyExists);
        }
        let node = self.make_node(name, kind, Some(dir));
        match self.state.lock().contents.get_mut(&dir.private()) {
            Some(Contents::Dir(children)) => children.push(node.clone()),
            _ => return Err(VfsError::NotADirectory),
        }
        Ok(node)
    }

    fn find(&self, dir: &Arc<VfsNode>, name: &str) -> Option<Arc<VfsNode>> {
        match self.state.lock().contents.get(&dir.private()) {
            Some(Contents::Dir(children)) => {
                children.iter().find(|child| child.name() == name).cloned()
            }
            _ => None,
        }
    }

    fn remove(&self, dir: &Arc<VfsNode>, name: &str, want_dir: bool) -> VfsResult<()> {
        let mut state = self.state.lock();
        let victim = match state.contents.get(&dir.private()) {
            Some(Contents::Dir(children)) => children
                .iter()
                .find(|child| child.name() == name)
                .cloned()
                .ok_or(VfsError::NotFound)?,
            _ => return Err(VfsError::NotADirectory),
        };
        match (state.contents.get(&victim.private()), want_dir) {
            (Some(Contents::Dir(children)), true) if !children.is_empty() => {
                return Err(VfsError::NotEmpty)
            }
            (Some(Contents::Dir(_)), false) => return Err(VfsError::IsADirectory),
            (Some(Contents::File(_)), true) => return Err(VfsError::NotADirectory),
            _ => {}
        }
        state.contents.remove(&victim.private());
        if let Some(Contents::Dir(children)) = state.contents.get_mut(&dir.private()) {
            children.retain(|child| !Arc::ptr_eq(child, &victim));
        }
        Ok(())
    }
}

impl NodeOps for RamFs {
    fn open(&self, node: &Arc<VfsNode>, _flags: OpenFlags) -> VfsResult<()> {
        if self.state.lock().contents.contains_key(&node.private()) {
            Ok(())
        } else {
            Err(VfsError::NotFound)
        }
    }

    fn read(&self, node: &Arc<VfsNode>, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let state = self.state.lock();
        let data = match state.contents.get(&node.private()) {
            Some(Contents::File(data)) => data,
            Some(Contents::Dir(_)) => return Err(VfsError::IsADirectory),
            None => return Err(VfsError::NotFound),
        };
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn write(&self, node: &Arc<VfsNode>, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        let mut state = self.state.lock();
        let data = match state.contents.get_mut(&node.private()) {
            Some(Contents::File(data)) => data,
            Some(Contents::Dir(_)) => return Err(VfsError::IsADirectory),
            None => return Err(VfsError::NotFound),
        };
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(VfsError::InvalidOffset)?;
        if end > data.len() {
            data.try_reserve(end - data.len())
                .map_err(|_| VfsError::NoSpace)?;
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        node.set_size(data.len() as u64);
        Ok(buf.len())
    }

    fn readdir(&self, dir: &Arc<VfsNode>, index: usize) -> VfsResult<Option<DirEntry>> {
        match self.state.lock().contents.get(&dir.private()) {
            Some(Contents::Dir(children)) => Ok(children.get(index).map(|child| DirEntry {
                name: child.name().into(),
                inode: child.inode(),
                kind: child.kind(),
            })),
            _ => Err(VfsError::NotADirectory),
        }
    }

    fn finddir(&self, dir: &Arc<VfsNode>, name: &str) -> VfsResult<Arc<VfsNode>> {
        self.find(dir, name).ok_or(VfsError::NotFound)
    }

    fn create(&self, dir: &Arc<VfsNode>, name: &str) -> VfsResult<Arc<VfsNode>> {
        self.insert(dir, name, NodeKind::File)
    }

    fn mkdir(&self, dir: &Arc<VfsNode>, name: &str) -> VfsResult<Arc<VfsNode>> {
        self.insert(dir, name, NodeKind::Directory)
    }

    fn unlink(&self, dir: &Arc<VfsNode>, name: &str) -> VfsResult<()> {
        self.remove(dir, name, false)
    }

    fn rmdir(&self, dir: &Arc<VfsNode>, name: &str) -> VfsResult<()> {
        self.remove(dir, name, true)
    }

    fn truncate(&self, node: &Arc<VfsNode>, size: u64) -> VfsResult<()> {
        match self.state.lock().contents.get_mut(&node.private()) {
            Some(Contents::File(data)) => {
                data.resize(size as usize, 0);
                node.set_size(size);
                Ok(())
            }
            Some(Contents::Dir(_)) => Err(VfsError::IsADirectory),
            None => Err(VfsError::NotFound),
        }
    }
}
