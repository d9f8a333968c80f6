use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::{OpenFlags, VfsError, VfsResult};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NodeKind {
    File,
    Directory,
    CharDevice,
    BlockDevice,
    Pipe,
    Symlink,
    Mountpoint,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub inode: u64,
    pub kind: NodeKind,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Stat {
    pub inode: u64,
    pub kind: NodeKind,
    pub size: u64,
    pub mode: u16,
    pub open_count: usize,
}

/// Operations a filesystem provides for its nodes.
///
/// Every method has a default that reports [`VfsError::Unsupported`], so a
/// driver only implements what its node types support.
pub trait NodeOps: Send + Sync {
    fn open(&self, _node: &Arc<VfsNode>, _flags: OpenFlags) -> VfsResult<()> {
        Ok(())
    }

    fn close(&self, _node: &Arc<VfsNode>) {}

    fn read(&self, _node: &Arc<VfsNode>, _offset: u64, _buf: &mut [u8]) -> VfsResult<usize> {
        Err(VfsError::Unsupported)
    }

    fn write(&self, _node: &Arc<VfsNode>, _offset: u64, _buf: &[u8]) -> VfsResult<usize> {
        Err(VfsError::Unsupported)
    }

    fn readdir(&self, _dir: &Arc<VfsNode>, _index: usize) -> VfsResult<Option<DirEntry>> {
        Err(VfsError::Unsupported)
    }

    fn finddir(&self, _dir: &Arc<VfsNode>, _name: &str) -> VfsResult<Arc<VfsNode>> {
        Err(VfsError::Unsupported)
    }

    fn create(&self, _dir: &Arc<VfsNode>, _name: &str) -> VfsResult<Arc<VfsNode>> {
        Err(VfsError::Unsupported)
    }

    fn unlink(&self, _dir: &Arc<VfsNode>, _name: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    fn mkdir(&self, _dir: &Arc<VfsNode>, _name: &str) -> VfsResult<Arc<VfsNode>> {
        Err(VfsError::Unsupported)
    }

    fn rmdir(&self, _dir: &Arc<VfsNode>, _name: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    fn truncate(&self, _node: &Arc<VfsNode>, _size: u64) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    fn sync(&self) -> VfsResult<()> {
        Ok(())
    }
}

struct NodeMeta {
    size: u64,
    private: u64,
}

pub struct VfsNode {
    name: String,
    inode: u64,
    kind: NodeKind,
    mode: u16,
    meta: Mutex<NodeMeta>,
    open_count: AtomicUsize,
    ops: Arc<dyn NodeOps>,
    parent: Mutex<Weak<VfsNode>>,
    mounted: Mutex<Option<Arc<VfsNode>>>,
    covers: Mutex<Weak<VfsNode>>,
}

impl VfsNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        inode: u64,
        kind: NodeKind,
        mode: u16,
        size: u64,
        private: u64,
        ops: Arc<dyn NodeOps>,
        parent: Option<&Arc<VfsNode>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            inode,
            kind,
            mode,
            meta: Mutex::new(NodeMeta { size, private }),
            open_count: AtomicUsize::new(0),
            ops,
            parent: Mutex::new(parent.map(Arc::downgrade).unwrap_or_default()),
            mounted: Mutex::new(None),
            covers: Mutex::new(Weak::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Reports `Mountpoint` while another filesystem is mounted here.
    pub fn kind(&self) -> NodeKind {
        if self.mounted.lock().is_some() {
            NodeKind::Mountpoint
        } else {
            self.kind
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    pub fn mode(&self) -> u16 {
        self.mode
    }

    pub fn writable(&self) -> bool {
        self.mode & 0o222 != 0
    }

    pub fn size(&self) -> u64 {
        self.meta.lock().size
    }

    pub fn set_size(&self, size: u64) {
        self.meta.lock().size = size;
    }

    /// Filesystem-private word (first cluster, backing index, ...).
    pub fn private(&self) -> u64 {
        self.meta.lock().private
    }

    pub fn set_private(&self, private: u64) {
        self.meta.lock().private = private;
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::Acquire)
    }

    pub(super) fn retain_open(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn release_open(&self) {
        let _ = self
            .open_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    }

    pub fn ops(&self) -> &Arc<dyn NodeOps> {
        &self.ops
    }

    /// True when both nodes belong to the same filesystem instance.
    pub fn same_fs(&self, other: &VfsNode) -> bool {
        Arc::as_ptr(&self.ops) as *const () == Arc::as_ptr(&other.ops) as *const ()
    }

    pub fn parent(&self) -> Option<Arc<VfsNode>> {
        self.parent.lock().upgrade()
    }

    pub fn set_parent(&self, parent: &Arc<VfsNode>) {
        *self.parent.lock() = Arc::downgrade(parent);
    }

    pub fn mounted(&self) -> Option<Arc<VfsNode>> {
        self.mounted.lock().clone()
    }

    pub(super) fn set_mounted(&self, root: Option<Arc<VfsNode>>) {
        *self.mounted.lock() = root;
    }

    /// Mountpoint this filesystem root is mounted over, if any.
    pub fn covers(&self) -> Option<Arc<VfsNode>> {
        self.covers.lock().upgrade()
    }

    pub(super) fn set_covers(&self, point: Option<&Arc<VfsNode>>) {
        *self.covers.lock() = point.map(Arc::downgrade).unwrap_or_default();
    }

    pub fn stat(&self) -> Stat {
        Stat {
            inode: self.inode,
            kind: self.kind(),
            size: self.size(),
            mode: self.mode,
            open_count: self.open_count(),
        }
    }
}

impl core::fmt::Debug for VfsNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VfsNode")
            .field("name", &self.name)
            .field("inode", &self.inode)
            .field("kind", &self.kind)
            .field("size", &self.size())
            .finish()
    }
}
