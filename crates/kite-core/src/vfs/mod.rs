//! Virtual filesystem: a node tree with mounts, a path walker and the open
//! file table.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::drivers::DriverError;

mod node;

pub use node::{DirEntry, NodeKind, NodeOps, Stat, VfsNode};

/// Result alias for VFS operations.
pub type VfsResult<T> = core::result::Result<T, VfsError>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VfsError {
    NotFound,
    NotADirectory,
    IsADirectory,
    AlreadyExists,
    NotEmpty,
    InvalidPath,
    BadDescriptor,
    TooManyOpenFiles,
    PermissionDenied,
    Busy,
    NoSpace,
    Io,
    Unsupported,
    InvalidOffset,
}

impl From<DriverError> for VfsError {
    fn from(_: DriverError) -> Self {
        VfsError::Io
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 6;
        const TRUNC = 1 << 9;
        const APPEND = 1 << 10;
        const RDWR = Self::READ.bits() | Self::WRITE.bits();
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Whence {
    Set,
    Current,
    End,
}

/// Capacity of the open file table.
pub const MAX_OPEN_FILES: usize = 64;

pub type Fd = usize;

struct OpenFile {
    node: Arc<VfsNode>,
    offset: u64,
    flags: OpenFlags,
}

struct Mount {
    point: Arc<VfsNode>,
    root: Arc<VfsNode>,
}

pub struct Vfs {
    root: Option<Arc<VfsNode>>,
    cwd: Option<Arc<VfsNode>>,
    mounts: Vec<Mount>,
    files: Vec<Option<OpenFile>>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub const fn new() -> Self {
        Self {
            root: None,
            cwd: None,
            mounts: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Installs the filesystem that backs `/`.
    pub fn mount_root(&mut self, root: Arc<VfsNode>) -> VfsResult<()> {
        if self.root.is_some() {
            return Err(VfsError::Busy);
        }
        if !root.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        info!("[vfs] root mounted ({})", root.name());
        self.cwd = Some(root.clone());
        self.root = Some(root);
        Ok(())
    }

    pub fn root(&self) -> Option<Arc<VfsNode>> {
        self.root.clone()
    }

    pub fn mount(&mut self, path: &str, fs_root: Arc<VfsNode>) -> VfsResult<()> {
        if !fs_root.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        let point = self.lookup(path, false)?;
        if !point.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        if point.mounted().is_some() {
            return Err(VfsError::Busy);
        }
        if self.root.as_ref().is_some_and(|root| Arc::ptr_eq(root, &point)) {
            return Err(VfsError::Busy);
        }

        fs_root.set_covers(Some(&point));
        point.set_mounted(Some(fs_root.clone()));
        self.mounts.push(Mount {
            point,
            root: fs_root,
        });
        info!("[vfs] mounted at {}", path);
        Ok(())
    }

    /// Detaches the filesystem mounted at `path`. Refused while any
    /// descriptor still refers to a node of that filesystem.
    pub fn unmount(&mut self, path: &str) -> VfsResult<()> {
        let target = self.lookup(path, true)?;
        let index = self
            .mounts
            .iter()
            .position(|mount| Arc::ptr_eq(&mount.root, &target))
            .ok_or(VfsError::InvalidPath)?;

        let root = self.mounts[index].root.clone();
        let live = self
            .files
            .iter()
            .flatten()
            .any(|file| file.node.same_fs(&root));
        if live {
            return Err(VfsError::Busy);
        }
        if self.mounts.iter().any(|mount| mount.point.same_fs(&root)) {
            return Err(VfsError::Busy);
        }

        if let Err(err) = self.mounts[index].root.ops().sync() {
            warn!("[vfs] {} not unmounted, flush failed: {:?}", path, err);
            return Err(err);
        }
        let mount = self.mounts.remove(index);
        mount.point.set_mounted(None);
        mount.root.set_covers(None);
        if self.cwd.as_ref().is_some_and(|cwd| cwd.same_fs(&mount.root)) {
            self.cwd = self.root.clone();
        }
        info!("[vfs] unmounted {}", path);
        Ok(())
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.len()
    }

    pub fn resolve(&self, path: &str) -> VfsResult<Arc<VfsNode>> {
        self.lookup(path, true)
    }

    pub fn chdir(&mut self, path: &str) -> VfsResult<()> {
        let node = self.resolve(path)?;
        if !node.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        self.cwd = Some(node);
        Ok(())
    }

    pub fn cwd(&self) -> Option<Arc<VfsNode>> {
        self.cwd.clone()
    }

    /// Walks `path` from the root (absolute) or the working directory.
    /// `follow_last` decides whether a mountpoint in the final position is
    /// replaced by the root mounted over it.
    fn lookup(&self, path: &str, follow_last: bool) -> VfsResult<Arc<VfsNode>> {
        if path.is_empty() {
            return Err(VfsError::InvalidPath);
        }
        let start = if path.starts_with('/') {
            self.root.clone()
        } else {
            self.cwd.clone()
        };
        let mut node = start.ok_or(VfsError::NotFound)?;
        node = follow_mounts(node);

        let mut components = path
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .peekable();
        while let Some(part) = components.next() {
            let last = components.peek().is_none();
            node = if part == ".." {
                parent_of(&node).unwrap_or(node)
            } else {
                if !node.is_directory() {
                    return Err(VfsError::NotADirectory);
                }
                node.ops().finddir(&node, part)?
            };
            if !last || follow_last {
                node = follow_mounts(node);
            }
        }
        Ok(node)
    }

    fn split_parent<'p>(&self, path: &'p str) -> VfsResult<(Arc<VfsNode>, &'p str)> {
        let trimmed = path.trim_end_matches('/');
        let (dir, name) = match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
            None => (".", trimmed),
        };
        if name.is_empty() || name == "." || name == ".." {
            return Err(VfsError::InvalidPath);
        }
        let parent = self.resolve(dir)?;
        if !parent.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        Ok((parent, name))
    }

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> VfsResult<Fd> {
        let slot = self.free_slot()?;

        let node = match self.resolve(path) {
            Ok(node) => node,
            Err(VfsError::NotFound) if flags.contains(OpenFlags::CREATE) => {
                let (parent, name) = self.split_parent(path)?;
                parent.ops().create(&parent, name)?
            }
            Err(err) => return Err(err),
        };

        let writing = flags.intersects(OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::TRUNC);
        if node.is_directory() && writing {
            return Err(VfsError::IsADirectory);
        }
        if writing && !node.writable() {
            return Err(VfsError::PermissionDenied);
        }
        if flags.contains(OpenFlags::TRUNC) && node.kind() == NodeKind::File {
            node.ops().truncate(&node, 0)?;
        }

        node.ops().open(&node, flags)?;
        node.retain_open();
        debug!("[vfs] open {} -> fd {}", path, slot);
        self.files[slot] = Some(OpenFile {
            node,
            offset: 0,
            flags,
        });
        Ok(slot)
    }

    pub fn close(&mut self, fd: Fd) -> VfsResult<()> {
        let file = self
            .files
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(VfsError::BadDescriptor)?;
        file.node.ops().close(&file.node);
        file.node.release_open();
        Ok(())
    }

    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> VfsResult<usize> {
        let file = self.file_mut(fd)?;
        if !file.flags.contains(OpenFlags::READ) {
            return Err(VfsError::PermissionDenied);
        }
        if file.node.is_directory() {
            return Err(VfsError::IsADirectory);
        }
        let count = file.node.ops().read(&file.node, file.offset, buf)?;
        file.offset += count as u64;
        Ok(count)
    }

    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> VfsResult<usize> {
        let file = self.file_mut(fd)?;
        if !file.flags.intersects(OpenFlags::WRITE | OpenFlags::APPEND) {
            return Err(VfsError::PermissionDenied);
        }
        if file.flags.contains(OpenFlags::APPEND) {
            file.offset = file.node.size();
        }
        let count = file.node.ops().write(&file.node, file.offset, buf)?;
        file.offset += count as u64;
        Ok(count)
    }

    /// Moves the descriptor offset; a negative result clamps to zero.
    pub fn seek(&mut self, fd: Fd, offset: i64, whence: Whence) -> VfsResult<u64> {
        let file = self.file_mut(fd)?;
        let base = match whence {
            Whence::Set => 0i64,
            Whence::Current => file.offset as i64,
            Whence::End => file.node.size() as i64,
        };
        let target = base.saturating_add(offset).max(0) as u64;
        file.offset = target;
        Ok(target)
    }

    pub fn tell(&self, fd: Fd) -> VfsResult<u64> {
        self.files
            .get(fd)
            .and_then(Option::as_ref)
            .map(|file| file.offset)
            .ok_or(VfsError::BadDescriptor)
    }

    /// Entry `index` of the directory open at `fd`, `None` past the end.
    pub fn readdir(&self, fd: Fd, index: usize) -> VfsResult<Option<DirEntry>> {
        let file = self
            .files
            .get(fd)
            .and_then(Option::as_ref)
            .ok_or(VfsError::BadDescriptor)?;
        if !file.node.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        file.node.ops().readdir(&file.node, index)
    }

    pub fn open_files(&self) -> usize {
        self.files.iter().flatten().count()
    }

    pub fn create(&mut self, path: &str) -> VfsResult<Arc<VfsNode>> {
        let (parent, name) = self.split_parent(path)?;
        if parent.ops().finddir(&parent, name).is_ok() {
            return Err(VfsError::AlreadyExists);
        }
        parent.ops().create(&parent, name)
    }

    pub fn mkdir(&mut self, path: &str) -> VfsResult<Arc<VfsNode>> {
        let (parent, name) = self.split_parent(path)?;
        if parent.ops().finddir(&parent, name).is_ok() {
            return Err(VfsError::AlreadyExists);
        }
        parent.ops().mkdir(&parent, name)
    }

    pub fn unlink(&mut self, path: &str) -> VfsResult<()> {
        let (parent, name) = self.split_parent(path)?;
        let node = parent.ops().finddir(&parent, name)?;
        if node.is_directory() {
            return Err(VfsError::IsADirectory);
        }
        if node.open_count() > 0 {
            return Err(VfsError::Busy);
        }
        parent.ops().unlink(&parent, name)
    }

    pub fn rmdir(&mut self, path: &str) -> VfsResult<()> {
        let (parent, name) = self.split_parent(path)?;
        let node = parent.ops().finddir(&parent, name)?;
        if !node.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        if node.mounted().is_some() || node.open_count() > 0 {
            return Err(VfsError::Busy);
        }
        parent.ops().rmdir(&parent, name)
    }

    pub fn stat(&self, path: &str) -> VfsResult<Stat> {
        self.resolve(path).map(|node| node.stat())
    }

    /// Reads a whole file without touching the descriptor table.
    pub fn read_all(&self, path: &str) -> VfsResult<Vec<u8>> {
        let node = self.resolve(path)?;
        if node.is_directory() {
            return Err(VfsError::IsADirectory);
        }
        let size = node.size() as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| VfsError::NoSpace)?;
        data.resize(size, 0);

        let mut filled = 0;
        while filled < size {
            let count = node.ops().read(&node, filled as u64, &mut data[filled..])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        data.truncate(filled);
        Ok(data)
    }

    /// Flushes every mounted filesystem.
    pub fn sync(&self) -> VfsResult<()> {
        if let Some(root) = &self.root {
            root.ops().sync()?;
        }
        for mount in &self.mounts {
            mount.root.ops().sync()?;
        }
        Ok(())
    }

    fn free_slot(&mut self) -> VfsResult<Fd> {
        if let Some(index) = self.files.iter().position(Option::is_none) {
            return Ok(index);
        }
        if self.files.len() >= MAX_OPEN_FILES {
            return Err(VfsError::TooManyOpenFiles);
        }
        self.files.push(None);
        Ok(self.files.len() - 1)
    }

    fn file_mut(&mut self, fd: Fd) -> VfsResult<&mut OpenFile> {
        self.files
            .get_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(VfsError::BadDescriptor)
    }
}

fn follow_mounts(mut node: Arc<VfsNode>) -> Arc<VfsNode> {
    while let Some(root) = node.mounted() {
        node = root;
    }
    node
}

/// `..` of a mounted root is the parent of the directory it covers.
fn parent_of(node: &Arc<VfsNode>) -> Option<Arc<VfsNode>> {
    match node.covers() {
        Some(point) => point.parent().or(Some(point)),
        None => node.parent(),
    }
}
