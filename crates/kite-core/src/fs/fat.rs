//! FAT16 filesystem.
//!
//! One copy of the FAT lives in memory and is the source of truth; every
//! mutation marks it dirty and `sync` writes it to each on-disk copy.
//! Directory entries are patched in place. A node's inode is the location of
//! its directory entry (`lba * 16 + slot`) and its private word is the first
//! cluster.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;

use core::cmp;

use log::{debug, info, warn};
use spin::Mutex;

use crate::drivers::{BlockDevice, DriverError};
use crate::vfs::{DirEntry, NodeKind, NodeOps, OpenFlags, VfsError, VfsNode, VfsResult};

pub const SECTOR_SIZE: usize = 512;
pub const DIR_ENTRY_SIZE: usize = 32;
const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / DIR_ENTRY_SIZE;
const SHORT_NAME_LEN: usize = 11;

const FAT16_END: u16 = 0xFFF8;
const FAT16_EOC: u16 = 0xFFFF;
const FAT16_MAX_CLUSTERS: u32 = 65_524;

/// Dead cache entries are swept once the cache reaches this size.
const NODE_CACHE_SWEEP: usize = 64;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_LONG_NAME: u8 = 0x0F;

const ENTRY_END: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xE5;

const ROOT_INODE: u64 = 1;

const DOT: [u8; SHORT_NAME_LEN] = *b".          ";
const DOT_DOT: [u8; SHORT_NAME_LEN] = *b"..         ";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FatError {
    BadSignature,
    UnsupportedGeometry,
    InvalidName,
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    NotEmpty,
    DirectoryFull,
    NoSpace,
    Corrupted,
    Io,
}

impl From<DriverError> for FatError {
    fn from(_: DriverError) -> Self {
        FatError::Io
    }
}

impl From<FatError> for VfsError {
    fn from(err: FatError) -> Self {
        match err {
            FatError::InvalidName => VfsError::InvalidPath,
            FatError::NotFound => VfsError::NotFound,
            FatError::AlreadyExists => VfsError::AlreadyExists,
            FatError::NotADirectory => VfsError::NotADirectory,
            FatError::IsADirectory => VfsError::IsADirectory,
            FatError::NotEmpty => VfsError::NotEmpty,
            FatError::DirectoryFull | FatError::NoSpace => VfsError::NoSpace,
            FatError::BadSignature
            | FatError::UnsupportedGeometry
            | FatError::Corrupted
            | FatError::Io => VfsError::Io,
        }
    }
}

/// Layout derived from the boot sector. LBAs are absolute on the device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    pub start_lba: u64,
    pub bytes_per_sector: usize,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entries: u16,
    pub sectors_per_fat: u16,
    pub total_sectors: u32,
    pub fat_lba: u64,
    pub root_dir_lba: u64,
    pub root_dir_sectors: u32,
    pub data_lba: u64,
    pub cluster_count: u32,
    pub bytes_per_cluster: usize,
}

impl Geometry {
    fn parse(sector: &[u8; SECTOR_SIZE], start_lba: u64) -> Result<Self, FatError> {
        if sector[510] != 0x55 || sector[511] != 0xAA {
            return Err(FatError::BadSignature);
        }

        let bytes_per_sector = u16::from_le_bytes([sector[11], sector[12]]) as usize;
        let sectors_per_cluster = sector[13];
        let reserved_sectors = u16::from_le_bytes([sector[14], sector[15]]);
        let num_fats = sector[16];
        let root_entries = u16::from_le_bytes([sector[17], sector[18]]);
        let small_total = u16::from_le_bytes([sector[19], sector[20]]);
        let sectors_per_fat = u16::from_le_bytes([sector[22], sector[23]]);
        let large_total = u32::from_le_bytes([sector[32], sector[33], sector[34], sector[35]]);
        let total_sectors = if small_total != 0 {
            small_total as u32
        } else {
            large_total
        };

        if bytes_per_sector != SECTOR_SIZE
            || sectors_per_cluster == 0
            || !sectors_per_cluster.is_power_of_two()
            || reserved_sectors == 0
            || num_fats == 0
            || sectors_per_fat == 0
            || root_entries == 0
        {
            return Err(FatError::UnsupportedGeometry);
        }

        let fat_lba = start_lba + reserved_sectors as u64;
        let root_dir_lba = fat_lba + num_fats as u64 * sectors_per_fat as u64;
        let root_dir_sectors = (root_entries as u32 * DIR_ENTRY_SIZE as u32).div_ceil(SECTOR_SIZE as u32);
        let data_lba = root_dir_lba + root_dir_sectors as u64;
        let data_sectors = (total_sectors as u64)
            .checked_sub(data_lba - start_lba)
            .ok_or(FatError::UnsupportedGeometry)?;
        let cluster_count = (data_sectors / sectors_per_cluster as u64) as u32;

        let fat_capacity = sectors_per_fat as u32 * (SECTOR_SIZE as u32 / 2);
        if cluster_count == 0 || cluster_count > FAT16_MAX_CLUSTERS || cluster_count + 2 > fat_capacity {
            return Err(FatError::UnsupportedGeometry);
        }

        Ok(Self {
            start_lba,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            root_entries,
            sectors_per_fat,
            total_sectors,
            fat_lba,
            root_dir_lba,
            root_dir_sectors,
            data_lba,
            cluster_count,
            bytes_per_cluster: bytes_per_sector * sectors_per_cluster as usize,
        })
    }

    fn cluster_to_lba(&self, cluster: u16) -> u64 {
        self.data_lba + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    fn fat_bytes(&self) -> usize {
        self.sectors_per_fat as usize * SECTOR_SIZE
    }
}

/// The in-memory FAT.
struct FatTable {
    entries: Vec<u16>,
    cluster_count: u32,
    free: u32,
    dirty: bool,
}

impl FatTable {
    fn from_bytes(bytes: &[u8], cluster_count: u32) -> Self {
        let entries: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let free = (2..cluster_count + 2)
            .filter(|&cluster| entries[cluster as usize] == 0)
            .count() as u32;
        Self {
            entries,
            cluster_count,
            free,
            dirty: false,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.entries.iter().flat_map(|entry| entry.to_le_bytes()).collect()
    }

    fn in_bounds(&self, cluster: u16) -> bool {
        cluster >= 2 && (cluster as u32) < self.cluster_count + 2
    }

    fn set(&mut self, cluster: u16, value: u16) {
        self.entries[cluster as usize] = value;
        self.dirty = true;
    }

    fn next(&self, cluster: u16) -> Result<Option<u16>, FatError> {
        let value = self.entries[cluster as usize];
        if value >= FAT16_END {
            Ok(None)
        } else if self.in_bounds(value) {
            Ok(Some(value))
        } else {
            warn!("[fat] cluster {} links to invalid value {:#06x}", cluster, value);
            Err(FatError::Corrupted)
        }
    }

    /// Every cluster of the chain starting at `first`, in order.
    fn chain(&self, first: u16) -> Result<Vec<u16>, FatError> {
        let mut clusters = Vec::new();
        if first == 0 {
            return Ok(clusters);
        }
        if !self.in_bounds(first) {
            return Err(FatError::Corrupted);
        }
        let mut cluster = first;
        loop {
            clusters.push(cluster);
            if clusters.len() as u32 > self.cluster_count {
                return Err(FatError::Corrupted);
            }
            match self.next(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(clusters),
            }
        }
    }

    /// First free cluster, marked end-of-chain.
    fn allocate(&mut self) -> Result<u16, FatError> {
        let cluster = (2..self.cluster_count + 2)
            .map(|cluster| cluster as u16)
            .find(|&cluster| self.entries[cluster as usize] == 0)
            .ok_or(FatError::NoSpace)?;
        self.set(cluster, FAT16_EOC);
        self.free -= 1;
        Ok(cluster)
    }

    /// Frees `chain[keep..]` and ends the chain at `chain[keep - 1]`.
    fn cut(&mut self, chain: &[u16], keep: usize) {
        if keep >= chain.len() {
            return;
        }
        for &cluster in &chain[keep..] {
            self.set(cluster, 0);
        }
        self.free += (chain.len() - keep) as u32;
        if keep > 0 {
            self.set(chain[keep - 1], FAT16_EOC);
        }
    }

    fn release_chain(&mut self, first: u16) -> Result<usize, FatError> {
        let clusters = self.chain(first)?;
        for &cluster in &clusters {
            self.set(cluster, 0);
        }
        self.free += clusters.len() as u32;
        Ok(clusters.len())
    }
}

/// A live entry read from a directory.
#[derive(Debug, Copy, Clone)]
struct RawEntry {
    lba: u64,
    slot: usize,
    name: [u8; SHORT_NAME_LEN],
    attr: u8,
    cluster: u16,
    size: u32,
}

impl RawEntry {
    fn parse(lba: u64, slot: usize, bytes: &[u8]) -> Self {
        let mut name = [0u8; SHORT_NAME_LEN];
        name.copy_from_slice(&bytes[..SHORT_NAME_LEN]);
        Self {
            lba,
            slot,
            name,
            attr: bytes[11],
            cluster: u16::from_le_bytes([bytes[26], bytes[27]]),
            size: u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]),
        }
    }

    fn inode(&self) -> u64 {
        self.lba * ENTRIES_PER_SECTOR as u64 + self.slot as u64
    }

    fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    fn is_dot(&self) -> bool {
        self.name == DOT || self.name == DOT_DOT
    }

    fn kind(&self) -> NodeKind {
        if self.is_dir() {
            NodeKind::Directory
        } else {
            NodeKind::File
        }
    }

    fn mode(&self) -> u16 {
        match (self.is_dir(), self.attr & ATTR_READ_ONLY != 0) {
            (true, _) => 0o755,
            (false, true) => 0o444,
            (false, false) => 0o644,
        }
    }
}

fn encode_entry(name: &[u8; SHORT_NAME_LEN], attr: u8, cluster: u16, size: u32) -> [u8; DIR_ENTRY_SIZE] {
    let mut entry = [0u8; DIR_ENTRY_SIZE];
    entry[..SHORT_NAME_LEN].copy_from_slice(name);
    entry[11] = attr;
    entry[26..28].copy_from_slice(&cluster.to_le_bytes());
    entry[28..32].copy_from_slice(&size.to_le_bytes());
    entry
}

/// Live nodes by directory-entry location, so repeated lookups share one
/// node. Entries whose node has been dropped are swept as the map grows.
struct NodeCache {
    nodes: BTreeMap<u64, Weak<VfsNode>>,
    sweep_at: usize,
}

impl NodeCache {
    fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            sweep_at: NODE_CACHE_SWEEP,
        }
    }

    fn get(&self, inode: u64) -> Option<Arc<VfsNode>> {
        self.nodes.get(&inode).and_then(Weak::upgrade)
    }

    fn insert(&mut self, inode: u64, node: &Arc<VfsNode>) {
        if self.nodes.len() >= self.sweep_at {
            self.nodes.retain(|_, node| node.strong_count() > 0);
            self.sweep_at = cmp::max(NODE_CACHE_SWEEP, self.nodes.len() * 2);
        }
        self.nodes.insert(inode, Arc::downgrade(node));
    }

    fn remove(&mut self, inode: u64) {
        self.nodes.remove(&inode);
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

pub struct FatVolume {
    device: &'static dyn BlockDevice,
    geometry: Geometry,
    table: Mutex<FatTable>,
    nodes: Mutex<NodeCache>,
    this: Weak<FatVolume>,
}

impl FatVolume {
    fn load(device: &'static dyn BlockDevice, start_lba: u64) -> Result<Arc<Self>, FatError> {
        let mut sector = [0u8; SECTOR_SIZE];
        device.read_blocks(start_lba, &mut sector)?;
        let geometry = Geometry::parse(&sector, start_lba)?;

        let fat_bytes = geometry.fat_bytes();
        let mut primary = vec![0u8; fat_bytes];
        device.read_blocks(geometry.fat_lba, &mut primary)?;
        let mut copy = vec![0u8; fat_bytes];
        for index in 1..geometry.num_fats as u64 {
            device.read_blocks(geometry.fat_lba + index * geometry.sectors_per_fat as u64, &mut copy)?;
            if copy != primary {
                warn!("[fat] FAT copy {} differs from the primary; using the primary", index);
            }
        }

        let table = FatTable::from_bytes(&primary, geometry.cluster_count);
        info!(
            "[fat] mounted at LBA {}: {} clusters of {} bytes, {} free",
            start_lba, geometry.cluster_count, geometry.bytes_per_cluster, table.free
        );

        Ok(Arc::new_cyclic(|this| Self {
            device,
            geometry,
            table: Mutex::new(table),
            nodes: Mutex::new(NodeCache::new()),
            this: this.clone(),
        }))
    }

    fn ops(&self) -> VfsResult<Arc<dyn NodeOps>> {
        let volume: Arc<dyn NodeOps> = self.this.upgrade().ok_or(VfsError::Io)?;
        Ok(volume)
    }

    fn read_sector(&self, lba: u64, buffer: &mut [u8; SECTOR_SIZE]) -> Result<(), FatError> {
        Ok(self.device.read_blocks(lba, buffer)?)
    }

    fn write_sector(&self, lba: u64, buffer: &[u8; SECTOR_SIZE]) -> Result<(), FatError> {
        Ok(self.device.write_blocks(lba, buffer)?)
    }

    fn read_cluster(&self, cluster: u16, buffer: &mut [u8]) -> Result<(), FatError> {
        debug!("[fat] read cluster {}", cluster);
        Ok(self.device.read_blocks(self.geometry.cluster_to_lba(cluster), buffer)?)
    }

    fn write_cluster(&self, cluster: u16, buffer: &[u8]) -> Result<(), FatError> {
        debug!("[fat] write cluster {}", cluster);
        Ok(self.device.write_blocks(self.geometry.cluster_to_lba(cluster), buffer)?)
    }

    /// Zeroes a fresh directory cluster and writes its `.` and `..` entries.
    fn init_directory(&self, cluster: u16, parent: u16) -> Result<(), FatError> {
        self.zero_cluster(cluster)?;
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..DIR_ENTRY_SIZE].copy_from_slice(&encode_entry(&DOT, ATTR_DIRECTORY, cluster, 0));
        sector[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(&encode_entry(&DOT_DOT, ATTR_DIRECTORY, parent, 0));
        self.write_sector(self.geometry.cluster_to_lba(cluster), &sector)
    }

    fn zero_cluster(&self, cluster: u16) -> Result<(), FatError> {
        self.write_cluster(cluster, &vec![0u8; self.geometry.bytes_per_cluster])
    }

    /// Writes the in-memory FAT to every on-disk copy.
    fn flush_table(&self, table: &mut FatTable) -> Result<(), FatError> {
        if !table.dirty {
            return Ok(());
        }
        let bytes = table.to_bytes();
        for index in 0..self.geometry.num_fats as u64 {
            let lba = self.geometry.fat_lba + index * self.geometry.sectors_per_fat as u64;
            self.device.write_blocks(lba, &bytes)?;
        }
        self.device.flush()?;
        table.dirty = false;
        debug!("[fat] synced {} FAT copies", self.geometry.num_fats);
        Ok(())
    }

    /// Sectors holding the directory whose first cluster is `dir_cluster`
    /// (zero for the fixed root directory).
    fn dir_sectors(&self, table: &FatTable, dir_cluster: u16) -> Result<Vec<u64>, FatError> {
        if dir_cluster == 0 {
            let root = self.geometry.root_dir_lba;
            return Ok((root..root + self.geometry.root_dir_sectors as u64).collect());
        }
        let per_cluster = self.geometry.sectors_per_cluster as u64;
        Ok(table
            .chain(dir_cluster)?
            .into_iter()
            .flat_map(|cluster| {
                let lba = self.geometry.cluster_to_lba(cluster);
                lba..lba + per_cluster
            })
            .collect())
    }

    /// Live entries of a directory, stopping at the end marker.
    fn scan(&self, table: &FatTable, dir_cluster: u16) -> Result<Vec<RawEntry>, FatError> {
        let mut entries = Vec::new();
        let mut sector = [0u8; SECTOR_SIZE];
        for lba in self.dir_sectors(table, dir_cluster)? {
            self.read_sector(lba, &mut sector)?;
            for slot in 0..ENTRIES_PER_SECTOR {
                let bytes = &sector[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE];
                match bytes[0] {
                    ENTRY_END => return Ok(entries),
                    ENTRY_DELETED => continue,
                    _ => {}
                }
                if bytes[11] == ATTR_LONG_NAME || bytes[11] & ATTR_VOLUME_ID != 0 {
                    continue;
                }
                entries.push(RawEntry::parse(lba, slot, bytes));
            }
        }
        Ok(entries)
    }

    fn lookup(&self, table: &FatTable, dir_cluster: u16, name: &str) -> Result<RawEntry, FatError> {
        let short = format_short_name(name).ok_or(FatError::InvalidName)?;
        self.scan(table, dir_cluster)?
            .into_iter()
            .find(|entry| entry.name == short)
            .ok_or(FatError::NotFound)
    }

    /// First reusable slot; grows a sub-directory by one cluster when full.
    fn free_slot(&self, table: &mut FatTable, dir_cluster: u16) -> Result<(u64, usize), FatError> {
        let mut sector = [0u8; SECTOR_SIZE];
        for lba in self.dir_sectors(table, dir_cluster)? {
            self.read_sector(lba, &mut sector)?;
            for slot in 0..ENTRIES_PER_SECTOR {
                let first = sector[slot * DIR_ENTRY_SIZE];
                if first == ENTRY_END || first == ENTRY_DELETED {
                    return Ok((lba, slot));
                }
            }
        }

        if dir_cluster == 0 {
            return Err(FatError::DirectoryFull);
        }
        let chain = table.chain(dir_cluster)?;
        let tail = *chain.last().ok_or(FatError::Corrupted)?;
        let fresh = table.allocate()?;
        if let Err(err) = self.zero_cluster(fresh) {
            table.cut(&[fresh], 0);
            return Err(err);
        }
        table.set(tail, fresh);
        Ok((self.geometry.cluster_to_lba(fresh), 0))
    }

    fn write_entry(&self, lba: u64, slot: usize, entry: &[u8; DIR_ENTRY_SIZE]) -> Result<(), FatError> {
        let mut sector = [0u8; SECTOR_SIZE];
        self.read_sector(lba, &mut sector)?;
        sector[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE].copy_from_slice(entry);
        self.write_sector(lba, &sector)
    }

    /// Rewrites the first-cluster and size fields of the entry at `inode`.
    fn patch_entry(&self, inode: u64, cluster: u16, size: u32) -> Result<(), FatError> {
        let lba = inode / ENTRIES_PER_SECTOR as u64;
        let slot = (inode % ENTRIES_PER_SECTOR as u64) as usize;
        let mut sector = [0u8; SECTOR_SIZE];
        self.read_sector(lba, &mut sector)?;
        let base = slot * DIR_ENTRY_SIZE;
        sector[base + 26..base + 28].copy_from_slice(&cluster.to_le_bytes());
        sector[base + 28..base + 32].copy_from_slice(&size.to_le_bytes());
        self.write_sector(lba, &sector)
    }

    fn mark_deleted(&self, entry: &RawEntry) -> Result<(), FatError> {
        let mut sector = [0u8; SECTOR_SIZE];
        self.read_sector(entry.lba, &mut sector)?;
        sector[entry.slot * DIR_ENTRY_SIZE] = ENTRY_DELETED;
        self.write_sector(entry.lba, &sector)
    }

    fn node_for(&self, entry: &RawEntry, parent: &Arc<VfsNode>) -> VfsResult<Arc<VfsNode>> {
        let inode = entry.inode();
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get(inode) {
            node.set_parent(parent);
            return Ok(node);
        }
        let size = if entry.is_dir() { 0 } else { entry.size as u64 };
        let node = VfsNode::new(
            &decode_short_name(&entry.name),
            inode,
            entry.kind(),
            entry.mode(),
            size,
            entry.cluster as u64,
            self.ops()?,
            Some(parent),
        );
        nodes.insert(inode, &node);
        Ok(node)
    }

    fn forget(&self, inode: u64) {
        self.nodes.lock().remove(inode);
    }

    fn insert_entry(
        &self,
        table: &mut FatTable,
        dir: &Arc<VfsNode>,
        name: &str,
        attr: u8,
        cluster: u16,
    ) -> Result<RawEntry, FatError> {
        let short = format_short_name(name).ok_or(FatError::InvalidName)?;
        let dir_cluster = dir_cluster(dir);
        match self.lookup(table, dir_cluster, name) {
            Ok(_) => return Err(FatError::AlreadyExists),
            Err(FatError::NotFound) => {}
            Err(err) => return Err(err),
        }
        let (lba, slot) = self.free_slot(table, dir_cluster)?;
        self.write_entry(lba, slot, &encode_entry(&short, attr, cluster, 0))?;
        Ok(RawEntry {
            lba,
            slot,
            name: short,
            attr,
            cluster,
            size: 0,
        })
    }

    fn remove_entry(&self, dir: &Arc<VfsNode>, name: &str, want_dir: bool) -> Result<(), FatError> {
        let mut table = self.table.lock();
        let entry = self.lookup(&table, dir_cluster(dir), name)?;
        if entry.is_dot() {
            return Err(FatError::InvalidName);
        }
        match (entry.is_dir(), want_dir) {
            (true, false) => return Err(FatError::IsADirectory),
            (false, true) => return Err(FatError::NotADirectory),
            (true, true) => {
                let busy = self
                    .scan(&table, entry.cluster)?
                    .iter()
                    .any(|child| !child.is_dot());
                if busy {
                    return Err(FatError::NotEmpty);
                }
            }
            (false, false) => {}
        }

        self.mark_deleted(&entry)?;
        let freed = table.release_chain(entry.cluster)?;
        self.flush_table(&mut table)?;
        self.forget(entry.inode());
        debug!("[fat] removed {} ({} clusters)", name, freed);
        Ok(())
    }

    fn read_file(&self, node: &VfsNode, offset: u64, buf: &mut [u8]) -> Result<usize, FatError> {
        let size = node.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let total = cmp::min(buf.len() as u64, size - offset) as usize;
        let cluster_bytes = self.geometry.bytes_per_cluster;
        let chain = self.table.lock().chain(node.private() as u16)?;

        let mut staging = vec![0u8; cluster_bytes];
        let mut done = 0;
        let mut position = offset;
        while done < total {
            let index = (position / cluster_bytes as u64) as usize;
            let within = (position % cluster_bytes as u64) as usize;
            let cluster = match chain.get(index) {
                Some(&cluster) => cluster,
                None => break,
            };
            self.read_cluster(cluster, &mut staging)?;
            let count = cmp::min(cluster_bytes - within, total - done);
            buf[done..done + count].copy_from_slice(&staging[within..within + count]);
            done += count;
            position += count as u64;
        }
        Ok(done)
    }

    fn write_file(&self, node: &VfsNode, offset: u64, buf: &[u8]) -> Result<usize, FatError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= u32::MAX as u64)
            .ok_or(FatError::NoSpace)?;
        let cluster_bytes = self.geometry.bytes_per_cluster;
        let size = node.size();

        let mut table = self.table.lock();
        let mut chain = table.chain(node.private() as u16)?;
        let existing = chain.len();
        let needed = cmp::max(end, size).div_ceil(cluster_bytes as u64) as usize;
        if needed.saturating_sub(existing) as u64 > table.free as u64 {
            return Err(FatError::NoSpace);
        }

        let written = self
            .extend_chain(&mut table, &mut chain, needed)
            .and_then(|()| self.write_clusters(&chain, offset, buf));
        let done = match written {
            Ok(done) => done,
            Err(err) => {
                table.cut(&chain, existing);
                return Err(err);
            }
        };

        let first = chain.first().copied().unwrap_or(0);
        let new_size = cmp::max(size, end);
        node.set_private(first as u64);
        node.set_size(new_size);
        self.patch_entry(node.inode(), first, new_size as u32)?;
        self.flush_table(&mut table)?;
        Ok(done)
    }

    /// Grows `chain` to `needed` zeroed clusters. Clusters added before a
    /// failure stay in `chain` so the caller can cut them back.
    fn extend_chain(&self, table: &mut FatTable, chain: &mut Vec<u16>, needed: usize) -> Result<(), FatError> {
        while chain.len() < needed {
            let fresh = table.allocate()?;
            if let Some(&tail) = chain.last() {
                table.set(tail, fresh);
            }
            chain.push(fresh);
            self.zero_cluster(fresh)?;
        }
        Ok(())
    }

    fn write_clusters(&self, chain: &[u16], offset: u64, buf: &[u8]) -> Result<usize, FatError> {
        let cluster_bytes = self.geometry.bytes_per_cluster;
        let mut staging = vec![0u8; cluster_bytes];
        let mut done = 0;
        let mut position = offset;
        while done < buf.len() {
            let cluster = *chain
                .get((position / cluster_bytes as u64) as usize)
                .ok_or(FatError::Corrupted)?;
            let within = (position % cluster_bytes as u64) as usize;
            let count = cmp::min(cluster_bytes - within, buf.len() - done);
            if count < cluster_bytes {
                self.read_cluster(cluster, &mut staging)?;
            }
            staging[within..within + count].copy_from_slice(&buf[done..done + count]);
            self.write_cluster(cluster, &staging)?;
            done += count;
            position += count as u64;
        }
        Ok(done)
    }

    fn truncate_file(&self, node: &VfsNode, size: u64) -> Result<(), FatError> {
        let current = node.size();
        if size > current {
            let zeros = vec![0u8; (size - current) as usize];
            self.write_file(node, current, &zeros)?;
            return Ok(());
        }

        let cluster_bytes = self.geometry.bytes_per_cluster as u64;
        let keep = size.div_ceil(cluster_bytes) as usize;
        let mut table = self.table.lock();
        let mut first = node.private() as u16;
        let chain = table.chain(first)?;
        if keep == 0 {
            if first != 0 {
                table.release_chain(first)?;
            }
            first = 0;
        } else if keep < chain.len() {
            table.release_chain(chain[keep])?;
            table.set(chain[keep - 1], FAT16_EOC);
        }

        node.set_private(first as u64);
        node.set_size(size);
        self.patch_entry(node.inode(), first, size as u32)?;
        self.flush_table(&mut table)
    }
}

fn dir_cluster(dir: &VfsNode) -> u16 {
    if dir.inode() == ROOT_INODE {
        0
    } else {
        dir.private() as u16
    }
}

impl NodeOps for FatVolume {
    fn open(&self, node: &Arc<VfsNode>, flags: OpenFlags) -> VfsResult<()> {
        if flags.contains(OpenFlags::WRITE) && !node.writable() {
            return Err(VfsError::PermissionDenied);
        }
        Ok(())
    }

    fn read(&self, node: &Arc<VfsNode>, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        if node.is_directory() {
            return Err(VfsError::IsADirectory);
        }
        Ok(self.read_file(node, offset, buf)?)
    }

    fn write(&self, node: &Arc<VfsNode>, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        if node.is_directory() {
            return Err(VfsError::IsADirectory);
        }
        Ok(self.write_file(node, offset, buf)?)
    }

    fn readdir(&self, dir: &Arc<VfsNode>, index: usize) -> VfsResult<Option<DirEntry>> {
        let table = self.table.lock();
        let entry = self
            .scan(&table, dir_cluster(dir))?
            .into_iter()
            .filter(|entry| !entry.is_dot())
            .nth(index);
        Ok(entry.map(|entry| DirEntry {
            name: decode_short_name(&entry.name),
            inode: entry.inode(),
            kind: entry.kind(),
        }))
    }

    fn finddir(&self, dir: &Arc<VfsNode>, name: &str) -> VfsResult<Arc<VfsNode>> {
        let entry = {
            let table = self.table.lock();
            self.lookup(&table, dir_cluster(dir), name)?
        };
        self.node_for(&entry, dir)
    }

    fn create(&self, dir: &Arc<VfsNode>, name: &str) -> VfsResult<Arc<VfsNode>> {
        let entry = {
            let mut table = self.table.lock();
            let entry = self.insert_entry(&mut table, dir, name, ATTR_ARCHIVE, 0)?;
            self.flush_table(&mut table)?;
            entry
        };
        debug!("[fat] created {}", name);
        self.node_for(&entry, dir)
    }

    fn mkdir(&self, dir: &Arc<VfsNode>, name: &str) -> VfsResult<Arc<VfsNode>> {
        let entry = {
            let mut table = self.table.lock();
            if format_short_name(name).is_none() {
                return Err(VfsError::InvalidPath);
            }
            let cluster = table.allocate()?;
            let made = self
                .init_directory(cluster, dir_cluster(dir))
                .and_then(|()| self.insert_entry(&mut table, dir, name, ATTR_DIRECTORY, cluster));
            let entry = match made {
                Ok(entry) => entry,
                Err(err) => {
                    table.cut(&[cluster], 0);
                    return Err(err.into());
                }
            };
            self.flush_table(&mut table)?;
            entry
        };
        debug!("[fat] mkdir {}", name);
        self.node_for(&entry, dir)
    }

    fn unlink(&self, dir: &Arc<VfsNode>, name: &str) -> VfsResult<()> {
        Ok(self.remove_entry(dir, name, false)?)
    }

    fn rmdir(&self, dir: &Arc<VfsNode>, name: &str) -> VfsResult<()> {
        Ok(self.remove_entry(dir, name, true)?)
    }

    fn truncate(&self, node: &Arc<VfsNode>, size: u64) -> VfsResult<()> {
        if node.is_directory() {
            return Err(VfsError::IsADirectory);
        }
        Ok(self.truncate_file(node, size)?)
    }

    fn sync(&self) -> VfsResult<()> {
        let mut table = self.table.lock();
        Ok(self.flush_table(&mut table)?)
    }
}

/// A mounted FAT16 volume.
pub struct FatFs {
    volume: Arc<FatVolume>,
    root: Arc<VfsNode>,
}

impl FatFs {
    pub fn mount(device: &'static dyn BlockDevice, start_lba: u64) -> Result<Self, FatError> {
        let volume = FatVolume::load(device, start_lba)?;
        let ops: Arc<dyn NodeOps> = volume.clone();
        let root = VfsNode::new("/", ROOT_INODE, NodeKind::Directory, 0o755, 0, 0, ops, None);
        Ok(Self { volume, root })
    }

    pub fn root(&self) -> Arc<VfsNode> {
        self.root.clone()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.volume.geometry
    }

    pub fn free_clusters(&self) -> u32 {
        self.volume.table.lock().free
    }

    /// Entries held by the node cache, dead ones included.
    pub fn cached_nodes(&self) -> usize {
        self.volume.nodes.lock().len()
    }

    pub fn is_dirty(&self) -> bool {
        self.volume.table.lock().dirty
    }

    /// Clusters of the chain starting at `first`.
    pub fn chain(&self, first: u16) -> Result<Vec<u16>, FatError> {
        self.volume.table.lock().chain(first)
    }

    pub fn sync(&self) -> Result<(), FatError> {
        let mut table = self.volume.table.lock();
        self.volume.flush_table(&mut table)
    }
}

/// Converts `name` to a space-padded 8.3 name, `None` if it does not fit.
pub fn format_short_name(name: &str) -> Option<[u8; SHORT_NAME_LEN]> {
    let trimmed = name.trim_matches('/');
    if trimmed.is_empty() || trimmed.contains('/') {
        return None;
    }

    let mut parts = trimmed.split('.');
    let name_part = parts.next()?;
    let ext_part = parts.next();
    if parts.next().is_some() {
        return None;
    }

    if name_part.is_empty() || name_part.len() > 8 {
        return None;
    }
    if let Some(ext) = ext_part {
        if ext.is_empty() || ext.len() > 3 {
            return None;
        }
    }

    let mut short = [b' '; SHORT_NAME_LEN];
    for (i, ch) in name_part.chars().enumerate() {
        short[i] = to_short_char(ch)?;
    }
    if let Some(ext) = ext_part {
        for (i, ch) in ext.chars().enumerate() {
            short[8 + i] = to_short_char(ch)?;
        }
    }
    Some(short)
}

pub fn decode_short_name(short: &[u8; SHORT_NAME_LEN]) -> String {
    let base = core::str::from_utf8(&short[..8]).unwrap_or("").trim_end();
    let ext = core::str::from_utf8(&short[8..]).unwrap_or("").trim_end();
    let mut name = String::from(base);
    if !ext.is_empty() {
        name.push('.');
        name.push_str(ext);
    }
    name
}

fn to_short_char(ch: char) -> Option<u8> {
    if ch.is_ascii_lowercase() {
        Some(ch.to_ascii_uppercase() as u8)
    } else if ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_' || ch == '-' || ch == '~' {
        Some(ch as u8)
    } else {
        None
    }
}
