use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::drivers::{BlockDevice, CharDevice, Driver, DriverError, DriverKind};

/// RAM-backed disk for host tests. Counts block writes so tests can assert
/// that metadata reached the device.
pub struct MemBlockDevice {
    name: &'static str,
    block: usize,
    storage: Mutex<Vec<u8>>,
    writes: AtomicUsize,
    write_budget: AtomicUsize,
}

impl MemBlockDevice {
    pub fn new(name: &'static str, data: Vec<u8>, block_size: usize) -> Self {
        assert_eq!(data.len() % block_size, 0, "backing must align to block size");
        Self {
            name,
            block: block_size,
            storage: Mutex::new(data),
            writes: AtomicUsize::new(0),
            write_budget: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Lets `count` more block writes succeed, then fails every write with
    /// `IoError`.
    pub fn fail_writes_after(&self, count: usize) {
        self.write_budget.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.with_storage(|storage| storage.clone())
    }

    fn with_storage<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut guard = self.storage.lock().expect("mem block device poisoned");
        f(&mut guard)
    }

    fn span(&self, lba: u64, len: usize) -> Result<usize, DriverError> {
        if len % self.block != 0 {
            return Err(DriverError::Unsupported);
        }
        (lba as usize)
            .checked_mul(self.block)
            .ok_or(DriverError::IoError)
    }
}

impl Driver for MemBlockDevice {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Block
    }

    fn init(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> usize {
        self.block
    }

    fn block_count(&self) -> u64 {
        self.with_storage(|storage| (storage.len() / self.block) as u64)
    }

    fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> Result<(), DriverError> {
        let offset = self.span(lba, buf.len())?;
        self.with_storage(|storage| {
            let end = offset + buf.len();
            if end > storage.len() {
                return Err(DriverError::IoError);
            }
            buf.copy_from_slice(&storage[offset..end]);
            Ok(())
        })
    }

    fn write_blocks(&self, lba: u64, buf: &[u8]) -> Result<(), DriverError> {
        let offset = self.span(lba, buf.len())?;
        let budget = self
            .write_budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| left.checked_sub(1));
        if budget.is_err() {
            return Err(DriverError::IoError);
        }
        self.with_storage(|storage| {
            let end = offset + buf.len();
            if end > storage.len() {
                return Err(DriverError::IoError);
            }
            storage[offset..end].copy_from_slice(buf);
            Ok(())
        })?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Character device that records writes and replays queued input.
pub struct MemCharDevice {
    name: &'static str,
    input: Mutex<Vec<u8>>,
    output: Mutex<Vec<u8>>,
}

impl MemCharDevice {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            input: Mutex::new(Vec::new()),
            output: Mutex::new(Vec::new()),
        }
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.input.lock().expect("input poisoned").extend_from_slice(bytes);
    }

    pub fn output(&self) -> Vec<u8> {
        self.output.lock().expect("output poisoned").clone()
    }
}

impl Driver for MemCharDevice {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Char
    }

    fn init(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

impl CharDevice for MemCharDevice {
    fn read(&self, buf: &mut [u8]) -> Result<usize, DriverError> {
        let mut input = self.input.lock().expect("input poisoned");
        let count = buf.len().min(input.len());
        buf[..count].copy_from_slice(&input[..count]);
        input.drain(..count);
        Ok(count)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, DriverError> {
        self.output.lock().expect("output poisoned").extend_from_slice(buf);
        Ok(buf.len())
    }
}
