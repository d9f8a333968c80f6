//! Device driver traits shared by the kernel and host tests.

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DriverKind {
    Block,
    Char,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DriverError {
    RegistryFull,
    InitFailed,
    NotPresent,
    Timeout,
    Unsupported,
    IoError,
}

pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> DriverKind;
    fn init(&self) -> Result<(), DriverError>;
    fn shutdown(&self) {}
}

/// Sector-addressed storage. `buf` lengths are whole blocks.
pub trait BlockDevice: Driver {
    fn block_size(&self) -> usize;

    fn block_count(&self) -> u64;

    fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> Result<(), DriverError>;

    fn write_blocks(&self, lba: u64, buf: &[u8]) -> Result<(), DriverError>;

    fn flush(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

pub trait CharDevice: Driver {
    fn read(&self, buf: &mut [u8]) -> Result<usize, DriverError>;
    fn write(&self, buf: &[u8]) -> Result<usize, DriverError>;
}

#[cfg(feature = "std")]
pub mod mock;
