//! ATA PIO driver for the primary master, polled, LBA28.

use core::hint::spin_loop;
use core::sync::atomic::{compiler_fence, AtomicU32, Ordering};

use kite_core::drivers::{BlockDevice, Driver, DriverError, DriverKind};
use log::{info, warn};
use spin::Mutex;

use crate::arch::x86::io::{inb, insw, outb, outsw};

const PRIMARY_IO_BASE: u16 = 0x1F0;
const PRIMARY_CTRL_BASE: u16 = 0x3F6;

const REG_DATA: u16 = 0x00;
const REG_SECCOUNT0: u16 = 0x02;
const REG_LBA0: u16 = 0x03;
const REG_LBA1: u16 = 0x04;
const REG_LBA2: u16 = 0x05;
const REG_HDDEVSEL: u16 = 0x06;
const REG_COMMAND: u16 = 0x07;
const REG_STATUS: u16 = REG_COMMAND;

const REG_ALTSTATUS: u16 = 0x00;
const REG_DEVICE_CONTROL: u16 = 0x00;

const STATUS_ERR: u8 = 1 << 0;
const STATUS_DRQ: u8 = 1 << 3;
const STATUS_DF: u8 = 1 << 5;
const STATUS_BSY: u8 = 1 << 7;

/// Interrupts off: every transfer is polled.
const CONTROL_NIEN: u8 = 0x02;

const CMD_IDENTIFY: u8 = 0xEC;
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;

const SECTOR_BYTES: usize = 512;
const LBA28_LIMIT: u64 = 1 << 28;
const POLL_LIMIT: usize = 100_000;

pub struct AtaPrimaryMaster {
    sectors: AtomicU32,
    lock: Mutex<()>,
}

static ATA_PRIMARY: AtaPrimaryMaster = AtaPrimaryMaster {
    sectors: AtomicU32::new(0),
    lock: Mutex::new(()),
};

impl AtaPrimaryMaster {
    pub fn instance() -> &'static AtaPrimaryMaster {
        &ATA_PRIMARY
    }

    const fn io_base(&self) -> u16 {
        PRIMARY_IO_BASE
    }

    const fn ctrl_base(&self) -> u16 {
        PRIMARY_CTRL_BASE
    }

    fn wait_400ns(&self) {
        for _ in 0..4 {
            unsafe {
                let _ = inb(self.ctrl_base() + REG_ALTSTATUS);
            }
        }
    }

    fn wait_until(&self, mask: u8, value: u8, timeout: usize) -> Result<(), DriverError> {
        for _ in 0..timeout {
            let status = unsafe { inb(self.io_base() + REG_STATUS) };
            if status & STATUS_BSY == 0 && status & mask == value {
                if status & (STATUS_ERR | STATUS_DF) != 0 {
                    return Err(DriverError::IoError);
                }
                return Ok(());
            }
            spin_loop();
        }
        Err(DriverError::Timeout)
    }

    fn select(&self, lba: u64) {
        let head = ((lba >> 24) & 0x0F) as u8;
        unsafe {
            outb(self.io_base() + REG_HDDEVSEL, 0xE0 | head);
        }
        self.wait_400ns();
    }

    fn program(&self, lba: u64, command: u8) {
        unsafe {
            outb(self.ctrl_base() + REG_DEVICE_CONTROL, CONTROL_NIEN);
            outb(self.io_base() + REG_SECCOUNT0, 1);
            outb(self.io_base() + REG_LBA0, (lba & 0xFF) as u8);
            outb(self.io_base() + REG_LBA1, ((lba >> 8) & 0xFF) as u8);
            outb(self.io_base() + REG_LBA2, ((lba >> 16) & 0xFF) as u8);
            outb(self.io_base() + REG_COMMAND, command);
        }
    }

    fn identify(&self) -> Result<u32, DriverError> {
        self.select(0);
        unsafe {
            outb(self.ctrl_base() + REG_DEVICE_CONTROL, CONTROL_NIEN);
            outb(self.io_base() + REG_SECCOUNT0, 0);
            outb(self.io_base() + REG_LBA0, 0);
            outb(self.io_base() + REG_LBA1, 0);
            outb(self.io_base() + REG_LBA2, 0);
            outb(self.io_base() + REG_COMMAND, CMD_IDENTIFY);
        }

        let status = unsafe { inb(self.io_base() + REG_STATUS) };
        if status == 0 || status == 0xFF {
            return Err(DriverError::NotPresent);
        }
        self.wait_until(STATUS_DRQ, STATUS_DRQ, POLL_LIMIT)?;

        let mut words = [0u16; 256];
        unsafe {
            insw(self.io_base() + REG_DATA, words.as_mut_ptr(), words.len());
        }
        // words 60-61: addressable LBA28 sectors
        Ok(words[60] as u32 | (words[61] as u32) << 16)
    }

    fn pio_read_sector(&self, lba: u64, buffer: &mut [u8]) -> Result<(), DriverError> {
        self.select(lba);
        self.program(lba, CMD_READ_SECTORS);
        self.wait_until(STATUS_DRQ, STATUS_DRQ, POLL_LIMIT)?;

        let mut words = [0u16; SECTOR_BYTES / 2];
        unsafe {
            insw(self.io_base() + REG_DATA, words.as_mut_ptr(), words.len());
        }
        compiler_fence(Ordering::SeqCst);
        for (chunk, word) in buffer.chunks_exact_mut(2).zip(words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    fn pio_write_sector(&self, lba: u64, buffer: &[u8]) -> Result<(), DriverError> {
        self.select(lba);
        self.program(lba, CMD_WRITE_SECTORS);
        self.wait_until(STATUS_DRQ, STATUS_DRQ, POLL_LIMIT)?;

        let mut words = [0u16; SECTOR_BYTES / 2];
        for (word, chunk) in words.iter_mut().zip(buffer.chunks_exact(2)) {
            *word = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        unsafe {
            outsw(self.io_base() + REG_DATA, words.as_ptr(), words.len());
        }
        compiler_fence(Ordering::SeqCst);

        self.wait_until(STATUS_DRQ, 0, POLL_LIMIT)
    }

    fn check_range(&self, lba: u64, len: usize) -> Result<u64, DriverError> {
        if len % SECTOR_BYTES != 0 {
            return Err(DriverError::Unsupported);
        }
        let count = (len / SECTOR_BYTES) as u64;
        let end = lba.checked_add(count).ok_or(DriverError::IoError)?;
        if end > self.block_count() || end > LBA28_LIMIT {
            return Err(DriverError::IoError);
        }
        Ok(count)
    }
}

impl Driver for AtaPrimaryMaster {
    fn name(&self) -> &'static str {
        "ata0"
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Block
    }

    fn init(&self) -> Result<(), DriverError> {
        let _guard = self.lock.lock();
        match self.identify() {
            Ok(sectors) => {
                self.sectors.store(sectors, Ordering::Release);
                info!("[ata] primary master ready, {} sectors", sectors);
                Ok(())
            }
            Err(err) => {
                warn!("[ata] identify failed: {:?}", err);
                Err(err)
            }
        }
    }
}

impl BlockDevice for AtaPrimaryMaster {
    fn block_size(&self) -> usize {
        SECTOR_BYTES
    }

    fn block_count(&self) -> u64 {
        self.sectors.load(Ordering::Acquire) as u64
    }

    fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> Result<(), DriverError> {
        self.check_range(lba, buf.len())?;
        let _guard = self.lock.lock();
        for (index, chunk) in buf.chunks_mut(SECTOR_BYTES).enumerate() {
            self.pio_read_sector(lba + index as u64, chunk)?;
        }
        Ok(())
    }

    fn write_blocks(&self, lba: u64, buf: &[u8]) -> Result<(), DriverError> {
        self.check_range(lba, buf.len())?;
        let _guard = self.lock.lock();
        for (index, chunk) in buf.chunks(SECTOR_BYTES).enumerate() {
            self.pio_write_sector(lba + index as u64, chunk)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), DriverError> {
        let _guard = self.lock.lock();
        unsafe {
            outb(self.io_base() + REG_COMMAND, CMD_CACHE_FLUSH);
        }
        self.wait_until(0, 0, POLL_LIMIT * 2)
    }
}
