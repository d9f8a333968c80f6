//! Multiboot v1 handoff: command line and physical memory map.
//!
//! Everything is copied out of the loader's structures while the boot
//! directory still maps low memory; nothing here allocates.

use core::ptr;

use kite_core::mem::layout::{phys_to_virt, DIRECT_MAP_SIZE};
use log::{debug, info, warn};

use crate::arch::x86::boot::MULTIBOOT_BOOTLOADER_MAGIC;

const MAX_REGIONS: usize = 32;
const MAX_CMDLINE: usize = 256;

/// The boot directory maps this much of low memory.
const BOOT_MAPPED: u32 = 8 * 1024 * 1024;

const FLAG_MEMORY: u32 = 1 << 0;
const FLAG_CMDLINE: u32 = 1 << 2;
const FLAG_MMAP: u32 = 1 << 6;

const MEMORY_TYPE_AVAILABLE: u32 = 1;
const LOW_MEMORY_END: u64 = 0x0010_0000;

#[repr(C, packed)]
struct MultibootInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
}

#[repr(C, packed)]
struct MmapEntry {
    size: u32,
    base_addr: u64,
    length: u64,
    entry_type: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BootError {
    BadMagic(u32),
    InfoNotMapped(u32),
    NoMemoryMap,
}

#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
}

impl MemoryRegion {
    const fn empty() -> Self {
        Self { base: 0, length: 0 }
    }

    pub fn end(&self) -> u64 {
        self.base + self.length
    }
}

pub struct BootInfo {
    cmdline: [u8; MAX_CMDLINE],
    cmdline_len: usize,
    regions: [MemoryRegion; MAX_REGIONS],
    region_count: usize,
}

impl BootInfo {
    /// # Safety
    /// `info_phys` must be the pointer the loader passed in `ebx`, and the
    /// boot directory must still be active.
    pub unsafe fn from_multiboot(magic: u32, info_phys: u32) -> Result<Self, BootError> {
        if magic != MULTIBOOT_BOOTLOADER_MAGIC {
            return Err(BootError::BadMagic(magic));
        }
        if info_phys >= BOOT_MAPPED {
            return Err(BootError::InfoNotMapped(info_phys));
        }

        let mut boot = BootInfo {
            cmdline: [0; MAX_CMDLINE],
            cmdline_len: 0,
            regions: [MemoryRegion::empty(); MAX_REGIONS],
            region_count: 0,
        };
        let info = ptr::read_unaligned(phys_to_virt(info_phys) as usize as *const MultibootInfo);
        let flags = info.flags;

        if flags & FLAG_CMDLINE != 0 && info.cmdline != 0 && info.cmdline < BOOT_MAPPED {
            boot.copy_cmdline(phys_to_virt(info.cmdline) as usize as *const u8);
        }

        if flags & FLAG_MMAP != 0 && info.mmap_addr < BOOT_MAPPED {
            boot.parse_mmap(info.mmap_addr, info.mmap_length);
        } else if flags & FLAG_MEMORY != 0 {
            boot.add_region(LOW_MEMORY_END, info.mem_upper as u64 * 1024);
        } else {
            return Err(BootError::NoMemoryMap);
        }

        info!(
            "[phys] {} usable region(s), {} KiB",
            boot.region_count,
            boot.usable_bytes() / 1024
        );
        Ok(boot)
    }

    unsafe fn copy_cmdline(&mut self, src: *const u8) {
        let mut len = 0;
        while len < MAX_CMDLINE {
            let byte = ptr::read(src.add(len));
            if byte == 0 {
                break;
            }
            self.cmdline[len] = byte;
            len += 1;
        }
        self.cmdline_len = len;
    }

    unsafe fn parse_mmap(&mut self, addr: u32, length: u32) {
        let mut cursor = addr;
        let end = addr.saturating_add(length);
        while cursor < end {
            let entry = ptr::read_unaligned(phys_to_virt(cursor) as usize as *const MmapEntry);
            let (base, len, kind) = (entry.base_addr, entry.length, entry.entry_type);
            debug!("[phys] mmap base=0x{:08X} len=0x{:08X} type={}", base, len, kind);
            if kind == MEMORY_TYPE_AVAILABLE {
                self.add_region(base, len);
            }
            cursor = cursor.saturating_add(entry.size + 4);
        }
    }

    fn add_region(&mut self, base: u64, length: u64) {
        if length == 0 {
            return;
        }
        if self.region_count == MAX_REGIONS {
            warn!("[phys] region table full, dropping base=0x{:08X} len=0x{:08X}", base, length);
            return;
        }
        self.regions[self.region_count] = MemoryRegion { base, length };
        self.region_count += 1;
    }

    pub fn cmdline(&self) -> &str {
        core::str::from_utf8(&self.cmdline[..self.cmdline_len]).unwrap_or("")
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions[..self.region_count]
    }

    pub fn usable_bytes(&self) -> u64 {
        self.regions().iter().map(|region| region.length).sum()
    }

    /// Highest usable address the direct map can reach.
    pub fn usable_top(&self) -> u64 {
        self.regions()
            .iter()
            .map(MemoryRegion::end)
            .max()
            .unwrap_or(0)
            .min(DIRECT_MAP_SIZE as u64)
    }
}
