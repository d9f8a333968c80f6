#![allow(dead_code)]

//! The kernel page directory and the temporary mapping window.

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use kite_core::mem::layout::{DIRECT_MAP_SIZE, KERNEL_BASE, TEMP_WINDOW_BASE, TEMP_WINDOW_PAGES};
use kite_core::mem::paging::{MapError, PageFlags};
use kite_core::mem::PAGE_SIZE;
use log::info;

use super::with_paging;
use crate::arch::x86::mmu;

static KERNEL_DIRECTORY: AtomicU32 = AtomicU32::new(0);

/// Bit per temporary window slot, set while in use.
static TEMP_SLOTS: AtomicU16 = AtomicU16::new(0);

const _: () = assert!(TEMP_WINDOW_PAGES <= 16);

/// Builds the real kernel directory (direct map plus every kernel-quarter
/// table, so later address spaces can share them) and switches to it. The
/// boot identity map is gone afterwards.
pub fn init() -> Result<(), MapError> {
    let directory = with_paging(|paging| {
        let directory = paging.alloc_zeroed()?;
        paging.populate_kernel_tables(directory)?;
        paging.map_range(directory, KERNEL_BASE, 0, DIRECT_MAP_SIZE as usize, PageFlags::WRITABLE)?;
        Ok::<u32, MapError>(directory)
    })?;

    KERNEL_DIRECTORY.store(directory, Ordering::Release);
    mmu::switch_directory(directory);
    info!(
        "[paging] kernel directory at 0x{:08X}, direct map {} MiB",
        directory,
        DIRECT_MAP_SIZE / (1024 * 1024)
    );
    Ok(())
}

pub fn kernel_directory() -> u32 {
    KERNEL_DIRECTORY.load(Ordering::Acquire)
}

/// A foreign frame mapped into the kernel quarter; unmapped on drop.
pub struct TempMapping {
    slot: usize,
    vaddr: u32,
}

impl TempMapping {
    pub fn new(frame: u32) -> Result<Self, MapError> {
        let slot = claim_slot().ok_or(MapError::OutOfMemory)?;
        let vaddr = TEMP_WINDOW_BASE + (slot * PAGE_SIZE) as u32;
        let mapped = with_paging(|paging| paging.map(kernel_directory(), vaddr, frame, PageFlags::WRITABLE));
        if let Err(err) = mapped {
            release_slot(slot);
            return Err(err);
        }
        Ok(Self { slot, vaddr })
    }

    pub fn vaddr(&self) -> u32 {
        self.vaddr
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.vaddr as usize as *mut u8, PAGE_SIZE) }
    }
}

impl Drop for TempMapping {
    fn drop(&mut self) {
        with_paging(|paging| paging.unmap(kernel_directory(), self.vaddr));
        release_slot(self.slot);
    }
}

fn claim_slot() -> Option<usize> {
    let mut current = TEMP_SLOTS.load(Ordering::Acquire);
    loop {
        let free = (!current).trailing_zeros() as usize;
        if free >= TEMP_WINDOW_PAGES {
            return None;
        }
        match TEMP_SLOTS.compare_exchange(current, current | (1 << free), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Some(free),
            Err(actual) => current = actual,
        }
    }
}

fn release_slot(slot: usize) {
    TEMP_SLOTS.fetch_and(!(1 << slot), Ordering::AcqRel);
}
