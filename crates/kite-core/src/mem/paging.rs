//! Two-level i386 page tables.
//!
//! A directory and each table are one frame of 1024 32-bit entries. Tables
//! are reached through [`Mmu::frame_ptr`], so the walker never assumes
//! identity mapping: the kernel resolves frames through its direct map and
//! tests resolve them into an in-memory arena.

use alloc::vec::Vec;
use core::ptr;

use bitflags::bitflags;
use log::{debug, trace};

use super::frame::{FrameAllocator, FRAME_SIZE};
use super::layout::KERNEL_PDE_START;
use super::PAGE_SIZE;

pub const ENTRIES: usize = 1024;

const ADDR_MASK: u32 = 0xFFFF_F000;

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct RegionFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
        const STACK = 1 << 4;
    }
}

impl RegionFlags {
    pub fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::PRESENT;
        if self.contains(RegionFlags::WRITE) {
            flags |= PageFlags::WRITABLE;
        }
        if self.contains(RegionFlags::USER) {
            flags |= PageFlags::USER;
        }
        flags
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapError {
    OutOfMemory,
    AlreadyMapped,
    Misaligned,
}

/// Hardware seam for the page walker.
pub trait Mmu {
    /// Kernel-visible pointer to the start of the frame at `phys`.
    fn frame_ptr(&self, phys: u32) -> *mut u8;

    /// Drops any cached translation of `vaddr` under `directory`.
    fn invalidate(&self, directory: u32, vaddr: u32);
}

/// Half-open virtual range owned by an address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Region {
    pub start: u32,
    pub end: u32,
    pub flags: RegionFlags,
}

impl Region {
    pub fn new(start: u32, end: u32, flags: RegionFlags) -> Self {
        Self { start, end, flags }
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn contains_range(&self, addr: u32, len: u32) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end,
            None => false,
        }
    }
}

pub struct AddressSpace {
    directory: u32,
    regions: Vec<Region>,
    refs: usize,
}

impl AddressSpace {
    pub fn directory(&self) -> u32 {
        self.directory
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn add_region(&mut self, region: Region) {
        self.regions.push(region);
    }

    pub fn find_region(&self, addr: u32) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(addr))
    }

    /// True when `[addr, addr + len)` sits inside a single region.
    pub fn owns_range(&self, addr: u32, len: u32) -> bool {
        self.regions.iter().any(|region| region.contains_range(addr, len))
    }

    pub fn retain(&mut self) {
        self.refs += 1;
    }

    /// Drops one reference; returns true when the last one is gone.
    pub fn release(&mut self) -> bool {
        self.refs = self.refs.saturating_sub(1);
        self.refs == 0
    }

    pub fn refs(&self) -> usize {
        self.refs
    }
}

pub struct Paging<'a, M: Mmu> {
    mmu: &'a M,
    frames: &'a mut FrameAllocator,
}

impl<'a, M: Mmu> Paging<'a, M> {
    pub fn new(mmu: &'a M, frames: &'a mut FrameAllocator) -> Self {
        Self { mmu, frames }
    }

    pub fn frames(&mut self) -> &mut FrameAllocator {
        self.frames
    }

    /// Allocates and zeroes a frame, usable as a directory or table.
    pub fn alloc_zeroed(&mut self) -> Result<u32, MapError> {
        let frame = self.frames.alloc().ok_or(MapError::OutOfMemory)?;
        unsafe {
            ptr::write_bytes(self.mmu.frame_ptr(frame), 0, PAGE_SIZE);
        }
        Ok(frame)
    }

    pub fn map(&mut self, directory: u32, vaddr: u32, paddr: u32, flags: PageFlags) -> Result<(), MapError> {
        if vaddr % FRAME_SIZE != 0 || paddr % FRAME_SIZE != 0 {
            return Err(MapError::Misaligned);
        }
        let table = self.ensure_table(directory, vaddr)?;
        let entry = unsafe { &mut (*table)[pte_index(vaddr)] };
        if *entry & PageFlags::PRESENT.bits() != 0 {
            return Err(MapError::AlreadyMapped);
        }
        *entry = paddr | (flags | PageFlags::PRESENT).bits();
        self.mmu.invalidate(directory, vaddr);
        trace!("[paging] map 0x{:08X} -> 0x{:08X} flags={:?}", vaddr, paddr, flags);
        Ok(())
    }

    /// Clears the mapping and returns the frame that backed it.
    pub fn unmap(&mut self, directory: u32, vaddr: u32) -> Option<u32> {
        let table = self.table_for(directory, vaddr)?;
        let entry = unsafe { &mut (*table)[pte_index(vaddr)] };
        if *entry & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        let frame = *entry & ADDR_MASK;
        *entry = 0;
        self.mmu.invalidate(directory, vaddr & ADDR_MASK);
        Some(frame)
    }

    pub fn map_range(
        &mut self,
        directory: u32,
        vaddr: u32,
        paddr: u32,
        len: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let pages = super::pages_required(len);
        for page in 0..pages {
            let offset = (page * PAGE_SIZE) as u32;
            self.map(directory, vaddr + offset, paddr + offset, flags)?;
        }
        Ok(())
    }

    pub fn translate(&self, directory: u32, vaddr: u32) -> Option<u32> {
        let entry = self.entry(directory, vaddr)?;
        Some((entry & ADDR_MASK) | (vaddr & !ADDR_MASK))
    }

    /// Flags of the leaf entry for `vaddr`, when present.
    pub fn flags(&self, directory: u32, vaddr: u32) -> Option<PageFlags> {
        self.entry(directory, vaddr)
            .map(|entry| PageFlags::from_bits_truncate(entry & !ADDR_MASK))
    }

    /// Allocates a frame and maps it at `vaddr`; the frame is zeroed.
    pub fn map_fresh(&mut self, directory: u32, vaddr: u32, flags: PageFlags) -> Result<u32, MapError> {
        let frame = self.alloc_zeroed()?;
        if let Err(err) = self.map(directory, vaddr, frame, flags) {
            self.frames.free(frame);
            return Err(err);
        }
        Ok(frame)
    }

    /// Pre-allocates every table in the kernel quarter of `directory`.
    pub fn populate_kernel_tables(&mut self, directory: u32) -> Result<(), MapError> {
        let pd = self.directory_ptr(directory);
        for index in KERNEL_PDE_START..ENTRIES {
            let present = unsafe { (*pd)[index] & PageFlags::PRESENT.bits() != 0 };
            if !present {
                let table = self.alloc_zeroed()?;
                unsafe {
                    (*pd)[index] = table | (PageFlags::PRESENT | PageFlags::WRITABLE).bits();
                }
            }
        }
        Ok(())
    }

    /// New directory whose kernel quarter aliases `kernel_directory`.
    pub fn create_address_space(&mut self, kernel_directory: u32) -> Result<AddressSpace, MapError> {
        let directory = self.alloc_zeroed()?;
        let src = self.directory_ptr(kernel_directory);
        let dst = self.directory_ptr(directory);
        unsafe {
            for index in KERNEL_PDE_START..ENTRIES {
                (*dst)[index] = (*src)[index];
            }
        }
        debug!("[paging] created address space pd=0x{:08X}", directory);
        Ok(AddressSpace {
            directory,
            regions: Vec::new(),
            refs: 1,
        })
    }

    /// Frees user frames, user tables and the directory. Returns frames freed.
    pub fn destroy_address_space(&mut self, space: AddressSpace) -> usize {
        let pd = self.directory_ptr(space.directory);
        let mut freed = 0;
        for pde_index in 0..KERNEL_PDE_START {
            let pde = unsafe { (*pd)[pde_index] };
            if pde & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let table_frame = pde & ADDR_MASK;
            let table = self.mmu.frame_ptr(table_frame) as *mut [u32; ENTRIES];
            for pte_index in 0..ENTRIES {
                let pte = unsafe { (*table)[pte_index] };
                if pte & PageFlags::PRESENT.bits() != 0 {
                    self.frames.free(pte & ADDR_MASK);
                    freed += 1;
                }
            }
            self.frames.free(table_frame);
            freed += 1;
            unsafe {
                (*pd)[pde_index] = 0;
            }
        }
        self.frames.free(space.directory);
        freed += 1;
        debug!("[paging] destroyed address space pd=0x{:08X} frames={}", space.directory, freed);
        freed
    }

    fn directory_ptr(&self, directory: u32) -> *mut [u32; ENTRIES] {
        self.mmu.frame_ptr(directory) as *mut [u32; ENTRIES]
    }

    fn table_for(&self, directory: u32, vaddr: u32) -> Option<*mut [u32; ENTRIES]> {
        let pde = unsafe { (*self.directory_ptr(directory))[pde_index(vaddr)] };
        if pde & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(self.mmu.frame_ptr(pde & ADDR_MASK) as *mut [u32; ENTRIES])
    }

    fn ensure_table(&mut self, directory: u32, vaddr: u32) -> Result<*mut [u32; ENTRIES], MapError> {
        let pd = self.directory_ptr(directory);
        let index = pde_index(vaddr);
        let pde = unsafe { (*pd)[index] };
        if pde & PageFlags::PRESENT.bits() != 0 {
            return Ok(self.mmu.frame_ptr(pde & ADDR_MASK) as *mut [u32; ENTRIES]);
        }
        let table = self.alloc_zeroed()?;
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
        unsafe {
            (*pd)[index] = table | flags.bits();
        }
        Ok(self.mmu.frame_ptr(table) as *mut [u32; ENTRIES])
    }

    fn entry(&self, directory: u32, vaddr: u32) -> Option<u32> {
        let table = self.table_for(directory, vaddr)?;
        let pte = unsafe { (*table)[pte_index(vaddr)] };
        (pte & PageFlags::PRESENT.bits() != 0).then_some(pte)
    }
}

pub const fn pde_index(vaddr: u32) -> usize {
    (vaddr >> 22) as usize
}

pub const fn pte_index(vaddr: u32) -> usize {
    ((vaddr >> 12) & 0x3FF) as usize
}
