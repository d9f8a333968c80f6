//! Kernel heap.
//!
//! Two size classes. Requests whose payload plus header reach half a page
//! take whole pages straight from the backing store; everything else is
//! carved first-fit out of an arena of small blocks. Every block, large or
//! small, is preceded by a [`BlockHeader`] whose magic tells `free` which
//! path the pointer came from.
//!
//! The heap itself takes no locks. The kernel wraps it in a spin lock and
//! only touches it with interrupts disabled.

use core::mem::size_of;
use core::ptr::{self, NonNull};

use log::{debug, error};

use super::{align_up, is_aligned, pages_required, PAGE_SIZE};

pub const SMALL_MAGIC: u32 = 0x5AFE_B10C;
pub const LARGE_MAGIC: u32 = 0x1A26_E0B1;

pub const MIN_ALIGN: usize = 8;
pub const INITIAL_PAGES: usize = 4;

const HEADER: usize = size_of::<BlockHeader>();
const SPLIT_THRESHOLD: usize = HEADER + MIN_ALIGN;
const LARGE_THRESHOLD: usize = PAGE_SIZE / 2;

#[repr(C)]
struct BlockHeader {
    /// Small: payload bytes. Large: bytes of the whole page run.
    size: usize,
    /// Small: next free block. Large: base of the page run.
    next: *mut BlockHeader,
    free: u32,
    magic: u32,
}

const _: () = assert!(HEADER % MIN_ALIGN == 0);

/// Page supplier behind the heap.
pub trait HeapBacking {
    /// Returns the address of `pages` fresh, virtually contiguous pages.
    fn acquire(&mut self, pages: usize) -> Option<usize>;

    /// Gives back a run previously returned by `acquire`.
    fn release(&mut self, addr: usize, pages: usize);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HeapError {
    OutOfMemory,
    Corrupted { addr: usize },
    DoubleFree { addr: usize },
    InvalidLayout,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct HeapStats {
    pub arena_pages: usize,
    pub grow_count: usize,
    pub live_blocks: usize,
    pub free_bytes: usize,
    pub large_pages: usize,
}

pub struct KernelHeap<B: HeapBacking> {
    backing: B,
    free_list: *mut BlockHeader,
    stats: HeapStats,
    growth: bool,
}

unsafe impl<B: HeapBacking + Send> Send for KernelHeap<B> {}

impl<B: HeapBacking> KernelHeap<B> {
    pub const fn new(backing: B) -> Self {
        Self {
            backing,
            free_list: ptr::null_mut(),
            stats: HeapStats {
                arena_pages: 0,
                grow_count: 0,
                live_blocks: 0,
                free_bytes: 0,
                large_pages: 0,
            },
            growth: true,
        }
    }

    /// Publishes the initial arena as one free block.
    pub fn init(&mut self, pages: usize) -> Result<(), HeapError> {
        let base = self.backing.acquire(pages).ok_or(HeapError::OutOfMemory)?;
        unsafe {
            self.publish(base, pages * PAGE_SIZE);
        }
        self.stats.arena_pages += pages;
        debug!("[heap] arena at 0x{:X} pages={}", base, pages);
        Ok(())
    }

    /// Disables arena growth; small allocations then fail once the arena is full.
    pub fn set_growth(&mut self, enabled: bool) {
        self.growth = enabled;
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    pub fn backing_mut(&mut self) -> &mut B {
        &mut self.backing
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.alloc_aligned(size, MIN_ALIGN)
    }

    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        if !align.is_power_of_two() || align > PAGE_SIZE {
            return Err(HeapError::InvalidLayout);
        }
        let payload = align_up(size.max(1), MIN_ALIGN);
        if align > MIN_ALIGN || payload + HEADER >= LARGE_THRESHOLD {
            return self.alloc_large(payload, align);
        }

        loop {
            if let Some(ptr) = unsafe { self.take_first_fit(payload) } {
                self.stats.live_blocks += 1;
                return Ok(ptr);
            }
            if !self.growth {
                return Err(HeapError::OutOfMemory);
            }
            self.grow()?;
        }
    }

    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let addr = ptr.as_ptr() as usize;
        if addr < HEADER || !is_aligned(addr, MIN_ALIGN) {
            return Err(HeapError::Corrupted { addr });
        }
        let header = (addr - HEADER) as *mut BlockHeader;
        unsafe {
            match (*header).magic {
                SMALL_MAGIC => self.free_small(header, addr),
                LARGE_MAGIC => self.free_large(header, addr),
                _ => {
                    error!("[heap] bad magic 0x{:08X} freeing 0x{:X}", (*header).magic, addr);
                    Err(HeapError::Corrupted { addr })
                }
            }
        }
    }

    fn alloc_large(&mut self, payload: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        let slack = if align > MIN_ALIGN { align } else { 0 };
        let pages = pages_required(payload + HEADER + slack);
        let base = self.backing.acquire(pages).ok_or(HeapError::OutOfMemory)?;
        let user = align_up(base + HEADER, align.max(MIN_ALIGN));
        let header = (user - HEADER) as *mut BlockHeader;
        unsafe {
            header.write(BlockHeader {
                size: pages * PAGE_SIZE,
                next: base as *mut BlockHeader,
                free: 0,
                magic: LARGE_MAGIC,
            });
        }
        self.stats.large_pages += pages;
        self.stats.live_blocks += 1;
        NonNull::new(user as *mut u8).ok_or(HeapError::OutOfMemory)
    }

    unsafe fn free_large(&mut self, header: *mut BlockHeader, addr: usize) -> Result<(), HeapError> {
        let base = (*header).next as usize;
        let bytes = (*header).size;
        if !is_aligned(base, PAGE_SIZE) || base > header as usize || bytes % PAGE_SIZE != 0 {
            error!("[heap] corrupt large header freeing 0x{:X}", addr);
            return Err(HeapError::Corrupted { addr });
        }
        (*header).magic = 0;
        let pages = bytes / PAGE_SIZE;
        self.backing.release(base, pages);
        self.stats.large_pages -= pages;
        self.stats.live_blocks -= 1;
        Ok(())
    }

    unsafe fn free_small(&mut self, header: *mut BlockHeader, addr: usize) -> Result<(), HeapError> {
        if (*header).free != 0 {
            error!("[heap] double free of 0x{:X}", addr);
            return Err(HeapError::DoubleFree { addr });
        }
        (*header).free = 1;
        (*header).next = self.free_list;
        self.free_list = header;
        self.stats.free_bytes += (*header).size;
        self.stats.live_blocks -= 1;
        self.coalesce();
        Ok(())
    }

    fn grow(&mut self) -> Result<(), HeapError> {
        let base = self.backing.acquire(1).ok_or(HeapError::OutOfMemory)?;
        unsafe {
            self.publish(base, PAGE_SIZE);
        }
        self.stats.arena_pages += 1;
        self.stats.grow_count += 1;
        self.coalesce();
        debug!("[heap] grew arena by one page at 0x{:X}", base);
        Ok(())
    }

    unsafe fn publish(&mut self, base: usize, bytes: usize) {
        let header = base as *mut BlockHeader;
        header.write(BlockHeader {
            size: bytes - HEADER,
            next: self.free_list,
            free: 1,
            magic: SMALL_MAGIC,
        });
        self.free_list = header;
        self.stats.free_bytes += bytes - HEADER;
    }

    unsafe fn take_first_fit(&mut self, payload: usize) -> Option<NonNull<u8>> {
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut current = self.free_list;
        while !current.is_null() {
            if (*current).size >= payload {
                let next = (*current).next;
                let replacement = if (*current).size - payload >= SPLIT_THRESHOLD {
                    let split = (current as usize + HEADER + payload) as *mut BlockHeader;
                    split.write(BlockHeader {
                        size: (*current).size - payload - HEADER,
                        next,
                        free: 1,
                        magic: SMALL_MAGIC,
                    });
                    (*current).size = payload;
                    self.stats.free_bytes -= HEADER;
                    split
                } else {
                    next
                };
                if prev.is_null() {
                    self.free_list = replacement;
                } else {
                    (*prev).next = replacement;
                }
                (*current).free = 0;
                (*current).next = ptr::null_mut();
                self.stats.free_bytes -= (*current).size;
                return NonNull::new((current as usize + HEADER) as *mut u8);
            }
            prev = current;
            current = (*current).next;
        }
        None
    }

    /// Merges free blocks that sit back to back in memory.
    fn coalesce(&mut self) {
        unsafe {
            let mut block = self.free_list;
            while !block.is_null() {
                let end = block as usize + HEADER + (*block).size;
                if self.unlink_free(end as *mut BlockHeader) {
                    let neighbour = end as *mut BlockHeader;
                    (*block).size += HEADER + (*neighbour).size;
                    (*neighbour).magic = 0;
                    self.stats.free_bytes += HEADER;
                    // The merged block may now touch another one.
                    continue;
                }
                block = (*block).next;
            }
        }
    }

    unsafe fn unlink_free(&mut self, target: *mut BlockHeader) -> bool {
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut current = self.free_list;
        while !current.is_null() {
            if current == target {
                if prev.is_null() {
                    self.free_list = (*current).next;
                } else {
                    (*prev).next = (*current).next;
                }
                return true;
            }
            prev = current;
            current = (*current).next;
        }
        false
    }

    /// Walks the free list and checks every header.
    pub fn check(&self) -> Result<usize, HeapError> {
        let mut blocks = 0;
        let mut current = self.free_list;
        unsafe {
            while !current.is_null() {
                if (*current).magic != SMALL_MAGIC || (*current).free == 0 {
                    return Err(HeapError::Corrupted { addr: current as usize });
                }
                blocks += 1;
                current = (*current).next;
            }
        }
        Ok(blocks)
    }
}

pub const fn header_size() -> usize {
    HEADER
}
