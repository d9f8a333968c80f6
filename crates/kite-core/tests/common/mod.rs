#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::{RefCell, UnsafeCell};

use kite_core::mem::frame::{FrameAllocator, FRAME_SIZE};
use kite_core::mem::heap::HeapBacking;
use kite_core::mem::paging::Mmu;
use kite_core::mem::PAGE_SIZE;

pub const ARENA_BASE: u32 = 0x0010_0000;

/// Physical memory simulated as an array of frames starting at `ARENA_BASE`.
pub struct FakeMmu {
    frames: Box<[UnsafeCell<[u32; 1024]>]>,
    invalidations: RefCell<Vec<(u32, u32)>>,
}

impl FakeMmu {
    pub fn new(frames: usize) -> Self {
        let frames = (0..frames).map(|_| UnsafeCell::new([0u32; 1024])).collect();
        Self {
            frames,
            invalidations: RefCell::new(Vec::new()),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Frame allocator covering the whole arena, every frame free.
    pub fn allocator(&self) -> FrameAllocator {
        let mut frames = FrameAllocator::new(ARENA_BASE, self.frames.len());
        frames.mark_region_free(ARENA_BASE as u64, self.frames.len() as u64 * FRAME_SIZE as u64);
        frames
    }

    pub fn read_word(&self, phys: u32, index: usize) -> u32 {
        unsafe { (*self.slot(phys))[index] }
    }

    pub fn bytes(&self, phys: u32) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.frame_ptr(phys), PAGE_SIZE) }
    }

    pub fn invalidations(&self) -> Vec<(u32, u32)> {
        self.invalidations.borrow().clone()
    }

    fn slot(&self, phys: u32) -> *mut [u32; 1024] {
        let index = ((phys & !0xFFF) - ARENA_BASE) as usize / PAGE_SIZE;
        self.frames[index].get()
    }
}

impl Mmu for FakeMmu {
    fn frame_ptr(&self, phys: u32) -> *mut u8 {
        self.slot(phys) as *mut u8
    }

    fn invalidate(&self, directory: u32, vaddr: u32) {
        self.invalidations.borrow_mut().push((directory, vaddr));
    }
}

/// Heap backing that hands out page-aligned runs from the host allocator.
pub struct PageBacking {
    runs: Vec<(usize, usize)>,
    limit: Option<usize>,
    pub acquired: usize,
    pub released: usize,
}

impl PageBacking {
    pub fn new() -> Self {
        Self {
            runs: Vec::new(),
            limit: None,
            acquired: 0,
            released: 0,
        }
    }

    pub fn with_limit(pages: usize) -> Self {
        Self {
            runs: Vec::new(),
            limit: Some(pages),
            acquired: 0,
            released: 0,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.acquired - self.released
    }
}

impl HeapBacking for PageBacking {
    fn acquire(&mut self, pages: usize) -> Option<usize> {
        if let Some(limit) = self.limit {
            if self.outstanding() + pages > limit {
                return None;
            }
        }
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        self.runs.push((ptr as usize, pages));
        self.acquired += pages;
        Some(ptr as usize)
    }

    fn release(&mut self, addr: usize, pages: usize) {
        let position = self
            .runs
            .iter()
            .position(|&(base, count)| base == addr && count == pages)
            .expect("release of a run that was never acquired");
        self.runs.swap_remove(position);
        self.released += pages;
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { dealloc(addr as *mut u8, layout) };
    }
}

impl Drop for PageBacking {
    fn drop(&mut self) {
        for &(base, pages) in &self.runs {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            unsafe { dealloc(base as *mut u8, layout) };
        }
    }
}
