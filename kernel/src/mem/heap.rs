#![allow(dead_code)]

//! Global allocator: the two-class kernel heap over pages mapped into the
//! heap window.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use kite_core::mem::heap::{HeapBacking, HeapError, KernelHeap, INITIAL_PAGES};
use kite_core::mem::layout::{KERNEL_HEAP_END, KERNEL_HEAP_START};
use kite_core::mem::paging::PageFlags;
use kite_core::mem::window::VirtualWindow;
use kite_core::mem::PAGE_SIZE;
use log::{info, warn};
use spin::Mutex;

use super::paging::kernel_directory;
use super::with_paging;
use crate::arch::x86::cpu::without_interrupts;

/// Hands out virtually contiguous page runs from the heap window, each page
/// backed by its own frame.
pub struct KernelHeapBacking {
    window: VirtualWindow,
}

impl KernelHeapBacking {
    pub const fn new() -> Self {
        Self {
            window: VirtualWindow::new(KERNEL_HEAP_START, KERNEL_HEAP_END),
        }
    }

    /// Skips one page of the window and returns it; nothing maps it.
    pub fn reserve_unmapped_page(&mut self) -> Option<u32> {
        self.window.reserve(1)
    }

    pub fn window(&self) -> &VirtualWindow {
        &self.window
    }
}

impl HeapBacking for KernelHeapBacking {
    fn acquire(&mut self, pages: usize) -> Option<usize> {
        let base = self.window.take(pages)?;
        let directory = kernel_directory();
        let mapped = with_paging(|paging| {
            for index in 0..pages {
                let vaddr = base + (index * PAGE_SIZE) as u32;
                if let Err(err) = paging.map_fresh(directory, vaddr, PageFlags::WRITABLE) {
                    for done in 0..index {
                        if let Some(frame) = paging.unmap(directory, base + (done * PAGE_SIZE) as u32) {
                            paging.frames().free(frame);
                        }
                    }
                    return Err(err);
                }
            }
            Ok(())
        });
        match mapped {
            Ok(()) => Some(base as usize),
            Err(err) => {
                warn!("[heap] cannot back {} page(s) at 0x{:08X}: {:?}", pages, base, err);
                self.window.give_back(base, pages);
                None
            }
        }
    }

    fn release(&mut self, addr: usize, pages: usize) {
        let base = addr as u32;
        let directory = kernel_directory();
        with_paging(|paging| {
            for index in 0..pages {
                if let Some(frame) = paging.unmap(directory, base + (index * PAGE_SIZE) as u32) {
                    paging.frames().free(frame);
                }
            }
        });
        self.window.give_back(base, pages);
    }
}

static HEAP: Mutex<KernelHeap<KernelHeapBacking>> = Mutex::new(KernelHeap::new(KernelHeapBacking::new()));

pub struct KernelAllocator;

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        without_interrupts(|| match HEAP.lock().alloc_aligned(layout.size(), layout.align()) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(block) = NonNull::new(ptr) else {
            return;
        };
        let result = without_interrupts(|| HEAP.lock().free(block));
        if let Err(err) = result {
            panic!("[heap] free of {:p} rejected: {:?}", ptr, err);
        }
    }
}

pub fn init() -> Result<(), HeapError> {
    without_interrupts(|| HEAP.lock().init(INITIAL_PAGES))?;
    info!(
        "[heap] ready at 0x{:08X}, {} initial page(s)",
        KERNEL_HEAP_START, INITIAL_PAGES
    );
    Ok(())
}

/// Runs `f` with the heap locked and interrupts off. `f` must not allocate
/// through the global allocator.
pub fn with_heap<R>(f: impl FnOnce(&mut KernelHeap<KernelHeapBacking>) -> R) -> R {
    without_interrupts(|| f(&mut HEAP.lock()))
}

/// Reserves one page of the heap window that stays unmapped until touched.
pub fn reserve_window_page() -> Option<u32> {
    with_heap(|heap| heap.backing_mut().reserve_unmapped_page())
}
