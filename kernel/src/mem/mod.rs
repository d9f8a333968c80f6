//! Physical memory, the kernel directory and the heap, as kernel globals.

pub mod fault;
pub mod heap;
pub mod paging;
pub mod phys;

use kite_core::mem::frame::{FrameAllocator, FrameStats, FRAME_SIZE};
use kite_core::mem::heap::HeapError;
use kite_core::mem::layout::virt_to_phys_direct;
use kite_core::mem::paging::{MapError, Paging};
use kite_core::mem::{align_up, PAGE_SIZE};
use log::info;
use spin::Mutex;

use crate::arch::x86::boot;
use crate::arch::x86::cpu::without_interrupts;
use crate::arch::x86::mmu::KernelMmu;
use phys::BootInfo;

const LOW_MEMORY_END: u64 = 0x0010_0000;

pub static FRAMES: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new(0, 0));

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemError {
    NoUsableMemory,
    Map(MapError),
    Heap(HeapError),
}

impl From<MapError> for MemError {
    fn from(err: MapError) -> Self {
        MemError::Map(err)
    }
}

impl From<HeapError> for MemError {
    fn from(err: HeapError) -> Self {
        MemError::Heap(err)
    }
}

pub fn init(boot: &BootInfo) -> Result<(), MemError> {
    let frames = (boot.usable_top() / FRAME_SIZE as u64) as usize;
    if frames == 0 {
        return Err(MemError::NoUsableMemory);
    }
    let kernel_end = virt_to_phys_direct(align_up(boot::kernel_end_addr(), PAGE_SIZE) as u32) as u64;

    let stats = without_interrupts(|| {
        let mut allocator = FRAMES.lock();
        *allocator = FrameAllocator::new(0, frames);
        for region in boot.regions() {
            allocator.mark_region_free(region.base, region.length);
        }
        allocator.mark_region_used(0, LOW_MEMORY_END);
        allocator.mark_region_used(LOW_MEMORY_END, kernel_end - LOW_MEMORY_END);
        allocator.stats()
    });
    info!(
        "[mem] frames total={} free={} kernel image ends at 0x{:08X}",
        stats.total, stats.free, kernel_end
    );

    paging::init()?;
    heap::init()?;
    Ok(())
}

/// Runs `f` on the page walker with the frame allocator locked.
pub fn with_paging<R>(f: impl FnOnce(&mut Paging<'_, KernelMmu>) -> R) -> R {
    without_interrupts(|| {
        let mut frames = FRAMES.lock();
        let mut paging = Paging::new(&KernelMmu, &mut frames);
        f(&mut paging)
    })
}

pub fn frame_stats() -> FrameStats {
    without_interrupts(|| FRAMES.lock().stats())
}
