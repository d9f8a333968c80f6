use core::arch::asm;

use kite_core::mem::layout::{phys_to_virt, KERNEL_BASE};
use kite_core::mem::paging::Mmu;

#[inline(always)]
pub fn read_cr2() -> u32 {
    let value: u32;
    unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

#[inline(always)]
pub fn read_cr3() -> u32 {
    let value: u32;
    unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

/// Loads `directory` (physical) unless it is already active.
pub fn switch_directory(directory: u32) {
    if read_cr3() != directory {
        unsafe { asm!("mov cr3, {}", in(reg) directory, options(nostack, preserves_flags)) };
    }
}

#[inline(always)]
pub fn invlpg(vaddr: u32) {
    unsafe { asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags)) };
}

/// Reaches frames through the direct map and flushes the live TLB.
pub struct KernelMmu;

impl Mmu for KernelMmu {
    fn frame_ptr(&self, phys: u32) -> *mut u8 {
        phys_to_virt(phys) as usize as *mut u8
    }

    fn invalidate(&self, directory: u32, vaddr: u32) {
        if vaddr >= KERNEL_BASE || directory == read_cr3() {
            invlpg(vaddr);
        }
    }
}
