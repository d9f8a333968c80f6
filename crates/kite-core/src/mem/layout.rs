//! Fixed virtual address layout shared by the kernel and the loader.
//!
//! The top quarter of every address space (`KERNEL_BASE..`) is the kernel's:
//! a direct map of the first 128 MiB of physical memory, the heap window and
//! the temporary mapping window. Everything below is per-task user space.

/// Start of the shared kernel quarter.
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// Physical memory reachable through the direct map.
pub const DIRECT_MAP_SIZE: u32 = 128 * 1024 * 1024;

/// Heap window; faults inside it are demand-paged.
pub const KERNEL_HEAP_START: u32 = 0xD000_0000;
pub const KERNEL_HEAP_END: u32 = 0xE000_0000;

/// Pages reserved for short-lived kernel views of foreign frames.
pub const TEMP_WINDOW_BASE: u32 = 0xFFC0_0000;
pub const TEMP_WINDOW_PAGES: usize = 16;

/// Lowest user address; the first 4 MiB stay unmapped to catch null derefs.
pub const USER_BASE: u32 = 0x0040_0000;
pub const USER_END: u32 = KERNEL_BASE;

pub const USER_STACK_TOP: u32 = 0xBFFF_F000;
pub const USER_STACK_PAGES: usize = 16;

/// First page-directory slot of the kernel quarter.
pub const KERNEL_PDE_START: usize = (KERNEL_BASE >> 22) as usize;

pub const fn phys_to_virt(phys: u32) -> u32 {
    phys + KERNEL_BASE
}

pub const fn virt_to_phys_direct(virt: u32) -> u32 {
    virt - KERNEL_BASE
}

pub const fn is_user_address(addr: u32) -> bool {
    addr >= USER_BASE && addr < USER_END
}

pub const fn in_heap_window(addr: u32) -> bool {
    addr >= KERNEL_HEAP_START && addr < KERNEL_HEAP_END
}
