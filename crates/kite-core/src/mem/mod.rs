pub mod frame;
pub mod heap;
pub mod layout;
pub mod paging;
pub mod window;

pub const PAGE_SIZE: usize = 4096;

pub const fn align_up(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    (addr + mask) & !mask
}

pub const fn align_down(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

pub const fn is_aligned(addr: usize, align: usize) -> bool {
    align.is_power_of_two() && addr & (align - 1) == 0
}

pub const fn pages_required(length: usize) -> usize {
    if length == 0 {
        return 0;
    }
    (length - 1) / PAGE_SIZE + 1
}
