use core::ptr;

use kite_core::mem::layout::phys_to_virt;

const VGA_PHYS: u32 = 0xB8000;
pub const WIDTH: usize = 80;
pub const HEIGHT: usize = 25;
pub const DEFAULT_ATTR: u8 = 0x0F;
pub const ALERT_ATTR: u8 = 0x4F;

fn buffer() -> *mut u16 {
    phys_to_virt(VGA_PHYS) as usize as *mut u16
}

#[inline(always)]
pub fn write_at(row: usize, col: usize, byte: u8, attr: u8) {
    let value = ((attr as u16) << 8) | byte as u16;
    unsafe { ptr::write_volatile(buffer().add(row * WIDTH + col), value) };
}

pub fn clear_row(row: usize) {
    for col in 0..WIDTH {
        write_at(row, col, b' ', DEFAULT_ATTR);
    }
}

pub fn scroll_up() {
    unsafe { ptr::copy(buffer().add(WIDTH), buffer(), WIDTH * (HEIGHT - 1)) };
    clear_row(HEIGHT - 1);
}

pub fn clear_screen() {
    for row in 0..HEIGHT {
        clear_row(row);
    }
}
