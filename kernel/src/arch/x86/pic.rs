//! 8259A pair, remapped to vectors 32-47.

use spin::Mutex;

use super::io::{io_wait, outb};

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const PIC_EOI: u8 = 0x20;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;

const CASCADE_LINE: u8 = 2;

/// Master passes IRQ0 (timer) and IRQ1 (keyboard); the cascade opens with
/// the first slave line.
const INITIAL_MASTER_MASK: u8 = !((1 << 0) | (1 << 1));
const INITIAL_SLAVE_MASK: u8 = 0xFF;

struct Masks {
    master: u8,
    slave: u8,
}

static MASKS: Mutex<Masks> = Mutex::new(Masks {
    master: 0xFF,
    slave: 0xFF,
});

pub fn remap(master_offset: u8, slave_offset: u8) {
    let mut masks = MASKS.lock();
    unsafe {
        outb(PIC1_CMD, ICW1_INIT | ICW1_ICW4);
        io_wait();
        outb(PIC2_CMD, ICW1_INIT | ICW1_ICW4);
        io_wait();

        outb(PIC1_DATA, master_offset);
        io_wait();
        outb(PIC2_DATA, slave_offset);
        io_wait();

        outb(PIC1_DATA, 1 << CASCADE_LINE);
        io_wait();
        outb(PIC2_DATA, CASCADE_LINE);
        io_wait();

        outb(PIC1_DATA, ICW4_8086);
        io_wait();
        outb(PIC2_DATA, ICW4_8086);
        io_wait();

        masks.master = INITIAL_MASTER_MASK;
        masks.slave = INITIAL_SLAVE_MASK;
        outb(PIC1_DATA, masks.master);
        outb(PIC2_DATA, masks.slave);
    }
    log::info!(
        "[pic] remapped to {}/{} mask={:02X}/{:02X}",
        master_offset,
        slave_offset,
        masks.master,
        masks.slave
    );
}

/// Acknowledges `vector`; the slave first when the line is on it.
pub fn send_eoi(vector: u8) {
    unsafe {
        if vector >= 40 {
            outb(PIC2_CMD, PIC_EOI);
        }
        outb(PIC1_CMD, PIC_EOI);
    }
}

pub fn unmask(irq: u8) {
    let mut masks = MASKS.lock();
    unsafe {
        if irq < 8 {
            masks.master &= !(1 << irq);
            outb(PIC1_DATA, masks.master);
        } else {
            masks.slave &= !(1 << (irq - 8));
            outb(PIC2_DATA, masks.slave);
            masks.master &= !(1 << CASCADE_LINE);
            outb(PIC1_DATA, masks.master);
        }
    }
}

/// Current `(master, slave)` masks, a set bit blocks the line.
pub fn masks() -> (u8, u8) {
    let masks = MASKS.lock();
    (masks.master, masks.slave)
}
