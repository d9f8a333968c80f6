use core::hint::spin_loop;

use crate::arch::x86::io::{inb, outb};

const COM1_PORT: u16 = 0x3F8;

const DATA: u16 = COM1_PORT;
const INTERRUPT_ENABLE: u16 = COM1_PORT + 1;
const FIFO_CONTROL: u16 = COM1_PORT + 2;
const LINE_CONTROL: u16 = COM1_PORT + 3;
const MODEM_CONTROL: u16 = COM1_PORT + 4;
const LINE_STATUS: u16 = COM1_PORT + 5;

const LSR_TRANSMIT_EMPTY: u8 = 0x20;

pub fn init() {
    unsafe {
        outb(INTERRUPT_ENABLE, 0x00);
        outb(LINE_CONTROL, 0x80); // DLAB on
        outb(DATA, 0x03); // 38400 baud
        outb(INTERRUPT_ENABLE, 0x00);
        outb(LINE_CONTROL, 0x03); // 8N1
        outb(FIFO_CONTROL, 0xC7);
        outb(MODEM_CONTROL, 0x0B);
    }
}

pub fn write_byte(byte: u8) {
    if byte == b'\n' {
        transmit(b'\r');
    }
    transmit(byte);
}

fn transmit(byte: u8) {
    while unsafe { inb(LINE_STATUS) } & LSR_TRANSMIT_EMPTY == 0 {
        spin_loop();
    }
    unsafe { outb(DATA, byte) };
}
