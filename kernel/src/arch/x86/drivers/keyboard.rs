//! PS/2 keyboard: IRQ1 pushes raw set-1 scancodes into a ring buffer.

use kite_core::trap::TrapFrame;
use log::{debug, info};
use spin::Mutex;

use crate::arch::x86::cpu::without_interrupts;
use crate::arch::x86::io::inb;
use crate::interrupts;

const DATA_PORT: u16 = 0x60;
const KEYBOARD_IRQ: u8 = 1;
const BUFFER_SIZE: usize = 256;

static STATE: Mutex<ScancodeRing> = Mutex::new(ScancodeRing::new());

struct ScancodeRing {
    buffer: [u8; BUFFER_SIZE],
    head: usize,
    tail: usize,
    dropped: usize,
}

impl ScancodeRing {
    const fn new() -> Self {
        Self {
            buffer: [0; BUFFER_SIZE],
            head: 0,
            tail: 0,
            dropped: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        if self.is_full() {
            self.head = (self.head + 1) % BUFFER_SIZE;
            self.dropped += 1;
        }
        self.buffer[self.tail] = byte;
        self.tail = (self.tail + 1) % BUFFER_SIZE;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buffer[self.head];
        self.head = (self.head + 1) % BUFFER_SIZE;
        Some(byte)
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % BUFFER_SIZE == self.head
    }
}

pub fn init() {
    interrupts::install(KEYBOARD_IRQ, keyboard_irq);
    info!("[keyboard] PS/2 keyboard on IRQ{}", KEYBOARD_IRQ);
}

/// Drains buffered scancodes into `buf`; never blocks.
pub fn read(buf: &mut [u8]) -> usize {
    without_interrupts(|| {
        let mut state = STATE.lock();
        let mut count = 0;
        while count < buf.len() {
            match state.pop() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        count
    })
}

fn keyboard_irq(_frame: &mut TrapFrame) {
    let scancode = unsafe { inb(DATA_PORT) };
    let mut state = STATE.lock();
    state.push(scancode);
    if state.dropped > 0 && state.dropped % 64 == 1 {
        debug!("[keyboard] buffer full, {} scancodes dropped", state.dropped);
    }
}
