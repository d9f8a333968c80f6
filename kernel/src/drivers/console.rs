//! VGA text console mirrored to COM1. Understands `\n`, `\r`, `\b` and
//! `\t`; every other byte is drawn as-is.

use core::fmt::{self, Write};

use kite_core::drivers::{CharDevice, Driver, DriverError, DriverKind};
use spin::Mutex;

use crate::arch::x86::cpu::without_interrupts;
use crate::arch::x86::drivers::{serial, vga as arch};

pub struct Console;

struct ConsoleState {
    row: usize,
    col: usize,
    attr: u8,
}

static CONSOLE: Console = Console;
static STATE: Mutex<ConsoleState> = Mutex::new(ConsoleState {
    row: 0,
    col: 0,
    attr: arch::DEFAULT_ATTR,
});

impl Console {
    pub fn instance() -> &'static Console {
        &CONSOLE
    }
}

impl Driver for Console {
    fn name(&self) -> &'static str {
        "console"
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Char
    }

    fn init(&self) -> Result<(), DriverError> {
        clear();
        Ok(())
    }
}

impl CharDevice for Console {
    fn read(&self, _buf: &mut [u8]) -> Result<usize, DriverError> {
        Ok(0)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, DriverError> {
        without_interrupts(|| {
            let mut state = STATE.lock();
            for &byte in buf {
                write_byte(&mut state, byte);
                serial::write_byte(byte);
            }
        });
        Ok(buf.len())
    }
}

fn write_byte(state: &mut ConsoleState, byte: u8) {
    match byte {
        b'\n' => new_line(state),
        b'\r' => state.col = 0,
        b'\x08' => {
            if state.col > 0 {
                state.col -= 1;
                arch::write_at(state.row, state.col, b' ', state.attr);
            }
        }
        b'\t' => {
            let next_tab = (state.col / 8 + 1) * 8;
            if next_tab >= arch::WIDTH {
                new_line(state);
            } else {
                state.col = next_tab;
            }
        }
        byte => put_char(state, byte),
    }
}

fn put_char(state: &mut ConsoleState, byte: u8) {
    if state.col >= arch::WIDTH {
        new_line(state);
    }
    arch::write_at(state.row, state.col, byte, state.attr);
    state.col += 1;
}

fn new_line(state: &mut ConsoleState) {
    state.col = 0;
    state.row += 1;
    if state.row >= arch::HEIGHT {
        arch::scroll_up();
        state.row = arch::HEIGHT - 1;
    }
}

pub fn driver() -> &'static dyn CharDevice {
    Console::instance()
}

pub fn write_bytes(buf: &[u8]) -> Result<usize, DriverError> {
    driver().write(buf)
}

pub fn clear() {
    without_interrupts(|| {
        let mut state = STATE.lock();
        arch::clear_screen();
        state.row = 0;
        state.col = 0;
    });
}

struct ConsoleWriter<'a> {
    state: &'a mut ConsoleState,
}

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            write_byte(self.state, byte);
        }
        Ok(())
    }
}

/// Fatal-path output: breaks the lock if a dying context still holds it.
pub fn emergency(args: fmt::Arguments) {
    if STATE.is_locked() {
        unsafe { STATE.force_unlock() };
    }
    let mut state = STATE.lock();
    state.attr = arch::ALERT_ATTR;
    let _ = ConsoleWriter { state: &mut *state }.write_fmt(args);
    state.attr = arch::DEFAULT_ATTR;
}
