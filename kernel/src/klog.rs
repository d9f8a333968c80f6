//! `log` backend writing `[LEVEL] target: message` lines to COM1.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use crate::arch::x86::cpu::without_interrupts;
use crate::arch::x86::drivers::serial;

struct SerialWriter;

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            serial::write_byte(byte);
        }
        Ok(())
    }
}

static SERIAL: Mutex<SerialWriter> = Mutex::new(SerialWriter);

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        without_interrupts(|| {
            let mut serial = SERIAL.lock();
            let _ = writeln!(serial, "[{}] {}: {}", record.level(), record.target(), record.args());
        });
    }

    fn flush(&self) {}
}

pub fn init() {
    serial::init();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Unlocked write for the panic path.
pub fn emergency(args: fmt::Arguments) {
    let _ = SerialWriter.write_fmt(args);
}
