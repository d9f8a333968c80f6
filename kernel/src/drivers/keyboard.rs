use kite_core::drivers::{CharDevice, Driver, DriverError, DriverKind};

use crate::arch::x86::drivers::keyboard as arch;

pub struct Keyboard;

static KEYBOARD: Keyboard = Keyboard;

impl Keyboard {
    pub fn instance() -> &'static Keyboard {
        &KEYBOARD
    }
}

impl Driver for Keyboard {
    fn name(&self) -> &'static str {
        "keyboard"
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Char
    }

    fn init(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

impl CharDevice for Keyboard {
    /// Raw scancodes, oldest first.
    fn read(&self, buf: &mut [u8]) -> Result<usize, DriverError> {
        Ok(arch::read(buf))
    }

    fn write(&self, _buf: &[u8]) -> Result<usize, DriverError> {
        Err(DriverError::Unsupported)
    }
}

pub fn driver() -> &'static dyn CharDevice {
    Keyboard::instance()
}

/// Hooks IRQ1; the line itself is unmasked by the PIC setup.
pub fn init() {
    arch::init();
}
