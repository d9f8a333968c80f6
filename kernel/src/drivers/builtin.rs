use kite_core::drivers::{CharDevice, Driver, DriverError, DriverKind};
use log::warn;

use super::{console, keyboard, register_char};

/// Bit-bucket devices. Writes are always accepted and discarded.
enum Sink {
    /// Reads report end of file.
    Null,
    /// Reads fill the buffer with zero bytes.
    Zero,
}

static NULL: Sink = Sink::Null;
static ZERO: Sink = Sink::Zero;

impl Driver for Sink {
    fn name(&self) -> &'static str {
        match self {
            Sink::Null => "null",
            Sink::Zero => "zero",
        }
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Char
    }

    fn init(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

impl CharDevice for Sink {
    fn read(&self, buf: &mut [u8]) -> Result<usize, DriverError> {
        match self {
            Sink::Null => Ok(0),
            Sink::Zero => {
                buf.fill(0);
                Ok(buf.len())
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, DriverError> {
        Ok(buf.len())
    }
}

/// Console, keyboard and the two sinks; each shows up under `/dev`.
pub fn register() {
    let devices: [&'static dyn CharDevice; 4] = [console::driver(), keyboard::driver(), &NULL, &ZERO];
    for device in devices {
        if let Err(err) = register_char(device) {
            warn!("[driver] failed to register {}: {:?}", device.name(), err);
        }
    }
}
