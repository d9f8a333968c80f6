//! Driver registry. Devices are `'static` singletons; the registry only
//! records them so the device filesystem and the boot log can find them.

use alloc::vec::Vec;

use kite_core::drivers::{BlockDevice, CharDevice, DriverError, DriverKind};
use log::{info, warn};
use spin::Mutex;

use crate::arch::x86::cpu::without_interrupts;
use crate::arch::x86::drivers::ata::AtaPrimaryMaster;

mod builtin;
pub mod console;
pub mod keyboard;

const MAX_DRIVERS: usize = 16;

#[derive(Copy, Clone)]
pub enum DriverSlot {
    Block(&'static dyn BlockDevice),
    Char(&'static dyn CharDevice),
}

impl DriverSlot {
    pub fn kind(&self) -> DriverKind {
        match self {
            DriverSlot::Block(_) => DriverKind::Block,
            DriverSlot::Char(_) => DriverKind::Char,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DriverSlot::Block(dev) => dev.name(),
            DriverSlot::Char(dev) => dev.name(),
        }
    }
}

static REGISTRY: Mutex<Vec<DriverSlot>> = Mutex::new(Vec::new());

pub fn init() {
    info!("[driver] registry ready");
}

fn insert(slot: DriverSlot) -> Result<(), DriverError> {
    without_interrupts(|| {
        let mut registry = REGISTRY.lock();
        if registry.len() >= MAX_DRIVERS {
            return Err(DriverError::RegistryFull);
        }
        registry.push(slot);
        Ok(())
    })
}

pub fn register_block(device: &'static dyn BlockDevice) -> Result<(), DriverError> {
    device.init()?;
    insert(DriverSlot::Block(device))?;
    info!("[driver] registered block device '{}'", device.name());
    Ok(())
}

pub fn register_char(device: &'static dyn CharDevice) -> Result<(), DriverError> {
    device.init()?;
    insert(DriverSlot::Char(device))?;
    info!("[driver] registered char device '{}'", device.name());
    Ok(())
}

pub fn register_builtin() {
    builtin::register();
}

/// Looks for the primary ATA disk; a missing disk is logged, not fatal.
pub fn register_disks() {
    if let Err(err) = register_block(AtaPrimaryMaster::instance()) {
        warn!("[driver] no primary ATA disk: {:?}", err);
    }
}

pub fn drivers() -> Vec<DriverSlot> {
    without_interrupts(|| REGISTRY.lock().clone())
}

pub fn find_block(name: &str) -> Option<&'static dyn BlockDevice> {
    drivers().into_iter().find_map(|slot| match slot {
        DriverSlot::Block(dev) if dev.name() == name => Some(dev),
        _ => None,
    })
}

pub fn list_drivers() {
    for slot in drivers() {
        info!("[driver] {} ({:?})", slot.name(), slot.kind());
    }
}
