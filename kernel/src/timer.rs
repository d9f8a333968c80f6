use core::sync::atomic::{AtomicU64, Ordering};

use kite_core::trap::TrapFrame;
use log::info;

use crate::arch::x86::pit;
use crate::{interrupts, task};

const PIT_LINE: u8 = 0;

static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn init(hz: u32) {
    let actual = pit::init_frequency(hz);
    interrupts::install(PIT_LINE, timer_handler);
    info!("[timer] PIT set to {} Hz (requested {})", actual, hz);
}

pub fn ticks() -> u64 {
    TICK_COUNT.load(Ordering::Relaxed)
}

fn timer_handler(_frame: &mut TrapFrame) {
    TICK_COUNT.fetch_add(1, Ordering::Relaxed);
    task::on_tick();
}
