#![no_std]
#![no_main]

extern crate alloc;

mod arch;
mod drivers;
mod fs;
mod interrupts;
mod klog;
mod mem;
mod syscall;
mod task;
#[cfg(kernel_test)]
mod tests;
mod timer;
mod user;

use core::panic::PanicInfo;

use kite_core::config::{KernelConfig, RootDevice};
use log::info;
use spin::Once;

use crate::arch::x86::{cpu, gdt};
use crate::mem::phys::BootInfo;

static CONFIG: Once<KernelConfig> = Once::new();

pub fn config() -> &'static KernelConfig {
    CONFIG.call_once(KernelConfig::default)
}

#[no_mangle]
pub extern "C" fn kmain(multiboot_magic: u32, multiboot_info: u32) -> ! {
    klog::init();

    let boot = match unsafe { BootInfo::from_multiboot(multiboot_magic, multiboot_info) } {
        Ok(boot) => boot,
        Err(err) => panic!("[boot] unusable multiboot handoff: {:?}", err),
    };
    info!("[boot] Kite starting, cmdline='{}'", boot.cmdline());

    gdt::init();
    cpu::enable_fpu();

    if let Err(err) = mem::init(&boot) {
        panic!("[mem] initialisation failed: {:?}", err);
    }

    let config = CONFIG.call_once(|| KernelConfig::parse(boot.cmdline()));
    klog::set_level(config.log_level);
    info!(
        "[boot] hz={} quantum={}ms init={} root={:?}",
        config.hz, config.quantum_ms, config.init_path, config.root
    );

    drivers::init();
    drivers::register_builtin();

    interrupts::init();
    timer::init(config.hz);
    drivers::keyboard::init();

    if config.root == RootDevice::Ata0 {
        drivers::register_disks();
    }
    drivers::list_drivers();
    fs::init();

    task::init(config.quantum_ticks());

    #[cfg(kernel_test)]
    tests::run();

    #[cfg(not(kernel_test))]
    start_init(&config.init_path);

    info!("[boot] entering idle loop");
    task::idle()
}

#[cfg(not(kernel_test))]
fn start_init(path: &str) {
    match task::spawn_user(path) {
        Ok(pid) => info!("[boot] started '{}' as pid {}", path, pid),
        Err(err) => log::warn!("[boot] no init program '{}': {:?}", path, err),
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    cpu::disable_interrupts();
    klog::emergency(format_args!("KERNEL PANIC: {}\n", info.message()));
    if let Some(location) = info.location() {
        klog::emergency(format_args!("  at {}:{}\n", location.file(), location.line()));
    }
    drivers::console::emergency(format_args!("KERNEL PANIC: {}\n", info.message()));
    cpu::halt_forever()
}
