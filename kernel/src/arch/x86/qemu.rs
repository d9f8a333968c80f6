use super::cpu;
use super::io::outb;

const ISA_DEBUG_EXIT: u16 = 0xF4;

/// QEMU exits with status `(code << 1) | 1`.
pub fn exit(code: u8) -> ! {
    log::info!("[exit] kernel exiting qemu: {}", code);

    unsafe { outb(ISA_DEBUG_EXIT, code) };
    cpu::halt_forever()
}

pub fn exit_success() -> ! {
    exit(0)
}

pub fn exit_failure() -> ! {
    exit(1)
}
