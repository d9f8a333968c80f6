use super::io::outb;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_INPUT_HZ: u32 = 1_193_182;

/// Channel 0, lobyte/hibyte, rate generator.
const MODE_RATE_GENERATOR: u8 = 0x36;

/// Programs channel 0 to fire IRQ0 `hz` times a second.
pub fn init_frequency(hz: u32) -> u32 {
    let divisor = (PIT_INPUT_HZ / hz.max(1)).clamp(1, 0xFFFF);
    unsafe {
        outb(PIT_COMMAND, MODE_RATE_GENERATOR);
        outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }
    PIT_INPUT_HZ / divisor
}
