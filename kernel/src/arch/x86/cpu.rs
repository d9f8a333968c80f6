use core::arch::asm;

const EFLAGS_IF: u32 = 1 << 9;

const CR0_MP: u32 = 1 << 1;
const CR0_EM: u32 = 1 << 2;
const CR0_TS: u32 = 1 << 3;
const CR0_NE: u32 = 1 << 5;

#[inline(always)]
pub fn enable_interrupts() {
    unsafe { asm!("sti", options(nomem, nostack)) };
}

#[inline(always)]
pub fn disable_interrupts() {
    unsafe { asm!("cli", options(nomem, nostack)) };
}

pub fn interrupts_enabled() -> bool {
    let flags: u32;
    unsafe { asm!("pushfd", "pop {}", out(reg) flags, options(nomem, preserves_flags)) };
    flags & EFLAGS_IF != 0
}

/// Clears IF for its lifetime and restores the previous state on drop.
pub struct InterruptGuard {
    was_enabled: bool,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let was_enabled = interrupts_enabled();
        disable_interrupts();
        Self { was_enabled }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            enable_interrupts();
        }
    }
}

pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let _guard = InterruptGuard::new();
    f()
}

/// Waits for the next interrupt with interrupts enabled.
#[inline(always)]
pub fn wait_for_interrupt() {
    unsafe { asm!("sti", "hlt", options(nomem, nostack)) };
}

pub fn halt_forever() -> ! {
    loop {
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

/// x87 on, no lazy switching: tasks share one FPU state.
pub fn enable_fpu() {
    unsafe {
        let mut cr0: u32;
        asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        cr0 &= !(CR0_EM | CR0_TS);
        cr0 |= CR0_MP | CR0_NE;
        asm!("mov cr0, {}", in(reg) cr0, options(nomem, nostack, preserves_flags));
        asm!("fninit", options(nomem, nostack));
    }
}
