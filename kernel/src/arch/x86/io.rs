#![allow(dead_code)]

pub mod ports {
    use core::arch::asm;

    #[inline(always)]
    pub unsafe fn outb(port: u16, value: u8) {
        asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
    }

    #[inline(always)]
    pub unsafe fn inb(port: u16) -> u8 {
        let value: u8;
        asm!("in al, dx", in("dx") port, out("al") value, options(nomem, nostack, preserves_flags));
        value
    }

    #[inline(always)]
    pub unsafe fn outw(port: u16, value: u16) {
        asm!("out dx, ax", in("dx") port, in("ax") value, options(nomem, nostack, preserves_flags));
    }

    #[inline(always)]
    pub unsafe fn inw(port: u16) -> u16 {
        let value: u16;
        asm!("in ax, dx", in("dx") port, out("ax") value, options(nomem, nostack, preserves_flags));
        value
    }

    #[inline(always)]
    pub unsafe fn insw(port: u16, buffer: *mut u16, count: usize) {
        if count == 0 {
            return;
        }
        asm!(
            "rep insw",
            in("dx") port,
            inout("edi") buffer => _,
            inout("ecx") count => _,
            options(nostack)
        );
    }

    #[inline(always)]
    pub unsafe fn outsw(port: u16, buffer: *const u16, count: usize) {
        if count == 0 {
            return;
        }
        // esi is reserved by LLVM on i686
        asm!(
            "xchg esi, {src}",
            "rep outsw",
            "xchg esi, {src}",
            src = inout(reg) buffer => _,
            in("dx") port,
            inout("ecx") count => _,
            options(nostack)
        );
    }

    /// Short delay through the unused POST port.
    #[inline(always)]
    pub unsafe fn io_wait() {
        outb(0x80, 0);
    }
}

pub use self::ports::{inb, insw, io_wait, outb, outsw};
