#![no_std]
#![no_main]

use core::arch::{asm, naked_asm};
use core::ffi::CStr;

const SYS_EXIT: u32 = 0;
const SYS_WRITE: u32 = 1;
const SYS_GETPID: u32 = 4;
const SYS_SLEEP: u32 = 5;

const EXIT_CODE: i32 = 7;

/// Entered by `iret` with user selectors in `cs`/`ss` only; the data
/// segments are reloaded before any Rust code runs.
#[unsafe(naked)]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    naked_asm!(
        "mov ax, 0x23",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "call {main}",
        "ud2",
        main = sym user_main,
    )
}

extern "C" fn user_main() -> ! {
    write(c"hello from user\n");
    if getpid() > 0 {
        sleep(10);
        write(c"hello again after a nap\n");
    }
    exit(EXIT_CODE)
}

fn syscall1(number: u32, arg: u32) -> i32 {
    let ret: u32;
    unsafe {
        asm!(
            "push ebx",
            "mov ebx, {arg}",
            "int 0x80",
            "pop ebx",
            arg = in(reg) arg,
            inlateout("eax") number => ret,
        );
    }
    ret as i32
}

fn write(text: &CStr) -> i32 {
    syscall1(SYS_WRITE, text.as_ptr() as u32)
}

fn getpid() -> i32 {
    syscall1(SYS_GETPID, 0)
}

fn sleep(ms: u32) {
    syscall1(SYS_SLEEP, ms);
}

fn exit(code: i32) -> ! {
    syscall1(SYS_EXIT, code as u32);
    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    exit(-1)
}
