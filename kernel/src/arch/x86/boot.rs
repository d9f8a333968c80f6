//! Multiboot entry point.
//!
//! The loader enters `_start` at the physical load address with paging off.
//! The boot directory maps the first 8 MiB both at 0 and at `0xC000_0000`
//! with 4 MiB pages so the jump to the linked (higher-half) addresses works;
//! `mem::paging` replaces it with the real kernel directory shortly after.

use core::arch::global_asm;

pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

extern "C" {
    static boot_stack_top: u8;
    static __kernel_end: u8;
}

/// Top of the stack `kmain` runs on; becomes the idle task's stack.
pub fn boot_stack_top_addr() -> usize {
    unsafe { core::ptr::addr_of!(boot_stack_top) as usize }
}

/// First virtual address past the kernel image and its bss.
pub fn kernel_end_addr() -> usize {
    unsafe { core::ptr::addr_of!(__kernel_end) as usize }
}

global_asm!(
    r#"
    .intel_syntax noprefix

    .set MB_MAGIC, 0x1BADB002
    .set MB_FLAGS, 0x00000003
    .set MB_CHECKSUM, -(MB_MAGIC + MB_FLAGS)
    .set PDE_LARGE, 0x83
    .set BOOT_STACK_SIZE, 16384

    .section .multiboot, "a"
    .align 4
    .long MB_MAGIC
    .long MB_FLAGS
    .long MB_CHECKSUM

    .section .boot.data, "aw"
    .align 4096
boot_page_directory:
    .long 0x00000000 + PDE_LARGE
    .long 0x00400000 + PDE_LARGE
    .fill 766, 4, 0
    .long 0x00000000 + PDE_LARGE
    .long 0x00400000 + PDE_LARGE
    .fill 254, 4, 0

    .section .boot.text, "ax"
    .globl _start
    .type _start, @function
_start:
    cli
    mov ecx, cr4
    or ecx, 0x10
    mov cr4, ecx
    mov ecx, offset boot_page_directory
    mov cr3, ecx
    mov ecx, cr0
    or ecx, 0x80010000
    mov cr0, ecx
    lea ecx, [higher_half_entry]
    jmp ecx

    .section .text
higher_half_entry:
    mov esp, offset boot_stack_top
    xor ebp, ebp
    push ebx
    push eax
    call kmain
2:
    cli
    hlt
    jmp 2b

    .section .bss
    .align 16
boot_stack_bottom:
    .skip BOOT_STACK_SIZE
    .globl boot_stack_top
boot_stack_top:
"#
);
