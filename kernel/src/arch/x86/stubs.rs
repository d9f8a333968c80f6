//! Trap entry stubs.
//!
//! Every stub leaves the stack shaped like `kite_core::trap::TrapFrame`
//! (error code, vector, `pushad`, data segments), calls
//! `trap_dispatch(frame) -> frame` and resumes on whatever frame comes back.
//! Returning a different task's frame is how a context switch happens.

use core::arch::global_asm;

global_asm!(
    r#"
    .intel_syntax noprefix
    .section .text

    .macro isr_noerr num
        .globl isr_\num
        .type isr_\num, @function
    isr_\num:
        push 0
        push \num
        jmp trap_common
    .endm

    .macro isr_err num
        .globl isr_\num
        .type isr_\num, @function
    isr_\num:
        push \num
        jmp trap_common
    .endm

    .macro irq idx, vector
        .globl irq_\idx
        .type irq_\idx, @function
    irq_\idx:
        push 0
        push \vector
        jmp trap_common
    .endm

    .globl idt_stub_load
    .type idt_stub_load, @function
idt_stub_load:
    mov eax, [esp + 4]
    lidt [eax]
    ret

trap_common:
    pushad
    push ds
    push es
    push fs
    push gs
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    cld
    push esp
    call trap_dispatch
    mov esp, eax

    .globl trap_return
trap_return:
    pop gs
    pop fs
    pop es
    pop ds
    popad
    add esp, 8
    iretd

    isr_noerr 0
    isr_noerr 1
    isr_noerr 2
    isr_noerr 3
    isr_noerr 4
    isr_noerr 5
    isr_noerr 6
    isr_noerr 7
    isr_err   8
    isr_noerr 9
    isr_err   10
    isr_err   11
    isr_err   12
    isr_err   13
    isr_err   14
    isr_noerr 15
    isr_noerr 16
    isr_err   17
    isr_noerr 18
    isr_noerr 19
    isr_noerr 20
    isr_err   21
    isr_noerr 22
    isr_noerr 23
    isr_noerr 24
    isr_noerr 25
    isr_noerr 26
    isr_noerr 27
    isr_noerr 28
    isr_err   29
    isr_err   30
    isr_noerr 31

    irq       0,  32
    irq       1,  33
    irq       2,  34
    irq       3,  35
    irq       4,  36
    irq       5,  37
    irq       6,  38
    irq       7,  39
    irq       8,  40
    irq       9,  41
    irq       10, 42
    irq       11, 43
    irq       12, 44
    irq       13, 45
    irq       14, 46
    irq       15, 47

    isr_noerr 128
    isr_noerr 255
"#
);
