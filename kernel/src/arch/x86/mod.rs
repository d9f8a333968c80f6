pub mod boot;
pub mod cpu;
pub mod drivers;
pub mod gdt;
pub mod idt;
pub mod io;
pub mod mmu;
pub mod pic;
pub mod pit;
#[cfg(kernel_test)]
pub mod qemu;
mod stubs;
