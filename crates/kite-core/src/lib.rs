#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod config;
pub mod drivers;
pub mod elf;
pub mod mem;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod vfs;

pub mod fs {
    pub mod devfs;
    pub mod fat;
    pub mod ramfs;
}
