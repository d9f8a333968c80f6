pub mod ata;
pub mod keyboard;
pub mod serial;
pub mod vga;
