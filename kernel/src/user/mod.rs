//! Ring-3 programs: loading ELF images into fresh address spaces.

pub mod loader;

pub use loader::{load_image, load_program, LoadError, LoadedImage};

/// Last path component, used as the task name.
pub fn program_name(path: &str) -> &str {
    path.rsplit('/').find(|part| !part.is_empty()).unwrap_or(path)
}
