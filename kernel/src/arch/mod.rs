#[cfg(target_arch = "x86")]
pub mod x86;

#[cfg(not(target_arch = "x86"))]
compile_error!("Kite only runs on 32-bit x86");
