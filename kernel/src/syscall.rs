//! Binds the `int 0x80` table to the running kernel.

use core::ptr;

use kite_core::syscall::{self, SyscallHost, WaitStatus};
use kite_core::trap::TrapFrame;
use log::{trace, warn};

use crate::drivers::console;
use crate::{config, task};

struct KernelHost;

impl SyscallHost for KernelHost {
    fn user_range_ok(&self, addr: u32, len: u32) -> bool {
        task::current_owns(addr, len)
    }

    fn copy_from_user(&self, addr: u32, buf: &mut [u8]) {
        unsafe { ptr::copy_nonoverlapping(addr as usize as *const u8, buf.as_mut_ptr(), buf.len()) };
    }

    fn copy_to_user(&mut self, addr: u32, bytes: &[u8]) {
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), addr as usize as *mut u8, bytes.len()) };
    }

    fn console_write(&mut self, bytes: &[u8]) {
        if let Err(err) = console::write_bytes(bytes) {
            warn!("[syscall] console write failed: {:?}", err);
        }
    }

    fn current_pid(&self) -> u32 {
        task::current_pid()
    }

    fn yield_now(&mut self) {
        task::yield_current();
    }

    fn sleep_ms(&mut self, ms: u32) {
        task::sleep_current(config().ms_to_ticks(ms));
    }

    fn exit(&mut self, code: i32) {
        task::kill_current(code);
    }

    fn exec(&mut self, path: &str, frame: &mut TrapFrame) -> bool {
        match task::exec_current(path, frame) {
            Ok(()) => true,
            Err(err) => {
                warn!("[syscall] exec '{}' failed: {:?}", path, err);
                false
            }
        }
    }

    fn wait(&mut self) -> WaitStatus {
        task::wait_child()
    }
}

/// Runs with no lock held, so a copy that touches a not-yet-mapped user
/// page is served by the fault handler.
pub fn handle(frame: &mut TrapFrame) {
    let number = frame.syscall_number();
    let completion = syscall::dispatch(&mut KernelHost, frame);
    trace!("[syscall] pid {} call {} -> {:?}", task::current_pid(), number, completion);
}
