//! `int 0x80` system-call gate.
//!
//! The number arrives in `eax` and up to five arguments in
//! `ebx ecx edx esi edi`. Handlers live in a fixed table indexed by number;
//! unknown numbers and every failure return `-1` in `eax`. Handlers reach
//! kernel services only through [`SyscallHost`].

use alloc::string::String;

use log::trace;

use crate::trap::TrapFrame;

pub mod user;

pub use user::{read_user_cstr, MAX_USER_STRING};

pub const SYS_EXIT: u32 = 0;
pub const SYS_WRITE: u32 = 1;
pub const SYS_READ: u32 = 2;
pub const SYS_YIELD: u32 = 3;
pub const SYS_GETPID: u32 = 4;
pub const SYS_SLEEP: u32 = 5;
pub const SYS_FORK: u32 = 6;
pub const SYS_EXEC: u32 = 7;
pub const SYS_WAIT: u32 = 8;

pub const SYSCALL_COUNT: usize = 9;

pub const FAILURE: i32 = -1;

/// How the trap path finishes a call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Completion {
    /// Store the value in `eax`.
    Return(i32),
    /// Leave `eax` alone and re-run the `int 0x80` when the task resumes.
    Replay,
    /// The frame was rebuilt (exec) or the task is gone (exit).
    Rewritten,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaitStatus {
    Collected { pid: u32, code: i32 },
    Blocked,
    NoChildren,
}

/// Kernel services reachable from system calls.
pub trait SyscallHost {
    /// True when `[addr, addr + len)` lies inside memory the caller owns.
    fn user_range_ok(&self, addr: u32, len: u32) -> bool;

    /// Copies caller memory after `user_range_ok` accepted it.
    fn copy_from_user(&self, addr: u32, buf: &mut [u8]);

    fn copy_to_user(&mut self, addr: u32, bytes: &[u8]);

    fn console_write(&mut self, bytes: &[u8]);

    fn current_pid(&self) -> u32;

    fn yield_now(&mut self);

    fn sleep_ms(&mut self, ms: u32);

    fn exit(&mut self, code: i32);

    /// Replaces the caller's image; on success `frame` enters the new one.
    fn exec(&mut self, path: &str, frame: &mut TrapFrame) -> bool;

    fn wait(&mut self) -> WaitStatus;
}

pub type SyscallFn = fn(&mut dyn SyscallHost, &mut TrapFrame) -> Completion;

pub static SYSCALL_TABLE: [SyscallFn; SYSCALL_COUNT] = [
    sys_exit,
    sys_write,
    sys_read,
    sys_yield,
    sys_getpid,
    sys_sleep,
    sys_fork,
    sys_exec,
    sys_wait,
];

pub fn dispatch(host: &mut dyn SyscallHost, frame: &mut TrapFrame) -> Completion {
    let number = frame.syscall_number();
    let completion = match SYSCALL_TABLE.get(number as usize) {
        Some(handler) => handler(host, frame),
        None => {
            trace!("[syscall] unknown number {}", number);
            Completion::Return(FAILURE)
        }
    };
    if let Completion::Return(value) = completion {
        frame.set_eax(value as u32);
    } else if completion == Completion::Replay {
        frame.replay_syscall();
    }
    completion
}

fn sys_exit(host: &mut dyn SyscallHost, frame: &mut TrapFrame) -> Completion {
    let [code, ..] = frame.syscall_args();
    host.exit(code as i32);
    Completion::Rewritten
}

fn sys_write(host: &mut dyn SyscallHost, frame: &mut TrapFrame) -> Completion {
    let [ptr, ..] = frame.syscall_args();
    match read_user_cstr(host, ptr) {
        Some(text) => {
            host.console_write(text.as_bytes());
            Completion::Return(0)
        }
        None => Completion::Return(FAILURE),
    }
}

fn sys_read(_host: &mut dyn SyscallHost, _frame: &mut TrapFrame) -> Completion {
    Completion::Return(FAILURE)
}

fn sys_yield(host: &mut dyn SyscallHost, _frame: &mut TrapFrame) -> Completion {
    host.yield_now();
    Completion::Return(0)
}

fn sys_getpid(host: &mut dyn SyscallHost, _frame: &mut TrapFrame) -> Completion {
    Completion::Return(host.current_pid() as i32)
}

fn sys_sleep(host: &mut dyn SyscallHost, frame: &mut TrapFrame) -> Completion {
    let [ms, ..] = frame.syscall_args();
    host.sleep_ms(ms);
    Completion::Return(0)
}

fn sys_exec(host: &mut dyn SyscallHost, frame: &mut TrapFrame) -> Completion {
    let [ptr, ..] = frame.syscall_args();
    let path: String = match read_user_cstr(host, ptr) {
        Some(path) => path,
        None => return Completion::Return(FAILURE),
    };
    if host.exec(&path, frame) {
        Completion::Rewritten
    } else {
        Completion::Return(FAILURE)
    }
}

fn sys_fork(_host: &mut dyn SyscallHost, _frame: &mut TrapFrame) -> Completion {
    Completion::Return(FAILURE)
}

fn sys_wait(host: &mut dyn SyscallHost, frame: &mut TrapFrame) -> Completion {
    let [status_ptr, ..] = frame.syscall_args();
    if status_ptr != 0 && !host.user_range_ok(status_ptr, 4) {
        return Completion::Return(FAILURE);
    }
    match host.wait() {
        WaitStatus::Collected { pid, code } => {
            if status_ptr != 0 {
                host.copy_to_user(status_ptr, &code.to_le_bytes());
            }
            Completion::Return(pid as i32)
        }
        WaitStatus::Blocked => Completion::Replay,
        WaitStatus::NoChildren => Completion::Return(FAILURE),
    }
}
