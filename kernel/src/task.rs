#![allow(dead_code)]

//! Kernel side of tasking: the global scheduler, the trap-exit switch, and
//! the kernel-task system-call wrappers.

use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::vec::Vec;

use kite_core::mem::layout::{KERNEL_BASE, USER_STACK_PAGES, USER_STACK_TOP};
use kite_core::mem::paging::Region;
use kite_core::syscall::{WaitStatus, SYS_EXIT, SYS_GETPID, SYS_SLEEP, SYS_WAIT, SYS_WRITE, SYS_YIELD};
use kite_core::task::{Pid, Ring, Scheduler, Task, TaskError, TaskInit, TaskSnapshot, WaitOutcome};
use kite_core::trap::TrapFrame;
use log::{debug, info, warn};
use spin::Mutex;

use crate::arch::x86::cpu::{self, without_interrupts};
use crate::arch::x86::{boot, gdt, mmu};
use crate::mem::paging::kernel_directory;
use crate::mem::with_paging;
use crate::user::{self, LoadError, LoadedImage};

pub type KernelEntry = extern "C" fn() -> !;

static SCHED: Mutex<Scheduler> = Mutex::new(Scheduler::new(1));
static RUNNING: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpawnError {
    Load(LoadError),
    Task(TaskError),
}

impl From<LoadError> for SpawnError {
    fn from(err: LoadError) -> Self {
        SpawnError::Load(err)
    }
}

impl From<TaskError> for SpawnError {
    fn from(err: TaskError) -> Self {
        SpawnError::Task(err)
    }
}

/// Adopts the boot context as the idle task and enables interrupts.
pub fn init(quantum: u32) {
    let stack_top = boot::boot_stack_top_addr();
    without_interrupts(|| {
        let mut sched = SCHED.lock();
        sched.set_quantum(quantum);
        sched.install_idle("idle", kernel_directory(), stack_top);
    });
    gdt::set_kernel_stack(stack_top as u32);
    RUNNING.store(true, Ordering::Release);
    info!("[task] scheduler running, quantum {} tick(s)", quantum);
    cpu::enable_interrupts();
}

/// Timer hook; runs in interrupt context.
pub fn on_tick() {
    if RUNNING.load(Ordering::Acquire) {
        SCHED.lock().tick();
    }
}

/// Called on every trap exit with the saved frame of the interrupted task.
/// Returns the frame to resume and loads that task's directory and ring-0
/// stack.
pub fn resume(sp: usize) -> usize {
    if !RUNNING.load(Ordering::Acquire) {
        return sp;
    }
    let target = SCHED.lock().switch(sp);
    if target.switched {
        mmu::switch_directory(target.directory);
        debug!("[task] switch to pid {}", target.pid);
    }
    gdt::set_kernel_stack(target.kernel_stack_top as u32);
    target.sp
}

pub fn spawn_kernel(name: &str, entry: KernelEntry) -> Result<Pid, TaskError> {
    let init = TaskInit::kernel(name, entry as usize as u32, kernel_directory())?;
    let pid = without_interrupts(|| SCHED.lock().spawn(init))?;
    info!("[task] kernel task '{}' is pid {}", name, pid);
    Ok(pid)
}

/// Loads the program at `path` and starts it in ring 3.
pub fn spawn_user(path: &str) -> Result<Pid, SpawnError> {
    let loaded = user::load_program(path)?;
    spawn_loaded(user::program_name(path), loaded)
}

pub fn spawn_loaded(name: &str, loaded: LoadedImage) -> Result<Pid, SpawnError> {
    let LoadedImage { space, image } = loaded;
    let directory = space.directory();
    let init = match TaskInit::user(name, space, image, USER_STACK_PAGES) {
        Ok(init) => init,
        Err(err) => {
            warn!("[task] no kernel stack for '{}', pd=0x{:08X} leaked", name, directory);
            return Err(err.into());
        }
    };
    let pid = without_interrupts(|| SCHED.lock().spawn(init))?;
    info!("[task] user task '{}' is pid {} entry=0x{:08X}", name, pid, image.entry);
    Ok(pid)
}

/// Idle loop: reaps orphaned zombies and halts until the next interrupt.
pub fn idle() -> ! {
    loop {
        let orphans: Vec<Task> = without_interrupts(|| SCHED.lock().reap_orphans());
        for task in orphans {
            debug!("[task] reaped orphan pid {} code {}", task.pid(), task.exit_code());
            release(task);
        }
        cpu::wait_for_interrupt();
    }
}

/// Returns a reaped task's address space to the frame allocator; its
/// kernel stack goes back to the heap when `task` drops.
pub fn release(mut task: Task) {
    if let Some(mut space) = task.take_space() {
        if space.release() {
            let freed = with_paging(|paging| paging.destroy_address_space(space));
            debug!("[task] pid {} released {} frame(s)", task.pid(), freed);
        }
    }
}

pub fn current_pid() -> Pid {
    without_interrupts(|| SCHED.lock().current_pid())
}

pub fn current_ring() -> Option<Ring> {
    without_interrupts(|| SCHED.lock().current().map(Task::ring))
}

/// Runs `f` on the current task's user regions; empty for kernel tasks.
pub fn with_current_regions<R>(f: impl FnOnce(&[Region]) -> R) -> R {
    without_interrupts(|| {
        let sched = SCHED.lock();
        let regions = sched
            .current()
            .and_then(Task::space)
            .map_or(&[][..], |space| space.regions());
        f(regions)
    })
}

/// True when the current task may hand `[addr, addr + len)` to the kernel.
pub fn current_owns(addr: u32, len: u32) -> bool {
    without_interrupts(|| {
        let sched = SCHED.lock();
        match sched.current() {
            Some(task) if task.ring() == Ring::User => task.space().is_some_and(|space| space.owns_range(addr, len)),
            Some(_) => addr >= KERNEL_BASE && addr.checked_add(len).is_some(),
            None => false,
        }
    })
}

pub fn yield_current() {
    without_interrupts(|| SCHED.lock().yield_current());
}

pub fn sleep_current(ticks: u64) {
    without_interrupts(|| SCHED.lock().sleep_current(ticks));
}

pub fn kill_current(code: i32) {
    if let Err(err) = without_interrupts(|| SCHED.lock().exit_current(code)) {
        warn!("[task] exit of pid {} refused: {:?}", current_pid(), err);
    }
}

pub fn wait_child() -> WaitStatus {
    let outcome = without_interrupts(|| SCHED.lock().wait_current());
    match outcome {
        WaitOutcome::Reaped { pid, code, task } => {
            release(task);
            WaitStatus::Collected { pid, code }
        }
        WaitOutcome::Pending => WaitStatus::Blocked,
        WaitOutcome::NoChildren => WaitStatus::NoChildren,
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExecError {
    KernelCaller,
    Load(LoadError),
    NoTask,
}

/// Replaces the calling user task's image with the program at `path` and
/// points `frame` at its entry. The old address space is torn down.
pub fn exec_current(path: &str, frame: &mut TrapFrame) -> Result<(), ExecError> {
    if current_ring() != Some(Ring::User) {
        return Err(ExecError::KernelCaller);
    }
    let LoadedImage { space, image } = user::load_program(path).map_err(ExecError::Load)?;
    let directory = space.directory();

    let replaced = without_interrupts(|| {
        let mut sched = SCHED.lock();
        let task = sched.current_mut().ok_or(ExecError::NoTask)?;
        Ok(task.replace_image(space, image, USER_STACK_PAGES))
    })?;
    mmu::switch_directory(directory);

    if let Some(mut old) = replaced {
        if old.release() {
            with_paging(|paging| paging.destroy_address_space(old));
        }
    }
    *frame = TrapFrame::user(image.entry, USER_STACK_TOP);
    info!("[task] pid {} exec '{}' entry=0x{:08X}", current_pid(), path, image.entry);
    Ok(())
}

pub fn snapshots() -> Vec<TaskSnapshot> {
    without_interrupts(|| SCHED.lock().snapshots())
}

pub fn snapshot(pid: Pid) -> Option<TaskSnapshot> {
    without_interrupts(|| SCHED.lock().snapshot(pid))
}

pub fn context_switches() -> u64 {
    without_interrupts(|| SCHED.lock().context_switches())
}

pub fn dump_tasks() {
    without_interrupts(|| SCHED.lock().dump_all());
}

/// `int 0x80` from ring 0. `ebx` is saved by hand because the compiler may
/// reserve it.
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

pub fn sys_write(text: &core::ffi::CStr) -> i32 {
    syscall1(SYS_WRITE, text.as_ptr() as usize as u32)
}

pub fn sys_yield() {
    syscall1(SYS_YIELD, 0);
}

pub fn sys_getpid() -> Pid {
    syscall1(SYS_GETPID, 0) as Pid
}

pub fn sys_sleep(ms: u32) {
    syscall1(SYS_SLEEP, ms);
}

/// Returns the collected child's pid, or -1 with no children.
pub fn sys_wait(status: Option<&mut i32>) -> i32 {
    let ptr = status.map_or(0, |status| status as *mut i32 as usize as u32);
    syscall1(SYS_WAIT, ptr)
}

pub fn sys_exit(code: i32) -> ! {
    syscall1(SYS_EXIT, code as u32);
    unreachable!("[task] exited task resumed");
}
