//! Task control blocks.

use alloc::string::String;
use alloc::vec::Vec;
use core::mem::size_of;

use crate::mem::layout::USER_STACK_TOP;
use crate::mem::paging::AddressSpace;
use crate::mem::{align_down, PAGE_SIZE};
use crate::trap::TrapFrame;

pub mod sched;

pub use sched::{Scheduler, SwitchTarget, WaitOutcome};

pub type Pid = u32;

pub const IDLE_PID: Pid = 0;
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;
pub const KERNEL_TASK_USER_STACK_SIZE: usize = 4 * 1024;
pub const DEFAULT_PRIORITY: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Sleeping,
    Zombie,
}

impl TaskState {
    pub fn name(self) -> &'static str {
        match self {
            TaskState::Ready => "Ready",
            TaskState::Running => "Running",
            TaskState::Blocked => "Blocked",
            TaskState::Sleeping => "Sleeping",
            TaskState::Zombie => "Zombie",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ring {
    Kernel,
    User,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TaskError {
    NotFound,
    StackAllocationFailed,
    TooManyTasks,
    NoIdleTask,
    InvalidState,
}

/// Virtual extents of a loaded program image.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ImageExtents {
    pub start: u32,
    pub end: u32,
    pub entry: u32,
}

/// Heap-backed stack owned by exactly one task.
pub struct Stack {
    memory: Vec<u8>,
}

impl Stack {
    pub fn new(size: usize) -> Result<Self, TaskError> {
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(size)
            .map_err(|_| TaskError::StackAllocationFailed)?;
        memory.resize(size, 0);
        Ok(Self { memory })
    }

    pub fn base(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    pub fn top(&self) -> usize {
        self.base() + self.memory.len()
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Copies `frame` just below the top and returns its address.
    pub fn push_frame(&mut self, frame: &TrapFrame) -> usize {
        let offset = align_down(self.memory.len() - size_of::<TrapFrame>(), 16);
        let slot = &mut self.memory[offset..offset + size_of::<TrapFrame>()];
        unsafe {
            (slot.as_mut_ptr() as *mut TrapFrame).write_unaligned(*frame);
        }
        self.base() + offset
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.top()
    }
}

/// Everything needed to create a task.
pub struct TaskInit {
    pub name: String,
    pub ring: Ring,
    pub priority: u8,
    pub directory: u32,
    pub space: Option<AddressSpace>,
    pub kernel_stack: Stack,
    pub user_stack: Option<Stack>,
    pub user_stack_base: u32,
    pub image: ImageExtents,
    pub frame: TrapFrame,
}

impl TaskInit {
    /// Ring-0 task entering `entry` on a fresh kernel stack.
    pub fn kernel(name: &str, entry: u32, directory: u32) -> Result<Self, TaskError> {
        let kernel_stack = Stack::new(KERNEL_STACK_SIZE)?;
        let user_stack = Stack::new(KERNEL_TASK_USER_STACK_SIZE)?;
        Ok(Self {
            name: String::from(name),
            ring: Ring::Kernel,
            priority: DEFAULT_PRIORITY,
            directory,
            space: None,
            user_stack_base: user_stack.base() as u32,
            kernel_stack,
            user_stack: Some(user_stack),
            image: ImageExtents { start: entry, end: entry, entry },
            frame: TrapFrame::kernel(entry),
        })
    }

    /// Ring-3 task running a loaded image inside `space`.
    pub fn user(name: &str, space: AddressSpace, image: ImageExtents, stack_pages: usize) -> Result<Self, TaskError> {
        let kernel_stack = Stack::new(KERNEL_STACK_SIZE)?;
        Ok(Self {
            name: String::from(name),
            ring: Ring::User,
            priority: DEFAULT_PRIORITY,
            directory: space.directory(),
            space: Some(space),
            kernel_stack,
            user_stack: None,
            user_stack_base: USER_STACK_TOP - (stack_pages * PAGE_SIZE) as u32,
            image,
            frame: TrapFrame::user(image.entry, USER_STACK_TOP),
        })
    }
}

pub struct Task {
    pid: Pid,
    name: String,
    state: TaskState,
    priority: u8,
    saved_sp: usize,
    directory: u32,
    space: Option<AddressSpace>,
    kernel_stack: Option<Stack>,
    kernel_stack_top: usize,
    user_stack: Option<Stack>,
    user_stack_base: u32,
    ring: Ring,
    image: ImageExtents,
    slice: u32,
    total_ticks: u64,
    wake_tick: u64,
    parent: Option<Pid>,
    ppid: Pid,
    first_child: Option<Pid>,
    next_sibling: Option<Pid>,
    exit_code: i32,
    reaped: bool,
    waiting: bool,
}

impl Task {
    fn from_init(pid: Pid, parent: Option<Pid>, quantum: u32, init: TaskInit) -> Self {
        let TaskInit {
            name,
            ring,
            priority,
            directory,
            space,
            mut kernel_stack,
            user_stack,
            user_stack_base,
            image,
            frame,
        } = init;
        let saved_sp = kernel_stack.push_frame(&frame);
        Self {
            pid,
            name,
            state: TaskState::Ready,
            priority,
            saved_sp,
            directory,
            space,
            kernel_stack_top: kernel_stack.top(),
            kernel_stack: Some(kernel_stack),
            user_stack,
            user_stack_base,
            ring,
            image,
            slice: quantum,
            total_ticks: 0,
            wake_tick: 0,
            parent,
            ppid: parent.unwrap_or(IDLE_PID),
            first_child: None,
            next_sibling: None,
            exit_code: 0,
            reaped: false,
            waiting: false,
        }
    }

    fn idle(name: &str, directory: u32, stack_top: usize, quantum: u32) -> Self {
        Self {
            pid: IDLE_PID,
            name: String::from(name),
            state: TaskState::Running,
            priority: 0,
            saved_sp: 0,
            directory,
            space: None,
            kernel_stack: None,
            kernel_stack_top: stack_top,
            user_stack: None,
            user_stack_base: 0,
            ring: Ring::Kernel,
            image: ImageExtents::default(),
            slice: quantum,
            total_ticks: 0,
            wake_tick: 0,
            parent: None,
            ppid: IDLE_PID,
            first_child: None,
            next_sibling: None,
            exit_code: 0,
            reaped: false,
            waiting: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn ring(&self) -> Ring {
        self.ring
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    /// Parent PID recorded at creation, kept after reparenting.
    pub fn ppid(&self) -> Pid {
        self.ppid
    }

    pub fn first_child(&self) -> Option<Pid> {
        self.first_child
    }

    pub fn next_sibling(&self) -> Option<Pid> {
        self.next_sibling
    }

    pub fn saved_sp(&self) -> usize {
        self.saved_sp
    }

    pub fn directory(&self) -> u32 {
        self.directory
    }

    pub fn space(&self) -> Option<&AddressSpace> {
        self.space.as_ref()
    }

    pub fn space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.space.as_mut()
    }

    /// Detaches the address space so its owner can tear it down.
    pub fn take_space(&mut self) -> Option<AddressSpace> {
        self.space.take()
    }

    pub fn kernel_stack_top(&self) -> usize {
        self.kernel_stack_top
    }

    pub fn kernel_stack(&self) -> Option<&Stack> {
        self.kernel_stack.as_ref()
    }

    pub fn user_stack_base(&self) -> u32 {
        self.user_stack_base
    }

    pub fn has_user_stack(&self) -> bool {
        self.user_stack.is_some()
    }

    pub fn image(&self) -> ImageExtents {
        self.image
    }

    pub fn slice(&self) -> u32 {
        self.slice
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    pub fn wake_tick(&self) -> u64 {
        self.wake_tick
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self.state, TaskState::Ready | TaskState::Running)
    }

    /// Swaps in a freshly loaded image; returns the space it replaces.
    pub fn replace_image(&mut self, space: AddressSpace, image: ImageExtents, stack_pages: usize) -> Option<AddressSpace> {
        self.directory = space.directory();
        self.image = image;
        self.ring = Ring::User;
        self.user_stack = None;
        self.user_stack_base = USER_STACK_TOP - (stack_pages * PAGE_SIZE) as u32;
        self.space.replace(space)
    }
}

#[derive(Clone, Debug)]
pub struct TaskSnapshot {
    pid: Pid,
    parent: Option<Pid>,
    name: String,
    state: TaskState,
    ring: Ring,
    total_ticks: u64,
    exit_code: i32,
}

impl TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            pid: task.pid,
            parent: task.parent,
            name: task.name.clone(),
            state: task.state,
            ring: task.ring,
            total_ticks: task.total_ticks,
            exit_code: task.exit_code,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn ring(&self) -> Ring {
        self.ring
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}
