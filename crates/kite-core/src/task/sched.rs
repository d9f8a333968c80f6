//! Round-robin scheduler.
//!
//! Tasks sit in one list in creation order. Each timer tick charges the
//! running task; when its slice runs out, or it blocks, sleeps or exits, the
//! next call to [`Scheduler::switch`] scans forward from it (wrapping) for a
//! Ready task and falls back to the idle task. The scheduler never touches
//! hardware: it hands back a [`SwitchTarget`] and the caller loads it.

use alloc::vec::Vec;

use log::{debug, info, warn};

use super::{Pid, Ring, Task, TaskError, TaskInit, TaskSnapshot, TaskState, IDLE_PID};

/// What the trap path must load to resume the chosen task.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SwitchTarget {
    pub pid: Pid,
    pub sp: usize,
    pub directory: u32,
    pub kernel_stack_top: usize,
    pub switched: bool,
}

pub enum WaitOutcome {
    /// A zombie child was collected; its resources come back with it.
    Reaped { pid: Pid, code: i32, task: Task },
    /// Children exist but none has exited; the caller is now Blocked.
    Pending,
    NoChildren,
}

pub struct Scheduler {
    tasks: Vec<Task>,
    current: Pid,
    next_pid: Pid,
    quantum: u32,
    ticks: u64,
    switches: u64,
    need_resched: bool,
    has_idle: bool,
}

impl Scheduler {
    pub const fn new(quantum: u32) -> Self {
        Self {
            tasks: Vec::new(),
            current: IDLE_PID,
            next_pid: IDLE_PID + 1,
            quantum,
            ticks: 0,
            switches: 0,
            need_resched: false,
            has_idle: false,
        }
    }

    pub fn set_quantum(&mut self, quantum: u32) {
        self.quantum = quantum.max(1);
    }

    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    /// Adopts the running boot context as the idle task and makes it current.
    pub fn install_idle(&mut self, name: &str, directory: u32, stack_top: usize) -> Pid {
        if !self.has_idle {
            self.tasks.insert(0, Task::idle(name, directory, stack_top, self.quantum));
            self.has_idle = true;
            self.current = IDLE_PID;
            info!("[sched] idle task '{}' installed", name);
        }
        IDLE_PID
    }

    pub fn spawn(&mut self, init: TaskInit) -> Result<Pid, TaskError> {
        if !self.has_idle {
            return Err(TaskError::NoIdleTask);
        }
        let pid = self.next_pid;
        self.next_pid = pid.checked_add(1).ok_or(TaskError::TooManyTasks)?;

        let parent = self.current;
        let mut task = Task::from_init(pid, Some(parent), self.quantum, init);
        let parent_task = self.get_mut(parent).ok_or(TaskError::NotFound)?;
        task.next_sibling = parent_task.first_child.replace(pid);

        debug!("[sched] spawned '{}' pid={} parent={} ring={:?}", task.name, pid, parent, task.ring);
        self.tasks.push(task);
        Ok(pid)
    }

    pub fn current_pid(&self) -> Pid {
        self.current
    }

    pub fn current(&self) -> Option<&Task> {
        self.get(self.current)
    }

    pub fn current_mut(&mut self) -> Option<&mut Task> {
        let pid = self.current;
        self.get_mut(pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Task> {
        self.tasks.iter().find(|task| task.pid == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.pid == pid)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn context_switches(&self) -> u64 {
        self.switches
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched
    }

    /// Timer tick: wakes sleepers and charges the running task.
    /// Returns true when a reschedule is due.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        let now = self.ticks;
        let mut woke = false;
        for task in self.tasks.iter_mut() {
            if task.state == TaskState::Sleeping && task.wake_tick <= now {
                task.state = TaskState::Ready;
                woke = true;
            }
        }

        let current = self.current;
        let expired = match self.get_mut(current) {
            Some(task) => {
                task.total_ticks += 1;
                task.slice = task.slice.saturating_sub(1);
                task.slice == 0
            }
            None => false,
        };
        if expired {
            self.need_resched = true;
        }

        if current == IDLE_PID && (woke || self.has_ready_task()) {
            self.need_resched = true;
        }
        self.need_resched
    }

    pub fn yield_current(&mut self) {
        self.need_resched = true;
    }

    pub fn block_current(&mut self) {
        let current = self.current;
        if current == IDLE_PID {
            warn!("[sched] idle task cannot block");
            return;
        }
        if let Some(task) = self.get_mut(current) {
            task.state = TaskState::Blocked;
        }
        self.need_resched = true;
    }

    pub fn wake(&mut self, pid: Pid) -> Result<(), TaskError> {
        let task = self.get_mut(pid).ok_or(TaskError::NotFound)?;
        match task.state {
            TaskState::Blocked | TaskState::Sleeping => {
                task.state = TaskState::Ready;
                task.waiting = false;
                Ok(())
            }
            TaskState::Ready | TaskState::Running => Ok(()),
            TaskState::Zombie => Err(TaskError::InvalidState),
        }
    }

    pub fn sleep_current(&mut self, ticks: u64) {
        let current = self.current;
        let wake_tick = self.ticks + ticks;
        if ticks > 0 && current != IDLE_PID {
            if let Some(task) = self.get_mut(current) {
                task.state = TaskState::Sleeping;
                task.wake_tick = wake_tick;
            }
        }
        self.need_resched = true;
    }

    /// Turns the current task into a zombie and hands its children to idle.
    pub fn exit_current(&mut self, code: i32) -> Result<(), TaskError> {
        let current = self.current;
        if current == IDLE_PID {
            return Err(TaskError::InvalidState);
        }
        let parent = {
            let task = self.get_mut(current).ok_or(TaskError::NotFound)?;
            task.state = TaskState::Zombie;
            task.exit_code = code;
            task.parent
        };
        self.reparent_children(current);

        if let Some(parent) = parent {
            if let Some(parent_task) = self.get_mut(parent) {
                if parent_task.waiting && parent_task.state == TaskState::Blocked {
                    parent_task.waiting = false;
                    parent_task.state = TaskState::Ready;
                }
            }
        }
        debug!("[sched] pid={} exited code={}", current, code);
        self.need_resched = true;
        Ok(())
    }

    /// Collects one zombie child of the current task, or blocks it.
    pub fn wait_current(&mut self) -> WaitOutcome {
        let parent = self.current;
        let mut child = self.get(parent).and_then(|task| task.first_child);
        let mut zombie = None;
        while let Some(pid) = child {
            match self.get(pid) {
                Some(task) => {
                    if task.state == TaskState::Zombie {
                        zombie = Some(pid);
                        break;
                    }
                    child = task.next_sibling;
                }
                None => break,
            }
        }

        if let Some(pid) = zombie {
            if let Some(task) = self.reap(pid) {
                return WaitOutcome::Reaped {
                    pid,
                    code: task.exit_code,
                    task,
                };
            }
        }

        let has_children = self.get(parent).and_then(|task| task.first_child).is_some();
        if !has_children {
            return WaitOutcome::NoChildren;
        }
        if let Some(task) = self.get_mut(parent) {
            task.waiting = true;
            task.state = TaskState::Blocked;
        }
        self.need_resched = true;
        WaitOutcome::Pending
    }

    /// Removes every zombie whose parent is the idle task.
    pub fn reap_orphans(&mut self) -> Vec<Task> {
        let orphans: Vec<Pid> = self
            .tasks
            .iter()
            .filter(|task| {
                task.state == TaskState::Zombie && task.parent == Some(IDLE_PID) && task.pid != self.current
            })
            .map(|task| task.pid)
            .collect();
        orphans.into_iter().filter_map(|pid| self.reap(pid)).collect()
    }

    /// Saves `saved_sp` for the current task and picks who runs next.
    pub fn switch(&mut self, saved_sp: usize) -> SwitchTarget {
        let current = self.current;
        let mut runnable = false;
        if let Some(task) = self.get_mut(current) {
            task.saved_sp = saved_sp;
            runnable = task.is_runnable();
        }

        if self.need_resched || !runnable {
            self.need_resched = false;
            let next = self.pick_next();
            if next != current {
                if let Some(task) = self.get_mut(current) {
                    if task.state == TaskState::Running {
                        task.state = TaskState::Ready;
                    }
                }
                self.current = next;
                self.switches += 1;
            }
            let quantum = self.quantum;
            if let Some(task) = self.get_mut(next) {
                task.state = TaskState::Running;
                task.slice = quantum;
            }
        }

        let switched = self.current != current;
        match self.get(self.current) {
            Some(task) => SwitchTarget {
                pid: task.pid,
                sp: task.saved_sp,
                directory: task.directory,
                kernel_stack_top: task.kernel_stack_top,
                switched,
            },
            None => SwitchTarget {
                pid: current,
                sp: saved_sp,
                directory: 0,
                kernel_stack_top: 0,
                switched: false,
            },
        }
    }

    pub fn snapshot(&self, pid: Pid) -> Option<TaskSnapshot> {
        self.get(pid).map(TaskSnapshot::from)
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.tasks.iter().map(TaskSnapshot::from).collect()
    }

    pub fn dump(&self, pid: Pid) -> Result<(), TaskError> {
        let task = self.get(pid).ok_or(TaskError::NotFound)?;
        dump_task(task);
        Ok(())
    }

    pub fn dump_all(&self) {
        for task in &self.tasks {
            dump_task(task);
        }
    }

    fn pick_next(&self) -> Pid {
        let len = self.tasks.len();
        let start = self
            .tasks
            .iter()
            .position(|task| task.pid == self.current)
            .unwrap_or(0);
        for step in 1..=len {
            let task = &self.tasks[(start + step) % len];
            if task.pid == IDLE_PID {
                continue;
            }
            if task.state == TaskState::Ready
                || (task.state == TaskState::Running && task.pid == self.current)
            {
                return task.pid;
            }
        }
        IDLE_PID
    }

    fn has_ready_task(&self) -> bool {
        self.tasks
            .iter()
            .any(|task| task.pid != IDLE_PID && task.state == TaskState::Ready)
    }

    fn reparent_children(&mut self, pid: Pid) {
        let mut child = self.get_mut(pid).and_then(|task| task.first_child.take());
        while let Some(child_pid) = child {
            let idle_first = self.get(IDLE_PID).and_then(|idle| idle.first_child);
            match self.get_mut(child_pid) {
                Some(task) => {
                    child = task.next_sibling;
                    task.parent = Some(IDLE_PID);
                    task.next_sibling = idle_first;
                }
                None => break,
            }
            if let Some(idle) = self.get_mut(IDLE_PID) {
                idle.first_child = Some(child_pid);
            }
        }
    }

    fn unlink_child(&mut self, parent: Pid, child: Pid) {
        let sibling = self.get(child).and_then(|task| task.next_sibling);
        let first = self.get(parent).and_then(|task| task.first_child);
        if first == Some(child) {
            if let Some(task) = self.get_mut(parent) {
                task.first_child = sibling;
            }
            return;
        }
        let mut cursor = first;
        while let Some(pid) = cursor {
            let next = self.get(pid).and_then(|task| task.next_sibling);
            if next == Some(child) {
                if let Some(task) = self.get_mut(pid) {
                    task.next_sibling = sibling;
                }
                return;
            }
            cursor = next;
        }
    }

    fn reap(&mut self, pid: Pid) -> Option<Task> {
        let parent = self.get(pid)?.parent;
        if let Some(parent) = parent {
            self.unlink_child(parent, pid);
        }
        let index = self.tasks.iter().position(|task| task.pid == pid)?;
        let mut task = self.tasks.remove(index);
        task.reaped = true;
        task.next_sibling = None;
        debug!("[sched] reaped pid={} code={}", pid, task.exit_code);
        Some(task)
    }
}

fn dump_task(task: &Task) {
    info!(
        "[sched] dump pid={} name='{}' state={} parent={:?} ring={}",
        task.pid,
        task.name,
        task.state.name(),
        task.parent,
        match task.ring {
            Ring::Kernel => 0,
            Ring::User => 3,
        }
    );
    info!(
        "           sp=0x{:08X} kstack_top=0x{:08X} pd=0x{:08X} ticks={} slice={}",
        task.saved_sp,
        task.kernel_stack_top,
        task.directory,
        task.total_ticks,
        task.slice
    );
    info!(
        "           image=0x{:08X}..0x{:08X} entry=0x{:08X} ustack=0x{:08X}",
        task.image.start,
        task.image.end,
        task.image.entry,
        task.user_stack_base
    );
}
