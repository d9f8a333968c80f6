use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use kite_core::task::TaskState;

use super::{TestCase, TestResult};
use crate::{config, interrupts, task, timer};

pub const TESTS: &[TestCase] = &[
    TestCase::new("process.wait_without_children", wait_without_children),
    TestCase::new("process.getpid", getpid),
    TestCase::new("process.irq_lines_at_boot", irq_lines_at_boot),
    TestCase::new("process.sleep_advances_ticks", sleep_advances_ticks),
    TestCase::new("process.wait_reaps_zombie", wait_reaps_zombie),
    TestCase::new("process.preemption_interleaves", preemption_interleaves),
];

const ZOMBIE_CODE: i32 = 42;

fn wait_without_children() -> TestResult {
    if task::sys_wait(None) != -1 {
        return Err("wait with no children did not fail");
    }
    Ok(())
}

fn getpid() -> TestResult {
    if task::sys_getpid() != task::current_pid() {
        return Err("getpid disagrees with the scheduler");
    }
    if task::sys_write(c"[test] write from ring 0\n") != 0 {
        return Err("kernel-task write failed");
    }
    Ok(())
}

/// Only the timer and keyboard are unmasked; the cascade and the slave stay
/// closed while no slave line has a handler.
fn irq_lines_at_boot() -> TestResult {
    if interrupts::enabled_lines() != 0b11 {
        return Err("unexpected IRQ lines enabled");
    }
    Ok(())
}

fn sleep_advances_ticks() -> TestResult {
    let wanted = config().ms_to_ticks(20);
    let start = timer::ticks();
    let irqs = interrupts::irq_count(0);
    task::sys_sleep(20);
    if timer::ticks() - start < wanted {
        return Err("woke up early");
    }
    if u64::from(interrupts::irq_count(0).wrapping_sub(irqs)) < wanted {
        return Err("timer line undercounted");
    }
    if interrupts::nested_irqs() != 0 {
        return Err("an IRQ line re-entered its handler");
    }
    Ok(())
}

extern "C" fn exit_immediately() -> ! {
    task::sys_exit(ZOMBIE_CODE)
}

fn wait_reaps_zombie() -> TestResult {
    let child = task::spawn_kernel("zombie", exit_immediately).map_err(|_| "spawn failed")?;

    let mut rounds = 0;
    while task::snapshot(child).map(|snap| snap.state()) != Some(TaskState::Zombie) {
        rounds += 1;
        if rounds > 100 {
            return Err("child never became a zombie");
        }
        task::sys_sleep(1);
    }

    let mut code = 0;
    let pid = task::sys_wait(Some(&mut code));
    if pid != child as i32 {
        return Err("wait returned another pid");
    }
    if code != ZOMBIE_CODE {
        return Err("wait returned the wrong exit code");
    }
    if task::snapshots().iter().any(|snap| snap.pid() == child) {
        return Err("zombie still in the task table");
    }
    Ok(())
}

static STOP: AtomicBool = AtomicBool::new(false);
static LAST_TAG: AtomicU8 = AtomicU8::new(0);
static HANDOVERS: AtomicU32 = AtomicU32::new(0);
static SPINS: [AtomicU32; 2] = [const { AtomicU32::new(0) }; 2];

fn spin_with_tag(tag: u8) -> ! {
    while !STOP.load(Ordering::Acquire) {
        if LAST_TAG.swap(tag, Ordering::AcqRel) != tag {
            HANDOVERS.fetch_add(1, Ordering::Relaxed);
        }
        SPINS[(tag - b'A') as usize].fetch_add(1, Ordering::Relaxed);
        spin_loop();
    }
    task::sys_exit(tag as i32)
}

extern "C" fn spinner_a() -> ! {
    spin_with_tag(b'A')
}

extern "C" fn spinner_b() -> ! {
    spin_with_tag(b'B')
}

/// Two tasks that never yield share the CPU while the harness sleeps for
/// a second; the timer alone must switch between them.
fn preemption_interleaves() -> TestResult {
    STOP.store(false, Ordering::Release);
    LAST_TAG.store(0, Ordering::Release);
    HANDOVERS.store(0, Ordering::Release);
    for spins in &SPINS {
        spins.store(0, Ordering::Release);
    }

    let switches = task::context_switches();
    task::spawn_kernel("spin-a", spinner_a).map_err(|_| "spawn a failed")?;
    task::spawn_kernel("spin-b", spinner_b).map_err(|_| "spawn b failed")?;
    task::sys_sleep(1000);
    STOP.store(true, Ordering::Release);
    let elapsed = task::context_switches() - switches;

    let mut codes = [0i32; 2];
    for code in codes.iter_mut() {
        if task::sys_wait(Some(code)) < 0 {
            return Err("spinner could not be collected");
        }
    }
    codes.sort_unstable();
    if codes != [b'A' as i32, b'B' as i32] {
        return Err("spinners exited with unexpected codes");
    }

    if SPINS.iter().any(|spins| spins.load(Ordering::Relaxed) == 0) {
        return Err("a spinner never ran");
    }
    if HANDOVERS.load(Ordering::Relaxed) < 4 {
        return Err("output was not interleaved");
    }
    let quantum = config().quantum_ticks().max(1) as u64;
    let expected = config().ms_to_ticks(1000) / quantum * 9 / 10;
    if elapsed < expected {
        return Err("too few context switches in one second");
    }
    Ok(())
}
