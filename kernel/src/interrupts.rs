#![allow(dead_code)]

//! Trap dispatch: exceptions, hardware interrupts and the system-call gate
//! all arrive at [`trap_dispatch`] with a saved [`TrapFrame`].

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use kite_core::trap::{exception_name, vectors, TrapFrame};
use log::{error, info, warn};
use spin::Mutex;

use crate::arch::x86::cpu::without_interrupts;
use crate::arch::x86::{idt, pic};
use crate::{mem, syscall, task};

pub type IrqHandler = fn(&mut TrapFrame);

const IRQ_LINES: usize = 16;
const LAST_EXCEPTION: u8 = 31;
const LAST_IRQ: u8 = vectors::IRQ_END - 1;

static HANDLERS: Mutex<[Option<IrqHandler>; IRQ_LINES]> = Mutex::new([None; IRQ_LINES]);

static IN_SERVICE: [AtomicBool; IRQ_LINES] = [const { AtomicBool::new(false) }; IRQ_LINES];
static IRQ_COUNTS: [AtomicU32; IRQ_LINES] = [const { AtomicU32::new(0) }; IRQ_LINES];
static NESTED_IRQS: AtomicU32 = AtomicU32::new(0);
static SPURIOUS: AtomicU32 = AtomicU32::new(0);

pub fn init() {
    idt::init();
    pic::remap(vectors::IRQ_BASE, vectors::IRQ_SLAVE_BASE);
    info!(
        "[interrupts] idt loaded, pic remapped to {}..{}",
        vectors::IRQ_BASE,
        vectors::IRQ_END
    );
}

/// Routes IRQ `line` to `handler` and unmasks it.
pub fn install(line: u8, handler: IrqHandler) {
    if line as usize >= IRQ_LINES {
        warn!("[interrupts] no IRQ line {}", line);
        return;
    }
    without_interrupts(|| HANDLERS.lock()[line as usize] = Some(handler));
    pic::unmask(line);
}

pub fn irq_count(line: u8) -> u32 {
    IRQ_COUNTS
        .get(line as usize)
        .map_or(0, |count| count.load(Ordering::Relaxed))
}

/// Lines the controller lets through, master in the low byte.
pub fn enabled_lines() -> u16 {
    let (master, slave) = without_interrupts(pic::masks);
    !(((slave as u16) << 8) | master as u16)
}

pub fn nested_irqs() -> u32 {
    NESTED_IRQS.load(Ordering::Relaxed)
}

/// Entered from the assembly stubs with interrupts off. Returns the frame
/// to resume, which belongs to another task after a switch.
#[no_mangle]
extern "C" fn trap_dispatch(frame: *mut TrapFrame) -> *mut TrapFrame {
    let trap = unsafe { &mut *frame };
    let vector = u8::try_from(trap.vector()).unwrap_or(u8::MAX);

    match vector {
        vectors::PAGE_FAULT => mem::fault::handle_page_fault(trap),
        0..=LAST_EXCEPTION => fatal(trap, None),
        vectors::IRQ_BASE..=LAST_IRQ => handle_irq(trap, vector),
        vectors::SYSCALL => syscall::handle(trap),
        _ => {
            SPURIOUS.fetch_add(1, Ordering::Relaxed);
            warn!("[interrupts] unexpected vector {} at eip=0x{:08X}", trap.vector(), trap.eip());
        }
    }

    task::resume(frame as usize) as *mut TrapFrame
}

/// The controller is acknowledged before the handler runs so a handler
/// that switches tasks cannot leave the line blocked.
fn handle_irq(frame: &mut TrapFrame, vector: u8) {
    let line = (vector - vectors::IRQ_BASE) as usize;
    pic::send_eoi(vector);
    IRQ_COUNTS[line].fetch_add(1, Ordering::Relaxed);

    if IN_SERVICE[line].swap(true, Ordering::AcqRel) {
        NESTED_IRQS.fetch_add(1, Ordering::Relaxed);
    }
    let handler = HANDLERS.lock()[line];
    match handler {
        Some(handler) => handler(frame),
        None => {
            SPURIOUS.fetch_add(1, Ordering::Relaxed);
        }
    }
    IN_SERVICE[line].store(false, Ordering::Release);
}

/// Unrecoverable trap: a user task is killed, the kernel panics.
pub fn fatal(frame: &mut TrapFrame, fault_addr: Option<u32>) {
    let vector = frame.vector();
    error!(
        "[trap] {} (vector {}) err=0x{:X} eip=0x{:08X} cs=0x{:X}",
        exception_name(vector),
        vector,
        frame.error_code(),
        frame.eip(),
        frame.cs()
    );
    if let Some(addr) = fault_addr {
        error!("[trap] faulting address 0x{:08X}", addr);
    }
    for (name, value) in frame.registers() {
        error!("[trap]   {}=0x{:08X}", name, value);
    }

    if frame.from_user() {
        let pid = task::current_pid();
        warn!("[trap] killing pid {}", pid);
        task::dump_tasks();
        task::kill_current(-1);
    } else {
        panic!(
            "[trap] {} in kernel mode at eip=0x{:08X}",
            exception_name(vector),
            frame.eip()
        );
    }
}
