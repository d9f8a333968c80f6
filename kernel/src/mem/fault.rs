#![allow(dead_code)]

//! Page-fault handling: demand paging for the heap window and for user
//! regions, everything else is fatal.

use core::sync::atomic::{AtomicU32, Ordering};

use kite_core::mem::paging::{MapError, PageFlags};
use kite_core::trap::fault::{classify, FaultAction, FaultCode};
use kite_core::trap::TrapFrame;
use log::{error, trace};

use super::paging::kernel_directory;
use super::with_paging;
use crate::arch::x86::mmu;
use crate::{interrupts, task};

/// Faults resolved by mapping a fresh page.
static DEMAND_FAULTS: AtomicU32 = AtomicU32::new(0);

pub fn demand_faults() -> u32 {
    DEMAND_FAULTS.load(Ordering::Relaxed)
}

pub fn handle_page_fault(frame: &mut TrapFrame) {
    let addr = mmu::read_cr2();
    let code = FaultCode::from_bits_truncate(frame.error_code());
    let action = task::with_current_regions(|regions| classify(addr, code, regions));
    trace!("[fault] addr=0x{:08X} code={:?} -> {:?}", addr, code, action);

    match action {
        FaultAction::DemandKernel { page } => {
            map_zeroed(kernel_directory(), page, PageFlags::WRITABLE);
        }
        FaultAction::DemandUser { page } => {
            map_zeroed(mmu::read_cr3(), page, PageFlags::WRITABLE | PageFlags::USER);
        }
        FaultAction::CopyOnWrite { page } => {
            error!("[fault] write to read-only page 0x{:08X}, no shared pages exist", page);
            interrupts::fatal(frame, Some(addr));
        }
        FaultAction::Fatal => interrupts::fatal(frame, Some(addr)),
    }
}

fn map_zeroed(directory: u32, page: u32, flags: PageFlags) {
    match with_paging(|paging| paging.map_fresh(directory, page, flags)) {
        Ok(_) | Err(MapError::AlreadyMapped) => {
            DEMAND_FAULTS.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => panic!("[fault] cannot back page 0x{:08X}: {:?}", page, err),
    }
}
