//! Page-fault classification.

use bitflags::bitflags;

use crate::mem::layout::{in_heap_window, is_user_address};
use crate::mem::paging::Region;

bitflags! {
    /// Error code pushed by the CPU for vector 14.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct FaultCode: u32 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const RESERVED = 1 << 3;
        const INSTRUCTION = 1 << 4;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultAction {
    /// Map a zeroed kernel page (present + write) and retry.
    DemandKernel { page: u32 },
    /// Map a zeroed user page (present + write + user) and retry.
    DemandUser { page: u32 },
    /// Write to a present read-only page; no sharing is implemented.
    CopyOnWrite { page: u32 },
    Fatal,
}

/// Decides how to treat a fault at `addr`; `regions` are the current task's.
pub fn classify(addr: u32, code: FaultCode, regions: &[Region]) -> FaultAction {
    let page = addr & !0xFFF;
    if code.contains(FaultCode::RESERVED) {
        return FaultAction::Fatal;
    }
    if code.contains(FaultCode::PRESENT) {
        if code.contains(FaultCode::WRITE) {
            return FaultAction::CopyOnWrite { page };
        }
        return FaultAction::Fatal;
    }
    if in_heap_window(addr) && !code.contains(FaultCode::USER) {
        return FaultAction::DemandKernel { page };
    }
    if is_user_address(addr) && regions.iter().any(|region| region.contains(addr)) {
        return FaultAction::DemandUser { page };
    }
    FaultAction::Fatal
}
