use core::arch::asm;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use kite_core::trap::frame::selectors;

const KERNEL_CODE: u64 = 0x00CF_9A00_0000_FFFF;
const KERNEL_DATA: u64 = 0x00CF_9200_0000_FFFF;
const USER_CODE: u64 = 0x00CF_FA00_0000_FFFF;
const USER_DATA: u64 = 0x00CF_F200_0000_FFFF;

const TSS_INDEX: usize = 5;

#[repr(C, packed)]
struct Gdtr {
    limit: u16,
    base: u32,
}

#[repr(C, packed)]
struct TaskStateSegment {
    prev_tss: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    general: [u32; 8],
    segments: [u32; 6],
    ldt: u32,
    trap: u16,
    iomap_base: u16,
}

impl TaskStateSegment {
    const fn new() -> Self {
        Self {
            prev_tss: 0,
            esp0: 0,
            ss0: selectors::KERNEL_DATA as u32,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            general: [0; 8],
            segments: [0; 6],
            ldt: 0,
            trap: 0,
            iomap_base: size_of::<Self>() as u16,
        }
    }
}

const _: () = assert!(size_of::<TaskStateSegment>() == 104);

static INITIALISED: AtomicBool = AtomicBool::new(false);

const GDT_LEN: usize = 6;

static mut GDT: [u64; GDT_LEN] = [0, KERNEL_CODE, KERNEL_DATA, USER_CODE, USER_DATA, 0];

static mut GDTR: Gdtr = Gdtr { limit: 0, base: 0 };

#[repr(C, align(16))]
struct AlignedTss(TaskStateSegment);

static mut TSS: AlignedTss = AlignedTss(TaskStateSegment::new());

pub fn init() {
    if INITIALISED.swap(true, Ordering::AcqRel) {
        return;
    }

    unsafe {
        encode_tss_descriptor();

        GDTR.limit = (GDT_LEN * size_of::<u64>() - 1) as u16;
        GDTR.base = ptr::addr_of!(GDT) as u32;

        asm!(
            "lgdt [{gdtr}]",
            "push {code}",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            "mov ax, {data}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            gdtr = in(reg) ptr::addr_of!(GDTR),
            code = const selectors::KERNEL_CODE as u32,
            data = const selectors::KERNEL_DATA as u32,
            out("eax") _,
        );
        asm!("ltr {0:x}", in(reg) selectors::TSS, options(nostack));
    }
    log::info!("[gdt] loaded, tss at {:p}", unsafe { ptr::addr_of!(TSS.0) });
}

/// Stack the CPU switches to when a ring-3 task traps.
pub fn set_kernel_stack(stack_top: u32) {
    unsafe {
        ptr::addr_of_mut!(TSS.0.esp0).write_unaligned(stack_top);
    }
}

pub fn kernel_stack() -> u32 {
    unsafe { ptr::addr_of!(TSS.0.esp0).read_unaligned() }
}

fn encode_tss_descriptor() {
    unsafe {
        let base = ptr::addr_of!(TSS.0) as u64;
        let limit = (size_of::<TaskStateSegment>() - 1) as u64;

        let mut descriptor = 0u64;
        descriptor |= limit & 0xFFFF;
        descriptor |= (base & 0xFF_FFFF) << 16;
        // present, DPL 0, available 32-bit TSS
        descriptor |= 0x89u64 << 40;
        descriptor |= ((limit >> 16) & 0xF) << 48;
        descriptor |= ((base >> 24) & 0xFF) << 56;

        ptr::addr_of_mut!(GDT[TSS_INDEX]).write(descriptor);
    }
}
