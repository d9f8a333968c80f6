use core::mem::size_of;
use core::ptr;

use kite_core::trap::frame::selectors;
use kite_core::trap::vectors;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn set_handler(&mut self, handler: unsafe extern "C" fn(), type_attr: u8) {
        let addr = handler as usize as u32;
        self.offset_low = addr as u16;
        self.selector = selectors::KERNEL_CODE;
        self.zero = 0;
        self.type_attr = type_attr;
        self.offset_high = (addr >> 16) as u16;
    }
}

#[repr(C, packed)]
struct Idtr {
    limit: u16,
    base: u32,
}

const IDT_ENTRIES: usize = 256;

// present, 32-bit interrupt gate; DPL 0 and DPL 3
const GATE_KERNEL: u8 = 0b1000_1110;
const GATE_USER: u8 = 0b1110_1110;

static mut IDT: [IdtEntry; IDT_ENTRIES] = [IdtEntry::missing(); IDT_ENTRIES];

static mut IDTR: Idtr = Idtr { limit: 0, base: 0 };

extern "C" {
    fn idt_stub_load(idtr: *const Idtr);

    fn isr_0();
    fn isr_1();
    fn isr_2();
    fn isr_3();
    fn isr_4();
    fn isr_5();
    fn isr_6();
    fn isr_7();
    fn isr_8();
    fn isr_9();
    fn isr_10();
    fn isr_11();
    fn isr_12();
    fn isr_13();
    fn isr_14();
    fn isr_15();
    fn isr_16();
    fn isr_17();
    fn isr_18();
    fn isr_19();
    fn isr_20();
    fn isr_21();
    fn isr_22();
    fn isr_23();
    fn isr_24();
    fn isr_25();
    fn isr_26();
    fn isr_27();
    fn isr_28();
    fn isr_29();
    fn isr_30();
    fn isr_31();

    fn irq_0();
    fn irq_1();
    fn irq_2();
    fn irq_3();
    fn irq_4();
    fn irq_5();
    fn irq_6();
    fn irq_7();
    fn irq_8();
    fn irq_9();
    fn irq_10();
    fn irq_11();
    fn irq_12();
    fn irq_13();
    fn irq_14();
    fn irq_15();

    fn isr_128();
    fn isr_255();
}

/// Fills all 256 gates and loads the table. Unused vectors land on the
/// catch-all stub, which reports vector 255.
pub fn init() {
    let isr_handlers: [unsafe extern "C" fn(); 32] = [
        isr_0, isr_1, isr_2, isr_3, isr_4, isr_5, isr_6, isr_7,
        isr_8, isr_9, isr_10, isr_11, isr_12, isr_13, isr_14, isr_15,
        isr_16, isr_17, isr_18, isr_19, isr_20, isr_21, isr_22, isr_23,
        isr_24, isr_25, isr_26, isr_27, isr_28, isr_29, isr_30, isr_31,
    ];

    let irq_handlers: [unsafe extern "C" fn(); 16] = [
        irq_0, irq_1, irq_2, irq_3, irq_4, irq_5, irq_6, irq_7,
        irq_8, irq_9, irq_10, irq_11, irq_12, irq_13, irq_14, irq_15,
    ];

    unsafe {
        let idt = &mut *ptr::addr_of_mut!(IDT);
        for entry in idt.iter_mut() {
            entry.set_handler(isr_255, GATE_KERNEL);
        }
        for (index, handler) in isr_handlers.iter().enumerate() {
            idt[index].set_handler(*handler, GATE_KERNEL);
        }
        for (line, handler) in irq_handlers.iter().enumerate() {
            idt[vectors::IRQ_BASE as usize + line].set_handler(*handler, GATE_KERNEL);
        }
        idt[vectors::SYSCALL as usize].set_handler(isr_128, GATE_USER);

        let idtr = &mut *ptr::addr_of_mut!(IDTR);
        idtr.limit = (size_of::<IdtEntry>() * IDT_ENTRIES - 1) as u16;
        idtr.base = ptr::addr_of!(IDT) as u32;
        idt_stub_load(ptr::addr_of!(IDTR));
    }
}
