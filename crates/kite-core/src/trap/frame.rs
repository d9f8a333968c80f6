//! Register frame shared with the assembly trap stubs.
//!
//! Layout from the lowest address: the four data segment registers pushed by
//! the stub, the `pushad` block, the vector and error code, then what the CPU
//! pushed (`eip`, `cs`, `eflags`, and `esp`/`ss` on a privilege change). The
//! stubs index this structure by byte offset; the assertions below pin them.

use core::mem::{offset_of, size_of};

pub mod selectors {
    pub const KERNEL_CODE: u16 = 0x08;
    pub const KERNEL_DATA: u16 = 0x10;
    pub const USER_CODE: u16 = 0x18 | 3;
    pub const USER_DATA: u16 = 0x20 | 3;
    pub const TSS: u16 = 0x28 | 3;
}

pub const EFLAGS_RESERVED: u32 = 1 << 1;
pub const EFLAGS_IF: u32 = 1 << 9;

/// Length of `int imm8`, used to replay a system call.
const INT_INSN_LEN: u32 = 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct TrapFrame {
    gs: u32,
    fs: u32,
    es: u32,
    ds: u32,
    edi: u32,
    esi: u32,
    ebp: u32,
    kernel_esp: u32,
    ebx: u32,
    edx: u32,
    ecx: u32,
    eax: u32,
    vector: u32,
    error_code: u32,
    eip: u32,
    cs: u32,
    eflags: u32,
    user_esp: u32,
    user_ss: u32,
}

const _: () = {
    assert!(offset_of!(TrapFrame, gs) == 0);
    assert!(offset_of!(TrapFrame, ds) == 12);
    assert!(offset_of!(TrapFrame, edi) == 16);
    assert!(offset_of!(TrapFrame, ebx) == 32);
    assert!(offset_of!(TrapFrame, eax) == 44);
    assert!(offset_of!(TrapFrame, vector) == 48);
    assert!(offset_of!(TrapFrame, error_code) == 52);
    assert!(offset_of!(TrapFrame, eip) == 56);
    assert!(offset_of!(TrapFrame, cs) == 60);
    assert!(offset_of!(TrapFrame, eflags) == 64);
    assert!(offset_of!(TrapFrame, user_esp) == 68);
    assert!(offset_of!(TrapFrame, user_ss) == 72);
    assert!(size_of::<TrapFrame>() == 76);
};

impl TrapFrame {
    /// Synthetic frame that `iret`s into ring 0 at `entry` with interrupts on.
    pub fn kernel(entry: u32) -> Self {
        let data = selectors::KERNEL_DATA as u32;
        Self {
            gs: data,
            fs: data,
            es: data,
            ds: data,
            eip: entry,
            cs: selectors::KERNEL_CODE as u32,
            eflags: EFLAGS_RESERVED | EFLAGS_IF,
            ..Self::default()
        }
    }

    /// Synthetic frame that `iret`s into ring 3 at `entry` on `user_esp`.
    pub fn user(entry: u32, user_esp: u32) -> Self {
        let data = selectors::USER_DATA as u32;
        Self {
            gs: data,
            fs: data,
            es: data,
            ds: data,
            eip: entry,
            cs: selectors::USER_CODE as u32,
            eflags: EFLAGS_RESERVED | EFLAGS_IF,
            user_esp,
            user_ss: data,
            ..Self::default()
        }
    }

    pub fn vector(&self) -> u32 {
        self.vector
    }

    pub fn error_code(&self) -> u32 {
        self.error_code
    }

    pub fn eip(&self) -> u32 {
        self.eip
    }

    pub fn cs(&self) -> u32 {
        self.cs
    }

    pub fn eflags(&self) -> u32 {
        self.eflags
    }

    pub fn user_esp(&self) -> u32 {
        self.user_esp
    }

    /// Privilege level the trap came from.
    pub fn ring(&self) -> u32 {
        self.cs & 3
    }

    pub fn from_user(&self) -> bool {
        self.ring() == 3
    }

    pub fn eax(&self) -> u32 {
        self.eax
    }

    pub fn set_eax(&mut self, value: u32) {
        self.eax = value;
    }

    /// System-call number and arguments: `eax`, then `ebx ecx edx esi edi`.
    pub fn syscall_number(&self) -> u32 {
        self.eax
    }

    pub fn syscall_args(&self) -> [u32; 5] {
        [self.ebx, self.ecx, self.edx, self.esi, self.edi]
    }

    pub fn set_syscall_args(&mut self, number: u32, args: [u32; 5]) {
        self.eax = number;
        self.ebx = args[0];
        self.ecx = args[1];
        self.edx = args[2];
        self.esi = args[3];
        self.edi = args[4];
    }

    /// Rewinds `eip` so the trapping `int 0x80` runs again on resume.
    pub fn replay_syscall(&mut self) {
        self.eip = self.eip.wrapping_sub(INT_INSN_LEN);
    }

    pub fn set_vector(&mut self, vector: u32, error_code: u32) {
        self.vector = vector;
        self.error_code = error_code;
    }

    /// Register dump in the order the stubs save them.
    pub fn registers(&self) -> [(&'static str, u32); 16] {
        [
            ("eax", self.eax),
            ("ebx", self.ebx),
            ("ecx", self.ecx),
            ("edx", self.edx),
            ("esi", self.esi),
            ("edi", self.edi),
            ("ebp", self.ebp),
            ("esp", self.kernel_esp),
            ("eip", self.eip),
            ("cs", self.cs),
            ("eflags", self.eflags),
            ("ds", self.ds),
            ("es", self.es),
            ("fs", self.fs),
            ("gs", self.gs),
            ("err", self.error_code),
        ]
    }
}
