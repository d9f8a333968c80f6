use alloc::vec::Vec;

use kite_core::elf::{PF_R, PF_X};
use kite_core::mem::layout::USER_BASE;
use kite_core::syscall::{SYS_EXEC, SYS_EXIT, SYS_WRITE};
use kite_core::trap::TrapFrame;
use kite_core::vfs::OpenFlags;

use super::{TestCase, TestResult};
use crate::arch::x86::cpu::without_interrupts;
use crate::mem::{self, FRAMES};
use crate::task::{self, ExecError};
use crate::{fs, user};

pub const TESTS: &[TestCase] = &[
    TestCase::new("user.elf_exit_status", elf_exit_status),
    TestCase::new("user.bad_pointer_write", bad_pointer_write),
    TestCase::new("user.fault_kills_task", fault_kills_task),
    TestCase::new("user.exec_replaces_image", exec_replaces_image),
    TestCase::new("user.exec_missing_file", exec_missing_file),
    TestCase::new("user.exec_refused_in_kernel", exec_refused_in_kernel),
];

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const ENTRY: u32 = USER_BASE + (EHDR_SIZE + PHDR_SIZE) as u32;
const EXEC_TARGET: &str = "/hello7.elf";

/// Tiny i386 assembler for the handful of instructions the test programs need.
#[derive(Default)]
struct Code {
    bytes: Vec<u8>,
}

impl Code {
    fn user_segments(mut self) -> Self {
        self.bytes.extend_from_slice(&[0x66, 0xB8, 0x23, 0x00]);
        for sreg in [0xD8, 0xC0, 0xE0, 0xE8] {
            self.bytes.extend_from_slice(&[0x8E, sreg]);
        }
        self
    }

    fn mov_eax(mut self, value: u32) -> Self {
        self.bytes.push(0xB8);
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn mov_ebx(mut self, value: u32) -> Self {
        self.bytes.push(0xBB);
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn mov_ebx_eax(mut self) -> Self {
        self.bytes.extend_from_slice(&[0x89, 0xC3]);
        self
    }

    fn store_dword(mut self, addr: u32, value: u32) -> Self {
        self.bytes.extend_from_slice(&[0xC7, 0x05]);
        self.bytes.extend_from_slice(&addr.to_le_bytes());
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn int80(mut self) -> Self {
        self.bytes.extend_from_slice(&[0xCD, 0x80]);
        self
    }

    fn hang(mut self) -> Self {
        self.bytes.extend_from_slice(&[0xEB, 0xFE]);
        self
    }
}

/// Assembles `program` with `data` placed right after the code; the
/// closure receives the data's user address.
fn program_with_data(program: impl Fn(u32) -> Code, data: &[u8]) -> Vec<u8> {
    let code_len = program(0).bytes.len();
    let mut body = program(ENTRY + code_len as u32).bytes;
    body.extend_from_slice(data);
    elf_image(&body)
}

fn elf_image(body: &[u8]) -> Vec<u8> {
    let total = (EHDR_SIZE + PHDR_SIZE + body.len()) as u32;
    let mut image = Vec::with_capacity(total as usize);

    image.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0]);
    image.extend_from_slice(&[0; 8]);
    for half in [2u16, 3] {
        image.extend_from_slice(&half.to_le_bytes());
    }
    for word in [1u32, ENTRY, EHDR_SIZE as u32, 0, 0] {
        image.extend_from_slice(&word.to_le_bytes());
    }
    for half in [EHDR_SIZE as u16, PHDR_SIZE as u16, 1, 0, 0, 0] {
        image.extend_from_slice(&half.to_le_bytes());
    }

    for word in [1, 0, USER_BASE, USER_BASE, total, total, PF_R | PF_X, 0x1000] {
        image.extend_from_slice(&word.to_le_bytes());
    }
    image.extend_from_slice(body);
    image
}

fn hello_exit_7() -> Vec<u8> {
    program_with_data(
        |msg| {
            Code::default()
                .user_segments()
                .mov_eax(SYS_WRITE)
                .mov_ebx(msg)
                .int80()
                .mov_eax(SYS_EXIT)
                .mov_ebx(7)
                .int80()
                .hang()
        },
        b"hello from user\n\0",
    )
}

/// Starts `image` as a user task and waits for it. Returns the exit status
/// and the directory the task ran in.
fn run_to_exit(name: &str, image: &[u8]) -> Result<(i32, u32), &'static str> {
    let loaded = user::load_image(image).map_err(|_| "image did not load")?;
    let directory = loaded.space.directory();
    let pid = task::spawn_loaded(name, loaded).map_err(|_| "spawn failed")?;

    let mut status = 0;
    if task::sys_wait(Some(&mut status)) != pid as i32 {
        return Err("wait returned another pid");
    }
    Ok((status, directory))
}

fn elf_exit_status() -> TestResult {
    let image = hello_exit_7();
    run_to_exit("warmup", &image)?;

    let free_before = mem::frame_stats().free;
    let (status, directory) = run_to_exit("hello7", &image)?;
    if status != 7 {
        return Err("exit status was not 7");
    }
    if without_interrupts(|| FRAMES.lock().is_used(directory)) {
        return Err("page directory was not freed");
    }
    if mem::frame_stats().free != free_before {
        return Err("user frames were not all returned");
    }
    Ok(())
}

fn bad_pointer_write() -> TestResult {
    let image = elf_image(
        &Code::default()
            .user_segments()
            .mov_eax(SYS_WRITE)
            .mov_ebx(0x10)
            .int80()
            .mov_ebx_eax()
            .mov_eax(SYS_EXIT)
            .int80()
            .hang()
            .bytes,
    );
    let (status, _) = run_to_exit("badptr", &image)?;
    if status != -1 {
        return Err("write accepted an unmapped pointer");
    }
    Ok(())
}

fn fault_kills_task() -> TestResult {
    let image = elf_image(&Code::default().user_segments().store_dword(0x10, 1).hang().bytes);
    let (status, _) = run_to_exit("faulter", &image)?;
    if status != -1 {
        return Err("faulting task was not killed");
    }
    Ok(())
}

fn exec_program(path: &str) -> Vec<u8> {
    let mut cpath = Vec::from(path.as_bytes());
    cpath.push(0);
    program_with_data(
        |path| {
            Code::default()
                .user_segments()
                .mov_eax(SYS_EXEC)
                .mov_ebx(path)
                .int80()
                .mov_ebx_eax()
                .mov_eax(SYS_EXIT)
                .int80()
                .hang()
        },
        &cpath,
    )
}

fn exec_replaces_image() -> TestResult {
    let target = hello_exit_7();
    fs::with_vfs(|vfs| {
        let fd = vfs.open(EXEC_TARGET, OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC)?;
        let written = vfs.write(fd, &target);
        vfs.close(fd)?;
        written
    })
    .map_err(|_| "cannot stage the exec target")?;

    let result = run_to_exit("execer", &exec_program(EXEC_TARGET));
    let removed = fs::with_vfs(|vfs| vfs.unlink(EXEC_TARGET));
    let (status, _) = result?;
    removed.map_err(|_| "cannot remove the exec target")?;
    if status != 7 {
        return Err("exec'd image did not run to exit(7)");
    }
    Ok(())
}

fn exec_missing_file() -> TestResult {
    let (status, _) = run_to_exit("execmiss", &exec_program("/no/such.elf"))?;
    if status != -1 {
        return Err("exec of a missing file did not fail");
    }
    Ok(())
}

fn exec_refused_in_kernel() -> TestResult {
    let mut frame = TrapFrame::kernel(0);
    match task::exec_current(EXEC_TARGET, &mut frame) {
        Err(ExecError::KernelCaller) => Ok(()),
        _ => Err("ring-0 exec was not refused"),
    }
}
