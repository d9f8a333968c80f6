//! In-kernel test harness. The suites run inside a kernel task so that
//! they can sleep, wait and be preempted like any other task; the result
//! leaves QEMU through the debug-exit port.

use log::{error, info};

use crate::arch::x86::qemu;
use crate::{config, task};

mod process;
mod user;

pub type TestResult = Result<(), &'static str>;

#[derive(Copy, Clone)]
pub struct TestCase {
    pub name: &'static str,
    pub func: fn() -> TestResult,
}

impl TestCase {
    pub const fn new(name: &'static str, func: fn() -> TestResult) -> Self {
        Self { name, func }
    }

    fn run(self) -> TestResult {
        (self.func)()
    }
}

const SUITES: &[(&str, &[TestCase])] = &[
    ("memory", memory::TESTS),
    ("process", process::TESTS),
    ("user", user::TESTS),
    ("vfs", vfs::TESTS),
];

pub fn run() {
    match task::spawn_kernel("ktest", test_main) {
        Ok(pid) => info!("[test] harness running as pid {}", pid),
        Err(err) => {
            error!("[test] cannot start harness: {:?}", err);
            qemu::exit_failure();
        }
    }
}

extern "C" fn test_main() -> ! {
    let filter = config().test_filter.as_deref();
    match filter {
        Some(f) => info!("[test] kernel test harness starting (filter='{}')", f),
        None => info!("[test] kernel test harness starting"),
    }

    let mut failures = 0u32;
    let mut executed = 0u32;

    for case in all_cases() {
        if !should_run(case.name, filter) {
            continue;
        }
        executed += 1;
        match case.run() {
            Ok(()) => info!("[test] {}: ok", case.name),
            Err(msg) => {
                failures += 1;
                error!("[test] {}: FAIL ({})", case.name, msg);
            }
        }
    }

    if executed == 0 {
        match filter {
            Some(f) => info!("[test] no tests matched filter '{}'", f),
            None => info!("[test] no tests registered"),
        }
    }

    if failures == 0 {
        info!("[test] all passed ({} run)", executed);
        qemu::exit_success();
    } else {
        error!("[test] {} failure(s)", failures);
        qemu::exit((failures.min(u8::MAX as u32) as u8).max(1));
    }
}

fn all_cases() -> impl Iterator<Item = TestCase> {
    SUITES.iter().flat_map(|(_, cases)| cases.iter().copied())
}

fn should_run(name: &str, filter: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(prefix) => name.starts_with(prefix),
    }
}
