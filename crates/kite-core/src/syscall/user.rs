//! Copying arguments out of user memory.

use alloc::string::String;
use alloc::vec::Vec;

use super::SyscallHost;

/// Longest C string a system call will accept, terminator excluded.
pub const MAX_USER_STRING: usize = 1024;

/// Reads a NUL-terminated UTF-8 string at `addr`. Each byte is checked
/// against the caller's ranges before it is touched.
pub fn read_user_cstr(host: &dyn SyscallHost, addr: u32) -> Option<String> {
    if addr == 0 {
        return None;
    }
    let mut bytes = Vec::new();
    let mut cursor = addr;
    while bytes.len() <= MAX_USER_STRING {
        if !host.user_range_ok(cursor, 1) {
            return None;
        }
        let mut byte = [0u8; 1];
        host.copy_from_user(cursor, &mut byte);
        if byte[0] == 0 {
            return String::from_utf8(bytes).ok();
        }
        bytes.push(byte[0]);
        cursor = cursor.checked_add(1)?;
    }
    None
}
