//! Invocation records: what was asked for, by whom, through which entry point.

use libc::{c_char, pid_t};
use std::ffi::CStr;
use std::fmt::Write;

use crate::interpose::Operation;
use crate::macros::StackWriter;

/// Upper bound for one formatted record, newline included.
pub const RECORD_BUF_SIZE: usize = 1024;

/// Rendered in place of a null requested path.
const NULL_PATH: &[u8] = b"(null)";

/// Ephemeral per-call data, captured before redirection.
#[derive(Debug, Clone, Copy)]
pub struct InvocationRecord<'a> {
    pub op: Operation,
    /// Calling process, not the child
    pub pid: pid_t,
    /// Path the caller asked for, before substitution
    pub requested: Option<&'a CStr>,
}

impl<'a> InvocationRecord<'a> {
    pub fn new(op: Operation, pid: pid_t, requested: Option<&'a CStr>) -> Self {
        Self { op, pid, requested }
    }

    /// Capture the current call.
    ///
    /// The pid is always the caller's own `getpid()`. The `posix_spawn` pid
    /// slot is never read here, unlike hooks that log `*pid` before the call
    /// has filled it in.
    ///
    /// # Safety
    /// `path` must be null or a NUL-terminated string valid for `'a`.
    pub unsafe fn capture(op: Operation, path: *const c_char) -> Self {
        let requested = if path.is_null() {
            None
        } else {
            Some(CStr::from_ptr(path))
        };
        Self::new(op, libc::getpid(), requested)
    }

    /// `[<tag>] pid: <pid>, process path: <path>.\n`, truncated to `buf`.
    ///
    /// Only the path is cut short; a truncated record still ends in `.\n`.
    pub fn format<'b>(&self, buf: &'b mut [u8]) -> &'b [u8] {
        let mut w = StackWriter::new(buf);
        let _ = write!(w, "[{}] pid: {}, process path: ", self.op.tag(), self.pid);
        // Keep room for the closing ".\n" so a truncated path still ends the record
        let path = self.requested.map_or(NULL_PATH, CStr::to_bytes);
        let room = w.remaining().saturating_sub(2);
        w.write_bytes(&path[..path.len().min(room)]);
        w.write_bytes(b".");
        w.finish_line();
        w.into_bytes()
    }
}
