//! # respawn-shim
//!
//! LD_PRELOAD / DYLD_INSERT_LIBRARIES shim that redirects every `execve` and
//! `posix_spawn` in the host process to one fixed substitute executable,
//! logging each requested path first.
//!
//! Zero-allocation on the interception path; configuration is frozen once at
//! load time from `RESPAWN_TARGET`, `RESPAWN_LOG_FILE` and `RESPAWN_DEBUG`.

// Allow unsafe FFI functions without safety docs - these are inherently unsafe C ABI
#![allow(clippy::missing_safety_doc)]

// Macros must be defined before modules that use them
#[macro_use]
pub mod macros;

pub mod interpose;
pub mod reals;
pub mod record;
pub mod state;
pub mod syscalls;

// Re-export for linkage - interpose tuples must stay reachable from the cdylib
#[cfg(target_os = "macos")]
pub use interpose::*;

use interpose::{is_redirected, Operation};

/// Freeze settings and announce bindings. Runs from the platform constructor.
pub(crate) extern "C" fn respawn_init() {
    let settings = state::settings();
    for op in Operation::ALL {
        shim_debug!(
            "{} -> {} ({})",
            op.name(),
            settings.target().to_string_lossy(),
            if is_redirected(op) { "bound" } else { "unbound" }
        );
    }
}

/// Static constructor for macOS, run by dyld after interpose tuples are applied.
#[cfg(all(target_os = "macos", not(test)))]
#[link_section = "__DATA,__mod_init_func"]
#[used]
pub static RESPAWN_INIT: extern "C" fn() = respawn_init;

/// Static constructor for Linux, run when the library is preloaded.
#[cfg(all(target_os = "linux", not(test)))]
#[link_section = ".init_array"]
#[used]
pub static RESPAWN_INIT_LINUX: extern "C" fn() = respawn_init;

/// Scratch space for the status document: two unescaped paths of up to
/// `PATH_MAX` plus the fixed fields. Paths that need heavy escaping can still
/// overflow it, in which case the export reports -1.
const STATUS_BUF_SIZE: usize = 2 * libc::PATH_MAX as usize + 1024;

/// Get shim status as a NUL-terminated JSON document.
/// Returns actual length written, or -1 if the buffer is null or too small.
#[no_mangle]
pub unsafe extern "C" fn respawn_get_status(
    buf: *mut libc::c_char,
    buf_size: usize,
) -> libc::c_int {
    write_status(state::settings(), buf, buf_size)
}

unsafe fn write_status(
    settings: &state::Settings,
    buf: *mut libc::c_char,
    buf_size: usize,
) -> libc::c_int {
    use std::fmt::Write;
    if buf.is_null() || buf_size == 0 {
        return -1;
    }

    let mut scratch = [0u8; STATUS_BUF_SIZE];
    let mut writer = macros::StackWriter::new(&mut scratch);

    let _ = writeln!(writer, "{{");
    let _ = writeln!(writer, "  \"pid\": {},", libc::getpid());
    let _ = write!(writer, "  \"substitute_target\": ");
    write_json_str(&mut writer, settings.target().to_bytes());
    let _ = writeln!(writer, ",");
    let _ = write!(writer, "  \"log_file\": ");
    match settings.log_file() {
        Some(path) => write_json_str(&mut writer, path.to_bytes()),
        None => {
            let _ = write!(writer, "null");
        }
    }
    let _ = writeln!(writer, ",");
    let _ = writeln!(writer, "  \"debug\": {},", settings.debug());

    let _ = writeln!(writer, "  \"bindings\": {{");
    for (i, op) in Operation::ALL.iter().enumerate() {
        let sep = if i + 1 < Operation::COUNT { "," } else { "" };
        let _ = writeln!(writer, "    \"{}\": {}{}", op.name(), is_redirected(*op), sep);
    }
    let _ = writeln!(writer, "  }},");

    let _ = writeln!(writer, "  \"intercepted\": {{");
    for (i, op) in Operation::ALL.iter().enumerate() {
        let sep = if i + 1 < Operation::COUNT { "," } else { "" };
        let _ = writeln!(
            writer,
            "    \"{}\": {}{}",
            op.name(),
            state::intercepted(*op),
            sep
        );
    }
    let _ = writeln!(writer, "  }}");
    let _ = write!(writer, "}}");

    // A full scratch buffer means the document was cut short
    if writer.is_full() {
        return -1;
    }
    let out = writer.as_bytes();
    let len = out.len();
    if len >= buf_size {
        return -1;
    }

    std::ptr::copy_nonoverlapping(out.as_ptr(), buf as *mut u8, len);
    *buf.add(len) = 0;

    len as libc::c_int
}

/// JSON string literal; invalid UTF-8 sequences become U+FFFD.
fn write_json_str(writer: &mut macros::StackWriter<'_>, raw: &[u8]) {
    use std::fmt::Write;
    let _ = writer.write_char('"');
    let mut rest = raw;
    while !rest.is_empty() {
        let (valid, skip) = match std::str::from_utf8(rest) {
            Ok(s) => (s, rest.len()),
            Err(e) => {
                let valid_len = e.valid_up_to();
                let bad_len = e.error_len().unwrap_or(rest.len() - valid_len);
                // SAFETY: from_utf8 vouched for the first valid_len bytes
                let valid = unsafe { std::str::from_utf8_unchecked(&rest[..valid_len]) };
                (valid, valid_len + bad_len)
            }
        };
        for c in valid.chars() {
            let _ = match c {
                '"' => writer.write_str("\\\""),
                '\\' => writer.write_str("\\\\"),
                '\n' => writer.write_str("\\n"),
                '\t' => writer.write_str("\\t"),
                c if (c as u32) < 0x20 => write!(writer, "\\u{:04x}", c as u32),
                c => writer.write_char(c),
            };
        }
        if skip > valid.len() {
            let _ = writer.write_char(char::REPLACEMENT_CHARACTER);
        }
        rest = &rest[skip..];
    }
    let _ = writer.write_char('"');
}
