//! Interception registry for the two process-creation entry points.
//!
//! Installation is declarative and happens when the dynamic linker loads
//! this library; there is no register/unregister call.
//!
//! - macOS: one `__DATA,__interpose` tuple per operation. dyld rebinds every
//!   other image's references to the replacement; references from this image
//!   keep pointing at the genuine function, which is `old_func`.
//! - Linux: exported `execve` / `posix_spawn` definitions. When the library
//!   is preloaded they come first in the global lookup scope; the genuine
//!   functions are reached through `reals`.
//!
//! Platform limitation: only calls that go through dynamic symbol resolution
//! are redirected. glibc's internal calls (`execvp`, `system`, `popen` reach
//! `__execve`/`__spawni` directly), statically linked programs, raw
//! syscalls, SIP-protected binaries on macOS and images dlopen'ed after
//! launch on macOS stay unintercepted. Nothing reports this at runtime
//! beyond `is_redirected`.
#![allow(clippy::missing_safety_doc)]

use std::ffi::CStr;

#[cfg(all(target_os = "macos", not(test)))]
use crate::syscalls::process::{ExecveFn, PosixSpawnFn};
#[cfg(all(target_os = "macos", not(test)))]
use libc::{c_char, c_int, pid_t, posix_spawn_file_actions_t, posix_spawnattr_t};

/// An intercepted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Replace the calling process image
    Execve,
    /// Create a child process
    PosixSpawn,
}

impl Operation {
    pub const COUNT: usize = 2;
    pub const ALL: [Operation; Operation::COUNT] = [Operation::Execve, Operation::PosixSpawn];

    pub const fn index(self) -> usize {
        match self {
            Operation::Execve => 0,
            Operation::PosixSpawn => 1,
        }
    }

    /// Symbol the operation is bound to
    pub const fn symbol(self) -> &'static CStr {
        match self {
            Operation::Execve => c"execve",
            Operation::PosixSpawn => c"posix_spawn",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Operation::Execve => "execve",
            Operation::PosixSpawn => "posix_spawn",
        }
    }

    /// Tag at the start of every diagnostic record
    pub const fn tag(self) -> &'static str {
        match self {
            Operation::Execve => "respawn - execve",
            Operation::PosixSpawn => "respawn - posix_spawn",
        }
    }
}

/// Whether process-wide resolution of `op` currently lands on this shim.
#[cfg(target_os = "linux")]
pub fn is_redirected(op: Operation) -> bool {
    let resolved = unsafe { libc::dlsym(libc::RTLD_DEFAULT, op.symbol().as_ptr()) };
    !resolved.is_null() && resolved as *const () == replacement(op)
}

/// Whether process-wide resolution of `op` currently lands on this shim.
///
/// dyld offers no query for applied interpose tuples; this reports whether
/// the tuple is linked into the image.
#[cfg(target_os = "macos")]
pub fn is_redirected(op: Operation) -> bool {
    !replacement(op).is_null()
}

#[cfg(all(target_os = "linux", not(test)))]
fn replacement(op: Operation) -> *const () {
    match op {
        Operation::Execve => linux::execve as *const (),
        Operation::PosixSpawn => linux::posix_spawn as *const (),
    }
}

#[cfg(all(target_os = "macos", not(test)))]
fn replacement(op: Operation) -> *const () {
    match op {
        Operation::Execve => IT_EXECVE.new_func,
        Operation::PosixSpawn => IT_POSIX_SPAWN.new_func,
    }
}

// Unit-test builds export nothing, so the harness itself is never rebound.
#[cfg(test)]
fn replacement(_op: Operation) -> *const () {
    std::ptr::null()
}

// ============================================================================
// Linux: exported definitions
// ============================================================================

#[cfg(all(target_os = "linux", not(test)))]
pub mod linux {
    use crate::reals::{REAL_EXECVE, REAL_POSIX_SPAWN};
    use crate::syscalls::process::{execve_impl, posix_spawn_impl, ExecveFn, PosixSpawnFn};
    use libc::{c_char, c_int, pid_t, posix_spawn_file_actions_t, posix_spawnattr_t};

    #[no_mangle]
    pub unsafe extern "C" fn execve(
        path: *const c_char,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> c_int {
        let real = REAL_EXECVE.get_as::<ExecveFn>();
        execve_impl(path, argv, envp, crate::state::settings(), real)
    }

    #[no_mangle]
    pub unsafe extern "C" fn posix_spawn(
        pid: *mut pid_t,
        path: *const c_char,
        file_actions: *const posix_spawn_file_actions_t,
        attrp: *const posix_spawnattr_t,
        argv: *const *mut c_char,
        envp: *const *mut c_char,
    ) -> c_int {
        let real = REAL_POSIX_SPAWN.get_as::<PosixSpawnFn>();
        posix_spawn_impl(
            pid,
            path,
            file_actions,
            attrp,
            argv,
            envp,
            crate::state::settings(),
            real,
        )
    }
}

// ============================================================================
// macOS: interpose tuples
// ============================================================================

#[cfg(target_os = "macos")]
#[repr(C)]
pub struct Interpose {
    pub new_func: *const (),
    pub old_func: *const (),
}

#[cfg(target_os = "macos")]
unsafe impl Sync for Interpose {}

#[cfg(target_os = "macos")]
impl Interpose {
    /// Genuine implementation recorded in the tuple.
    ///
    /// # Safety
    /// `F` must be the fn pointer type of the interposed symbol.
    pub unsafe fn original<F: Copy>(&self) -> Option<F> {
        if self.old_func.is_null() {
            None
        } else {
            Some(std::mem::transmute_copy::<*const (), F>(&self.old_func))
        }
    }
}

#[cfg(all(target_os = "macos", not(test)))]
extern "C" {
    #[link_name = "execve"]
    fn real_execve(
        path: *const c_char,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> c_int;
    #[link_name = "posix_spawn"]
    fn real_posix_spawn(
        pid: *mut pid_t,
        path: *const c_char,
        file_actions: *const posix_spawn_file_actions_t,
        attrp: *const posix_spawnattr_t,
        argv: *const *mut c_char,
        envp: *const *mut c_char,
    ) -> c_int;
}

#[cfg(all(target_os = "macos", not(test)))]
#[no_mangle]
pub unsafe extern "C" fn execve_respawn(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    let real = IT_EXECVE.original::<ExecveFn>();
    crate::syscalls::process::execve_impl(path, argv, envp, crate::state::settings(), real)
}

#[cfg(all(target_os = "macos", not(test)))]
#[no_mangle]
pub unsafe extern "C" fn posix_spawn_respawn(
    pid: *mut pid_t,
    path: *const c_char,
    file_actions: *const posix_spawn_file_actions_t,
    attrp: *const posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    let real = IT_POSIX_SPAWN.original::<PosixSpawnFn>();
    crate::syscalls::process::posix_spawn_impl(
        pid,
        path,
        file_actions,
        attrp,
        argv,
        envp,
        crate::state::settings(),
        real,
    )
}

#[cfg(all(target_os = "macos", not(test)))]
#[link_section = "__DATA,__interpose"]
#[used]
pub static IT_EXECVE: Interpose = Interpose {
    new_func: execve_respawn as *const (),
    old_func: real_execve as *const (),
};

#[cfg(all(target_os = "macos", not(test)))]
#[link_section = "__DATA,__interpose"]
#[used]
pub static IT_POSIX_SPAWN: Interpose = Interpose {
    new_func: posix_spawn_respawn as *const (),
    old_func: real_posix_spawn as *const (),
};
