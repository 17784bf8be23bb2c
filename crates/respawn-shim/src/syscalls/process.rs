use libc::{c_char, c_int, pid_t, posix_spawn_file_actions_t, posix_spawnattr_t};

use crate::interpose::Operation;
use crate::record::InvocationRecord;
use crate::state::{count_interception, emit, set_errno, Settings};

// ============================================================================
// Process / Execution
// ============================================================================

pub type ExecveFn =
    unsafe extern "C" fn(*const c_char, *const *const c_char, *const *const c_char) -> c_int;
pub type PosixSpawnFn = unsafe extern "C" fn(
    pid: *mut pid_t,
    path: *const c_char,
    file_actions: *const posix_spawn_file_actions_t,
    attrp: *const posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int;

/// Record the call, then hand it to the genuine `execve` with the substitute
/// target as the path. `argv` and `envp` are forwarded untouched, so the
/// target sees the caller's original `argv[0]`.
///
/// Returns only on failure, with `errno` as the genuine call left it.
pub unsafe fn execve_impl(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
    settings: &Settings,
    real: Option<ExecveFn>,
) -> c_int {
    observe(Operation::Execve, path, settings);

    let Some(real_execve) = real else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    real_execve(settings.target().as_ptr(), argv, envp)
}

/// Record the call, then hand it to the genuine `posix_spawn` with the
/// substitute target. The pid slot is never read here; it is only filled in
/// by the genuine call on success.
#[allow(clippy::too_many_arguments)]
pub unsafe fn posix_spawn_impl(
    pid: *mut pid_t,
    path: *const c_char,
    file_actions: *const posix_spawn_file_actions_t,
    attrp: *const posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
    settings: &Settings,
    real: Option<PosixSpawnFn>,
) -> c_int {
    observe(Operation::PosixSpawn, path, settings);

    let Some(real_posix_spawn) = real else {
        return libc::ENOSYS;
    };
    real_posix_spawn(
        pid,
        settings.target().as_ptr(),
        file_actions,
        attrp,
        argv,
        envp,
    )
}

unsafe fn observe(op: Operation, path: *const c_char, settings: &Settings) {
    count_interception(op);
    emit(settings, &InvocationRecord::capture(op, path));
}
