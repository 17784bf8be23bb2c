use libc::{c_char, c_int, c_void};
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use crate::interpose::Operation;
use crate::record::{InvocationRecord, RECORD_BUF_SIZE};

// ============================================================================
// Frozen settings
// ============================================================================

/// Settings frozen at load time. Null until the first `freeze`.
static SETTINGS: AtomicPtr<Settings> = AtomicPtr::new(ptr::null_mut());

/// Mirrors `Settings::debug` for `shim_debug!`, which must not chase pointers.
pub(crate) static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Substitute target plus diagnostic sink, immutable once frozen.
#[derive(Debug)]
pub struct Settings {
    target: CString,
    log_file: Option<CString>,
    debug: bool,
}

impl Settings {
    pub fn new(target: Option<&CStr>, log_file: Option<&CStr>, debug: bool) -> Self {
        Self {
            target: resolve_target(target),
            log_file: log_file
                .filter(|p| !p.to_bytes().is_empty())
                .map(CStr::to_owned),
            debug,
        }
    }

    /// Read `RESPAWN_*` with `getenv`; called once from the library constructor.
    pub unsafe fn from_env() -> Self {
        let target = getenv(respawn_config::ENV_TARGET_C);
        let log_file = getenv(respawn_config::ENV_LOG_FILE_C);
        let debug = !libc::getenv(respawn_config::ENV_DEBUG_C.as_ptr()).is_null();
        Self::new(target, log_file, debug)
    }

    pub fn target(&self) -> &CStr {
        &self.target
    }

    pub fn log_file(&self) -> Option<&CStr> {
        self.log_file.as_deref()
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

unsafe fn getenv(name: &CStr) -> Option<&'static CStr> {
    let p = libc::getenv(name.as_ptr());
    if p.is_null() {
        None
    } else {
        Some(CStr::from_ptr(p))
    }
}

/// Pick the substitute target: a valid override, else the build default.
pub(crate) fn resolve_target(requested: Option<&CStr>) -> CString {
    if let Some(path) = requested {
        if respawn_config::validate_target_bytes(path.to_bytes()).is_ok() {
            return path.to_owned();
        }
    }
    CString::new(respawn_config::DEFAULT_SUBSTITUTE_TARGET)
        .unwrap_or_else(|_| c"/bin/echo".to_owned())
}

/// Install `settings` as the process-wide value unless another thread won.
///
/// Returns whichever value is installed; the loser's allocation is dropped.
pub fn freeze(settings: Settings) -> &'static Settings {
    let debug = settings.debug;
    let new = Box::into_raw(Box::new(settings));
    match SETTINGS.compare_exchange(ptr::null_mut(), new, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            DEBUG_ENABLED.store(debug, Ordering::Relaxed);
            unsafe { &*new }
        }
        Err(existing) => {
            drop(unsafe { Box::from_raw(new) });
            unsafe { &*existing }
        }
    }
}

/// The frozen settings, freezing them from the environment on first use.
///
/// The constructor normally freezes before any interception; an entry point
/// reached earlier (another library's initializer) resolves the same way.
pub fn settings() -> &'static Settings {
    let p = SETTINGS.load(Ordering::Acquire);
    if !p.is_null() {
        return unsafe { &*p };
    }
    freeze(unsafe { Settings::from_env() })
}

// ============================================================================
// Interception counters
// ============================================================================

const COUNTER_INIT: AtomicU64 = AtomicU64::new(0);
static INTERCEPTED: [AtomicU64; Operation::COUNT] = [COUNTER_INIT; Operation::COUNT];

pub(crate) fn count_interception(op: Operation) {
    INTERCEPTED[op.index()].fetch_add(1, Ordering::Relaxed);
}

/// Calls observed for `op` since load.
pub fn intercepted(op: Operation) -> u64 {
    INTERCEPTED[op.index()].load(Ordering::Relaxed)
}

// ============================================================================
// Diagnostic sink
// ============================================================================

/// Saves `errno` on entry and restores it on drop, so diagnostic writes never
/// leak a stale error into the caller.
pub(crate) struct ErrnoGuard(c_int);

impl ErrnoGuard {
    pub(crate) fn save() -> Self {
        ErrnoGuard(unsafe { *errno_location() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        unsafe { *errno_location() = self.0 };
    }
}

#[cfg(target_os = "linux")]
pub(crate) unsafe fn errno_location() -> *mut c_int {
    libc::__errno_location()
}

#[cfg(target_os = "macos")]
pub(crate) unsafe fn errno_location() -> *mut c_int {
    libc::__error()
}

pub(crate) unsafe fn set_errno(e: c_int) {
    *errno_location() = e;
}

/// Write every byte or give up silently. Retries only on EINTR.
pub unsafe fn write_all(fd: c_int, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let n = libc::write(fd, bytes.as_ptr() as *const c_void, bytes.len());
        if n < 0 {
            if *errno_location() == libc::EINTR {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Blocks SIGPIPE for the current thread while a diagnostic is written.
///
/// On drop, a SIGPIPE raised by that write (pending now, not pending on
/// entry) is consumed before the previous mask is restored, so a broken
/// stderr pipe never terminates the host.
pub(crate) struct SigpipeGuard {
    old_mask: libc::sigset_t,
    set: libc::sigset_t,
    was_pending: bool,
    blocked: bool,
}

impl SigpipeGuard {
    pub(crate) fn block() -> Self {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            let mut old_mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGPIPE);
            let was_pending = sigpipe_pending();
            let blocked =
                libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old_mask) == 0;
            SigpipeGuard {
                old_mask,
                set,
                was_pending,
                blocked,
            }
        }
    }
}

impl Drop for SigpipeGuard {
    fn drop(&mut self) {
        if !self.blocked {
            return;
        }
        unsafe {
            if !self.was_pending && sigpipe_pending() {
                let mut sig: c_int = 0;
                // Pending, so this returns immediately
                libc::sigwait(&self.set, &mut sig);
            }
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old_mask, ptr::null_mut());
        }
    }
}

unsafe fn sigpipe_pending() -> bool {
    let mut pending: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut pending);
    libc::sigpending(&mut pending) == 0 && libc::sigismember(&pending, libc::SIGPIPE) == 1
}

/// Emit one record line. Every failure is swallowed and `errno` is left as
/// the caller had it.
pub(crate) fn emit(settings: &Settings, record: &InvocationRecord<'_>) {
    let _errno = ErrnoGuard::save();
    let _sigpipe = SigpipeGuard::block();
    let mut buf = [0u8; RECORD_BUF_SIZE];
    let line = record.format(&mut buf);
    unsafe {
        match settings.log_file() {
            Some(path) => append_line(path, line),
            None => write_all(2, line),
        }
    }
}

/// Single open/write/close with O_APPEND so concurrent writers (threads or
/// forked children) never interleave within a line.
///
/// O_NONBLOCK: a FIFO without a reader fails with ENXIO instead of blocking.
unsafe fn append_line(path: &CStr, line: &[u8]) {
    let fd = libc::open(
        path.as_ptr() as *const c_char,
        libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT | libc::O_CLOEXEC | libc::O_NONBLOCK,
        0o644 as libc::c_uint,
    );
    if fd < 0 {
        return;
    }
    write_all(fd, line);
    libc::close(fd);
}
