//! Real Symbol Storage
//!
//! Provides access to the genuine libc process-creation functions.
//!
//! On Linux the shim's own `execve`/`posix_spawn` shadow libc's for the whole
//! process, including calls made from inside this library, so the genuine
//! implementation is looked up with `dlsym(RTLD_NEXT)` and cached.
//! On macOS the interpose tuple's `old_func` is used instead (see `interpose`).

use libc::{c_char, c_void};
use std::ffi::CStr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::interpose::Operation;

/// Lazily resolved pointer to the next definition of a symbol
pub struct RealSymbol {
    ptr: AtomicPtr<c_void>,
    name: &'static CStr,
}

impl RealSymbol {
    pub const fn new(name: &'static CStr) -> Self {
        Self {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
            name,
        }
    }

    pub fn name(&self) -> &'static CStr {
        self.name
    }

    /// Get the real function pointer; null if no later object defines it.
    ///
    /// Concurrent first calls may both hit dlsym; they store the same value.
    pub unsafe fn get(&self) -> *mut c_void {
        let p = self.ptr.load(Ordering::Acquire);
        if !p.is_null() {
            return p;
        }
        let f = libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr() as *const c_char);
        if !f.is_null() {
            self.ptr.store(f, Ordering::Release);
        }
        f
    }

    /// Typed view of `get()`. `F` must be the `extern "C"` fn pointer type
    /// matching the symbol's C signature.
    pub unsafe fn get_as<F: Copy>(&self) -> Option<F> {
        debug_assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*mut c_void>()
        );
        let p = self.get();
        if p.is_null() {
            None
        } else {
            Some(std::mem::transmute_copy::<*mut c_void, F>(&p))
        }
    }
}

pub static REAL_EXECVE: RealSymbol = RealSymbol::new(Operation::Execve.symbol());
pub static REAL_POSIX_SPAWN: RealSymbol = RealSymbol::new(Operation::PosixSpawn.symbol());
