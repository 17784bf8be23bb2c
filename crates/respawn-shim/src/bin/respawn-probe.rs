//! respawn-probe: calls `execve` / `posix_spawn` through the dynamic linker so
//! a preloaded shim can be observed end to end.
//!
//! ```text
//! respawn-probe exec  <path> [-e KEY=VAL]... <argv0> [args...]
//! respawn-probe spawn <path> [-e KEY=VAL]... <argv0> [args...]
//! respawn-probe spawn-null-pid <path> <argv0> [args...]
//! respawn-probe spawn-each <path>...
//! respawn-probe spawn-threads <n> <path>
//! respawn-probe status
//! respawn-probe config
//! ```
//!
//! With `-e`, the callee gets exactly those entries plus
//! `RESPAWN_PROBE_REPORT=1`; a probe started that way prints its `argv` and
//! environment as JSON instead of running a mode.
//!
//! Probe messages go to stderr; stdout carries only the callee's output.

use std::ffi::{CStr, CString, OsString};
use std::os::unix::ffi::OsStrExt;
use std::process::ExitCode;
use std::ptr;

use anyhow::{bail, Context, Result};
use libc::{c_char, c_int, pid_t};
use respawn_config::logging::{init_logging, LogLevel};
use respawn_config::path::normalize_target;
use respawn_config::{log_probe_debug, log_probe_error, log_probe_info};

const REPORT_ENV: &str = "RESPAWN_PROBE_REPORT";

extern "C" {
    static environ: *const *mut c_char;
}

/// Owned, NUL-terminated pointer array for `argv` / `envp`.
struct CArgs {
    _owned: Vec<CString>,
    ptrs: Vec<*mut c_char>,
}

impl CArgs {
    fn new<I, S>(items: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        let owned = items
            .into_iter()
            .map(CString::new)
            .collect::<Result<Vec<_>, _>>()
            .context("argument contains an interior NUL")?;
        let mut ptrs: Vec<*mut c_char> = owned.iter().map(|s| s.as_ptr() as *mut c_char).collect();
        ptrs.push(ptr::null_mut());
        Ok(Self {
            _owned: owned,
            ptrs,
        })
    }

    fn as_ptr(&self) -> *const *mut c_char {
        self.ptrs.as_ptr()
    }
}

/// A parsed launch request.
struct Launch {
    path: CString,
    argv: CArgs,
    /// `None` inherits the probe's own environment
    envp: Option<CArgs>,
}

impl Launch {
    fn parse(args: &[OsString]) -> Result<Self> {
        let (path, rest) = args.split_first().context("missing <path>")?;
        let mut rest = rest;
        let mut env_entries: Vec<Vec<u8>> = Vec::new();
        while let [flag, entry, tail @ ..] = rest {
            if flag.as_bytes() != b"-e" {
                break;
            }
            env_entries.push(entry.as_bytes().to_vec());
            rest = tail;
        }
        if rest.is_empty() {
            bail!("missing <argv0>");
        }

        let envp = if env_entries.is_empty() {
            None
        } else {
            env_entries.push(format!("{}=1", REPORT_ENV).into_bytes());
            Some(CArgs::new(env_entries)?)
        };

        Ok(Self {
            path: CString::new(path.as_bytes()).context("path contains an interior NUL")?,
            argv: CArgs::new(rest.iter().map(|a| a.as_bytes().to_vec()))?,
            envp,
        })
    }

    fn envp(&self) -> *const *mut c_char {
        match &self.envp {
            Some(envp) => envp.as_ptr(),
            None => unsafe { environ },
        }
    }
}

fn probe_pid() {
    eprintln!("probe-pid={}", std::process::id());
}

fn run_exec(launch: &Launch) -> Result<ExitCode> {
    probe_pid();
    log_probe_debug!("calling execve", path = tracing::field::debug(&launch.path));
    unsafe {
        libc::execve(
            launch.path.as_ptr(),
            launch.argv.as_ptr() as *const *const c_char,
            launch.envp() as *const *const c_char,
        );
    }
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    eprintln!("exec-failed errno={}", errno);
    Ok(ExitCode::from(127))
}

fn spawn_and_wait(launch: &Launch, pid_slot: bool) -> Result<bool> {
    let mut child: pid_t = 0;
    let slot = if pid_slot { &mut child as *mut pid_t } else { ptr::null_mut() };
    let rc = unsafe {
        libc::posix_spawn(
            slot,
            launch.path.as_ptr(),
            ptr::null(),
            ptr::null(),
            launch.argv.as_ptr(),
            launch.envp(),
        )
    };
    if rc != 0 {
        eprintln!("spawn-failed code={}", rc);
        return Ok(false);
    }

    let mut status: c_int = 0;
    let waited = unsafe {
        if pid_slot {
            libc::waitpid(child, &mut status, 0)
        } else {
            libc::wait(&mut status)
        }
    };
    if waited < 0 {
        bail!("wait failed: {}", std::io::Error::last_os_error());
    }
    let code = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else {
        -1
    };
    eprintln!("spawned pid={} status={}", if pid_slot { child } else { waited }, code);
    Ok(true)
}

fn run_spawn(launch: &Launch, pid_slot: bool) -> Result<ExitCode> {
    probe_pid();
    log_probe_debug!("calling posix_spawn", path = tracing::field::debug(&launch.path));
    Ok(if spawn_and_wait(launch, pid_slot)? {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_spawn_each(paths: &[OsString]) -> Result<ExitCode> {
    probe_pid();
    let mut ok = true;
    for path in paths {
        let launch = Launch::parse(&[path.clone(), path.clone()])?;
        ok &= spawn_and_wait(&launch, true)?;
    }
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn run_spawn_threads(args: &[OsString]) -> Result<ExitCode> {
    let [count, path] = args else {
        bail!("usage: spawn-threads <n> <path>");
    };
    let count: usize = count
        .to_str()
        .context("thread count is not UTF-8")?
        .parse()
        .context("thread count is not a number")?;
    probe_pid();

    let failures = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..count)
            .map(|i| {
                scope.spawn(move || -> Result<bool> {
                    let argv0 = OsString::from(format!("worker-{}", i));
                    let launch = Launch::parse(&[path.clone(), argv0])?;
                    spawn_and_wait(&launch, true)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| matches!(h.join(), Ok(Ok(true))))
            .filter(|ok| !ok)
            .count()
    });
    log_probe_info!("threads finished", count = count, failures = failures);
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

type StatusFn = unsafe extern "C" fn(*mut c_char, usize) -> c_int;

fn run_status() -> Result<ExitCode> {
    let sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"respawn_get_status".as_ptr()) };
    if sym.is_null() {
        bail!("respawn_get_status not found; is the shim preloaded?");
    }
    let get_status: StatusFn = unsafe { std::mem::transmute::<*mut libc::c_void, StatusFn>(sym) };
    let mut buf = vec![0 as c_char; 4096];
    let len = unsafe { get_status(buf.as_mut_ptr(), buf.len()) };
    if len < 0 {
        bail!("status buffer too small");
    }
    let doc = unsafe { CStr::from_ptr(buf.as_ptr()) };
    println!("{}", doc.to_string_lossy());
    Ok(ExitCode::SUCCESS)
}

fn run_config() -> Result<ExitCode> {
    let config = respawn_config::config();
    match normalize_target(&config.substitute_target) {
        Ok(resolved) => log_probe_debug!(
            "substitute target resolves",
            resolved = tracing::field::display(resolved.display())
        ),
        // Not fatal: the shim passes the failure through to callers
        Err(e) => log_probe_info!(
            "substitute target does not resolve",
            error = tracing::field::display(format!("{:#}", e))
        ),
    }
    println!("{}", serde_json::to_string(config)?);
    Ok(ExitCode::SUCCESS)
}

/// Started as a substitute with `-e`: describe what we were given.
fn report() -> ExitCode {
    let argv: Vec<String> = std::env::args_os()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    let env: serde_json::Map<String, serde_json::Value> = std::env::vars_os()
        .map(|(k, v)| {
            (
                k.to_string_lossy().into_owned(),
                serde_json::Value::String(v.to_string_lossy().into_owned()),
            )
        })
        .collect();
    println!("{}", serde_json::json!({ "argv": argv, "env": env }));
    ExitCode::SUCCESS
}

fn run(args: &[OsString]) -> Result<ExitCode> {
    let (mode, rest) = args.split_first().context("missing mode")?;
    match mode.as_bytes() {
        b"exec" => run_exec(&Launch::parse(rest)?),
        b"spawn" => run_spawn(&Launch::parse(rest)?, true),
        b"spawn-null-pid" => run_spawn(&Launch::parse(rest)?, false),
        b"spawn-each" => run_spawn_each(rest),
        b"spawn-threads" => run_spawn_threads(rest),
        b"status" => run_status(),
        b"config" => run_config(),
        other => bail!("unknown mode {:?}", String::from_utf8_lossy(other)),
    }
}

fn main() -> ExitCode {
    if std::env::var_os(REPORT_ENV).is_some() {
        return report();
    }
    init_logging(LogLevel::Warn);

    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            log_probe_error!("probe failed", error = tracing::field::display(&e));
            eprintln!("respawn-probe: {:#}", e);
            ExitCode::from(2)
        }
    }
}
