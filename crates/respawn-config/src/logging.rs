//! Structured logging utilities for respawn host-side code.
//!
//! The shim itself never goes through `tracing`: it runs inside foreign
//! processes, often during dynamic-linker bootstrap, and writes its records
//! with raw `libc::write`. These helpers are for code running in a normal
//! Rust context (config resolution, the probe binary, tests).
//!
//! # Usage
//!
//! ```ignore
//! use respawn_config::logging::*;
//!
//! init_logging(LogLevel::Warn);
//! log_probe_info!("Spawned child", pid = 1234);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const CONFIG: &'static str = "CONFIG";
    pub const PROBE: &'static str = "PROBE";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === CONFIG logging macros ===

#[macro_export]
macro_rules! log_config_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = $crate::logging::Component::CONFIG, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_config_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::CONFIG, $($key = $value,)* $msg)
    };
}

// === PROBE logging macros ===

#[macro_export]
macro_rules! log_probe_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = $crate::logging::Component::PROBE, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_probe_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = $crate::logging::Component::PROBE, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_probe_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::PROBE, $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup; `RUST_LOG` wins when set.
///
/// Output goes to stderr so stdout stays byte-exact for whatever the
/// process (or the image that replaces it) prints.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
