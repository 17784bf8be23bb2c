//! # respawn-config
//!
//! Configuration management for the respawn shim.
//!
//! The shim has a single setting that changes behavior, the substitute target
//! every intercepted launch is redirected to. It is resolved from:
//! 1. The compile-time default (`RESPAWN_DEFAULT_TARGET` at build time, else `/bin/echo`)
//! 2. Environment variables (highest priority, read once at load time)
//!
//! There is no configuration file. The resolved value is immutable for the
//! lifetime of the process.

pub mod logging;
pub mod path;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

/// Substitute target override.
pub const ENV_TARGET: &str = "RESPAWN_TARGET";
/// Append diagnostic records to this file instead of stderr.
pub const ENV_LOG_FILE: &str = "RESPAWN_LOG_FILE";
/// Any value enables the load-time binding banner.
pub const ENV_DEBUG: &str = "RESPAWN_DEBUG";

// The shim reads the environment with libc::getenv during library init,
// where Rust String/OsString conversions are off limits.
pub const ENV_TARGET_C: &CStr = c"RESPAWN_TARGET";
pub const ENV_LOG_FILE_C: &CStr = c"RESPAWN_LOG_FILE";
pub const ENV_DEBUG_C: &CStr = c"RESPAWN_DEBUG";

/// Executable used when `RESPAWN_TARGET` is unset or empty.
pub const DEFAULT_SUBSTITUTE_TARGET: &str = match option_env!("RESPAWN_DEFAULT_TARGET") {
    Some(path) => path,
    None => "/bin/echo",
};

/// Process-wide config, resolved on first access and never reloaded.
static CONFIG: Lazy<ShimConfig> = Lazy::new(|| ShimConfig::load().unwrap_or_default());

/// Get the global config (read-only)
pub fn config() -> &'static ShimConfig {
    &CONFIG
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("substitute target is empty")]
    EmptyTarget,
    #[error("substitute target contains a NUL byte at offset {0}")]
    InteriorNul(usize),
    #[error("substitute target is not an executable file: {}", .0.display())]
    NotExecutable(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Check that raw target bytes can be handed to `execve` as a C string.
///
/// Allocation-free so the shim can call it before the Rust runtime is usable.
pub fn validate_target_bytes(bytes: &[u8]) -> Result<(), ConfigError> {
    if bytes.is_empty() {
        return Err(ConfigError::EmptyTarget);
    }
    if let Some(pos) = bytes.iter().position(|&b| b == 0) {
        return Err(ConfigError::InteriorNul(pos));
    }
    Ok(())
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimConfig {
    /// Executable that replaces every intercepted launch target
    pub substitute_target: PathBuf,
    pub diagnostics: DiagnosticsConfig,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            substitute_target: PathBuf::from(DEFAULT_SUBSTITUTE_TARGET),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

/// Where interception records go
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Append records here; `None` means stderr
    pub log_file: Option<PathBuf>,
    /// Print the binding banner at load time
    pub debug: bool,
}

impl ShimConfig {
    /// Load config from the process environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Build a config from defaults plus whatever `lookup` returns for the
    /// `RESPAWN_*` variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let mut config = ShimConfig::default();
        config.apply_env_overrides(&lookup);
        config.validate()?;
        crate::log_config_debug!(
            "Resolved substitute target",
            substitute = tracing::field::display(config.substitute_target.display()),
            debug = config.diagnostics.debug,
        );
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<OsString>,
    {
        // Empty values fall back to the default, same as the shim's init path.
        match lookup(ENV_TARGET) {
            Some(target) if !target.is_empty() => {
                self.substitute_target = PathBuf::from(target);
            }
            Some(_) => {
                crate::log_config_warn!(
                    "Ignoring empty substitute target override",
                    var = ENV_TARGET,
                );
            }
            None => {}
        }
        if let Some(file) = lookup(ENV_LOG_FILE) {
            if !file.is_empty() {
                self.diagnostics.log_file = Some(PathBuf::from(file));
            }
        }
        if lookup(ENV_DEBUG).is_some() {
            self.diagnostics.debug = true;
        }
    }

    /// Structural check: the target can be passed to `execve` at all.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_target_bytes(self.substitute_target.as_os_str().as_bytes())
    }

    /// Preflight check that the target exists and is executable.
    ///
    /// The shim never performs this check itself; a missing target surfaces
    /// to callers as the genuine `ENOENT` from the redirected call.
    pub fn check_target(&self) -> Result<(), ConfigError> {
        self.validate()?;
        let meta = std::fs::metadata(&self.substitute_target)?;
        if !meta.is_file() || !crate::path::is_executable(&self.substitute_target) {
            return Err(ConfigError::NotExecutable(self.substitute_target.clone()));
        }
        Ok(())
    }

    /// Environment variables a host sets so a freshly loaded shim resolves
    /// to this config.
    pub fn shim_env(&self) -> Vec<(String, String)> {
        let mut vars = vec![(
            ENV_TARGET.to_string(),
            self.substitute_target.to_string_lossy().into_owned(),
        )];
        if let Some(file) = &self.diagnostics.log_file {
            vars.push((ENV_LOG_FILE.to_string(), file.to_string_lossy().into_owned()));
        }
        if self.diagnostics.debug {
            vars.push((ENV_DEBUG.to_string(), "1".to_string()));
        }
        vars
    }
}
