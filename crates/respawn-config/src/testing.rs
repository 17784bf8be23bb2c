//! Test environment abstraction for isolated shim testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary directory with a private diagnostic log
//! - Throwaway substitute executables (shell scripts)
//! - The environment a preloaded shim needs to resolve to that setup
//!
//! # Usage
//!
//! ```ignore
//! use respawn_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new().unwrap();
//! let target = env.create_script("stand-in", "echo replaced")?;
//! Command::new(probe).envs(env.shim_env(&target)).env(PRELOAD_ENV, shim_lib);
//! assert_eq!(env.log_lines().len(), 1);
//! ```

use crate::{DiagnosticsConfig, ShimConfig};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Variable the dynamic linker reads to load the shim into a new process.
#[cfg(target_os = "linux")]
pub const PRELOAD_ENV: &str = "LD_PRELOAD";
#[cfg(target_os = "macos")]
pub const PRELOAD_ENV: &str = "DYLD_INSERT_LIBRARIES";

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with its own log file and scratch executables
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Root of the scratch tree
    pub root: PathBuf,
    /// Directory for generated substitute executables
    pub bin_dir: PathBuf,
    /// Diagnostic log the shim appends to
    pub log_file: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();

        let bin_dir = root.join("bin");
        std::fs::create_dir_all(&bin_dir)?;

        let log_file = root.join(format!("respawn-test-{}.log", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            bin_dir,
            log_file,
            test_id,
        })
    }

    /// Write an executable `/bin/sh` script into `bin_dir`.
    pub fn create_script(&self, name: &str, body: &str) -> anyhow::Result<PathBuf> {
        let path = self.bin_dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    /// A path inside the environment that is guaranteed not to exist.
    pub fn missing_path(&self, name: &str) -> PathBuf {
        self.root.join("missing").join(name)
    }

    /// The system `echo`, the default substitute target.
    pub fn echo_path(&self) -> PathBuf {
        let search = std::env::var("PATH").unwrap_or_else(|_| "/bin:/usr/bin".to_string());
        crate::path::find_executable("echo", &search).unwrap_or_else(|| PathBuf::from("/bin/echo"))
    }

    /// Config pointing the shim at `target` and at this environment's log.
    pub fn shim_config(&self, target: impl AsRef<Path>) -> ShimConfig {
        ShimConfig {
            substitute_target: target.as_ref().to_path_buf(),
            diagnostics: DiagnosticsConfig {
                log_file: Some(self.log_file.clone()),
                debug: false,
            },
        }
    }

    /// Environment variables for spawning a shimmed process.
    ///
    /// Uses `ShimConfig::shim_env()` for consistency with production hosts.
    pub fn shim_env(&self, target: impl AsRef<Path>) -> Vec<(String, String)> {
        self.shim_config(target).shim_env()
    }

    /// Full contents of the diagnostic log; empty if nothing was written.
    pub fn read_log(&self) -> String {
        std::fs::read_to_string(&self.log_file).unwrap_or_default()
    }

    /// Non-empty lines of the diagnostic log.
    pub fn log_lines(&self) -> Vec<String> {
        self.read_log()
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
