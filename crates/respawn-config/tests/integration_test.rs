//! Integration tests for respawn-config
//!
//! These tests verify target resolution and preflight checks against real
//! files on disk.

use respawn_config::testing::TestEnvironment;
use respawn_config::{ConfigError, ShimConfig, ENV_LOG_FILE, ENV_TARGET};
use std::ffi::OsString;
use std::path::PathBuf;

/// Preflight accepts a generated executable script
#[test]
fn test_check_target_accepts_executable_script() {
    let env = TestEnvironment::new().unwrap();
    let script = env.create_script("stand-in", "echo replaced").unwrap();

    let config = env.shim_config(&script);
    config.check_target().unwrap();
}

/// Preflight reports a missing target as an IO error, the same
/// classification the redirected execve will surface.
#[test]
fn test_check_target_missing_is_io_not_found() {
    let env = TestEnvironment::new().unwrap();
    let config = env.shim_config(env.missing_path("ghost"));

    match config.check_target() {
        Err(ConfigError::Io(err)) => assert_eq!(err.kind(), std::io::ErrorKind::NotFound),
        other => panic!("expected NotFound, got {:?}", other),
    }
}

/// Preflight rejects files without an execute bit and directories
#[test]
fn test_check_target_rejects_non_executables() {
    let env = TestEnvironment::new().unwrap();
    let plain = env.root.join("plain.txt");
    std::fs::write(&plain, "not a program").unwrap();

    assert!(matches!(
        env.shim_config(&plain).check_target(),
        Err(ConfigError::NotExecutable(p)) if p == plain
    ));
    assert!(matches!(
        env.shim_config(&env.bin_dir).check_target(),
        Err(ConfigError::NotExecutable(_))
    ));
}

/// The env a host exports resolves back to the same config in the shimmed
/// process.
#[test]
fn test_exported_env_resolves_to_same_config() {
    let env = TestEnvironment::new().unwrap();
    let script = env.create_script("stand-in", "true").unwrap();
    let expected = env.shim_config(&script);

    let vars = env.shim_env(&script);
    let resolved = ShimConfig::from_lookup(|key| {
        vars.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| OsString::from(v))
    })
    .unwrap();

    assert_eq!(resolved, expected);
}

/// Only the variables that are set override defaults
#[test]
fn test_partial_env_keeps_defaults() {
    let resolved = ShimConfig::from_lookup(|key| {
        (key == ENV_LOG_FILE).then(|| OsString::from("/tmp/only-log.log"))
    })
    .unwrap();

    assert_eq!(
        resolved.substitute_target,
        ShimConfig::default().substitute_target
    );
    assert_eq!(
        resolved.diagnostics.log_file,
        Some(PathBuf::from("/tmp/only-log.log"))
    );
}

/// A serialized config with missing sections picks up defaults
#[test]
fn test_serde_defaults_for_missing_fields() {
    let parsed: ShimConfig =
        serde_json::from_str(r#"{ "substitute_target": "/opt/stand-in" }"#).unwrap();
    assert_eq!(parsed.substitute_target, PathBuf::from("/opt/stand-in"));
    assert!(parsed.diagnostics.log_file.is_none());
    assert!(!parsed.diagnostics.debug);

    let json = serde_json::to_string(&parsed).unwrap();
    let back: ShimConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, parsed);
}

/// An explicitly empty target in a deserialized config fails validation
#[test]
fn test_validate_rejects_empty_deserialized_target() {
    let parsed: ShimConfig = serde_json::from_str(r#"{ "substitute_target": "" }"#).unwrap();
    assert!(matches!(parsed.validate(), Err(ConfigError::EmptyTarget)));
}

/// Overriding the target through the lookup never touches the process env
#[test]
fn test_lookup_is_isolated_from_process_env() {
    let resolved = ShimConfig::from_lookup(|key| {
        (key == ENV_TARGET).then(|| OsString::from("/usr/bin/env"))
    })
    .unwrap();
    assert_eq!(resolved.substitute_target, PathBuf::from("/usr/bin/env"));
}
