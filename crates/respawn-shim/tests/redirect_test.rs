//! End-to-end redirection tests.
//!
//! Each test runs the `respawn-probe` helper with the built shim preloaded,
//! so `execve` / `posix_spawn` go through the dynamic linker exactly as they
//! would in any other host.

use respawn_config::testing::{TestEnvironment, PRELOAD_ENV};
use respawn_config::{ENV_DEBUG, ENV_LOG_FILE, ENV_TARGET};
use std::ffi::OsStr;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

const PROBE: &str = env!("CARGO_BIN_EXE_respawn-probe");

#[cfg(target_os = "linux")]
const SHIM_FILE: &str = "librespawn_shim.so";
#[cfg(target_os = "macos")]
const SHIM_FILE: &str = "librespawn_shim.dylib";

/// The cdylib sits next to the probe binary, or under `deps/`.
fn find_shim_path() -> PathBuf {
    let root = Path::new(PROBE)
        .parent()
        .expect("probe binary has a parent directory")
        .to_path_buf();

    let direct = root.join(SHIM_FILE);
    if direct.exists() {
        return direct;
    }

    let (stem, ext) = SHIM_FILE.split_once('.').unwrap();
    if let Ok(entries) = std::fs::read_dir(root.join("deps")) {
        for entry in entries.flatten() {
            let path = entry.path();
            if let Some(name) = path.file_name().and_then(OsStr::to_str) {
                if name.starts_with(stem) && name.ends_with(ext) {
                    return path;
                }
            }
        }
    }

    panic!("respawn shim not found. Expected at: {:?}", direct);
}

/// Probe command with the shim preloaded and no inherited `RESPAWN_*`.
fn probe(env: &TestEnvironment, target: Option<&Path>) -> Command {
    let mut cmd = Command::new(PROBE);
    cmd.env(PRELOAD_ENV, find_shim_path())
        .env_remove(ENV_TARGET)
        .env_remove(ENV_LOG_FILE)
        .env_remove(ENV_DEBUG)
        .env_remove("RESPAWN_PROBE_REPORT")
        .env_remove("RUST_LOG");
    if let Some(target) = target {
        for (key, value) in env.shim_env(target) {
            cmd.env(key, value);
        }
    }
    cmd
}

/// Same probe without the shim, for baseline behaviour.
fn bare_probe() -> Command {
    let mut cmd = Command::new(PROBE);
    cmd.env_remove(PRELOAD_ENV).env_remove("RESPAWN_PROBE_REPORT");
    cmd
}

fn run(cmd: &mut Command) -> Output {
    cmd.output().expect("failed to run respawn-probe")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

/// Value after `key=` on the first stderr line starting with `key=`.
fn stderr_field(out: &Output, key: &str) -> Option<String> {
    let prefix = format!("{}=", key);
    stderr(out).lines().find_map(|line| {
        line.split_whitespace()
            .find_map(|word| word.strip_prefix(&prefix).map(str::to_string))
    })
}

fn probe_pid(out: &Output) -> u32 {
    stderr_field(out, "probe-pid")
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(|| panic!("no probe-pid in stderr: {}", stderr(out)))
}

fn record(tag: &str, pid: u32, path: &str) -> String {
    format!("[respawn - {}] pid: {}, process path: {}.", tag, pid, path)
}

#[test]
fn test_execve_is_replaced_by_echo() {
    let env = TestEnvironment::new().unwrap();
    let echo = env.echo_path();

    let out = run(probe(&env, Some(&echo)).args([
        "exec",
        "/usr/bin/myservice",
        "myservice",
        "--flag",
    ]));

    assert!(out.status.success(), "stderr: {}", stderr(&out));
    // echo ran with argv ["myservice", "--flag"] and prints what follows argv[0]
    assert_eq!(stdout(&out), "--flag\n");
    assert!(!stderr(&out).contains("exec-failed"));
    assert_eq!(
        env.log_lines(),
        vec![record("execve", probe_pid(&out), "/usr/bin/myservice")]
    );
}

#[test]
fn test_posix_spawn_runs_echo_and_fills_pid() {
    let env = TestEnvironment::new().unwrap();
    let echo = env.echo_path();

    let out = run(probe(&env, Some(&echo)).args([
        "spawn",
        "/usr/bin/build-tool",
        "build-tool",
        "all",
        "--jobs=4",
    ]));

    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "all --jobs=4\n");
    let child: i64 = stderr_field(&out, "pid").unwrap().parse().unwrap();
    assert!(child > 0);
    assert_eq!(stderr_field(&out, "status").as_deref(), Some("0"));
    assert_eq!(
        env.log_lines(),
        vec![record("posix_spawn", probe_pid(&out), "/usr/bin/build-tool")]
    );
}

#[test]
fn test_argv0_and_env_reach_substitute_via_execve() {
    let env = TestEnvironment::new().unwrap();
    let target = PathBuf::from(PROBE);

    let out = run(probe(&env, Some(&target)).args([
        "exec",
        "/usr/bin/myservice",
        "-e",
        "GREETING=hello",
        "myservice",
        "--flag",
    ]));

    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["argv"], serde_json::json!(["myservice", "--flag"]));
    assert_eq!(report["env"]["GREETING"], "hello");
    assert_eq!(env.log_lines().len(), 1);
}

#[test]
fn test_argv0_and_env_reach_substitute_via_posix_spawn() {
    let env = TestEnvironment::new().unwrap();
    let target = PathBuf::from(PROBE);

    let out = run(probe(&env, Some(&target)).args([
        "spawn",
        "/usr/bin/build-tool",
        "-e",
        "BUILD_MODE=release",
        "build-tool",
    ]));

    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["argv"], serde_json::json!(["build-tool"]));
    assert_eq!(report["env"]["BUILD_MODE"], "release");
}

#[test]
fn test_missing_target_fails_like_missing_path() {
    let env = TestEnvironment::new().unwrap();
    let missing = env.missing_path("no-such-target");

    let shimmed = run(probe(&env, Some(&missing)).args(["exec", "/usr/bin/myservice", "x"]));
    let baseline = run(bare_probe().args(["exec", missing.to_str().unwrap(), "x"]));

    assert_eq!(shimmed.status.code(), Some(127));
    assert_eq!(stderr_field(&shimmed, "errno").as_deref(), Some("2"));
    assert_eq!(
        stderr_field(&shimmed, "errno"),
        stderr_field(&baseline, "errno")
    );
    // Observed even though the launch failed
    assert_eq!(env.log_lines().len(), 1);

    let shimmed = run(probe(&env, Some(&missing)).args(["spawn", "/usr/bin/build-tool", "x"]));
    let baseline = run(bare_probe().args(["spawn", missing.to_str().unwrap(), "x"]));
    assert!(!shimmed.status.success());
    assert_eq!(stderr_field(&shimmed, "code").as_deref(), Some("2"));
    assert_eq!(stderr_field(&shimmed, "code"), stderr_field(&baseline, "code"));
    assert_eq!(env.log_lines().len(), 2);
}

#[test]
fn test_substitute_exit_status_passes_through() {
    let env = TestEnvironment::new().unwrap();
    let script = env.create_script("stand-in", "exit 7").unwrap();

    let out = run(probe(&env, Some(&script)).args(["spawn", "/usr/bin/tool", "tool"]));
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stderr_field(&out, "status").as_deref(), Some("7"));

    let out = run(probe(&env, Some(&script)).args(["exec", "/usr/bin/tool", "tool"]));
    assert_eq!(out.status.code(), Some(7));
}

#[test]
fn test_each_requested_path_is_logged_same_target_runs() {
    let env = TestEnvironment::new().unwrap();
    let echo = env.echo_path();
    let paths = ["/usr/bin/cc", "/usr/bin/ld", "/opt/tools/strip"];

    let out = run(probe(&env, Some(&echo))
        .arg("spawn-each")
        .args(paths));

    assert!(out.status.success(), "stderr: {}", stderr(&out));
    // echo with only argv[0] prints an empty line per spawn
    assert_eq!(stdout(&out), "\n\n\n");
    let pid = probe_pid(&out);
    let expected: Vec<String> = paths
        .iter()
        .map(|p| record("posix_spawn", pid, p))
        .collect();
    assert_eq!(env.log_lines(), expected);
}

#[test]
fn test_null_pid_slot_is_accepted() {
    let env = TestEnvironment::new().unwrap();
    let echo = env.echo_path();

    let out = run(probe(&env, Some(&echo)).args([
        "spawn-null-pid",
        "/usr/bin/build-tool",
        "build-tool",
        "ok",
    ]));

    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "ok\n");
    assert_eq!(
        env.log_lines(),
        vec![record("posix_spawn", probe_pid(&out), "/usr/bin/build-tool")]
    );
}

#[test]
fn test_concurrent_spawns_one_record_each() {
    let env = TestEnvironment::new().unwrap();
    let echo = env.echo_path();
    let threads = 8;

    let out = run(probe(&env, Some(&echo)).args([
        "spawn-threads",
        threads.to_string().as_str(),
        "/usr/bin/worker",
    ]));

    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let pid = probe_pid(&out);
    let lines = env.log_lines();
    assert_eq!(lines.len(), threads);
    assert!(lines
        .iter()
        .all(|l| *l == record("posix_spawn", pid, "/usr/bin/worker")));
    assert_eq!(stdout(&out).lines().count(), threads);
}

#[test]
fn test_records_go_to_stderr_without_log_file() {
    let env = TestEnvironment::new().unwrap();
    let echo = env.echo_path();

    let out = run(probe(&env, None)
        .env(ENV_TARGET, &echo)
        .args(["exec", "/usr/bin/myservice", "myservice", "hi"]));

    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "hi\n");
    let expected = record("execve", probe_pid(&out), "/usr/bin/myservice");
    assert!(stderr(&out).lines().any(|l| l == expected), "stderr: {}", stderr(&out));
    assert!(env.log_lines().is_empty());
}

#[test]
fn test_records_to_null_stderr_keep_spawn_working() {
    let env = TestEnvironment::new().unwrap();
    let echo = env.echo_path();

    let out = run(probe(&env, None)
        .env(ENV_TARGET, &echo)
        .stderr(Stdio::null())
        .args(["spawn", "/usr/bin/build-tool", "build-tool", "quiet"]));

    assert!(out.status.success());
    assert_eq!(stdout(&out), "quiet\n");
}

#[test]
fn test_closed_stderr_keeps_exec_working() {
    let env = TestEnvironment::new().unwrap();
    let echo = env.echo_path();

    let mut cmd = probe(&env, None);
    cmd.env(ENV_TARGET, &echo)
        .env(ENV_DEBUG, "1")
        .args(["exec", "/usr/bin/myservice", "myservice", "still-runs"]);
    // The banner is written while fd 2 is still closed
    unsafe {
        cmd.pre_exec(|| {
            libc::close(2);
            Ok(())
        });
    }
    let out = run(&mut cmd);

    assert!(out.status.success(), "status: {:?}", out.status);
    assert_eq!(stdout(&out), "still-runs\n");
}

#[test]
fn test_default_target_when_unset() {
    // Only meaningful for the stock default
    if option_env!("RESPAWN_DEFAULT_TARGET").is_some() || !Path::new("/bin/echo").exists() {
        return;
    }
    let env = TestEnvironment::new().unwrap();

    let out = run(probe(&env, None)
        .env(ENV_LOG_FILE, &env.log_file)
        .args(["spawn", "/usr/bin/build-tool", "build-tool", "default"]));

    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "default\n");
    assert_eq!(env.log_lines().len(), 1);
}

#[test]
fn test_status_reports_bindings() {
    let env = TestEnvironment::new().unwrap();
    let echo = env.echo_path();

    let out = run(probe(&env, Some(&echo)).arg("status"));
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let status: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(status["substitute_target"], echo.to_str().unwrap());
    assert_eq!(status["log_file"], env.log_file.to_str().unwrap());
    assert_eq!(status["bindings"]["execve"], true);
    assert_eq!(status["bindings"]["posix_spawn"], true);
    assert_eq!(status["intercepted"]["execve"], 0);
}

#[test]
fn test_status_unavailable_without_shim() {
    let out = run(bare_probe().arg("status"));
    assert_eq!(out.status.code(), Some(2));
    assert!(stderr(&out).contains("respawn_get_status not found"));
}

#[test]
fn test_debug_banner_lists_bindings() {
    let env = TestEnvironment::new().unwrap();
    let echo = env.echo_path();

    let out = run(probe(&env, Some(&echo))
        .env(ENV_DEBUG, "1")
        .arg("config"));

    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let err = stderr(&out);
    for op in ["execve", "posix_spawn"] {
        let banner = format!("[respawn] {} -> {} (bound)", op, echo.display());
        assert!(err.lines().any(|l| l == banner), "missing {:?} in {}", banner, err);
    }
}

#[test]
fn test_probe_sees_same_config_as_shim() {
    let env = TestEnvironment::new().unwrap();
    let echo = env.echo_path();

    let out = run(probe(&env, Some(&echo)).arg("config"));
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let config: respawn_config::ShimConfig = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(config, env.shim_config(&echo));
}
