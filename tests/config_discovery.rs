use std::{
    ffi::OsStr,
    fs,
    path::Path,
    process::{Command, Output},
};

use tempfile::tempdir;

/// Writes a config whose capture log holds `bad_lines` unparseable lines, so
/// the replay summary on stdout identifies which config was used.
fn write_valid_config(path: &Path, log_dir: &Path, bad_lines: usize) {
    fs::create_dir_all(log_dir).expect("log dir should be created");
    let capture_log = log_dir.join("queries.jsonl");
    fs::write(&capture_log, "not json\n".repeat(bad_lines)).expect("capture log should be written");
    let config = format!(
        r#"
[replay]
capture_log = "{}"
replay_log_path = "{}"
target_port = 1

[logging]
level = "error"
"#,
        capture_log.display(),
        log_dir.join("replay.jsonl").display()
    );
    fs::write(path, config).expect("config should be written");
}

fn run_pgrr<I, S>(args: I, cwd: &Path, home: &Path) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_pgrr"))
        .args(args)
        .env("HOME", home)
        .current_dir(cwd)
        .output()
        .expect("pgrr command should execute")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "expected success\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_owned()
}

#[test]
fn config_discovery_prefers_project_then_home_then_override() {
    let sandbox = tempdir().expect("tempdir should be created");
    let project_dir = sandbox.path().join("project");
    let home_dir = sandbox.path().join("home");
    let logs_dir = sandbox.path().join("logs");
    fs::create_dir_all(&project_dir).expect("project dir should be created");
    fs::create_dir_all(home_dir.join(".pgrr")).expect("home config dir should be created");

    let project_config = project_dir.join("pgrr.toml");
    let home_config = home_dir.join(".pgrr").join("config.toml");
    let override_config = sandbox.path().join("override.toml");

    write_valid_config(&project_config, &logs_dir.join("project"), 1);
    fs::write(
        &home_config,
        r#"
[replay]
unknown_key = "invalid"
"#,
    )
    .expect("home config should be written");

    let prefers_project = run_pgrr(["replay"], &project_dir, &home_dir);
    assert_success(&prefers_project);
    assert_eq!(stdout(&prefers_project), "sent=0 skipped=1");

    fs::remove_file(&project_config).expect("project config should be removed");
    write_valid_config(&home_config, &logs_dir.join("home"), 2);

    let falls_back_to_home = run_pgrr(["replay"], &project_dir, &home_dir);
    assert_success(&falls_back_to_home);
    assert_eq!(stdout(&falls_back_to_home), "sent=0 skipped=2");

    fs::write(
        &project_config,
        r#"
[capture]
listen = "not-an-address"
"#,
    )
    .expect("project config should be rewritten as invalid");
    fs::write(
        &home_config,
        r#"
[capture]
backend = "missing-port"
"#,
    )
    .expect("home config should be rewritten as invalid");
    write_valid_config(&override_config, &logs_dir.join("override"), 3);

    let without_override = run_pgrr(["replay"], &project_dir, &home_dir);
    assert!(
        !without_override.status.success(),
        "expected failure without override\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&without_override.stdout),
        String::from_utf8_lossy(&without_override.stderr)
    );
    assert!(
        String::from_utf8_lossy(&without_override.stderr).contains("project ./pgrr.toml"),
        "stderr should indicate the project source\nstderr:\n{}",
        String::from_utf8_lossy(&without_override.stderr)
    );

    let with_override = run_pgrr(
        [
            OsStr::new("replay"),
            OsStr::new("--config"),
            override_config.as_os_str(),
        ],
        &project_dir,
        &home_dir,
    );
    assert_success(&with_override);
    assert_eq!(stdout(&with_override), "sent=0 skipped=3");
}

#[test]
fn zero_speed_is_rejected_before_replaying() {
    let sandbox = tempdir().expect("tempdir should be created");
    let config = sandbox.path().join("pgrr.toml");
    write_valid_config(&config, &sandbox.path().join("logs"), 0);

    let output = run_pgrr(
        [
            OsStr::new("replay"),
            OsStr::new("--config"),
            config.as_os_str(),
            OsStr::new("--speed"),
            OsStr::new("0"),
        ],
        sandbox.path(),
        sandbox.path(),
    );
    assert!(!output.status.success(), "zero speed should fail");
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("speed multiplier"),
        "stderr should explain the speed error\nstderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(
        !sandbox.path().join("logs").join("replay.jsonl").exists(),
        "no replay log should be written"
    );
}

#[test]
fn missing_capture_log_is_an_error() {
    let sandbox = tempdir().expect("tempdir should be created");
    let output = run_pgrr(
        ["replay", "--capture-log", "does-not-exist.jsonl"],
        sandbox.path(),
        sandbox.path(),
    );
    assert!(!output.status.success(), "missing capture log should fail");
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("does-not-exist.jsonl"),
        "stderr should name the capture log\nstderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
}
