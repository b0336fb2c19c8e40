use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    let body = format!(
        r#"data_dir = {:?}

[sampling]
deadline_secs = 2

[source]
delay_ms = 10

[device]
probe = "static"

{extra}"#,
        dir.join("kv").display().to_string(),
    );
    fs::write(&path, body).unwrap();
    path
}

fn locsampler(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("locsampler").unwrap();
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn once_prints_the_fix() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");

    locsampler(&config)
        .arg("once")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\"").and(predicate::str::contains("37.7749")));
}

#[test]
fn dry_run_does_not_store_the_fix() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");

    locsampler(&config).args(["once", "--dry-run"]).assert().success();
    let stored = fs::read_dir(dir.path().join("kv")).unwrap().count();
    assert_eq!(stored, 0);

    locsampler(&config).arg("once").assert().success();
    assert!(fs::read_dir(dir.path().join("kv")).unwrap().count() > 0);
}

#[test]
fn once_without_permission_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "[permissions]\nforeground_location = false\n");

    locsampler(&config)
        .arg("once")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("permission-denied"));
}

#[test]
fn once_with_unavailable_provider_asks_for_retry() {
    let dir = tempfile::tempdir().unwrap();
    let body = fs::read_to_string(write_config(dir.path(), "")).unwrap();
    let config = dir.path().join("config.toml");
    fs::write(&config, body.replace("delay_ms = 10", "delay_ms = 10\navailable = false")).unwrap();

    locsampler(&config)
        .arg("once")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("\"retry\""));
}

#[test]
fn jobs_and_cancel_on_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");

    locsampler(&config)
        .arg("jobs")
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));

    locsampler(&config)
        .args(["cancel", "LocationWork"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"removed\":false"));
}

#[test]
fn missing_config_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("fresh").join("config.toml");

    Command::cargo_bin("locsampler")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .args(["cancel", "nothing"])
        .env("XDG_DATA_HOME", dir.path())
        .env("HOME", dir.path())
        .assert()
        .success();
    let written = fs::read_to_string(&config).unwrap();
    assert!(written.contains("LocationWork"));
}
