use std::fs;
use std::process::Command;

use crate::utils::{binary, write_config};

#[test]
fn test_check_config() {
    let root = mirrorgate_test::tempdir();
    let config = write_config(root.path(), "127.0.0.1:0");

    let output = Command::new(binary())
        .arg("check-config")
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2 redirect rule(s)"), "{stdout}");
}

#[test]
fn test_check_config_invalid() {
    let root = mirrorgate_test::tempdir();
    let config = root.path().join("config.yml");
    fs::write(&config, "redirects:\n  - patterns: 42\n").unwrap();

    let output = Command::new(binary())
        .args(["-c"])
        .arg(&config)
        .arg("check-config")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed loading config"), "{stderr}");
}

#[test]
fn test_missing_config_file() {
    let root = mirrorgate_test::tempdir();

    let output = Command::new(binary())
        .arg("--config")
        .arg(root.path().join("missing.yml"))
        .arg("run")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
}
