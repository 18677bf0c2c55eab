//! CLI contract tests.

use assert_cmd::Command;

fn execguard() -> Command {
    match Command::cargo_bin("execguard") {
        Ok(cmd) => cmd,
        Err(err) => panic!("execguard binary should be built: {err}"),
    }
}

#[test]
fn digest_prints_hex_and_path() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let file = dir.path().join("abc.bin");
    std::fs::write(&file, b"abc").expect("should write file");

    let output = execguard()
        .arg("digest")
        .arg(&file)
        .output()
        .expect("should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim_end(),
        format!(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  {}",
            file.display()
        )
    );
}

#[test]
fn digest_of_missing_file_fails() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    execguard()
        .arg("digest")
        .arg(dir.path().join("missing"))
        .assert()
        .failure();
}

#[test]
fn check_config_accepts_valid_file() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let file = dir.path().join("config.toml");
    std::fs::write(&file, "[engine]\nworkers = 2\n").expect("should write config");

    let output = execguard()
        .arg("check-config")
        .arg("--config")
        .arg(&file)
        .env("EXECGUARD_LOGS_DIR", dir.path().join("logs"))
        .output()
        .expect("should run");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("configuration OK"));
}

#[test]
fn check_config_rejects_invalid_settings() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let file = dir.path().join("config.toml");
    std::fs::write(&file, "[engine]\nworkers = 0\n").expect("should write config");

    execguard()
        .arg("check-config")
        .arg("--config")
        .arg(&file)
        .assert()
        .failure();
}

#[test]
fn help_lists_subcommands() {
    let output = execguard().arg("--help").output().expect("should run");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("start"));
    assert!(stdout.contains("digest"));
    assert!(stdout.contains("check-config"));
}
