use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn fleet_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("fleet");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/fleet.sqlite"

[storage]
root = "{root}/repos"

[scheduler]
workers = 2

[server]
bind = "127.0.0.1:7431"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("fleet.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_fleet(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = fleet_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run fleet binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database_and_storage() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_fleet(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Fleet initialized"));

    assert!(tmp.path().join("data/fleet.sqlite").exists());
    assert!(tmp.path().join("repos/golden").is_dir());
    assert!(tmp.path().join("repos/activated").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (_, _, first) = run_fleet(&config, &["init"]);
    assert!(first);
    let (stdout, stderr, second) = run_fleet(&config, &["init"]);
    assert!(second, "second init failed: {}", stderr);
    assert!(stdout.contains("Fleet initialized"));
}

#[test]
fn test_golden_list_empty() {
    let (_tmp, config) = setup_test_env();
    run_fleet(&config, &["init"]);
    let (stdout, stderr, success) = run_fleet(&config, &["golden", "list"]);
    assert!(success, "list failed: {}", stderr);
    assert!(stdout.contains("No golden repositories."));
}

#[test]
fn test_golden_add_rejects_invalid_alias() {
    let (_tmp, config) = setup_test_env();
    run_fleet(&config, &["init"]);
    let (stdout, _stderr, success) = run_fleet(
        &config,
        &["golden", "add", "https://example.invalid/repo.git", "bad/alias"],
    );
    assert!(!success);
    assert!(stdout.contains("validation_error"));
}

#[test]
fn test_golden_add_unknown_index_kind() {
    let (_tmp, config) = setup_test_env();
    let (_stdout, stderr, success) = run_fleet(
        &config,
        &[
            "golden",
            "add",
            "https://example.invalid/repo.git",
            "svc",
            "--kind",
            "vector",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("unknown index kind"));
}

#[test]
fn test_query_unknown_repository_fails() {
    let (_tmp, config) = setup_test_env();
    run_fleet(&config, &["init"]);
    let (_stdout, stderr, success) = run_fleet(&config, &["query", "ghost", "needle"]);
    assert!(!success);
    assert!(stderr.contains("ghost"));
}

#[test]
fn test_query_unknown_mode_errors() {
    let (_tmp, config) = setup_test_env();
    let (_stdout, stderr, success) =
        run_fleet(&config, &["query", "svc", "needle", "--mode", "roundrobin"]);
    assert!(!success);
    assert!(stderr.contains("unknown mode"));
}

#[test]
fn test_job_missing() {
    let (_tmp, config) = setup_test_env();
    run_fleet(&config, &["init"]);
    let (_stdout, stderr, success) = run_fleet(&config, &["job", "no-such-job"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_write_mode_exit_unknown_repository() {
    let (_tmp, config) = setup_test_env();
    run_fleet(&config, &["init"]);
    let (_stdout, stderr, success) = run_fleet(&config, &["write-mode", "exit", "ghost"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_missing_config_file() {
    let tmp = TempDir::new().unwrap();
    let (_stdout, stderr, success) = run_fleet(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
