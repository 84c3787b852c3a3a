//! End-to-end tests of the `kgw` binary against a temporary database.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kgw_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kgw"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/gateway.sqlite"

[server]
bind = "127.0.0.1:0"

[object_store]
bucket = "rag-files"
endpoint_url = "http://127.0.0.1:9"

[remote]
base_url = "http://127.0.0.1:9/v1"
dataset_id = "test-dataset"
"#,
        root.display()
    );

    let config_path = config_dir.join("gateway.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kgw(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(kgw_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run kgw");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_kgw(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/gateway.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (_, _, ok1) = run_kgw(&config, &["init"]);
    let (_, stderr, ok2) = run_kgw(&config, &["init"]);
    assert!(ok1);
    assert!(ok2, "second init failed: {}", stderr);
}

#[test]
fn test_space_create_prints_timestamp_id() {
    let (_tmp, config) = setup_test_env();
    run_kgw(&config, &["init"]);

    let (stdout, stderr, ok) = run_kgw(
        &config,
        &["space", "create", "--name", "Handbook", "--description", "HR"],
    );
    assert!(ok, "space create failed: {}", stderr);
    let id = stdout.trim();
    assert_eq!(id.len(), 14, "unexpected id: {}", id);
    assert!(id.chars().all(|c| c.is_ascii_digit()));
}

#[test]
fn test_search_empty_space() {
    let (_tmp, config) = setup_test_env();
    run_kgw(&config, &["init"]);
    let (stdout, stderr, ok) = run_kgw(&config, &["search", "20240101000000", "report"]);
    assert!(ok, "search failed: {}", stderr);
    assert!(stdout.contains("No documents found."));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = run_kgw(&tmp.path().join("absent.toml"), &["init"]);
    assert!(!ok);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_invalid_config_rejected() {
    let (_tmp, config) = setup_test_env();
    let content = fs::read_to_string(&config)
        .unwrap()
        .replace("http://127.0.0.1:9/v1", "not-a-url");
    fs::write(&config, content).unwrap();

    let (_, stderr, ok) = run_kgw(&config, &["init"]);
    assert!(!ok);
    assert!(stderr.contains("remote.base_url"));
}
