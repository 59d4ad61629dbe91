use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn stylist_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_stylist"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // A small two-tone photo.
    let img = image::RgbImage::from_fn(16, 16, |x, _| {
        if x < 8 {
            image::Rgb([200, 30, 30])
        } else {
            image::Rgb([20, 20, 180])
        }
    });
    img.save(root.join("me.png")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/stylist.sqlite"

[server]
bind = "127.0.0.1:7341"
log_level = "warn"

[embedding]
provider = "disabled"

[storage]
backend = "fs"
root = "{root}/objects"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("stylist.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_stylist(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = stylist_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run stylist binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_stylist(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/stylist.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_stylist(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_stylist(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_enroll_then_show_user() {
    let (tmp, config_path) = setup_test_env();
    run_stylist(&config_path, &["init"]);

    let photo = tmp.path().join("me.png");
    let (stdout, stderr, success) = run_stylist(
        &config_path,
        &[
            "user",
            "enroll",
            "--user",
            "u1",
            "--username",
            "asha",
            photo.to_str().unwrap(),
        ],
    );
    assert!(success, "enroll failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Enrolled u1 (1 photo(s)"));

    // The photo was copied into object storage.
    let stored: Vec<_> = fs::read_dir(tmp.path().join("objects/photos/u1"))
        .unwrap()
        .collect();
    assert_eq!(stored.len(), 1);

    let (stdout, _, success) = run_stylist(&config_path, &["user", "show", "u1"]);
    assert!(success);
    assert!(stdout.contains("asha"));
    assert!(stdout.contains("enrolled"));
}

#[test]
fn test_show_unknown_user_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_stylist(&config_path, &["init"]);

    let (_, stderr, success) = run_stylist(&config_path, &["user", "show", "ghost"]);
    assert!(!success);
    assert!(stderr.contains("User not found"));
}

#[test]
fn test_thread_commands_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();
    run_stylist(&config_path, &["init"]);

    let (stdout, _, success) = run_stylist(&config_path, &["thread", "list", "--user", "u1"]);
    assert!(success);
    assert!(stdout.contains("No threads for u1."));

    let (_, stderr, success) = run_stylist(&config_path, &["thread", "show", "thread_missing"]);
    assert!(!success);
    assert!(stderr.contains("Thread not found"));

    let (_, _, success) = run_stylist(&config_path, &["thread", "delete", "thread_missing"]);
    assert!(!success);
}

#[test]
fn test_embed_reports_dimensions() {
    let (tmp, config_path) = setup_test_env();
    let photo = tmp.path().join("me.png");

    let (stdout, stderr, success) =
        run_stylist(&config_path, &["embed", photo.to_str().unwrap()]);
    assert!(success, "embed failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("model:   disabled"));
    assert!(stdout.contains("visual:  768 dims, 0 non-zero"));
    assert!(stdout.contains("color:   256 dims"));
}
