//! Integration tests for the render/validate/backup/write/reload pipeline
//!
//! A shell script stands in for the nginx binary so the tests can steer the
//! exit code of each subprocess step and observe the invocations.

#![cfg(unix)]

use proxyctl::config::NginxConfig;
use proxyctl::db::{BackendInput, Database, RuleInput};
use proxyctl::nginx::NginxManager;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write an executable stand-in for the nginx binary
fn write_fake_nginx(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-nginx");
    let script = format!("#!/bin/sh\n{}\n", body);
    std::fs::write(&path, script).unwrap();

    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

struct Harness {
    _dir: TempDir,
    manager: NginxManager,
    config_path: PathBuf,
    backup_dir: PathBuf,
    reload_marker: PathBuf,
}

/// Build a manager pointed at a temp dir and a scripted nginx. The script
/// receives `-t -c <file>` for validation and `-s reload` for reloads; it
/// touches `reloaded` on every reload so tests can count invocations.
fn harness(script_body: &str, timeout_secs: u64) -> Harness {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("nginx.conf");
    let backup_dir = dir.path().join("backup");
    let reload_marker = dir.path().join("reloaded");

    let body = format!(
        r#"if [ "$1" = "-s" ]; then
    touch "{}"
fi
{}"#,
        reload_marker.display(),
        script_body
    );
    let binary = write_fake_nginx(dir.path(), &body);

    let config = NginxConfig {
        binary: binary.to_string_lossy().into_owned(),
        config_path: config_path.clone(),
        backup_dir: backup_dir.clone(),
        subprocess_timeout_secs: timeout_secs,
    };

    Harness {
        manager: NginxManager::new(&config),
        config_path,
        backup_dir,
        reload_marker,
        _dir: dir,
    }
}

fn seeded_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    let backend = db
        .create_backend(
            &BackendInput {
                name: "web".to_string(),
                host: "10.0.0.5".to_string(),
                port: 8080,
                scheme: "http".to_string(),
                is_active: true,
            },
            None,
        )
        .unwrap();
    db.create_rule(
        &RuleInput {
            hostname: "app.example.com".to_string(),
            backend_id: backend.id,
            certificate_id: None,
            access: "public".to_string(),
            ip_allowlist: None,
            ssl_enabled: false,
            force_https: false,
            enable_hsts: false,
            hsts_max_age: 31536000,
            custom_headers: None,
            rate_limit: None,
            is_active: true,
        },
        None,
    )
    .unwrap();
    db
}

#[tokio::test]
async fn apply_writes_config_and_reloads() {
    let h = harness("exit 0", 10);
    let db = seeded_db();

    let outcome = h.manager.apply(&db).await;
    assert!(outcome.success, "apply failed: {}", outcome.message);
    assert_eq!(outcome.message, "Configuration applied and nginx reloaded");

    let live = std::fs::read_to_string(&h.config_path).unwrap();
    assert!(live.contains("upstream backend_"));
    assert!(live.contains("server_name app.example.com;"));
    assert!(h.reload_marker.exists(), "reload was never invoked");

    // No previous live config existed, so nothing to back up
    assert!(!h.backup_dir.exists());
}

#[tokio::test]
async fn apply_backs_up_previous_config() {
    let h = harness("exit 0", 10);
    let db = seeded_db();

    std::fs::write(&h.config_path, "# previous config\n").unwrap();

    let outcome = h.manager.apply(&db).await;
    assert!(outcome.success, "apply failed: {}", outcome.message);

    let backups: Vec<_> = std::fs::read_dir(&h.backup_dir)
        .unwrap()
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(backups.len(), 1);
    let name = backups[0].file_name();
    assert!(name.to_string_lossy().starts_with("nginx.conf."));

    let backed_up = std::fs::read_to_string(backups[0].path()).unwrap();
    assert_eq!(backed_up, "# previous config\n");

    // The live file now holds the new rendering
    let live = std::fs::read_to_string(&h.config_path).unwrap();
    assert!(live.contains("server_name app.example.com;"));
}

#[tokio::test]
async fn validation_failure_leaves_live_config_untouched() {
    let h = harness(
        r#"if [ "$1" = "-t" ]; then
    echo "nginx: [emerg] unexpected end of file" >&2
    exit 1
fi
exit 0"#,
        10,
    );
    let db = seeded_db();

    std::fs::write(&h.config_path, "# previous config\n").unwrap();

    let outcome = h.manager.apply(&db).await;
    assert!(!outcome.success);
    assert!(outcome.message.starts_with("Validation failed:"));
    assert!(outcome.message.contains("unexpected end of file"));

    // The pipeline stopped before backup, write, and reload
    let live = std::fs::read_to_string(&h.config_path).unwrap();
    assert_eq!(live, "# previous config\n");
    assert!(!h.backup_dir.exists());
    assert!(!h.reload_marker.exists());
}

#[tokio::test]
async fn write_failure_never_triggers_reload() {
    let h = harness("exit 0", 10);
    let db = seeded_db();

    // Live path is a dangling symlink into a missing directory: validation
    // writes its sibling candidate file fine, backup is skipped because the
    // link resolves to nothing, and the final write fails.
    let target = h
        .config_path
        .parent()
        .unwrap()
        .join("missing")
        .join("nginx.conf");
    std::os::unix::fs::symlink(&target, &h.config_path).unwrap();

    let outcome = h.manager.apply(&db).await;
    assert!(!outcome.success);
    assert!(outcome.message.starts_with("Write failed:"), "{}", outcome.message);

    // Validation succeeded, but reload never ran and no backup was taken
    assert!(!h.reload_marker.exists());
    assert!(!h.backup_dir.exists());
}

#[tokio::test]
async fn reload_failure_leaves_new_config_on_disk() {
    let h = harness(
        r#"if [ "$1" = "-s" ]; then
    echo "nginx: [error] invalid PID" >&2
    exit 1
fi
exit 0"#,
        10,
    );
    let db = seeded_db();

    let outcome = h.manager.apply(&db).await;
    assert!(!outcome.success);
    assert!(outcome.message.starts_with("Reload failed:"));

    // The write already happened; disk and process are now out of sync
    let live = std::fs::read_to_string(&h.config_path).unwrap();
    assert!(live.contains("server_name app.example.com;"));
}

#[tokio::test]
async fn subprocess_timeout_is_reported() {
    let h = harness("sleep 30", 1);
    let db = seeded_db();

    let outcome = h.manager.apply(&db).await;
    assert!(!outcome.success);
    assert!(outcome.message.contains("timed out after 1s"), "{}", outcome.message);
}

#[tokio::test]
async fn missing_binary_is_reported_not_panicked() {
    let dir = TempDir::new().unwrap();
    let config = NginxConfig {
        binary: dir.path().join("no-such-nginx").to_string_lossy().into_owned(),
        config_path: dir.path().join("nginx.conf"),
        backup_dir: dir.path().join("backup"),
        subprocess_timeout_secs: 5,
    };
    let manager = NginxManager::new(&config);

    let outcome = manager.validate_config("events {}\n").await;
    assert!(!outcome.success);
    assert!(outcome.message.contains("Failed to run"));
}

#[tokio::test]
async fn validate_removes_candidate_file() {
    let h = harness("exit 0", 10);

    let outcome = h.manager.validate_config("events {}\n").await;
    assert!(outcome.success);

    let mut candidate = h.config_path.as_os_str().to_owned();
    candidate.push(".test");
    assert!(
        !PathBuf::from(candidate).exists(),
        "candidate config was not cleaned up"
    );
}

#[tokio::test]
async fn validate_reports_stderr_on_failure() {
    let h = harness(
        r#"echo 'nginx: configuration file test failed' >&2
exit 1"#,
        10,
    );

    let outcome = h.manager.validate_config("bogus\n").await;
    assert!(!outcome.success);
    assert_eq!(outcome.message, "nginx: configuration file test failed");
}
