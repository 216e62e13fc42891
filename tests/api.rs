//! Integration tests for the management API over a live socket
//!
//! The server runs against an in-memory database; requests are sent as raw
//! HTTP/1.1 so the tests exercise the full routing and auth path.

#![cfg(unix)]

use proxyctl::api::{ApiServer, ApiState};
use proxyctl::auth::{hash_password, AuthConfig, AuthManager};
use proxyctl::certs::CertificateStore;
use proxyctl::config::NginxConfig;
use proxyctl::db::Database;
use proxyctl::nginx::NginxManager;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

struct TestServer {
    port: u16,
    _dir: TempDir,
    _shutdown_tx: watch::Sender<bool>,
}

/// Start an API server on a free port with one seeded admin account
/// (`admin` / `secret`)
async fn start_server() -> TestServer {
    let dir = TempDir::new().unwrap();

    let db = Arc::new(Database::open_in_memory().unwrap());
    db.create_user("admin", &hash_password("secret"), "admin")
        .unwrap();

    let nginx = Arc::new(NginxManager::new(&NginxConfig {
        binary: "true".to_string(),
        config_path: dir.path().join("nginx.conf"),
        backup_dir: dir.path().join("backup"),
        subprocess_timeout_secs: 5,
    }));
    let certs = CertificateStore::new(dir.path().join("certs"));
    let auth = AuthManager::new(AuthConfig {
        secret: "test-secret".to_string(),
        token_expiry_hours: 1,
    });

    let state = Arc::new(ApiState {
        db,
        nginx,
        certs,
        auth,
    });

    let port = free_port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = Arc::new(ApiServer::new(
        state,
        format!("127.0.0.1:{}", port),
        shutdown_rx,
    ));
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    assert!(
        wait_for_port(port, Duration::from_secs(5)).await,
        "server did not start"
    );

    TestServer {
        port,
        _dir: dir,
        _shutdown_tx: shutdown_tx,
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Send one request and return (status, parsed JSON body)
async fn request(
    port: u16,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&str>,
) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();

    let body = body.unwrap_or("");
    let auth_header = token
        .map(|t| format!("Authorization: Bearer {}\r\n", t))
        .unwrap_or_default();
    let raw = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n{}Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        auth_header,
        body.len(),
        body
    );
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status line");
    let json_body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b)
        .filter(|b| !b.is_empty())
        .and_then(|b| serde_json::from_str(b).ok())
        .unwrap_or(serde_json::Value::Null);

    (status, json_body)
}

async fn login(port: u16, username: &str, password: &str) -> (u16, serde_json::Value) {
    let body = serde_json::json!({ "username": username, "password": password }).to_string();
    request(port, "POST", "/auth/login", None, Some(&body)).await
}

#[tokio::test]
async fn user_management_lifecycle() {
    let server = start_server().await;
    let port = server.port;

    let (status, body) = login(port, "admin", "secret").await;
    assert_eq!(status, 200);
    let admin_token = body["data"]["token"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["role"], "admin");

    // Admin creates a second account
    let create = serde_json::json!({ "username": "viewer", "password": "viewpass" }).to_string();
    let (status, body) = request(port, "POST", "/users", Some(&admin_token), Some(&create)).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["role"], "user");
    let viewer_id = body["data"]["id"].as_i64().unwrap();
    // Hashes never leave the server
    assert!(body["data"].get("password_hash").is_none());

    // Duplicate username is a conflict
    let (status, _) = request(port, "POST", "/users", Some(&admin_token), Some(&create)).await;
    assert_eq!(status, 409);

    let (status, body) = request(port, "GET", "/users", Some(&admin_token), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    // The new account can log in and see itself, but not the user list
    let (status, body) = login(port, "viewer", "viewpass").await;
    assert_eq!(status, 200);
    let viewer_token = body["data"]["token"].as_str().unwrap().to_string();

    let (status, _) = request(port, "GET", "/users", Some(&viewer_token), None).await;
    assert_eq!(status, 403);

    let self_path = format!("/users/{}", viewer_id);
    let (status, body) = request(port, "GET", &self_path, Some(&viewer_token), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["username"], "viewer");

    let (status, _) = request(port, "GET", "/users/1", Some(&viewer_token), None).await;
    assert_eq!(status, 403);

    // Password change requires the current password
    let password_path = format!("/users/{}/password", viewer_id);
    let wrong = serde_json::json!({ "old_password": "nope", "new_password": "newpass" }).to_string();
    let (status, _) = request(port, "POST", &password_path, Some(&viewer_token), Some(&wrong)).await;
    assert_eq!(status, 401);

    let change =
        serde_json::json!({ "old_password": "viewpass", "new_password": "newpass" }).to_string();
    let (status, _) = request(port, "POST", &password_path, Some(&viewer_token), Some(&change)).await;
    assert_eq!(status, 200);

    let (status, _) = login(port, "viewer", "viewpass").await;
    assert_eq!(status, 401);
    let (status, _) = login(port, "viewer", "newpass").await;
    assert_eq!(status, 200);

    // Soft delete: the account stops authenticating but stays listed
    let (status, _) = request(port, "DELETE", &self_path, Some(&admin_token), None).await;
    assert_eq!(status, 200);
    let (status, _) = login(port, "viewer", "newpass").await;
    assert_eq!(status, 401);
    let (status, body) = request(port, "GET", "/users", Some(&admin_token), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn mutations_require_admin_role() {
    let server = start_server().await;
    let port = server.port;

    let (_, body) = login(port, "admin", "secret").await;
    let admin_token = body["data"]["token"].as_str().unwrap().to_string();

    let create = serde_json::json!({ "username": "viewer", "password": "viewpass" }).to_string();
    request(port, "POST", "/users", Some(&admin_token), Some(&create)).await;
    let (_, body) = login(port, "viewer", "viewpass").await;
    let viewer_token = body["data"]["token"].as_str().unwrap().to_string();

    let backend =
        serde_json::json!({ "name": "web", "host": "10.0.0.1", "port": 8080 }).to_string();
    let (status, _) = request(port, "POST", "/backends", Some(&viewer_token), Some(&backend)).await;
    assert_eq!(status, 403);

    // And no token at all is unauthorized
    let (status, _) = request(port, "POST", "/backends", None, Some(&backend)).await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn health_reports_component_status() {
    let server = start_server().await;

    let (status, body) = request(server.port, "GET", "/health", None, None).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "connected");
    assert_eq!(body["active_backends"], 0);
    assert!(body["nginx_binary"].is_string());
}
