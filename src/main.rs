use proxyctl::api::{ApiServer, ApiState, PKG_NAME, VERSION};
use proxyctl::auth::{hash_password, AuthConfig, AuthManager};
use proxyctl::certs::CertificateStore;
use proxyctl::config::Config;
use proxyctl::db::Database;
use proxyctl::nginx::NginxManager;
use proxyctl::render;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxyctl=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    info!(
        name = PKG_NAME,
        version = VERSION,
        bind = %config.server.bind_addr(),
        nginx_binary = %config.nginx.binary,
        nginx_config = %config.nginx.config_path.display(),
        db = %config.storage.db_path.display(),
        "Starting management daemon"
    );

    // Open the desired-state store
    let db = Arc::new(Database::open(&config.storage.db_path)?);
    seed_settings(&db)?;
    seed_admin_user(&db)?;

    // Auth: a missing jwt_secret means a fresh random secret per start,
    // which invalidates existing sessions on restart.
    if config.auth.jwt_secret.is_none() {
        warn!("No jwt_secret configured; sessions will not survive a restart");
    }
    let auth = AuthManager::new(AuthConfig {
        secret: config
            .auth
            .jwt_secret
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        token_expiry_hours: config.auth.token_expiry_hours,
    });

    let nginx = Arc::new(NginxManager::new(&config.nginx));
    let certs = CertificateStore::new(config.storage.certs_dir.clone());

    let state = Arc::new(ApiState {
        db,
        nginx,
        certs,
        auth,
    });

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = Arc::new(ApiServer::new(
        state,
        config.server.bind_addr(),
        shutdown_rx,
    ));
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Management API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and wait for the server to drain
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Seed the global settings the renderer reads, without overwriting values an
/// operator has already changed.
fn seed_settings(db: &Database) -> anyhow::Result<()> {
    let defaults = [
        (render::SETTING_DEFAULT_SSL_SERVER, "false"),
        (render::SETTING_DEFAULT_CERT_PATH, "/etc/nginx/certs/default.crt"),
        (render::SETTING_DEFAULT_KEY_PATH, "/etc/nginx/certs/default.key"),
    ];
    for (key, value) in defaults {
        if db.get_setting(key)?.is_none() {
            db.set_setting(key, value)?;
        }
    }
    Ok(())
}

/// Create the initial admin account on first start. The generated password is
/// logged exactly once; only its hash is stored.
fn seed_admin_user(db: &Database) -> anyhow::Result<()> {
    if db.count_users()? > 0 {
        return Ok(());
    }

    let password = uuid::Uuid::new_v4().to_string();
    db.create_user("admin", &hash_password(&password), "admin")?;
    info!(
        username = "admin",
        password = %password,
        "Created initial admin user; change this password after first login"
    );
    Ok(())
}
