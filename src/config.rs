use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the management daemon
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// External nginx process configuration
    #[serde(default)]
    pub nginx: NginxConfig,

    /// Storage paths
    #[serde(default)]
    pub storage: StorageConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the management API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the management API (default: 8600)
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NginxConfig {
    /// Path to the nginx binary (default: "nginx", resolved via PATH)
    #[serde(default = "default_nginx_binary")]
    pub binary: String,

    /// Path to the live configuration file nginx reads
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Directory for timestamped backups of the previous live config
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Timeout in seconds for syntax-check and reload subprocess calls
    #[serde(default = "default_subprocess_timeout")]
    pub subprocess_timeout_secs: u64,
}

impl NginxConfig {
    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_secs)
    }
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            binary: default_nginx_binary(),
            config_path: default_config_path(),
            backup_dir: default_backup_dir(),
            subprocess_timeout_secs: default_subprocess_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory where uploaded certificate and key files are written
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            certs_dir: default_certs_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// Secret used to sign JWTs. If not set, a random secret is generated at
    /// startup and existing sessions are invalidated on restart.
    pub jwt_secret: Option<String>,

    /// Token lifetime in hours (default: 24)
    #[serde(default = "default_token_expiry_hours")]
    pub token_expiry_hours: i64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_expiry_hours: default_token_expiry_hours(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8600
}

fn default_nginx_binary() -> String {
    "nginx".to_string()
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/nginx/nginx.conf")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/backup")
}

fn default_subprocess_timeout() -> u64 {
    10
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./proxyctl.db")
}

fn default_certs_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/certs")
}

fn default_token_expiry_hours() -> i64 {
    24
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8600);
        assert_eq!(config.nginx.binary, "nginx");
        assert_eq!(
            config.nginx.config_path,
            PathBuf::from("/etc/nginx/nginx.conf")
        );
        assert_eq!(config.nginx.subprocess_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            [server]
            port = 9000

            [nginx]
            binary = "/usr/sbin/nginx"
            subprocess_timeout_secs = 5
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.nginx.binary, "/usr/sbin/nginx");
        assert_eq!(config.nginx.subprocess_timeout_secs, 5);
        // Untouched sections fall back to defaults
        assert_eq!(config.storage.db_path, PathBuf::from("./proxyctl.db"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/proxyctl.toml")).unwrap();
        assert_eq!(config.server.bind_addr(), "127.0.0.1:8600");
    }
}
