//! SQLite database for proxy desired state
//!
//! This module provides durable storage for backend targets, routing rules,
//! certificates, global settings, users, and the audit log. The renderer
//! reads from here; it never writes.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Conflict raised by uniqueness checks (name, host:port, active hostname)
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ConflictError(pub String);

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// A named upstream service the proxy forwards traffic to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRecord {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields accepted when creating or updating a backend
#[derive(Debug, Clone, Deserialize)]
pub struct BackendInput {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// A hostname-to-backend mapping plus its security policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: i64,
    pub hostname: String,
    pub backend_id: i64,
    pub certificate_id: Option<i64>,
    pub access: String,
    /// JSON array of CIDR/IP literals, order preserved
    pub ip_allowlist: Option<String>,
    pub ssl_enabled: bool,
    pub force_https: bool,
    pub enable_hsts: bool,
    pub hsts_max_age: i64,
    /// JSON object of extra response headers
    pub custom_headers: Option<String>,
    /// Rate descriptor, e.g. "100r/s"
    pub rate_limit: Option<String>,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields accepted when creating or updating a routing rule
#[derive(Debug, Clone, Deserialize)]
pub struct RuleInput {
    pub hostname: String,
    pub backend_id: i64,
    pub certificate_id: Option<i64>,
    #[serde(default = "default_access")]
    pub access: String,
    pub ip_allowlist: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub ssl_enabled: bool,
    #[serde(default = "default_true")]
    pub force_https: bool,
    #[serde(default)]
    pub enable_hsts: bool,
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age: i64,
    pub custom_headers: Option<HashMap<String, String>>,
    pub rate_limit: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// A named, domain-scoped certificate/key pair stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: i64,
    pub name: String,
    pub domain: String,
    pub cert_path: String,
    pub key_path: String,
    pub is_default: bool,
    pub cert_type: String,
    pub expires_at: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: i64,
    pub username: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub changes: Option<String>,
    pub created_at: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_access() -> String {
    "public".to_string()
}

fn default_true() -> bool {
    true
}

fn default_hsts_max_age() -> i64 {
    31536000
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }

            if current_version < 2 {
                self.migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: Initial schema
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'user',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Backend targets
            CREATE TABLE IF NOT EXISTS backends (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                scheme TEXT NOT NULL DEFAULT 'http',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_by TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (host, port)
            );

            -- Routing rules
            CREATE TABLE IF NOT EXISTS rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname TEXT NOT NULL,
                backend_id INTEGER NOT NULL REFERENCES backends(id),
                certificate_id INTEGER,
                access TEXT NOT NULL DEFAULT 'public',
                ip_allowlist TEXT,
                ssl_enabled INTEGER NOT NULL DEFAULT 1,
                force_https INTEGER NOT NULL DEFAULT 1,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_by TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Hostname unique among active rules only
            CREATE UNIQUE INDEX IF NOT EXISTS idx_rules_active_hostname
                ON rules(hostname) WHERE is_active = 1;

            -- Certificates
            CREATE TABLE IF NOT EXISTS certificates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                domain TEXT NOT NULL,
                cert_path TEXT NOT NULL,
                key_path TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                cert_type TEXT NOT NULL,
                expires_at TEXT,
                created_by TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_certificates_domain ON certificates(domain);

            -- Global key/value settings
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                changes TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_audit_time ON audit_log(created_at);

            -- Record migration
            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: Per-rule security policy
    fn migrate_v2(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: per-rule security policy");

        conn.execute_batch(
            r#"
            ALTER TABLE rules ADD COLUMN enable_hsts INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE rules ADD COLUMN hsts_max_age INTEGER NOT NULL DEFAULT 31536000;
            ALTER TABLE rules ADD COLUMN custom_headers TEXT;
            ALTER TABLE rules ADD COLUMN rate_limit TEXT;

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    // ==================== Backend Operations ====================

    /// Create a backend target. Name and (host, port) must be unique across
    /// all backends, active or not.
    pub fn create_backend(&self, input: &BackendInput, created_by: Option<&str>) -> Result<BackendRecord> {
        let conn = self.conn.lock().unwrap();

        let name_taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM backends WHERE name = ?1)",
            params![input.name],
            |row| row.get(0),
        )?;
        if name_taken {
            anyhow::bail!(ConflictError(format!(
                "Backend name '{}' already in use",
                input.name
            )));
        }

        let addr_taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM backends WHERE host = ?1 AND port = ?2)",
            params![input.host, input.port],
            |row| row.get(0),
        )?;
        if addr_taken {
            anyhow::bail!(ConflictError(format!(
                "Backend address {}:{} already in use",
                input.host, input.port
            )));
        }

        conn.execute(
            "INSERT INTO backends (name, host, port, scheme, is_active, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                input.name,
                input.host,
                input.port,
                input.scheme,
                input.is_active,
                created_by
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        self.get_backend(id)?
            .context("Backend vanished after insert")
    }

    /// Get a backend by id
    pub fn get_backend(&self, id: i64) -> Result<Option<BackendRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, host, port, scheme, is_active, created_by, created_at, updated_at
             FROM backends WHERE id = ?1",
            params![id],
            row_to_backend,
        )
        .optional()
        .context("Failed to get backend")
    }

    /// List backends ordered by id
    pub fn list_backends(&self, active_only: bool) -> Result<Vec<BackendRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = if active_only {
            "SELECT id, name, host, port, scheme, is_active, created_by, created_at, updated_at
             FROM backends WHERE is_active = 1 ORDER BY id"
        } else {
            "SELECT id, name, host, port, scheme, is_active, created_by, created_at, updated_at
             FROM backends ORDER BY id"
        };
        let mut stmt = conn.prepare(sql)?;
        let backends = stmt
            .query_map([], row_to_backend)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(backends)
    }

    /// Update a backend. Returns the updated record, or None if not found.
    pub fn update_backend(&self, id: i64, input: &BackendInput) -> Result<Option<BackendRecord>> {
        let conn = self.conn.lock().unwrap();

        let name_taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM backends WHERE name = ?1 AND id != ?2)",
            params![input.name, id],
            |row| row.get(0),
        )?;
        if name_taken {
            anyhow::bail!(ConflictError(format!(
                "Backend name '{}' already in use",
                input.name
            )));
        }

        let addr_taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM backends WHERE host = ?1 AND port = ?2 AND id != ?3)",
            params![input.host, input.port, id],
            |row| row.get(0),
        )?;
        if addr_taken {
            anyhow::bail!(ConflictError(format!(
                "Backend address {}:{} already in use",
                input.host, input.port
            )));
        }

        let rows = conn.execute(
            "UPDATE backends SET name = ?1, host = ?2, port = ?3, scheme = ?4, is_active = ?5,
                    updated_at = datetime('now')
             WHERE id = ?6",
            params![
                input.name,
                input.host,
                input.port,
                input.scheme,
                input.is_active,
                id
            ],
        )?;
        drop(conn);

        if rows == 0 {
            return Ok(None);
        }
        self.get_backend(id)
    }

    /// Delete a backend
    pub fn delete_backend(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let referenced: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM rules WHERE backend_id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if referenced {
            anyhow::bail!(ConflictError(
                "Backend is referenced by one or more routing rules".to_string()
            ));
        }
        let rows = conn.execute("DELETE FROM backends WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ==================== Rule Operations ====================

    /// Create a routing rule. Hostname must be unique among active rules.
    pub fn create_rule(&self, input: &RuleInput, created_by: Option<&str>) -> Result<RuleRecord> {
        let allowlist_json = encode_allowlist(&input.ip_allowlist)?;
        let headers_json = encode_headers(&input.custom_headers)?;

        let conn = self.conn.lock().unwrap();

        let backend_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM backends WHERE id = ?1)",
            params![input.backend_id],
            |row| row.get(0),
        )?;
        if !backend_exists {
            anyhow::bail!(ConflictError(format!(
                "Backend {} does not exist",
                input.backend_id
            )));
        }

        if input.is_active {
            let hostname_taken: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM rules WHERE hostname = ?1 AND is_active = 1)",
                params![input.hostname],
                |row| row.get(0),
            )?;
            if hostname_taken {
                anyhow::bail!(ConflictError(format!(
                    "An active rule for '{}' already exists",
                    input.hostname
                )));
            }
        }

        conn.execute(
            "INSERT INTO rules (hostname, backend_id, certificate_id, access, ip_allowlist,
                    ssl_enabled, force_https, enable_hsts, hsts_max_age, custom_headers,
                    rate_limit, is_active, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                input.hostname,
                input.backend_id,
                input.certificate_id,
                input.access,
                allowlist_json,
                input.ssl_enabled,
                input.force_https,
                input.enable_hsts,
                input.hsts_max_age,
                headers_json,
                input.rate_limit,
                input.is_active,
                created_by
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        self.get_rule(id)?.context("Rule vanished after insert")
    }

    /// Get a rule by id
    pub fn get_rule(&self, id: i64) -> Result<Option<RuleRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1", RULE_SELECT),
            params![id],
            row_to_rule,
        )
        .optional()
        .context("Failed to get rule")
    }

    /// List rules ordered by id
    pub fn list_rules(&self, active_only: bool) -> Result<Vec<RuleRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = if active_only {
            format!("{} WHERE is_active = 1 ORDER BY id", RULE_SELECT)
        } else {
            format!("{} ORDER BY id", RULE_SELECT)
        };
        let mut stmt = conn.prepare(&sql)?;
        let rules = stmt
            .query_map([], row_to_rule)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Update a rule. Returns the updated record, or None if not found.
    pub fn update_rule(&self, id: i64, input: &RuleInput) -> Result<Option<RuleRecord>> {
        let allowlist_json = encode_allowlist(&input.ip_allowlist)?;
        let headers_json = encode_headers(&input.custom_headers)?;

        let conn = self.conn.lock().unwrap();

        let backend_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM backends WHERE id = ?1)",
            params![input.backend_id],
            |row| row.get(0),
        )?;
        if !backend_exists {
            anyhow::bail!(ConflictError(format!(
                "Backend {} does not exist",
                input.backend_id
            )));
        }

        if input.is_active {
            let hostname_taken: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM rules WHERE hostname = ?1 AND is_active = 1 AND id != ?2)",
                params![input.hostname, id],
                |row| row.get(0),
            )?;
            if hostname_taken {
                anyhow::bail!(ConflictError(format!(
                    "An active rule for '{}' already exists",
                    input.hostname
                )));
            }
        }

        let rows = conn.execute(
            "UPDATE rules SET hostname = ?1, backend_id = ?2, certificate_id = ?3, access = ?4,
                    ip_allowlist = ?5, ssl_enabled = ?6, force_https = ?7, enable_hsts = ?8,
                    hsts_max_age = ?9, custom_headers = ?10, rate_limit = ?11, is_active = ?12,
                    updated_at = datetime('now')
             WHERE id = ?13",
            params![
                input.hostname,
                input.backend_id,
                input.certificate_id,
                input.access,
                allowlist_json,
                input.ssl_enabled,
                input.force_https,
                input.enable_hsts,
                input.hsts_max_age,
                headers_json,
                input.rate_limit,
                input.is_active,
                id
            ],
        )?;
        drop(conn);

        if rows == 0 {
            return Ok(None);
        }
        self.get_rule(id)
    }

    /// Delete a rule
    pub fn delete_rule(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM rules WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ==================== Certificate Operations ====================

    /// Insert a certificate record. When `is_default` is set, the flag is
    /// cleared on every other certificate in the same transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_certificate(
        &self,
        name: &str,
        domain: &str,
        cert_path: &str,
        key_path: &str,
        is_default: bool,
        cert_type: &str,
        expires_at: Option<&str>,
        created_by: Option<&str>,
    ) -> Result<CertificateRecord> {
        let mut conn = self.conn.lock().unwrap();

        let name_taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM certificates WHERE name = ?1)",
            params![name],
            |row| row.get(0),
        )?;
        if name_taken {
            anyhow::bail!(ConflictError(format!(
                "Certificate name '{}' already in use",
                name
            )));
        }

        let tx = conn.transaction()?;
        if is_default {
            tx.execute("UPDATE certificates SET is_default = 0 WHERE is_default = 1", [])?;
        }
        tx.execute(
            "INSERT INTO certificates (name, domain, cert_path, key_path, is_default, cert_type,
                    expires_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                name, domain, cert_path, key_path, is_default, cert_type, expires_at, created_by
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        drop(conn);

        self.get_certificate(id)?
            .context("Certificate vanished after insert")
    }

    /// Get a certificate by id
    pub fn get_certificate(&self, id: i64) -> Result<Option<CertificateRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1", CERT_SELECT),
            params![id],
            row_to_certificate,
        )
        .optional()
        .context("Failed to get certificate")
    }

    /// Get a certificate by its unique name
    pub fn get_certificate_by_name(&self, name: &str) -> Result<Option<CertificateRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE name = ?1", CERT_SELECT),
            params![name],
            row_to_certificate,
        )
        .optional()
        .context("Failed to get certificate by name")
    }

    /// Get a certificate by exact domain field
    pub fn get_certificate_by_domain(&self, domain: &str) -> Result<Option<CertificateRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE domain = ?1 ORDER BY id LIMIT 1", CERT_SELECT),
            params![domain],
            row_to_certificate,
        )
        .optional()
        .context("Failed to get certificate by domain")
    }

    /// Get the certificate currently flagged as default
    pub fn get_default_certificate(&self) -> Result<Option<CertificateRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE is_default = 1 LIMIT 1", CERT_SELECT),
            [],
            row_to_certificate,
        )
        .optional()
        .context("Failed to get default certificate")
    }

    /// List all certificates ordered by id
    pub fn list_certificates(&self) -> Result<Vec<CertificateRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{} ORDER BY id", CERT_SELECT))?;
        let certs = stmt
            .query_map([], row_to_certificate)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(certs)
    }

    /// Make one certificate the default, clearing the flag everywhere else.
    /// Returns the updated record, or None if not found.
    pub fn set_default_certificate(&self, id: i64) -> Result<Option<CertificateRecord>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("UPDATE certificates SET is_default = 0 WHERE is_default = 1", [])?;
        let rows = tx.execute(
            "UPDATE certificates SET is_default = 1, updated_at = datetime('now') WHERE id = ?1",
            params![id],
        )?;
        tx.commit()?;
        drop(conn);

        if rows == 0 {
            return Ok(None);
        }
        self.get_certificate(id)
    }

    /// Delete a certificate row, returning it so the caller can remove files
    pub fn delete_certificate(&self, id: i64) -> Result<Option<CertificateRecord>> {
        let record = self.get_certificate(id)?;
        if record.is_some() {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM certificates WHERE id = ?1", params![id])?;
        }
        Ok(record)
    }

    /// Certificates whose parsed expiry falls within the next `days` days
    pub fn expiring_certificates(&self, days: i64) -> Result<Vec<CertificateRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE expires_at IS NOT NULL
                AND expires_at <= datetime('now', '+' || ?1 || ' days')
              ORDER BY expires_at",
            CERT_SELECT
        ))?;
        let certs = stmt
            .query_map(params![days], row_to_certificate)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(certs)
    }

    // ==================== Settings Operations ====================

    /// Set a global setting value
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    /// Get a global setting value
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get setting")
    }

    /// Fetch all settings as key/value pairs
    pub fn all_settings(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value FROM settings WHERE value IS NOT NULL")?;

        let mut settings = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (key, value) = row?;
            settings.insert(key, value);
        }

        Ok(settings)
    }

    // ==================== User Operations ====================

    /// Create a user
    pub fn create_user(&self, username: &str, password_hash: &str, role: &str) -> Result<UserRecord> {
        let conn = self.conn.lock().unwrap();

        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
            params![username],
            |row| row.get(0),
        )?;
        if taken {
            anyhow::bail!(ConflictError(format!(
                "Username '{}' already in use",
                username
            )));
        }

        conn.execute(
            "INSERT INTO users (username, password_hash, role) VALUES (?1, ?2, ?3)",
            params![username, password_hash, role],
        )?;
        let id = conn.last_insert_rowid();

        conn.query_row(
            "SELECT id, username, password_hash, role, is_active, created_at
             FROM users WHERE id = ?1",
            params![id],
            row_to_user,
        )
        .context("User vanished after insert")
    }

    /// Look up an active user by username
    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, password_hash, role, is_active, created_at
             FROM users WHERE username = ?1 AND is_active = 1",
            params![username],
            row_to_user,
        )
        .optional()
        .context("Failed to get user")
    }

    /// Get a user by id, active or not
    pub fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, password_hash, role, is_active, created_at
             FROM users WHERE id = ?1",
            params![id],
            row_to_user,
        )
        .optional()
        .context("Failed to get user")
    }

    /// List all users ordered by id
    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, username, password_hash, role, is_active, created_at
             FROM users ORDER BY id",
        )?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Update a user's role and/or active flag. Absent fields are left as-is.
    /// Returns the updated record, or None if not found.
    pub fn update_user(
        &self,
        id: i64,
        role: Option<&str>,
        is_active: Option<bool>,
    ) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE users SET role = COALESCE(?1, role),
                    is_active = COALESCE(?2, is_active)
             WHERE id = ?3",
            params![role, is_active, id],
        )?;
        drop(conn);

        if rows == 0 {
            return Ok(None);
        }
        self.get_user(id)
    }

    /// Soft-delete a user by deactivating it. The row stays for the audit
    /// trail; a deactivated user can no longer log in.
    pub fn deactivate_user(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE users SET is_active = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(rows > 0)
    }

    /// Replace a user's password hash
    pub fn set_user_password(&self, id: i64, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE users SET password_hash = ?1 WHERE id = ?2",
            params![password_hash, id],
        )?;
        Ok(rows > 0)
    }

    /// Number of user rows
    pub fn count_users(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count)
    }

    // ==================== Audit Operations ====================

    /// Append an audit entry
    pub fn append_audit(
        &self,
        username: Option<&str>,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        changes: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_log (username, action, resource_type, resource_id, changes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![username, action, resource_type, resource_id, changes],
        )?;
        Ok(())
    }

    /// Most recent audit entries
    pub fn list_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, username, action, resource_type, resource_id, changes, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], |row| {
                Ok(AuditRecord {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    action: row.get(2)?,
                    resource_type: row.get(3)?,
                    resource_id: row.get(4)?,
                    changes: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Delete audit entries older than the retention window. Returns the
    /// number of rows removed.
    pub fn cleanup_audit(&self, retention_days: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "DELETE FROM audit_log
             WHERE created_at < datetime('now', '-' || ?1 || ' days')",
            params![retention_days],
        )?;
        Ok(rows)
    }
}

const RULE_SELECT: &str = "SELECT id, hostname, backend_id, certificate_id, access, ip_allowlist,
        ssl_enabled, force_https, enable_hsts, hsts_max_age, custom_headers, rate_limit,
        is_active, created_by, created_at, updated_at
 FROM rules";

const CERT_SELECT: &str = "SELECT id, name, domain, cert_path, key_path, is_default, cert_type,
        expires_at, created_by, created_at, updated_at
 FROM certificates";

fn row_to_backend(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackendRecord> {
    Ok(BackendRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        scheme: row.get(4)?,
        is_active: row.get(5)?,
        created_by: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<RuleRecord> {
    Ok(RuleRecord {
        id: row.get(0)?,
        hostname: row.get(1)?,
        backend_id: row.get(2)?,
        certificate_id: row.get(3)?,
        access: row.get(4)?,
        ip_allowlist: row.get(5)?,
        ssl_enabled: row.get(6)?,
        force_https: row.get(7)?,
        enable_hsts: row.get(8)?,
        hsts_max_age: row.get(9)?,
        custom_headers: row.get(10)?,
        rate_limit: row.get(11)?,
        is_active: row.get(12)?,
        created_by: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn row_to_certificate(row: &rusqlite::Row<'_>) -> rusqlite::Result<CertificateRecord> {
    Ok(CertificateRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        domain: row.get(2)?,
        cert_path: row.get(3)?,
        key_path: row.get(4)?,
        is_default: row.get(5)?,
        cert_type: row.get(6)?,
        expires_at: row.get(7)?,
        created_by: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        role: row.get(3)?,
        is_active: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn encode_allowlist(list: &Option<Vec<String>>) -> Result<Option<String>> {
    match list {
        Some(entries) if !entries.is_empty() => Ok(Some(serde_json::to_string(entries)?)),
        _ => Ok(None),
    }
}

fn encode_headers(headers: &Option<HashMap<String, String>>) -> Result<Option<String>> {
    match headers {
        Some(map) if !map.is_empty() => Ok(Some(serde_json::to_string(map)?)),
        _ => Ok(None),
    }
}

impl RuleRecord {
    /// Decode the stored allow-list, tolerating malformed JSON as empty
    pub fn allowlist(&self) -> Vec<String> {
        self.ip_allowlist
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    /// Decode the stored custom headers, sorted by name for determinism
    pub fn headers(&self) -> Vec<(String, String)> {
        let map: std::collections::BTreeMap<String, String> = self
            .custom_headers
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        map.into_iter().collect()
    }
}
