//! Certificate storage and resolution
//!
//! Uploaded PEM material is validated (the private key must match the
//! certificate's public key), written to disk with restrictive permissions on
//! the key, and recorded in the database. Resolution picks the certificate
//! securing a routing rule via a priority chain: explicit reference, exact
//! domain match, one-level wildcard match, then the default certificate.

use crate::db::{CertificateRecord, ConflictError, Database, RuleRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rustls::pki_types::CertificateDer;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Manages certificate files under a storage directory
#[derive(Debug, Clone)]
pub struct CertificateStore {
    certs_dir: PathBuf,
}

impl CertificateStore {
    pub fn new(certs_dir: impl Into<PathBuf>) -> Self {
        Self {
            certs_dir: certs_dir.into(),
        }
    }

    /// Validate a PEM pair, persist it, and record it. The default flag is
    /// applied transactionally by the store.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        db: &Database,
        name: &str,
        domain: &str,
        cert_pem: &str,
        key_pem: &str,
        is_default: bool,
        created_by: Option<&str>,
    ) -> Result<CertificateRecord> {
        validate_certificate_pair(cert_pem, key_pem)?;

        // Name conflicts are checked before any file is written, so a
        // duplicate upload cannot clobber or orphan the existing pair
        if db.get_certificate_by_name(name)?.is_some() {
            anyhow::bail!(ConflictError(format!(
                "Certificate name '{}' already in use",
                name
            )));
        }

        let expires_at = parse_certificate_expiry(cert_pem).map(|dt| format_expiry(&dt));
        let cert_type = if domain.starts_with('*') {
            "wildcard"
        } else {
            "domain-specific"
        };

        let (cert_path, key_path) = self.save_files(name, cert_pem, key_pem)?;

        let record = db.insert_certificate(
            name,
            domain,
            &cert_path.to_string_lossy(),
            &key_path.to_string_lossy(),
            is_default,
            cert_type,
            expires_at.as_deref(),
            created_by,
        )?;

        info!(
            name = %record.name,
            domain = %record.domain,
            cert_type = %record.cert_type,
            "Certificate stored"
        );
        Ok(record)
    }

    /// Remove a certificate's row and its files. File removal failures are
    /// logged, not fatal: the row is gone either way and the leftover files
    /// are detectable on disk.
    pub fn delete(&self, db: &Database, id: i64) -> Result<Option<CertificateRecord>> {
        let record = match db.delete_certificate(id)? {
            Some(record) => record,
            None => return Ok(None),
        };

        for path in [&record.cert_path, &record.key_path] {
            let path = Path::new(path);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove certificate file");
                }
            }
        }

        info!(name = %record.name, "Certificate deleted");
        Ok(Some(record))
    }

    /// Write the PEM pair under the storage directory. The certificate is
    /// world-readable, the key owner-only.
    pub fn save_files(&self, name: &str, cert_pem: &str, key_pem: &str) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(&self.certs_dir)
            .with_context(|| format!("Failed to create {}", self.certs_dir.display()))?;

        let safe_name: String = name
            .chars()
            .map(|c| if c == ' ' || c == '/' { '_' } else { c })
            .collect();
        let cert_path = self.certs_dir.join(format!("{}.crt", safe_name));
        let key_path = self.certs_dir.join(format!("{}.key", safe_name));

        std::fs::write(&cert_path, cert_pem)
            .with_context(|| format!("Failed to write {}", cert_path.display()))?;
        std::fs::write(&key_path, key_pem)
            .with_context(|| format!("Failed to write {}", key_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&cert_path, std::fs::Permissions::from_mode(0o644))?;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok((cert_path, key_path))
    }
}

/// Pick the certificate that should secure a rule, or None.
///
/// Resolution order, first match wins:
/// 1. The rule's explicit certificate reference, when it still resolves.
/// 2. A certificate whose domain exactly equals the rule's hostname.
/// 3. A certificate for `*.<parent>`, one wildcard level only
///    (`app.v2.example.com` tries `*.v2.example.com`, never `*.example.com`).
/// 4. The default certificate.
pub fn resolve_for_rule(db: &Database, rule: &RuleRecord) -> Result<Option<CertificateRecord>> {
    if let Some(cert_id) = rule.certificate_id {
        if let Some(cert) = db.get_certificate(cert_id)? {
            return Ok(Some(cert));
        }
        // Dangling reference: treated as unset, fall through the chain
    }

    if let Some(cert) = db.get_certificate_by_domain(&rule.hostname)? {
        return Ok(Some(cert));
    }

    if let Some((_, parent)) = rule.hostname.split_once('.') {
        if !parent.is_empty() {
            let wildcard = format!("*.{}", parent);
            if let Some(cert) = db.get_certificate_by_domain(&wildcard)? {
                return Ok(Some(cert));
            }
        }
    }

    db.get_default_certificate()
}

/// Check that the private key matches the certificate's public key.
///
/// The leaf certificate is the first PEM block; chains are accepted and the
/// intermediates ignored for the comparison.
pub fn validate_certificate_pair(cert_pem: &str, key_pem: &str) -> Result<()> {
    let leaf = first_certificate(cert_pem)?;

    let key_der = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
        .context("Failed to parse private key PEM")?
        .context("No private key found in PEM content")?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("Unsupported private key: {}", e))?;
    let key_spki = signing_key
        .public_key()
        .context("Private key does not expose a public key")?;

    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate: {}", e))?;
    let cert_spki = parsed.public_key().raw;

    if cert_spki != key_spki.as_ref() {
        anyhow::bail!("Certificate and private key do not match");
    }

    Ok(())
}

/// Extract the expiry timestamp from the leaf certificate, if parseable
pub fn parse_certificate_expiry(cert_pem: &str) -> Option<DateTime<Utc>> {
    let leaf = first_certificate(cert_pem).ok()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    let not_after = parsed.validity().not_after.timestamp();
    Utc.timestamp_opt(not_after, 0).single()
}

/// Expiry format stored in the database, comparable by SQLite datetime()
fn format_expiry(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn first_certificate(cert_pem: &str) -> Result<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
        .next()
        .context("No certificate found in PEM content")?
        .context("Failed to parse certificate PEM")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RuleInput;

    fn self_signed(domain: &str) -> (String, String) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    fn insert_cert(db: &Database, name: &str, domain: &str, is_default: bool) -> CertificateRecord {
        db.insert_certificate(
            name,
            domain,
            &format!("/certs/{}.crt", name),
            &format!("/certs/{}.key", name),
            is_default,
            if domain.starts_with('*') { "wildcard" } else { "domain-specific" },
            None,
            None,
        )
        .unwrap()
    }

    fn rule_for(db: &Database, hostname: &str, certificate_id: Option<i64>) -> RuleRecord {
        let backend = db
            .create_backend(
                &crate::db::BackendInput {
                    name: format!("b-{}", hostname),
                    host: "127.0.0.1".to_string(),
                    port: 3000 + db.list_backends(false).unwrap().len() as u16,
                    scheme: "http".to_string(),
                    is_active: true,
                },
                None,
            )
            .unwrap();
        db.create_rule(
            &RuleInput {
                hostname: hostname.to_string(),
                backend_id: backend.id,
                certificate_id,
                access: "public".to_string(),
                ip_allowlist: None,
                ssl_enabled: true,
                force_https: true,
                enable_hsts: false,
                hsts_max_age: 31536000,
                custom_headers: None,
                rate_limit: None,
                is_active: true,
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_pair_validation_accepts_matching_pair() {
        let (cert, key) = self_signed("example.com");
        validate_certificate_pair(&cert, &key).unwrap();
    }

    #[test]
    fn test_pair_validation_rejects_mismatched_key() {
        let (cert, _) = self_signed("example.com");
        let (_, other_key) = self_signed("other.com");
        assert!(validate_certificate_pair(&cert, &other_key).is_err());
    }

    #[test]
    fn test_pair_validation_rejects_garbage() {
        assert!(validate_certificate_pair("not a cert", "not a key").is_err());
    }

    #[test]
    fn test_expiry_parsing() {
        let (cert, _) = self_signed("example.com");
        let expiry = parse_certificate_expiry(&cert).unwrap();
        assert!(expiry > Utc::now());
        assert!(parse_certificate_expiry("garbage").is_none());
    }

    #[test]
    fn test_store_create_and_delete_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let db = Database::open_in_memory().unwrap();

        let (cert_pem, key_pem) = self_signed("app.example.com");
        let record = store
            .create(&db, "app cert", "app.example.com", &cert_pem, &key_pem, false, Some("admin"))
            .unwrap();

        // Spaces are sanitized out of filenames
        assert!(record.cert_path.ends_with("app_cert.crt"));
        assert!(Path::new(&record.cert_path).exists());
        assert!(Path::new(&record.key_path).exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let key_mode = std::fs::metadata(&record.key_path).unwrap().permissions().mode();
            assert_eq!(key_mode & 0o777, 0o600);
            let cert_mode = std::fs::metadata(&record.cert_path).unwrap().permissions().mode();
            assert_eq!(cert_mode & 0o777, 0o644);
        }

        let deleted = store.delete(&db, record.id).unwrap().unwrap();
        assert!(!Path::new(&deleted.cert_path).exists());
        assert!(!Path::new(&deleted.key_path).exists());
        assert!(db.get_certificate(record.id).unwrap().is_none());
    }

    #[test]
    fn test_create_rejects_bad_pair_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let db = Database::open_in_memory().unwrap();

        let (cert_pem, _) = self_signed("app.example.com");
        let (_, wrong_key) = self_signed("other.example.com");
        assert!(store
            .create(&db, "bad", "app.example.com", &cert_pem, &wrong_key, false, None)
            .is_err());
        assert!(db.list_certificates().unwrap().is_empty());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_duplicate_name_leaves_existing_files_intact() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let db = Database::open_in_memory().unwrap();

        let (first_cert, first_key) = self_signed("app.example.com");
        let record = store
            .create(&db, "app", "app.example.com", &first_cert, &first_key, false, None)
            .unwrap();

        let (second_cert, second_key) = self_signed("app.example.com");
        let err = store
            .create(&db, "app", "app.example.com", &second_cert, &second_key, false, None)
            .unwrap_err();
        assert!(err.downcast_ref::<ConflictError>().is_some());

        // The original files are untouched and no extras were written
        assert_eq!(std::fs::read_to_string(&record.cert_path).unwrap(), first_cert);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
        assert_eq!(db.list_certificates().unwrap().len(), 1);
    }

    #[test]
    fn test_resolution_explicit_id_wins_over_exact_match() {
        let db = Database::open_in_memory().unwrap();
        let exact = insert_cert(&db, "exact", "api.example.com", false);
        let pinned = insert_cert(&db, "pinned", "unrelated.example.net", false);

        let rule = rule_for(&db, "api.example.com", Some(pinned.id));
        let resolved = resolve_for_rule(&db, &rule).unwrap().unwrap();
        assert_eq!(resolved.id, pinned.id);
        assert_ne!(resolved.id, exact.id);
    }

    #[test]
    fn test_resolution_exact_match_wins_over_wildcard() {
        let db = Database::open_in_memory().unwrap();
        insert_cert(&db, "wild", "*.example.com", false);
        let exact = insert_cert(&db, "exact", "api.example.com", false);

        let rule = rule_for(&db, "api.example.com", None);
        assert_eq!(resolve_for_rule(&db, &rule).unwrap().unwrap().id, exact.id);
    }

    #[test]
    fn test_resolution_wildcard_is_single_level() {
        let db = Database::open_in_memory().unwrap();
        insert_cert(&db, "wild", "*.example.com", false);

        // app.v2.example.com tries *.v2.example.com only
        let rule = rule_for(&db, "app.v2.example.com", None);
        assert!(resolve_for_rule(&db, &rule).unwrap().is_none());

        insert_cert(&db, "wild-v2", "*.v2.example.com", false);
        let resolved = resolve_for_rule(&db, &rule).unwrap().unwrap();
        assert_eq!(resolved.name, "wild-v2");
    }

    #[test]
    fn test_resolution_falls_back_to_default_then_none() {
        let db = Database::open_in_memory().unwrap();
        let rule = rule_for(&db, "api.example.com", None);
        assert!(resolve_for_rule(&db, &rule).unwrap().is_none());

        let default = insert_cert(&db, "fallback", "whatever.example.org", true);
        assert_eq!(resolve_for_rule(&db, &rule).unwrap().unwrap().id, default.id);
    }

    #[test]
    fn test_resolution_dangling_explicit_id_falls_through() {
        let db = Database::open_in_memory().unwrap();
        let exact = insert_cert(&db, "exact", "api.example.com", false);

        let rule = rule_for(&db, "api.example.com", Some(9999));
        assert_eq!(resolve_for_rule(&db, &rule).unwrap().unwrap().id, exact.id);
    }
}
