//! Nginx configuration rendering
//!
//! Projects the desired-state snapshot (active backends, active rules with
//! their resolved certificates, global settings) into a complete nginx
//! configuration document. Pure over its inputs: the caller supplies the
//! generation timestamp, so identical snapshots render byte-identically.

use crate::certs;
use crate::db::{BackendRecord, CertificateRecord, Database, RuleRecord};
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::fmt::Write;
use tracing::warn;

/// Setting key: emit the catch-all TLS server block ("true"/"false")
pub const SETTING_DEFAULT_SSL_SERVER: &str = "enable_default_ssl_server";
/// Setting key: certificate path used when no certificate resolves
pub const SETTING_DEFAULT_CERT_PATH: &str = "default_cert_path";
/// Setting key: key path used when no certificate resolves
pub const SETTING_DEFAULT_KEY_PATH: &str = "default_key_path";

const FALLBACK_CERT_PATH: &str = "/etc/nginx/certs/default.crt";
const FALLBACK_KEY_PATH: &str = "/etc/nginx/certs/default.key";

const HTTP_PREAMBLE: &str = r#"user nginx;
worker_processes auto;
pid /var/run/nginx.pid;

events {
    worker_connections 768;
}

http {
    include /etc/nginx/mime.types;
    default_type application/octet-stream;

    log_format main '$remote_addr - $remote_user [$time_local] "$request" '
                    '$status $body_bytes_sent "$http_referer" '
                    '"$http_user_agent" "$http_x_forwarded_for"';

    access_log /var/log/nginx/access.log main;
    error_log /var/log/nginx/error.log warn;

    sendfile on;
    tcp_nopush on;
    tcp_nodelay on;
    keepalive_timeout 65;
    types_hash_max_size 2048;
    server_tokens off;
"#;

/// One rule together with the certificate resolution outcome and the
/// transport scheme of its backend target
#[derive(Debug, Clone)]
pub struct RuleSite {
    pub rule: RuleRecord,
    pub certificate: Option<CertificateRecord>,
    pub backend_scheme: String,
}

/// Everything the renderer reads, captured at one point in time
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub backends: Vec<BackendRecord>,
    pub sites: Vec<RuleSite>,
    pub settings: HashMap<String, String>,
}

/// Read the active desired state and resolve a certificate per rule
pub fn build_snapshot(db: &Database) -> Result<Snapshot> {
    let backends = db.list_backends(true)?;
    let rules = db.list_rules(true)?;
    let settings = db.all_settings()?;

    let mut sites = Vec::with_capacity(rules.len());
    for rule in rules {
        let certificate = certs::resolve_for_rule(db, &rule)?;
        let backend_scheme = db
            .get_backend(rule.backend_id)?
            .map(|b| b.scheme)
            .unwrap_or_else(|| "http".to_string());
        sites.push(RuleSite {
            rule,
            certificate,
            backend_scheme,
        });
    }

    Ok(Snapshot {
        backends,
        sites,
        settings,
    })
}

/// Render the snapshot into nginx configuration text
pub fn render_config(snapshot: &Snapshot, generated_at: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(4096);

    let default_cert = snapshot
        .settings
        .get(SETTING_DEFAULT_CERT_PATH)
        .map(String::as_str)
        .unwrap_or(FALLBACK_CERT_PATH);
    let default_key = snapshot
        .settings
        .get(SETTING_DEFAULT_KEY_PATH)
        .map(String::as_str)
        .unwrap_or(FALLBACK_KEY_PATH);

    let _ = writeln!(out, "# Auto-generated nginx configuration");
    let _ = writeln!(
        out,
        "# Generated at {}",
        generated_at.to_rfc3339_opts(SecondsFormat::Secs, false)
    );
    let _ = writeln!(out, "# DO NOT EDIT MANUALLY");
    out.push('\n');

    out.push_str(HTTP_PREAMBLE);

    // Upstream per active backend, named by primary key
    if !snapshot.backends.is_empty() {
        out.push('\n');
        let _ = writeln!(out, "    # Backend upstream definitions");
        for backend in &snapshot.backends {
            let _ = writeln!(out, "    upstream backend_{} {{", backend.id);
            let _ = writeln!(out, "        server {}:{};", backend.host, backend.port);
            let _ = writeln!(out, "    }}");
        }
    }

    // Shared rate-limit zones, one per rule that requests limiting
    let limited: Vec<&RuleSite> = snapshot
        .sites
        .iter()
        .filter(|s| s.rule.rate_limit.is_some())
        .collect();
    if !limited.is_empty() {
        out.push('\n');
        let _ = writeln!(out, "    # Rate limit zones");
        for site in &limited {
            let rate = site.rule.rate_limit.as_deref().unwrap_or("");
            let _ = writeln!(
                out,
                "    limit_req_zone $binary_remote_addr zone=rule_{}:10m rate={};",
                site.rule.id, rate
            );
        }
    }

    // Catch-all TLS server: terminates unknown SNI with the default
    // certificate and refuses the connection
    if snapshot
        .settings
        .get(SETTING_DEFAULT_SSL_SERVER)
        .map(String::as_str)
        == Some("true")
    {
        out.push('\n');
        let _ = writeln!(out, "    # Default catch-all TLS server");
        let _ = writeln!(out, "    server {{");
        let _ = writeln!(out, "        listen 443 ssl default_server;");
        let _ = writeln!(out, "        server_name _;");
        let _ = writeln!(out, "        ssl_certificate {};", default_cert);
        let _ = writeln!(out, "        ssl_certificate_key {};", default_key);
        let _ = writeln!(out, "        return 444;");
        let _ = writeln!(out, "    }}");
    }

    for site in &snapshot.sites {
        render_site(&mut out, site, default_cert, default_key);
    }

    out.push_str("}\n");
    out
}

fn render_site(out: &mut String, site: &RuleSite, default_cert: &str, default_key: &str) {
    let rule = &site.rule;

    out.push('\n');
    let _ = writeln!(out, "    # rule {} -> backend_{}", rule.hostname, rule.backend_id);

    // Plaintext listener redirecting to the secure equivalent
    if rule.ssl_enabled && rule.force_https {
        let _ = writeln!(out, "    server {{");
        let _ = writeln!(out, "        listen 80;");
        let _ = writeln!(out, "        server_name {};", rule.hostname);
        let _ = writeln!(out, "        return 301 https://$host$request_uri;");
        let _ = writeln!(out, "    }}");
    }

    let _ = writeln!(out, "    server {{");
    if rule.ssl_enabled {
        let _ = writeln!(out, "        listen 443 ssl;");
    } else {
        let _ = writeln!(out, "        listen 80;");
    }
    let _ = writeln!(out, "        server_name {};", rule.hostname);

    if rule.ssl_enabled {
        match &site.certificate {
            Some(cert) => {
                let _ = writeln!(out, "        ssl_certificate {};", cert.cert_path);
                let _ = writeln!(out, "        ssl_certificate_key {};", cert.key_path);
            }
            None => {
                warn!(
                    hostname = %rule.hostname,
                    "No certificate resolved for SSL-enabled rule; using default paths"
                );
                let _ = writeln!(
                    out,
                    "        # warning: no certificate resolved for {}; using default paths",
                    rule.hostname
                );
                let _ = writeln!(out, "        ssl_certificate {};", default_cert);
                let _ = writeln!(out, "        ssl_certificate_key {};", default_key);
            }
        }
        let _ = writeln!(out, "        ssl_protocols TLSv1.2 TLSv1.3;");
    }

    // Non-empty allow-list means "allow only these"; absent means allow all
    let allowlist = rule.allowlist();
    if !allowlist.is_empty() {
        for entry in &allowlist {
            let _ = writeln!(out, "        allow {};", entry);
        }
        let _ = writeln!(out, "        deny all;");
    }

    // HSTS only makes sense on a TLS listener
    if rule.enable_hsts && rule.ssl_enabled {
        let _ = writeln!(
            out,
            "        add_header Strict-Transport-Security \"max-age={}; includeSubDomains\" always;",
            rule.hsts_max_age
        );
    }

    for (name, value) in rule.headers() {
        let _ = writeln!(out, "        add_header {} \"{}\" always;", name, value);
    }

    if rule.rate_limit.is_some() {
        let _ = writeln!(out, "        limit_req zone=rule_{} burst=20 nodelay;", rule.id);
    }

    let _ = writeln!(out, "        location / {{");
    let scheme = if site.backend_scheme == "https" {
        "https"
    } else {
        "http"
    };
    let _ = writeln!(out, "            proxy_pass {}://backend_{};", scheme, rule.backend_id);
    let _ = writeln!(out, "            proxy_http_version 1.1;");
    let _ = writeln!(out, "            proxy_set_header Host $host;");
    let _ = writeln!(out, "            proxy_set_header X-Real-IP $remote_addr;");
    let _ = writeln!(
        out,
        "            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
    );
    let _ = writeln!(out, "            proxy_set_header X-Forwarded-Proto $scheme;");
    let _ = writeln!(out, "        }}");
    let _ = writeln!(out, "    }}");
}
