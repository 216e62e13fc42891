//! Management API server
//!
//! RESTful endpoints for backends, routing rules, certificates, global
//! settings, the rendered configuration, and the audit log. Every mutation is
//! audit-logged and followed by a best-effort publish cycle; publish failures
//! are logged and reported, never rolled back.

use crate::auth::{AuthManager, Claims};
use crate::certs::CertificateStore;
use crate::db::{BackendInput, ConflictError, Database, RuleInput};
use crate::error::{json_error_response, ApiErrorCode};
use crate::nginx::NginxManager;
use crate::render;
use anyhow::Result;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Explicitly constructed state shared by all request handlers
pub struct ApiState {
    pub db: Arc<Database>,
    pub nginx: Arc<NginxManager>,
    pub certs: CertificateStore,
    pub auth: AuthManager,
}

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    role: String,
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    username: String,
    password: String,
    #[serde(default = "default_role")]
    role: String,
}

fn default_role() -> String {
    "user".to_string()
}

#[derive(Debug, Deserialize)]
struct UpdateUserRequest {
    role: Option<String>,
    is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChangePasswordRequest {
    old_password: String,
    new_password: String,
}

#[derive(Debug, Deserialize)]
struct CreateCertificateRequest {
    name: String,
    domain: String,
    cert_pem: String,
    key_pem: String,
    #[serde(default)]
    is_default: bool,
}

#[derive(Debug, Deserialize)]
struct SetSettingRequest {
    value: String,
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    #[serde(default = "default_retention_days")]
    retention_days: i64,
}

fn default_retention_days() -> i64 {
    90
}

/// Management API server
pub struct ApiServer {
    state: Arc<ApiState>,
    bind_addr: String,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(state: Arc<ApiState>, bind_addr: String, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            state,
            bind_addr,
            shutdown_rx,
        }
    }

    /// Run the API server until shutdown is signalled
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Management API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let server = Arc::clone(&server);
                                    async move { server.handle_request(req).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Management API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let query = req.uri().query().map(str::to_string);

        debug!(%method, %path, "API request");

        if path == "/health" && method == Method::GET {
            return Ok(self.health());
        }

        if path == "/auth/login" && method == Method::POST {
            return Ok(self.login(req).await);
        }

        // Everything else requires a valid token
        let claims = match self.authenticate(&req) {
            Some(claims) => claims,
            None => {
                warn!(%path, "Unauthorized API request");
                return Ok(json_error_response(
                    ApiErrorCode::Unauthorized,
                    "Missing or invalid bearer token",
                ));
            }
        };

        let segments: Vec<String> = path
            .trim_matches('/')
            .split('/')
            .map(str::to_string)
            .collect();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        let result = match (method, segments.as_slice()) {
            // Backends
            (Method::GET, ["backends"]) => self.list_backends(&query),
            (Method::POST, ["backends"]) => self.create_backend(req, &claims).await,
            (Method::GET, ["backends", id]) => self.get_backend(id),
            (Method::PUT, ["backends", id]) => self.update_backend(id, req, &claims).await,
            (Method::DELETE, ["backends", id]) => self.delete_backend(id, &claims).await,

            // Routing rules
            (Method::GET, ["rules"]) => self.list_rules(&query),
            (Method::POST, ["rules"]) => self.create_rule(req, &claims).await,
            (Method::GET, ["rules", id]) => self.get_rule(id),
            (Method::PUT, ["rules", id]) => self.update_rule(id, req, &claims).await,
            (Method::DELETE, ["rules", id]) => self.delete_rule(id, &claims).await,

            // Certificates
            (Method::GET, ["certificates"]) => self.list_certificates(),
            (Method::POST, ["certificates"]) => self.create_certificate(req, &claims).await,
            (Method::GET, ["certificates", "expiring"]) => self.expiring_certificates(&query),
            (Method::DELETE, ["certificates", id]) => self.delete_certificate(id, &claims).await,
            (Method::POST, ["certificates", id, "default"]) => {
                self.set_default_certificate(id, &claims).await
            }

            // Users
            (Method::GET, ["users"]) => self.list_users(&claims),
            (Method::POST, ["users"]) => self.create_user(req, &claims).await,
            (Method::GET, ["users", id]) => self.get_user(id, &claims),
            (Method::PUT, ["users", id]) => self.update_user(id, req, &claims).await,
            (Method::DELETE, ["users", id]) => self.delete_user(id, &claims).await,
            (Method::POST, ["users", id, "password"]) => {
                self.change_password(id, req, &claims).await
            }

            // Global settings
            (Method::GET, ["settings"]) => self.list_settings(),
            (Method::PUT, ["settings", key]) => self.set_setting(key, req, &claims).await,

            // Configuration pipeline
            (Method::GET, ["config", "preview"]) => self.preview_config(),
            (Method::POST, ["config", "apply"]) => self.apply_config(&claims).await,
            (Method::POST, ["config", "reload"]) => self.reload_nginx(&claims).await,

            // Audit log
            (Method::GET, ["audit"]) => self.list_audit(&query),
            (Method::POST, ["audit", "cleanup"]) => self.cleanup_audit(req, &claims).await,

            _ => Ok(json_error_response(ApiErrorCode::NotFound, "Unknown endpoint")),
        };

        Ok(result.unwrap_or_else(error_to_response))
    }

    fn authenticate(&self, req: &Request<Incoming>) -> Option<Claims> {
        let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
        let token = self.state.auth.extract_token_from_header(header)?;
        self.state
            .auth
            .verify_token(&token)
            .ok()
            .map(|data| data.claims)
    }

    // ==================== Health ====================

    /// Unauthenticated health summary: database reachability, whether the
    /// proxy binary resolves, and the active desired-state counts
    fn health(&self) -> Response<Full<Bytes>> {
        let (database, active_backends, active_rules) = match (
            self.state.db.list_backends(true),
            self.state.db.list_rules(true),
        ) {
            (Ok(backends), Ok(rules)) => ("connected", backends.len(), rules.len()),
            _ => ("disconnected", 0, 0),
        };
        let nginx_binary = if self.state.nginx.binary_available() {
            "present"
        } else {
            "missing"
        };
        let status = if database == "connected" {
            "healthy"
        } else {
            "unhealthy"
        };

        let body = serde_json::json!({
            "status": status,
            "version": VERSION,
            "database": database,
            "nginx_binary": nginx_binary,
            "active_backends": active_backends,
            "active_rules": active_rules,
        });
        json_response(StatusCode::OK, body.to_string())
    }

    // ==================== Auth ====================

    async fn login(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let input: LoginRequest = match read_json(req).await {
            Ok(input) => input,
            Err(response) => return response,
        };

        let user = match self.state.db.get_user_by_username(&input.username) {
            Ok(Some(user)) => user,
            Ok(None) => {
                return json_error_response(ApiErrorCode::Unauthorized, "Invalid credentials")
            }
            Err(e) => return error_to_response(e),
        };

        if !crate::auth::verify_password(&input.password, &user.password_hash) {
            warn!(username = %input.username, "Failed login attempt");
            return json_error_response(ApiErrorCode::Unauthorized, "Invalid credentials");
        }

        match self.state.auth.create_token(&user.username, &user.role) {
            Ok(token) => {
                info!(username = %user.username, "User logged in");
                ok_json(&ApiResponse::ok(LoginResponse {
                    token,
                    role: user.role,
                }))
            }
            Err(e) => error_to_response(e.into()),
        }
    }

    // ==================== Backends ====================

    fn list_backends(&self, query: &Option<String>) -> Result<Response<Full<Bytes>>> {
        let active_only = !query_flag(query, "all");
        let backends = self.state.db.list_backends(active_only)?;
        Ok(ok_json(&ApiResponse::ok(backends)))
    }

    fn get_backend(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        let Some(id) = parse_id(id) else {
            return Ok(json_error_response(ApiErrorCode::InvalidRequest, "Invalid id"));
        };
        match self.state.db.get_backend(id)? {
            Some(backend) => Ok(ok_json(&ApiResponse::ok(backend))),
            None => Ok(json_error_response(ApiErrorCode::NotFound, "Backend not found")),
        }
    }

    async fn create_backend(
        &self,
        req: Request<Incoming>,
        claims: &Claims,
    ) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let input: BackendInput = match read_json(req).await {
            Ok(input) => input,
            Err(response) => return Ok(response),
        };

        let backend = self.state.db.create_backend(&input, Some(&claims.sub))?;
        self.audit(claims, "created", "backend", &backend.id.to_string(), Some(&backend))?;
        self.apply_after_mutation().await;
        Ok(ok_json(&ApiResponse::ok(backend)))
    }

    async fn update_backend(
        &self,
        id: &str,
        req: Request<Incoming>,
        claims: &Claims,
    ) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let Some(id) = parse_id(id) else {
            return Ok(json_error_response(ApiErrorCode::InvalidRequest, "Invalid id"));
        };
        let input: BackendInput = match read_json(req).await {
            Ok(input) => input,
            Err(response) => return Ok(response),
        };

        let before = self.state.db.get_backend(id)?;
        match self.state.db.update_backend(id, &input)? {
            Some(backend) => {
                let changes = serde_json::json!({ "before": before, "after": backend });
                self.audit_raw(claims, "updated", "backend", &id.to_string(), Some(changes))?;
                self.apply_after_mutation().await;
                Ok(ok_json(&ApiResponse::ok(backend)))
            }
            None => Ok(json_error_response(ApiErrorCode::NotFound, "Backend not found")),
        }
    }

    async fn delete_backend(&self, id: &str, claims: &Claims) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let Some(id) = parse_id(id) else {
            return Ok(json_error_response(ApiErrorCode::InvalidRequest, "Invalid id"));
        };
        if !self.state.db.delete_backend(id)? {
            return Ok(json_error_response(ApiErrorCode::NotFound, "Backend not found"));
        }
        self.audit_raw(claims, "deleted", "backend", &id.to_string(), None)?;
        self.apply_after_mutation().await;
        Ok(ok_json(&ApiResponse::ok(serde_json::json!({ "deleted": id }))))
    }

    // ==================== Rules ====================

    fn list_rules(&self, query: &Option<String>) -> Result<Response<Full<Bytes>>> {
        let active_only = !query_flag(query, "all");
        let rules = self.state.db.list_rules(active_only)?;
        Ok(ok_json(&ApiResponse::ok(rules)))
    }

    fn get_rule(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        let Some(id) = parse_id(id) else {
            return Ok(json_error_response(ApiErrorCode::InvalidRequest, "Invalid id"));
        };
        match self.state.db.get_rule(id)? {
            Some(rule) => Ok(ok_json(&ApiResponse::ok(rule))),
            None => Ok(json_error_response(ApiErrorCode::NotFound, "Rule not found")),
        }
    }

    async fn create_rule(
        &self,
        req: Request<Incoming>,
        claims: &Claims,
    ) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let input: RuleInput = match read_json(req).await {
            Ok(input) => input,
            Err(response) => return Ok(response),
        };

        let rule = self.state.db.create_rule(&input, Some(&claims.sub))?;
        self.audit(claims, "created", "rule", &rule.id.to_string(), Some(&rule))?;
        self.apply_after_mutation().await;
        Ok(ok_json(&ApiResponse::ok(rule)))
    }

    async fn update_rule(
        &self,
        id: &str,
        req: Request<Incoming>,
        claims: &Claims,
    ) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let Some(id) = parse_id(id) else {
            return Ok(json_error_response(ApiErrorCode::InvalidRequest, "Invalid id"));
        };
        let input: RuleInput = match read_json(req).await {
            Ok(input) => input,
            Err(response) => return Ok(response),
        };

        let before = self.state.db.get_rule(id)?;
        match self.state.db.update_rule(id, &input)? {
            Some(rule) => {
                let changes = serde_json::json!({ "before": before, "after": rule });
                self.audit_raw(claims, "updated", "rule", &id.to_string(), Some(changes))?;
                self.apply_after_mutation().await;
                Ok(ok_json(&ApiResponse::ok(rule)))
            }
            None => Ok(json_error_response(ApiErrorCode::NotFound, "Rule not found")),
        }
    }

    async fn delete_rule(&self, id: &str, claims: &Claims) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let Some(id) = parse_id(id) else {
            return Ok(json_error_response(ApiErrorCode::InvalidRequest, "Invalid id"));
        };
        if !self.state.db.delete_rule(id)? {
            return Ok(json_error_response(ApiErrorCode::NotFound, "Rule not found"));
        }
        self.audit_raw(claims, "deleted", "rule", &id.to_string(), None)?;
        self.apply_after_mutation().await;
        Ok(ok_json(&ApiResponse::ok(serde_json::json!({ "deleted": id }))))
    }

    // ==================== Certificates ====================

    fn list_certificates(&self) -> Result<Response<Full<Bytes>>> {
        let certs = self.state.db.list_certificates()?;
        Ok(ok_json(&ApiResponse::ok(certs)))
    }

    fn expiring_certificates(&self, query: &Option<String>) -> Result<Response<Full<Bytes>>> {
        let days = query_value(query, "days")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let certs = self.state.db.expiring_certificates(days)?;
        Ok(ok_json(&ApiResponse::ok(certs)))
    }

    async fn create_certificate(
        &self,
        req: Request<Incoming>,
        claims: &Claims,
    ) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let input: CreateCertificateRequest = match read_json(req).await {
            Ok(input) => input,
            Err(response) => return Ok(response),
        };

        let record = match self.state.certs.create(
            &self.state.db,
            &input.name,
            &input.domain,
            &input.cert_pem,
            &input.key_pem,
            input.is_default,
            Some(&claims.sub),
        ) {
            Ok(record) => record,
            Err(e) if e.downcast_ref::<ConflictError>().is_some() => return Err(e),
            Err(e) => {
                // PEM problems are the caller's fault, not ours
                return Ok(json_error_response(ApiErrorCode::InvalidRequest, e.to_string()));
            }
        };

        self.audit(claims, "created", "certificate", &record.id.to_string(), Some(&record))?;
        self.apply_after_mutation().await;
        Ok(ok_json(&ApiResponse::ok(record)))
    }

    async fn delete_certificate(&self, id: &str, claims: &Claims) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let Some(id) = parse_id(id) else {
            return Ok(json_error_response(ApiErrorCode::InvalidRequest, "Invalid id"));
        };
        match self.state.certs.delete(&self.state.db, id)? {
            Some(record) => {
                self.audit(claims, "deleted", "certificate", &id.to_string(), Some(&record))?;
                self.apply_after_mutation().await;
                Ok(ok_json(&ApiResponse::ok(serde_json::json!({ "deleted": id }))))
            }
            None => Ok(json_error_response(ApiErrorCode::NotFound, "Certificate not found")),
        }
    }

    async fn set_default_certificate(
        &self,
        id: &str,
        claims: &Claims,
    ) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let Some(id) = parse_id(id) else {
            return Ok(json_error_response(ApiErrorCode::InvalidRequest, "Invalid id"));
        };
        match self.state.db.set_default_certificate(id)? {
            Some(record) => {
                self.audit(claims, "updated", "certificate", &id.to_string(), Some(&record))?;
                self.apply_after_mutation().await;
                Ok(ok_json(&ApiResponse::ok(record)))
            }
            None => Ok(json_error_response(ApiErrorCode::NotFound, "Certificate not found")),
        }
    }

    // ==================== Users ====================

    fn list_users(&self, claims: &Claims) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let users = self.state.db.list_users()?;
        Ok(ok_json(&ApiResponse::ok(users)))
    }

    /// Admins can view anyone; others only themselves
    fn get_user(&self, id: &str, claims: &Claims) -> Result<Response<Full<Bytes>>> {
        let Some(id) = parse_id(id) else {
            return Ok(json_error_response(ApiErrorCode::InvalidRequest, "Invalid id"));
        };
        match self.state.db.get_user(id)? {
            Some(user) => {
                if !claims.is_admin() && claims.sub != user.username {
                    return Ok(json_error_response(ApiErrorCode::Forbidden, "Access denied"));
                }
                Ok(ok_json(&ApiResponse::ok(user)))
            }
            None => Ok(json_error_response(ApiErrorCode::NotFound, "User not found")),
        }
    }

    async fn create_user(
        &self,
        req: Request<Incoming>,
        claims: &Claims,
    ) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let input: CreateUserRequest = match read_json(req).await {
            Ok(input) => input,
            Err(response) => return Ok(response),
        };

        let user = self.state.db.create_user(
            &input.username,
            &crate::auth::hash_password(&input.password),
            &input.role,
        )?;
        self.audit(claims, "created", "user", &user.id.to_string(), Some(&user))?;
        Ok(ok_json(&ApiResponse::ok(user)))
    }

    async fn update_user(
        &self,
        id: &str,
        req: Request<Incoming>,
        claims: &Claims,
    ) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let Some(id) = parse_id(id) else {
            return Ok(json_error_response(ApiErrorCode::InvalidRequest, "Invalid id"));
        };
        let input: UpdateUserRequest = match read_json(req).await {
            Ok(input) => input,
            Err(response) => return Ok(response),
        };

        match self
            .state
            .db
            .update_user(id, input.role.as_deref(), input.is_active)?
        {
            Some(user) => {
                let changes = serde_json::json!({ "role": input.role, "is_active": input.is_active });
                self.audit_raw(claims, "updated", "user", &id.to_string(), Some(changes))?;
                Ok(ok_json(&ApiResponse::ok(user)))
            }
            None => Ok(json_error_response(ApiErrorCode::NotFound, "User not found")),
        }
    }

    /// Soft delete: the account is deactivated, not removed
    async fn delete_user(&self, id: &str, claims: &Claims) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let Some(id) = parse_id(id) else {
            return Ok(json_error_response(ApiErrorCode::InvalidRequest, "Invalid id"));
        };
        if !self.state.db.deactivate_user(id)? {
            return Ok(json_error_response(ApiErrorCode::NotFound, "User not found"));
        }
        self.audit_raw(claims, "deleted", "user", &id.to_string(), None)?;
        Ok(ok_json(&ApiResponse::ok(serde_json::json!({ "deactivated": id }))))
    }

    /// Change a password. Admins can change anyone's, others their own; the
    /// current password is verified either way.
    async fn change_password(
        &self,
        id: &str,
        req: Request<Incoming>,
        claims: &Claims,
    ) -> Result<Response<Full<Bytes>>> {
        let Some(id) = parse_id(id) else {
            return Ok(json_error_response(ApiErrorCode::InvalidRequest, "Invalid id"));
        };
        let input: ChangePasswordRequest = match read_json(req).await {
            Ok(input) => input,
            Err(response) => return Ok(response),
        };

        let user = match self.state.db.get_user(id)? {
            Some(user) => user,
            None => return Ok(json_error_response(ApiErrorCode::NotFound, "User not found")),
        };
        if !claims.is_admin() && claims.sub != user.username {
            return Ok(json_error_response(ApiErrorCode::Forbidden, "Access denied"));
        }
        if !crate::auth::verify_password(&input.old_password, &user.password_hash) {
            warn!(username = %user.username, "Password change rejected: wrong current password");
            return Ok(json_error_response(ApiErrorCode::Unauthorized, "Invalid password"));
        }

        self.state
            .db
            .set_user_password(id, &crate::auth::hash_password(&input.new_password))?;
        let changes = serde_json::json!({ "changed": true });
        self.audit_raw(claims, "updated", "user_password", &id.to_string(), Some(changes))?;
        Ok(ok_json(&ApiResponse::ok(serde_json::json!({ "message": "Password changed" }))))
    }

    // ==================== Settings ====================

    fn list_settings(&self) -> Result<Response<Full<Bytes>>> {
        let settings = self.state.db.all_settings()?;
        Ok(ok_json(&ApiResponse::ok(settings)))
    }

    async fn set_setting(
        &self,
        key: &str,
        req: Request<Incoming>,
        claims: &Claims,
    ) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let input: SetSettingRequest = match read_json(req).await {
            Ok(input) => input,
            Err(response) => return Ok(response),
        };

        let old_value = self.state.db.get_setting(key)?;
        self.state.db.set_setting(key, &input.value)?;

        let changes = serde_json::json!({ "key": key, "old_value": old_value, "new_value": input.value });
        self.audit_raw(claims, "updated", "setting", key, Some(changes))?;
        self.apply_after_mutation().await;
        Ok(ok_json(&ApiResponse::ok(
            serde_json::json!({ "key": key, "value": input.value }),
        )))
    }

    // ==================== Configuration ====================

    fn preview_config(&self) -> Result<Response<Full<Bytes>>> {
        let snapshot = render::build_snapshot(&self.state.db)?;
        let config = render::render_config(&snapshot, Utc::now());
        Ok(ok_json(&ApiResponse::ok(serde_json::json!({
            "config": config,
            "path": self.state.nginx.config_path(),
        }))))
    }

    async fn apply_config(&self, claims: &Claims) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let outcome = self.state.nginx.apply(&self.state.db).await;
        let changes = serde_json::json!({ "action": "apply", "message": outcome.message });
        self.audit_raw(claims, "applied", "config", "nginx", Some(changes))?;

        if outcome.success {
            Ok(ok_json(&ApiResponse::ok(serde_json::json!({ "message": outcome.message }))))
        } else {
            Ok(json_error_response(ApiErrorCode::ApplyFailed, outcome.message))
        }
    }

    async fn reload_nginx(&self, claims: &Claims) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let outcome = self.state.nginx.reload().await;
        let changes = serde_json::json!({ "action": "reload", "message": outcome.message });
        self.audit_raw(claims, "reloaded", "config", "nginx", Some(changes))?;

        if outcome.success {
            Ok(ok_json(&ApiResponse::ok(serde_json::json!({ "message": outcome.message }))))
        } else {
            Ok(json_error_response(ApiErrorCode::ApplyFailed, outcome.message))
        }
    }

    // ==================== Audit ====================

    fn list_audit(&self, query: &Option<String>) -> Result<Response<Full<Bytes>>> {
        let limit = query_value(query, "limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);
        let entries = self.state.db.list_audit(limit)?;
        Ok(ok_json(&ApiResponse::ok(entries)))
    }

    async fn cleanup_audit(
        &self,
        req: Request<Incoming>,
        claims: &Claims,
    ) -> Result<Response<Full<Bytes>>> {
        if let Some(denied) = require_admin(claims) {
            return Ok(denied);
        }
        let input: CleanupRequest = match read_json(req).await {
            Ok(input) => input,
            Err(response) => return Ok(response),
        };
        let deleted = self.state.db.cleanup_audit(input.retention_days)?;
        Ok(ok_json(&ApiResponse::ok(serde_json::json!({
            "deleted": deleted,
            "retention_days": input.retention_days,
        }))))
    }

    // ==================== Helpers ====================

    fn audit<T: Serialize>(
        &self,
        claims: &Claims,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        payload: Option<&T>,
    ) -> Result<()> {
        let changes = payload.map(serde_json::to_value).transpose()?;
        self.audit_raw(claims, action, resource_type, resource_id, changes)
    }

    fn audit_raw(
        &self,
        claims: &Claims,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        changes: Option<serde_json::Value>,
    ) -> Result<()> {
        let encoded = changes.map(|v| v.to_string());
        self.state.db.append_audit(
            Some(&claims.sub),
            action,
            resource_type,
            resource_id,
            encoded.as_deref(),
        )
    }

    /// Re-render and reload after a mutation. Best-effort: the database
    /// change stands even when the publish cycle fails.
    async fn apply_after_mutation(&self) {
        let outcome = self.state.nginx.apply(&self.state.db).await;
        if !outcome.success {
            warn!(message = %outcome.message, "Publish cycle after mutation failed");
        }
    }
}

fn require_admin(claims: &Claims) -> Option<Response<Full<Bytes>>> {
    if claims.is_admin() {
        None
    } else {
        Some(json_error_response(ApiErrorCode::Forbidden, "Admin role required"))
    }
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, Response<Full<Bytes>>> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| json_error_response(ApiErrorCode::InvalidRequest, format!("Body read error: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| json_error_response(ApiErrorCode::InvalidRequest, format!("Invalid JSON: {}", e)))
}

fn ok_json<T: Serialize>(payload: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_string(payload).unwrap_or_else(|_| r#"{"success":true}"#.to_string());
    json_response(StatusCode::OK, body)
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with static headers")
}

fn error_to_response(err: anyhow::Error) -> Response<Full<Bytes>> {
    if let Some(conflict) = err.downcast_ref::<ConflictError>() {
        return json_error_response(ApiErrorCode::Conflict, conflict.to_string());
    }
    error!(error = %err, "Internal API error");
    json_error_response(ApiErrorCode::InternalError, "Internal error")
}

fn parse_id(raw: &str) -> Option<i64> {
    raw.parse().ok()
}

fn query_flag(query: &Option<String>, key: &str) -> bool {
    query_value(query, key).map(|v| v == "true" || v == "1").unwrap_or(false)
}

fn query_value(query: &Option<String>, key: &str) -> Option<String> {
    let query = query.as_deref()?;
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            return Some(v.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_parsing() {
        let query = Some("all=true&limit=50".to_string());
        assert!(query_flag(&query, "all"));
        assert!(!query_flag(&query, "missing"));
        assert_eq!(query_value(&query, "limit").as_deref(), Some("50"));
        assert!(query_value(&None, "limit").is_none());
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("42"), Some(42));
        assert!(parse_id("forty-two").is_none());
    }
}
