//! proxyctl - desired-state management for an external nginx reverse proxy
//!
//! This library provides a control plane that:
//! - Stores backends, routing rules, and certificates in SQLite
//! - Renders the full nginx configuration from that desired state
//! - Validates candidate configs with `nginx -t` before they go live
//! - Backs up the previous config and hot-reloads nginx on apply
//! - Exposes a JWT-authenticated management API with an audit trail

pub mod api;
pub mod auth;
pub mod certs;
pub mod config;
pub mod db;
pub mod error;
pub mod nginx;
pub mod render;
