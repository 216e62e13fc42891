//! JWT sessions and password hashing for the management API

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub role: String,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub token_expiry_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: uuid::Uuid::new_v4().to_string(),
            token_expiry_hours: 24,
        }
    }
}

#[derive(Clone)]
pub struct AuthManager {
    config: Arc<AuthConfig>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AuthManager {
    pub fn new(config: AuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config: Arc::new(config),
            encoding_key,
            decoding_key,
        }
    }

    pub fn create_token(
        &self,
        username: &str,
        role: &str,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let exp = now + Duration::hours(self.config.token_expiry_hours);

        let claims = Claims {
            sub: username.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            role: role.to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
    }

    pub fn verify_token(
        &self,
        token: &str,
    ) -> Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
        let validation = Validation::default();
        decode::<Claims>(token, &self.decoding_key, &validation)
    }

    pub fn extract_token_from_header(&self, auth_header: &str) -> Option<String> {
        auth_header.strip_prefix("Bearer ").map(|s| s.to_string())
    }
}

/// Hash a password with a random 16-byte salt. Stored as `hex(salt)$hex(hash)`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = salted_digest(&salt, password);
    format!("{}${}", hex::encode(salt), hex::encode(digest))
}

/// Check a password against a stored `hex(salt)$hex(hash)` value
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, hash_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let digest = salted_digest(&salt, password);
    hex::encode(digest) == hash_hex
}

fn salted_digest(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AuthManager {
        AuthManager::new(AuthConfig {
            secret: "test-secret".to_string(),
            token_expiry_hours: 1,
        })
    }

    #[test]
    fn test_token_roundtrip() {
        let auth = manager();
        let token = auth.create_token("alice", "admin").unwrap();
        let data = auth.verify_token(&token).unwrap();
        assert_eq!(data.claims.sub, "alice");
        assert!(data.claims.is_admin());
    }

    #[test]
    fn test_token_rejected_with_wrong_secret() {
        let auth = manager();
        let token = auth.create_token("alice", "user").unwrap();

        let other = AuthManager::new(AuthConfig {
            secret: "different-secret".to_string(),
            token_expiry_hours: 1,
        });
        assert!(other.verify_token(&token).is_err());
    }

    #[test]
    fn test_bearer_extraction() {
        let auth = manager();
        assert_eq!(
            auth.extract_token_from_header("Bearer abc.def.ghi").as_deref(),
            Some("abc.def.ghi")
        );
        assert!(auth.extract_token_from_header("Basic abc").is_none());
    }

    #[test]
    fn test_password_hash_and_verify() {
        let stored = hash_password("hunter2");
        assert!(verify_password("hunter2", &stored));
        assert!(!verify_password("hunter3", &stored));
        assert!(!verify_password("hunter2", "malformed"));

        // Salted: two hashes of the same password differ
        assert_ne!(stored, hash_password("hunter2"));
    }
}
