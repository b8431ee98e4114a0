//! Built-in identity mode.
//!
//! When no external validator is wired in, the server can mint and validate
//! its own opaque tokens. The credential store is bootstrapped from a single
//! admin secret: the secret itself authenticates as the `admin` user, and
//! admins can issue further tokens over the wire (`identity.issueToken`) or
//! revoke them (`identity.revokeToken`).
//!
//! Tokens are never stored in the clear — only their SHA-256 digests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::protocol::now_ms;
use crate::store::{SessionClaims, TokenValidator};

pub const ADMIN_USER_ID: &str = "admin";
pub const ADMIN_ROLE: &str = "admin";

struct IssuedToken {
    user_id: String,
    roles: Vec<String>,
    expires_at: Option<i64>,
}

pub struct BuiltInIdentity {
    admin_digest: String,
    /// Digest → claims for tokens minted at runtime.
    tokens: RwLock<HashMap<String, IssuedToken>>,
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl BuiltInIdentity {
    pub fn new(admin_secret: &str) -> Self {
        Self {
            admin_digest: digest(admin_secret),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a token for `user_id`. Returns the raw token; only its digest is
    /// retained. `ttl_ms` of `None` means the token never expires.
    pub fn issue_token(&self, user_id: &str, roles: Vec<String>, ttl_ms: Option<i64>) -> String {
        // UUID v4 hex without dashes, same shape the connection tokens use.
        let token = Uuid::new_v4().to_string().replace('-', "");
        let expires_at = ttl_ms.map(|ttl| now_ms() + ttl);
        self.tokens.write().expect("token lock poisoned").insert(
            digest(&token),
            IssuedToken {
                user_id: user_id.to_string(),
                roles,
                expires_at,
            },
        );
        token
    }

    /// Returns `true` if the token existed.
    pub fn revoke_token(&self, token: &str) -> bool {
        self.tokens
            .write()
            .expect("token lock poisoned")
            .remove(&digest(token))
            .is_some()
    }
}

#[async_trait]
impl TokenValidator for BuiltInIdentity {
    async fn validate(&self, token: &str) -> Option<SessionClaims> {
        let d = digest(token);
        if d == self.admin_digest {
            return Some(SessionClaims {
                user_id: ADMIN_USER_ID.to_string(),
                roles: vec![ADMIN_ROLE.to_string()],
                expires_at: None,
            });
        }
        let tokens = self.tokens.read().expect("token lock poisoned");
        tokens.get(&d).map(|issued| SessionClaims {
            user_id: issued.user_id.clone(),
            roles: issued.roles.clone(),
            expires_at: issued.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admin_secret_authenticates_as_admin() {
        let identity = BuiltInIdentity::new("hunter2-but-longer");
        let claims = identity.validate("hunter2-but-longer").await.unwrap();
        assert_eq!(claims.user_id, ADMIN_USER_ID);
        assert!(claims.has_role(ADMIN_ROLE));
        assert!(claims.expires_at.is_none());
        assert!(identity.validate("wrong").await.is_none());
    }

    #[tokio::test]
    async fn issued_tokens_validate_until_revoked() {
        let identity = BuiltInIdentity::new("s3cret");
        let token = identity.issue_token("user-1", vec!["user".into()], None);
        let claims = identity.validate(&token).await.unwrap();
        assert_eq!(claims.user_id, "user-1");
        assert_eq!(claims.roles, vec!["user".to_string()]);

        assert!(identity.revoke_token(&token));
        assert!(identity.validate(&token).await.is_none());
        assert!(!identity.revoke_token(&token));
    }

    #[tokio::test]
    async fn issued_token_carries_expiry() {
        let identity = BuiltInIdentity::new("s3cret");
        let token = identity.issue_token("user-1", vec![], Some(60_000));
        let claims = identity.validate(&token).await.unwrap();
        let expires_at = claims.expires_at.unwrap();
        assert!(expires_at > now_ms());
        // Expiry enforcement is the session facade's job; the validator
        // still returns the claims for an expired token.
        assert!(!claims.expired(now_ms()));
        assert!(claims.expired(expires_at));
    }
}
