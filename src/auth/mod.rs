//! Authentication — credential extraction, token/user lookup, and the
//! cache tiers in front of the repository layer.

pub mod bloom;
pub mod cache;
pub mod extractor;
pub mod singleflight;

pub use bloom::BloomFilter;
pub use cache::UserCache;
pub use extractor::extract_credential;
pub use singleflight::SingleFlight;

use crate::config::{AuthConfig, UserCacheConfig};
use crate::error::GatewayError;
use crate::models::{Token, TokenStatus, User, UserStatus};
use crate::repository::{TokenRepository, UserRepository};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// SHA-256 of the raw credential: tokens are stored and looked up by
/// hash, never by plaintext.
pub fn hash_credential(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Deserialize, Serialize)]
struct BearerClaims {
    sub: String,
}

/// A `Bearer` value with two `.` separators is treated as a JWT rather
/// than an opaque API key; everything else goes through the
/// hash-and-look-up path against `TokenRepository`.
fn looks_like_jwt(credential: &str) -> bool {
    credential.bytes().filter(|b| *b == b'.').count() == 2
}

pub struct AuthService<R: UserRepository + TokenRepository> {
    repo: Arc<R>,
    users: UserCache,
    jwt_secret: Option<String>,
}

impl<R: UserRepository + TokenRepository + 'static> AuthService<R> {
    pub fn new(repo: Arc<R>, config: UserCacheConfig) -> Self {
        Self { repo, users: UserCache::new(config), jwt_secret: None }
    }

    pub fn with_auth_config(repo: Arc<R>, cache_config: UserCacheConfig, auth_config: AuthConfig) -> Self {
        Self { repo, users: UserCache::new(cache_config), jwt_secret: auth_config.jwt_secret }
    }

    /// Runs the full inbound auth check: extract -> (JWT verify | hash ->
    /// token lookup) -> token validity -> user lookup (cached) -> user
    /// status. Returns the resolved `(User, Token)` pair or a specific
    /// `GatewayError` variant naming the failure point.
    pub async fn authenticate(
        &self,
        headers: &HashMap<String, String>,
        query: &HashMap<String, String>,
        client_ip: Option<&str>,
        requested_model: Option<&str>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(User, Token), GatewayError> {
        let credential = extract_credential(headers, query).ok_or(GatewayError::NoCredential)?;

        let token = if looks_like_jwt(&credential) {
            self.verify_jwt(&credential).await?
        } else {
            let hash = hash_credential(&credential);
            self.repo
                .get_token(&hash)
                .await
                .map_err(|_| GatewayError::InvalidCredential("unknown token".into()))?
        };

        if !token.is_valid(now) {
            return Err(GatewayError::Forbidden("token is not in a usable state".into()));
        }
        if let Some(ip) = client_ip {
            if !token.ip_allowed(ip) {
                return Err(GatewayError::Forbidden(format!("ip {ip} not in token allowlist")));
            }
        }
        if let Some(model) = requested_model {
            if !token.model_allowed(model) {
                return Err(GatewayError::Forbidden(format!("model {model} not in token allowlist")));
            }
        }

        let repo = self.repo.clone();
        let user = self
            .users
            .get_or_load(&token.user_id, move |id| async move { repo.get_user(&id).await })
            .await?;

        if user.status != UserStatus::Active {
            return Err(GatewayError::Forbidden(format!("user {} is not active", user.id)));
        }

        let quota = self
            .repo
            .get_quota(&user.id)
            .await
            .map_err(|_| GatewayError::Insufficient { available: 0.0, requested: 0.0 })?;
        if quota.available() <= 0.0 {
            return Err(GatewayError::Insufficient { available: quota.available(), requested: 0.0 });
        }

        Ok((user, token))
    }

    /// Verifies an HS256 JWT against the configured secret and synthesizes
    /// an always-valid `Token` carrying the claim's `sub` as the user id;
    /// JWT bearers skip the `TokenRepository` lookup entirely since the
    /// token itself is the credential of record.
    async fn verify_jwt(&self, credential: &str) -> Result<Token, GatewayError> {
        let secret = self
            .jwt_secret
            .as_deref()
            .ok_or_else(|| GatewayError::InvalidCredential("JWT verification is not configured".into()))?;
        let claims = decode::<BearerClaims>(credential, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
            .map_err(|e| GatewayError::InvalidCredential(format!("invalid jwt: {e}")))?
            .claims;
        Ok(Token {
            hash: hash_credential(credential),
            user_id: claims.sub,
            name: "jwt".into(),
            status: TokenStatus::Normal,
            quota_limit: None,
            quota_used: 0.0,
            expire_at: None,
            ip_whitelist: vec![],
            model_whitelist: vec![],
        })
    }

    pub fn invalidate_user(&self, user_id: &str) {
        self.users.invalidate(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TokenStatus, UserQuota};
    use crate::repository::InMemoryRepository;

    async fn service_with(token: Token, user: User) -> AuthService<InMemoryRepository> {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_user(user, UserQuota::new("u1", 100.0)).await;
        repo.seed_token(token).await;
        AuthService::new(repo, UserCacheConfig::default())
    }

    fn headers(bearer: &str) -> HashMap<String, String> {
        [("authorization".to_string(), format!("Bearer {bearer}"))].into()
    }

    #[tokio::test]
    async fn valid_bearer_token_authenticates() {
        let raw = "sk-live-123";
        let token = Token {
            hash: hash_credential(raw),
            user_id: "u1".into(),
            name: "default".into(),
            status: TokenStatus::Normal,
            quota_limit: None,
            quota_used: 0.0,
            expire_at: None,
            ip_whitelist: vec![],
            model_whitelist: vec![],
        };
        let user = User { id: "u1".into(), group: "default".into(), status: UserStatus::Active, role_ids: vec![] };
        let service = service_with(token, user).await;

        let result = service.authenticate(&headers(raw), &HashMap::new(), None, None, chrono::Utc::now()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn missing_credential_is_rejected() {
        let service = service_with(
            Token {
                hash: "h".into(), user_id: "u1".into(), name: "t".into(), status: TokenStatus::Normal,
                quota_limit: None, quota_used: 0.0, expire_at: None, ip_whitelist: vec![], model_whitelist: vec![],
            },
            User { id: "u1".into(), group: "default".into(), status: UserStatus::Active, role_ids: vec![] },
        )
        .await;
        let result = service.authenticate(&HashMap::new(), &HashMap::new(), None, None, chrono::Utc::now()).await;
        assert!(matches!(result, Err(GatewayError::NoCredential)));
    }

    #[tokio::test]
    async fn disabled_user_is_forbidden_even_with_valid_token() {
        let raw = "sk-live-456";
        let token = Token {
            hash: hash_credential(raw), user_id: "u1".into(), name: "t".into(), status: TokenStatus::Normal,
            quota_limit: None, quota_used: 0.0, expire_at: None, ip_whitelist: vec![], model_whitelist: vec![],
        };
        let user = User { id: "u1".into(), group: "default".into(), status: UserStatus::Disabled, role_ids: vec![] };
        let service = service_with(token, user).await;
        let result = service.authenticate(&headers(raw), &HashMap::new(), None, None, chrono::Utc::now()).await;
        assert!(matches!(result, Err(GatewayError::Forbidden(_))));
    }

    #[tokio::test]
    async fn valid_jwt_bearer_authenticates_without_a_stored_token() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_user(
            User { id: "u1".into(), group: "default".into(), status: UserStatus::Active, role_ids: vec![] },
            UserQuota::new("u1", 100.0),
        )
        .await;
        let service = AuthService::with_auth_config(
            repo,
            UserCacheConfig::default(),
            crate::config::AuthConfig { jwt_secret: Some("test-secret".into()) },
        );
        let jwt = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &BearerClaims { sub: "u1".into() },
            &jsonwebtoken::EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        let result = service.authenticate(&headers(&jwt), &HashMap::new(), None, None, chrono::Utc::now()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn jwt_bearer_without_configured_secret_is_rejected() {
        let service = service_with(
            Token {
                hash: "h".into(), user_id: "u1".into(), name: "t".into(), status: TokenStatus::Normal,
                quota_limit: None, quota_used: 0.0, expire_at: None, ip_whitelist: vec![], model_whitelist: vec![],
            },
            User { id: "u1".into(), group: "default".into(), status: UserStatus::Active, role_ids: vec![] },
        )
        .await;
        let jwt = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &BearerClaims { sub: "u1".into() },
            &jsonwebtoken::EncodingKey::from_secret(b"irrelevant"),
        )
        .unwrap();
        let result = service.authenticate(&headers(&jwt), &HashMap::new(), None, None, chrono::Utc::now()).await;
        assert!(matches!(result, Err(GatewayError::InvalidCredential(_))));
    }

    #[tokio::test]
    async fn exhausted_quota_is_rejected_even_with_valid_token() {
        let raw = "sk-live-exhausted";
        let token = Token {
            hash: hash_credential(raw), user_id: "u1".into(), name: "t".into(), status: TokenStatus::Normal,
            quota_limit: None, quota_used: 0.0, expire_at: None, ip_whitelist: vec![], model_whitelist: vec![],
        };
        let user = User { id: "u1".into(), group: "default".into(), status: UserStatus::Active, role_ids: vec![] };
        let repo = Arc::new(InMemoryRepository::new());
        let mut quota = UserQuota::new("u1", 100.0);
        quota.used = 100.0;
        repo.seed_user(user, quota).await;
        repo.seed_token(token).await;
        let service = AuthService::new(repo, UserCacheConfig::default());

        let result = service.authenticate(&headers(raw), &HashMap::new(), None, None, chrono::Utc::now()).await;
        assert!(matches!(result, Err(GatewayError::Insufficient { .. })));
    }

    #[tokio::test]
    async fn ip_whitelist_rejects_unlisted_client() {
        let raw = "sk-live-789";
        let token = Token {
            hash: hash_credential(raw), user_id: "u1".into(), name: "t".into(), status: TokenStatus::Normal,
            quota_limit: None, quota_used: 0.0, expire_at: None,
            ip_whitelist: vec!["10.0.0.1".to_string()], model_whitelist: vec![],
        };
        let user = User { id: "u1".into(), group: "default".into(), status: UserStatus::Active, role_ids: vec![] };
        let service = service_with(token, user).await;
        let result = service
            .authenticate(&headers(raw), &HashMap::new(), Some("10.0.0.2"), None, chrono::Utc::now())
            .await;
        assert!(matches!(result, Err(GatewayError::Forbidden(_))));
    }
}
