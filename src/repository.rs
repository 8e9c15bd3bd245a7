//! Repository interfaces — the persistence seam, with a concrete backend
//! left out of scope. Every trait here is object-safe and `async_trait`;
//! an in-memory implementation backs the test suite and the admin CLI's
//! demo mode.

use crate::error::GatewayResult;
use crate::models::{Channel, ModelPrice, Token, User, UserQuota};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_user(&self, user_id: &str) -> GatewayResult<User>;
    async fn get_quota(&self, user_id: &str) -> GatewayResult<UserQuota>;
    async fn save_quota(&self, quota: UserQuota) -> GatewayResult<()>;
}

#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn get_token(&self, hash: &str) -> GatewayResult<Token>;
    async fn save_token(&self, token: Token) -> GatewayResult<()>;
}

#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn list_channels(&self) -> GatewayResult<Vec<Channel>>;
    async fn save_channel(&self, channel: Channel) -> GatewayResult<()>;
}

#[async_trait]
pub trait BillingRepository: Send + Sync {
    async fn append_record(&self, record: crate::models::BillingRecord) -> GatewayResult<()>;
}

#[async_trait]
pub trait PricingRepository: Send + Sync {
    async fn current_price(&self, model: &str, group: &str) -> GatewayResult<ModelPrice>;
    async fn save_price(&self, price: ModelPrice) -> GatewayResult<()>;
}

/// In-memory implementation of every repository trait, used by tests and
/// by `admin --demo`. Not meant to survive a process restart.
#[derive(Default)]
pub struct InMemoryRepository {
    users: RwLock<HashMap<String, User>>,
    quotas: RwLock<HashMap<String, UserQuota>>,
    tokens: RwLock<HashMap<String, Token>>,
    channels: RwLock<HashMap<String, Channel>>,
    prices: RwLock<HashMap<(String, String), ModelPrice>>,
    billing_log: RwLock<Vec<crate::models::BillingRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_user(&self, user: User, quota: UserQuota) {
        self.users.write().await.insert(user.id.clone(), user);
        self.quotas.write().await.insert(quota.user_id.clone(), quota);
    }

    pub async fn seed_token(&self, token: Token) {
        self.tokens.write().await.insert(token.hash.clone(), token);
    }

    pub async fn seed_price(&self, price: ModelPrice) {
        self.prices.write().await.insert((price.model.clone(), price.group.clone()), price);
    }
}

#[async_trait]
impl UserRepository for InMemoryRepository {
    async fn get_user(&self, user_id: &str) -> GatewayResult<User> {
        self.users
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| crate::error::GatewayError::NotFound(format!("user {user_id}")))
    }

    async fn get_quota(&self, user_id: &str) -> GatewayResult<UserQuota> {
        self.quotas
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| crate::error::GatewayError::NotFound(format!("quota for user {user_id}")))
    }

    async fn save_quota(&self, quota: UserQuota) -> GatewayResult<()> {
        self.quotas.write().await.insert(quota.user_id.clone(), quota);
        Ok(())
    }
}

#[async_trait]
impl TokenRepository for InMemoryRepository {
    async fn get_token(&self, hash: &str) -> GatewayResult<Token> {
        self.tokens
            .read()
            .await
            .get(hash)
            .cloned()
            .ok_or_else(|| crate::error::GatewayError::NotFound(format!("token {hash}")))
    }

    async fn save_token(&self, token: Token) -> GatewayResult<()> {
        self.tokens.write().await.insert(token.hash.clone(), token);
        Ok(())
    }
}

#[async_trait]
impl ChannelRepository for InMemoryRepository {
    async fn list_channels(&self) -> GatewayResult<Vec<Channel>> {
        Ok(self.channels.read().await.values().map(Channel::config_clone).collect())
    }

    async fn save_channel(&self, channel: Channel) -> GatewayResult<()> {
        self.channels.write().await.insert(channel.id.clone(), channel);
        Ok(())
    }
}

#[async_trait]
impl BillingRepository for InMemoryRepository {
    async fn append_record(&self, record: crate::models::BillingRecord) -> GatewayResult<()> {
        self.billing_log.write().await.push(record);
        Ok(())
    }
}

#[async_trait]
impl PricingRepository for InMemoryRepository {
    async fn current_price(&self, model: &str, group: &str) -> GatewayResult<ModelPrice> {
        self.prices
            .read()
            .await
            .get(&(model.to_string(), group.to_string()))
            .cloned()
            .ok_or_else(|| crate::error::GatewayError::NotFound(format!("price for {model}/{group}")))
    }

    async fn save_price(&self, price: ModelPrice) -> GatewayResult<()> {
        self.prices.write().await.insert((price.model.clone(), price.group.clone()), price);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserStatus;

    #[tokio::test]
    async fn seeded_user_is_retrievable() {
        let repo = InMemoryRepository::new();
        repo.seed_user(
            User { id: "u1".into(), group: "default".into(), status: UserStatus::Active, role_ids: vec![] },
            UserQuota::new("u1", 100.0),
        )
        .await;
        assert!(repo.get_user("u1").await.is_ok());
        assert_eq!(repo.get_quota("u1").await.unwrap().total, 100.0);
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let repo = InMemoryRepository::new();
        assert!(repo.get_token("missing").await.is_err());
    }
}
