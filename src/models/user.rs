//! User, Token (API credential) and the UserQuota three-way ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    Active,
    Disabled,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub group: String,
    pub status: UserStatus,
    pub role_ids: Vec<String>,
}

/// The three-way accounting ledger for one user. `available = total -
/// used - frozen` is the enforced invariant; every mutator here upholds it
/// or returns an error rather than leaving the struct in a bad state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuota {
    pub user_id: String,
    pub total: f64,
    pub used: f64,
    pub frozen: f64,
}

impl UserQuota {
    pub fn new(user_id: impl Into<String>, total: f64) -> Self {
        Self {
            user_id: user_id.into(),
            total,
            used: 0.0,
            frozen: 0.0,
        }
    }

    pub fn available(&self) -> f64 {
        self.total - self.used - self.frozen
    }

    pub fn check_invariant(&self) -> Result<(), crate::error::GatewayError> {
        if self.used < 0.0 || self.frozen < 0.0 || self.available() < -1e-9 {
            return Err(crate::error::GatewayError::InternalInvariant(format!(
                "quota invariant violated for user {}: total={} used={} frozen={}",
                self.user_id, self.total, self.used, self.frozen
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStatus {
    Normal,
    Exhausted,
    Disabled,
    Expired,
    Deleted,
}

/// An API credential bound to a user, with its own lifecycle state
/// machine independent of the owning user's status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub hash: String,
    pub user_id: String,
    pub name: String,
    pub status: TokenStatus,
    pub quota_limit: Option<f64>,
    pub quota_used: f64,
    pub expire_at: Option<DateTime<Utc>>,
    pub ip_whitelist: Vec<String>,
    pub model_whitelist: Vec<String>,
}

impl Token {
    /// A token is valid iff Normal, unexpired, and under its own quota
    /// limit (if any). This does not check the owning user's quota or
    /// status — callers compose both checks (see `auth::extractor`).
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.status != TokenStatus::Normal {
            return false;
        }
        if let Some(expire_at) = self.expire_at {
            if now >= expire_at {
                return false;
            }
        }
        if let Some(limit) = self.quota_limit {
            if self.quota_used >= limit {
                return false;
            }
        }
        true
    }

    pub fn ip_allowed(&self, ip: &str) -> bool {
        self.ip_whitelist.is_empty() || self.ip_whitelist.iter().any(|w| w == ip)
    }

    pub fn model_allowed(&self, model: &str) -> bool {
        self.model_whitelist.is_empty() || self.model_whitelist.iter().any(|m| m == model)
    }

    /// Applies a status transition and returns the audit record the caller
    /// must persist. `Deleted` is reachable from any state.
    pub fn transition(&mut self, to: TokenStatus, reason: impl Into<String>, now: DateTime<Utc>) -> AuditRecord {
        let from = self.status;
        self.status = to;
        AuditRecord {
            token_hash: self.hash.clone(),
            from_status: from,
            to_status: to,
            reason: reason.into(),
            at: now,
        }
    }
}

/// Immutable audit record emitted on every token status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub token_hash: String,
    pub from_status: TokenStatus,
    pub to_status: TokenStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_invariant_holds_after_construction() {
        let q = UserQuota::new("u1", 100.0);
        assert_eq!(q.available(), 100.0);
        assert!(q.check_invariant().is_ok());
    }

    #[test]
    fn quota_invariant_flags_negative_frozen() {
        let mut q = UserQuota::new("u1", 100.0);
        q.frozen = -5.0;
        assert!(q.check_invariant().is_err());
    }

    #[test]
    fn token_invalid_when_expired() {
        let mut t = Token {
            hash: "h".into(),
            user_id: "u1".into(),
            name: "default".into(),
            status: TokenStatus::Normal,
            quota_limit: None,
            quota_used: 0.0,
            expire_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            ip_whitelist: vec![],
            model_whitelist: vec![],
        };
        assert!(!t.is_valid(Utc::now()));
        t.expire_at = None;
        assert!(t.is_valid(Utc::now()));
    }
}
