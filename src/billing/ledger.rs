//! The two-phase billing ledger: pre-debit / confirm / refund over
//! `UserQuota`, plus a TTL sweep for orphaned pre-debits. Pre-debit always
//! freezes the estimated amount up front — there is no "would this be
//! affordable" dry-run path.

use crate::error::{GatewayError, GatewayResult};
use crate::models::{BillingOperation, BillingRecord, BillingStatus, UserQuota};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

pub struct Ledger {
    quotas: RwLock<HashMap<String, UserQuota>>,
    pending: RwLock<HashMap<String, BillingRecord>>,
    predebit_ttl: Duration,
}

impl Ledger {
    pub fn new(predebit_ttl: Duration) -> Self {
        Self {
            quotas: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            predebit_ttl,
        }
    }

    pub async fn set_quota(&self, quota: UserQuota) {
        self.quotas.write().await.insert(quota.user_id.clone(), quota);
    }

    pub async fn get_quota(&self, user_id: &str) -> Option<UserQuota> {
        self.quotas.read().await.get(user_id).cloned()
    }

    /// Freezes `amount` against the user's quota and records a pending
    /// `BillingRecord` keyed by `request_id`. Fails with `Insufficient` if
    /// the freeze would push `available` negative.
    pub async fn pre_debit(
        &self,
        user_id: &str,
        request_id: &str,
        model: &str,
        amount: f64,
    ) -> GatewayResult<BillingRecord> {
        let mut quotas = self.quotas.write().await;
        let quota = quotas
            .get_mut(user_id)
            .ok_or_else(|| GatewayError::NotFound(format!("quota for user {user_id}")))?;

        if quota.available() < amount {
            return Err(GatewayError::Insufficient {
                available: quota.available(),
                requested: amount,
            });
        }
        quota.frozen += amount;
        quota.check_invariant()?;

        let record = BillingRecord::new_predebit(user_id, request_id, model, amount);
        self.pending.write().await.insert(request_id.to_string(), record.clone());
        Ok(record)
    }

    /// Settles a pending pre-debit at `actual_amount`, which may only be
    /// less than or equal to the frozen estimate: unfreeze the estimate,
    /// charge the actual. Validates before mutating anything, so a rejected
    /// or invariant-failing confirm leaves both the quota and the pending
    /// record exactly as they were — the record stays pending and can still
    /// be refunded or retried.
    pub async fn confirm(&self, request_id: &str, actual_amount: f64) -> GatewayResult<BillingRecord> {
        let mut pending = self.pending.write().await;
        let record = pending
            .get(request_id)
            .ok_or_else(|| GatewayError::NotFound(format!("pending billing record {request_id}")))?
            .clone();

        if actual_amount > record.amount {
            return Err(GatewayError::BillingMismatch {
                frozen: record.amount,
                actual: actual_amount,
            });
        }

        let mut quotas = self.quotas.write().await;
        let quota = quotas
            .get_mut(&record.user_id)
            .ok_or_else(|| GatewayError::NotFound(format!("quota for user {}", record.user_id)))?;

        let prior = quota.clone();
        quota.frozen -= record.amount;
        quota.used += actual_amount;
        if let Err(e) = quota.check_invariant() {
            *quota = prior;
            return Err(e);
        }

        let mut record = pending.remove(request_id).expect("record present, checked above");
        record.operation = BillingOperation::Confirm;
        record.amount = actual_amount;
        record.status = BillingStatus::Confirmed;
        record.completed_at = Some(chrono::Utc::now());
        Ok(record)
    }

    /// Releases a pending pre-debit without charging anything, e.g. when
    /// the upstream call never completed.
    pub async fn refund(&self, request_id: &str) -> GatewayResult<BillingRecord> {
        let mut pending = self.pending.write().await;
        let mut record = pending
            .remove(request_id)
            .ok_or_else(|| GatewayError::NotFound(format!("pending billing record {request_id}")))?;

        let mut quotas = self.quotas.write().await;
        let quota = quotas
            .get_mut(&record.user_id)
            .ok_or_else(|| GatewayError::NotFound(format!("quota for user {}", record.user_id)))?;

        quota.frozen -= record.amount;
        quota.check_invariant()?;

        record.operation = BillingOperation::Refund;
        record.status = BillingStatus::Refunded;
        record.completed_at = Some(chrono::Utc::now());
        Ok(record)
    }

    pub fn confirm_ratio(record: &BillingRecord, predebit_amount: f64) -> f64 {
        if predebit_amount <= 0.0 {
            1.0
        } else {
            record.amount / predebit_amount
        }
    }

    /// Auto-refunds any pre-debit older than `predebit_ttl` — a crashed or
    /// hung request must never leave quota permanently frozen. Returns the
    /// request ids that were swept.
    pub async fn sweep_expired_predebits(&self) -> Vec<String> {
        let now = chrono::Utc::now();
        let expired: Vec<String> = {
            let pending = self.pending.read().await;
            pending
                .iter()
                .filter(|(_, record)| {
                    now.signed_duration_since(record.created_at).num_seconds()
                        > self.predebit_ttl.as_secs() as i64
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut swept = Vec::new();
        for id in expired {
            match self.refund(&id).await {
                Ok(_) => swept.push(id),
                Err(e) => warn!("failed to auto-refund expired predebit {id}: {e}"),
            }
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger_with_quota(total: f64) -> Ledger {
        let ledger = Ledger::new(Duration::from_secs(600));
        ledger.set_quota(UserQuota::new("u1", total)).await;
        ledger
    }

    #[tokio::test]
    async fn predebit_freezes_and_confirm_charges_actual() {
        let ledger = ledger_with_quota(100.0).await;
        ledger.pre_debit("u1", "req-1", "gpt-4", 10.0).await.unwrap();
        let quota = ledger.get_quota("u1").await.unwrap();
        assert_eq!(quota.frozen, 10.0);
        assert_eq!(quota.available(), 90.0);

        ledger.confirm("req-1", 7.5).await.unwrap();
        let quota = ledger.get_quota("u1").await.unwrap();
        assert_eq!(quota.frozen, 0.0);
        assert_eq!(quota.used, 7.5);
        assert_eq!(quota.available(), 92.5);
    }

    #[tokio::test]
    async fn predebit_rejected_when_insufficient() {
        let ledger = ledger_with_quota(5.0).await;
        let result = ledger.pre_debit("u1", "req-1", "gpt-4", 10.0).await;
        assert!(matches!(result, Err(GatewayError::Insufficient { .. })));
    }

    #[tokio::test]
    async fn refund_releases_freeze_without_charging() {
        let ledger = ledger_with_quota(100.0).await;
        ledger.pre_debit("u1", "req-1", "gpt-4", 10.0).await.unwrap();
        ledger.refund("req-1").await.unwrap();
        let quota = ledger.get_quota("u1").await.unwrap();
        assert_eq!(quota.frozen, 0.0);
        assert_eq!(quota.used, 0.0);
    }

    #[tokio::test]
    async fn confirm_above_frozen_amount_is_rejected_without_mutating_state() {
        let ledger = ledger_with_quota(100.0).await;
        ledger.pre_debit("u1", "req-1", "gpt-4", 10.0).await.unwrap();

        let result = ledger.confirm("req-1", 12.5).await;
        assert!(matches!(result, Err(GatewayError::BillingMismatch { frozen, actual }) if frozen == 10.0 && actual == 12.5));

        // Neither the quota nor the pending record were touched: the
        // request can still be refunded or retried.
        let quota = ledger.get_quota("u1").await.unwrap();
        assert_eq!(quota.frozen, 10.0);
        assert_eq!(quota.used, 0.0);
        ledger.refund("req-1").await.unwrap();
        let quota = ledger.get_quota("u1").await.unwrap();
        assert_eq!(quota.frozen, 0.0);
    }

    #[tokio::test]
    async fn confirm_unknown_request_is_not_found() {
        let ledger = ledger_with_quota(100.0).await;
        assert!(matches!(ledger.confirm("missing", 1.0).await, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn sweep_refunds_predebits_past_ttl() {
        let ledger = Ledger::new(Duration::from_secs(0));
        ledger.set_quota(UserQuota::new("u1", 100.0)).await;
        ledger.pre_debit("u1", "req-1", "gpt-4", 10.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let swept = ledger.sweep_expired_predebits().await;
        assert_eq!(swept, vec!["req-1".to_string()]);
        let quota = ledger.get_quota("u1").await.unwrap();
        assert_eq!(quota.frozen, 0.0);
    }
}
