//! BillingRecord and ModelPrice — the ledger's persisted shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingOperation {
    PreDebit,
    Confirm,
    Refund,
    Recharge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingStatus {
    Pending,
    Confirmed,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRecord {
    pub id: Uuid,
    pub user_id: String,
    pub operation: BillingOperation,
    pub amount: f64,
    pub request_id: String,
    pub model: String,
    pub status: BillingStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BillingRecord {
    pub fn new_predebit(user_id: impl Into<String>, request_id: impl Into<String>, model: impl Into<String>, amount: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            operation: BillingOperation::PreDebit,
            amount,
            request_id: request_id.into(),
            model: model.into(),
            status: BillingStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    ByToken,
    ByRequest,
}

/// A versioned price point. Updates append a new record with a bumped
/// `version`; old records are never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model: String,
    pub group: String,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
    pub min_price: Option<f64>,
    pub pricing_mode: PricingMode,
    pub group_multiplier: f64,
    pub version: u32,
}

impl ModelPrice {
    pub fn next_version(&self, input_price_per_1k: f64, output_price_per_1k: f64) -> ModelPrice {
        ModelPrice {
            model: self.model.clone(),
            group: self.group.clone(),
            input_price_per_1k,
            output_price_per_1k,
            min_price: self.min_price,
            pricing_mode: self.pricing_mode,
            group_multiplier: self.group_multiplier,
            version: self.version + 1,
        }
    }
}
