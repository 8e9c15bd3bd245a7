//! Billing — the pre-debit/confirm/refund ledger, pricing evaluation,
//! token counting, and the bounded async settlement queue.

pub mod ledger;
pub mod pricing;
pub mod queue;
pub mod tokens;

pub use ledger::Ledger;
pub use pricing::PricingTable;
pub use queue::{BillingJob, BillingQueue};
pub use tokens::{CountMethod, TokenCounter};
