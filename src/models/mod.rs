//! Domain models for the relay gateway.
//!
//! Pure data: no I/O, no locking. The engine modules (`channel`, `relay`,
//! `billing`, `auth`) operate on these types under their own concurrency
//! policy (see `SPEC_FULL.md` §5).

pub mod billing;
pub mod channel;
pub mod request;
pub mod user;

pub use billing::{BillingOperation, BillingRecord, BillingStatus, ModelPrice, PricingMode};
pub use channel::{Capabilities, Channel, ChannelAbility, ChannelStatus, WildcardRule};
pub use request::{
    CanonicalChatRequest, CanonicalChatResponse, CanonicalEmbeddingsRequest,
    CanonicalEmbeddingsResponse, ChatMessage, Role, StreamChunk, Usage,
};
pub use user::{AuditRecord, Token, TokenStatus, User, UserQuota, UserStatus};
