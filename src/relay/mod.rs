//! The Relay Pipeline: body cache, retry controller, SSE broadcaster, and
//! the pipeline that wires them to the channel registry/selector and the
//! billing ledger.

pub mod body_cache;
pub mod pipeline;
pub mod retry;
pub mod sse;

pub use body_cache::BodyCache;
pub use pipeline::{RelayOutcome, RelayPipeline};
pub use retry::{RetryController, RetryDecision};
pub use sse::{Broadcaster, SseFrame};
