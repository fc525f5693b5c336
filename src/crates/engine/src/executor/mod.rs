//! Task execution
//!
//! Everything between a dispatched task and its upstream endpoint: pool
//! leasing, bounded retry, the streaming relay and output moderation.

pub mod moderation;
pub mod pool;
pub mod relay;
pub mod retry;
pub mod streaming;

pub use moderation::{AllowAll, KeywordModeration, Moderation, ModerationError};
pub use pool::{EndpointLease, EndpointPool, PoolRouter, PoolStats, QuarantineConfig};
pub use relay::{RelayConfig, StreamingRelay};
pub use retry::{retry_with_backoff, Classify, ErrorClass, RetryAttempt, RetryConfig};
pub use streaming::{
    Completion, EventEmitter, FailureReason, RelayStream, StreamBuilder, StreamEvent,
};
