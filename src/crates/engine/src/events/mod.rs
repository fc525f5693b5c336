//! Task lifecycle events
//!
//! [`TaskEvent`] is what the service announces at each status change;
//! [`EventBroker`] is the at-least-once pub/sub it announces on.

pub mod broker;
pub mod lifecycle;
pub mod memory;

pub use broker::{EventBroker, EventHandler, Message, SubscribeOptions, Subscription};
pub use lifecycle::{TaskEvent, TopicConfig};
pub use memory::{DeadLetter, InMemoryBroker};
