//! Engine configuration

pub mod engine;

pub use engine::{
    ConfigError, ConsumerSettings, DatabaseConfig, EngineConfig, ImageSettings,
    ModerationSettings, PoolRouteConfig, RelaySettings,
};
pub use crate::events::TopicConfig;
pub use crate::executor::QuarantineConfig;
