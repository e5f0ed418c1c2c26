pub mod accounting;
pub mod adapter;
pub mod error;
pub mod hub;
pub mod manager;
pub mod monitor;
pub mod relay;
pub mod settings;
pub mod store;
pub mod template;

#[cfg(test)]
mod testing;

pub use accounting::{MeteredStream, TrafficAccountingLayer};
pub use adapter::{EngineAdapter, EngineKind, SingBoxAdapter, XrayAdapter};
pub use error::{EngineError, Result};
pub use hub::{BroadcastHub, HubEvent, Subscription};
pub use manager::{EngineManager, EngineStatus};
pub use monitor::Monitor;
pub use settings::{EngineSettings, HubSettings, LimiterSettings, MonitorSettings};
pub use store::{SettingsStore, UserRecord};
