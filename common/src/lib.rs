pub mod commands;
pub mod config;
pub mod domoticz;
pub mod link;
pub mod pages;
pub mod store;
pub mod topics;
pub mod urlcodec;

pub use commands::{
    CommandDispatcher, CommandEffect, CommandOutput, CommandSource, RuntimeFlags, TraceLevel,
};
pub use config::{
    format_ip, ApConfig, HttpAuthConfig, MqttSettings, NetworkConfig, SERVER_VERSION,
};
pub use link::{LinkAction, LinkEvent, LinkSupervisor, WifiStatus};
pub use store::{ConfigStore, StoreError};
pub use topics::*;
