mod config;

pub use config::{BridgeConfig, CONFIG_ENV};
