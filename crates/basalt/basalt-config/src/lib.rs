mod config;

pub use config::{ConfigError, ModuleConfig};
