use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bootstrap parameters of a worker module.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ModuleConfig {
    #[serde(default = "defaults::controller_host")]
    pub controller_host: String,
    pub controller_port: u16,
    #[serde(default)]
    pub module_id: u32,
    #[serde(default = "defaults::module_name")]
    pub module_name: String,
    #[serde(default = "defaults::shm_dir")]
    pub shm_dir: PathBuf,
    #[serde(default = "defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deferred-message backlog that triggers a warning; 0 turns it off.
    #[serde(default = "defaults::queue_high_water")]
    pub queue_high_water: usize,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    use std::path::{Path, PathBuf};

    pub fn controller_host() -> String {
        "127.0.0.1".into()
    }

    pub fn module_name() -> String {
        "module".into()
    }

    pub fn shm_dir() -> PathBuf {
        // tmpfs where available so segments never touch disk
        let dev_shm = Path::new("/dev/shm");
        if dev_shm.is_dir() {
            dev_shm.to_path_buf()
        } else {
            std::env::temp_dir()
        }
    }

    pub fn connect_timeout_ms() -> u64 {
        5_000
    }

    pub fn queue_high_water() -> usize {
        1024
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

impl ModuleConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config = Self::from_toml(&toml_to_str)?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: ModuleConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Config with defaults for everything but the controller port.
    pub fn with_controller(host: impl Into<String>, port: u16) -> Self {
        Self {
            controller_host: host.into(),
            controller_port: port,
            module_id: 0,
            module_name: defaults::module_name(),
            shm_dir: defaults::shm_dir(),
            connect_timeout_ms: defaults::connect_timeout_ms(),
            queue_high_water: defaults::queue_high_water(),
            log_level: defaults::log_level(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller_host.trim().is_empty() {
            return Err(ConfigError::Invalid("controller_host is empty".into()));
        }
        if self.controller_port == 0 {
            return Err(ConfigError::Invalid("controller_port must be non-zero".into()));
        }
        Ok(())
    }

    /// `None` means block until the OS gives up.
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }
}
