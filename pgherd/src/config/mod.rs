//! Configuration.
//!
//! The core consumes a typed config struct; the TOML file and argv
//! are thin wrappers around it.

pub mod backend;
pub mod error;
pub mod general;
pub mod users;
pub mod watchdog;

pub use backend::{Backend, Role};
pub use error::Error;
pub use general::General;
pub use users::{AuthType, User};
pub use watchdog::{WatchdogConfig, WatchdogPeer};

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Get the current configuration.
pub fn config() -> Arc<Config> {
    CONFIG.load().clone()
}

/// Load the configuration file from disk and install it.
pub fn load(path: &Path) -> Result<Arc<Config>, Error> {
    let config = Config::load(path)?;
    Ok(set(config))
}

/// Install a configuration.
pub fn set(config: Config) -> Arc<Config> {
    let config = Arc::new(config);
    CONFIG.store(config.clone());
    config
}

/// Typed configuration consumed by the core.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

impl Config {
    /// Read and parse the TOML config file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.check()?;
        Ok(config)
    }

    /// Sanity checks that don't fit in serde defaults.
    pub fn check(&self) -> Result<(), Error> {
        if self.general.reserved_connections >= self.general.max_connections {
            return Err(Error::Invalid(
                "reserved_connections must be smaller than max_connections".into(),
            ));
        }

        for user in &self.users {
            if user.auth != AuthType::Trust && user.password.is_none() {
                return Err(Error::Invalid(format!(
                    "user \"{}\" requires a password for {:?} auth",
                    user.name, user.auth
                )));
            }
        }

        Ok(())
    }

    /// Find credentials for a frontend user.
    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|user| user.name == name)
    }
}
