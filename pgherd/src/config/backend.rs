//! Backend node settings.

use serde::{Deserialize, Serialize};

/// Configured role of a backend node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Standby,
    #[default]
    Unknown,
}

/// One backend node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Backend {
    pub host: String,
    #[serde(default = "Backend::default_port")]
    pub port: u16,
    /// Load-balancing weight.
    #[serde(default = "Backend::default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub role: Role,
}

impl Backend {
    fn default_port() -> u16 {
        5432
    }

    fn default_weight() -> f64 {
        1.0
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
