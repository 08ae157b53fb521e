//! Frontend/backend credentials.

use serde::{Deserialize, Serialize};

/// How a user authenticates to the proxy, and the proxy
/// to the backends.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Trust,
    Cleartext,
    Md5,
}

/// One user entry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub name: String,
    /// Clear text or `md5`-prefixed stored secret.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub auth: AuthType,
}

impl User {
    /// Password to present to backends. Stored md5 secrets can't be
    /// replayed over cleartext auth, only over md5.
    pub fn backend_password(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}
