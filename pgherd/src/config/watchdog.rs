//! Watchdog settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Watchdog settings: own identity, peers, escalation hooks.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WatchdogConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Name this node advertises to peers.
    #[serde(default = "WatchdogConfig::default_node_name")]
    pub node_name: String,
    /// Address peers connect to.
    #[serde(default = "WatchdogConfig::default_host")]
    pub host: String,
    #[serde(default = "WatchdogConfig::default_wd_port")]
    pub wd_port: u16,
    /// The proxy port this node serves clients on; part of the
    /// node identity exchanged with peers.
    #[serde(default = "WatchdogConfig::default_pgherd_port")]
    pub pgherd_port: u16,
    /// Election priority. Higher wins.
    #[serde(default = "WatchdogConfig::default_priority")]
    pub priority: i32,
    /// Shared cluster secret. Can also come from the key file.
    #[serde(default)]
    pub auth_key: Option<String>,
    /// Fallback key file, overridable with `PGHERDKEYFILE`.
    #[serde(default = "WatchdogConfig::default_key_file")]
    pub key_file: PathBuf,
    /// IPC socket for local collaborators.
    #[serde(default = "WatchdogConfig::default_ipc_socket")]
    pub ipc_socket: PathBuf,
    /// Run when this node becomes coordinator with quorum.
    #[serde(default)]
    pub escalation_command: Option<String>,
    /// Run when coordinator status or quorum is lost.
    #[serde(default)]
    pub de_escalation_command: Option<String>,
    #[serde(default)]
    pub peers: Vec<WatchdogPeer>,
}

/// A remote watchdog peer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WatchdogPeer {
    pub node_name: String,
    pub host: String,
    pub wd_port: u16,
    pub pgherd_port: u16,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

impl WatchdogConfig {
    fn default_node_name() -> String {
        "localhost".into()
    }

    fn default_host() -> String {
        "0.0.0.0".into()
    }

    fn default_wd_port() -> u16 {
        9000
    }

    fn default_pgherd_port() -> u16 {
        9999
    }

    fn default_priority() -> i32 {
        1
    }

    fn default_key_file() -> PathBuf {
        ".pgherdkey".into()
    }

    fn default_ipc_socket() -> PathBuf {
        "/tmp/.s.PGHERD.wd".into()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.wd_port)
    }

    /// Resolve the shared auth key: inline setting, then the
    /// `PGHERDKEYFILE` env var, then the configured key file.
    pub fn resolve_auth_key(&self) -> String {
        if let Some(ref key) = self.auth_key {
            return key.clone();
        }

        let path = std::env::var("PGHERDKEYFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.key_file.clone());

        std::fs::read_to_string(path)
            .map(|key| key.trim().to_string())
            .unwrap_or_default()
    }
}

impl WatchdogPeer {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.wd_port)
    }
}
