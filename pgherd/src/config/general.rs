//! General settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// General settings. Durations are milliseconds in the file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct General {
    /// Address to listen on.
    #[serde(default = "General::default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "General::default_port")]
    pub port: u16,
    /// Directory for the UNIX socket, if one should be created.
    #[serde(default)]
    pub unix_socket_dir: Option<PathBuf>,
    /// Maximum number of concurrent client connections.
    #[serde(default = "General::default_max_connections")]
    pub max_connections: usize,
    /// Connections held back from the limit; clients beyond
    /// `max_connections - reserved_connections` are refused.
    #[serde(default)]
    pub reserved_connections: usize,
    /// Maximum number of idle pooled entries.
    #[serde(default = "General::default_max_pool")]
    pub max_pool: usize,
    /// Idle pooled connections older than this are closed.
    /// Zero disables the sweep.
    #[serde(default)]
    pub connection_life_time: u64,
    /// Clients must finish authentication within this window.
    #[serde(default = "General::default_authentication_timeout")]
    pub authentication_timeout: u64,
    /// Period between backend health probes. Zero disables them.
    #[serde(default)]
    pub health_check_period: u64,
    /// Consecutive probe failures before a node is reported down.
    #[serde(default = "General::default_health_check_max_retries")]
    pub health_check_max_retries: usize,
    /// Credentials for health probes.
    #[serde(default)]
    pub health_check_user: Option<String>,
    #[serde(default)]
    pub health_check_password: Option<String>,
    /// Statements run against a backend before it's returned to the pool.
    #[serde(default = "General::default_reset_query_list")]
    pub reset_query_list: Vec<String>,
    /// How long a graceful shutdown waits for sessions to finish.
    #[serde(default = "General::default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    /// Report a node down when a session sees its connection fail.
    #[serde(default = "General::default_true")]
    pub failover_on_backend_error: bool,
    /// External command run when a failover is executed.
    #[serde(default)]
    pub failover_command: Option<String>,
    /// PID file location.
    #[serde(default = "General::default_pid_file")]
    pub pid_file: PathBuf,
    /// Backend status persistence.
    #[serde(default = "General::default_status_file")]
    pub status_file: PathBuf,
    /// Spread read sessions over backends by weight.
    #[serde(default = "General::default_true")]
    pub load_balance_mode: bool,
    /// `database:node(weight)` redirect rules.
    #[serde(default)]
    pub database_redirect_preference_list: Option<String>,
    /// `application:node(weight)` redirect rules. Wins over the
    /// database list when both match.
    #[serde(default)]
    pub app_name_redirect_preference_list: Option<String>,
    /// Backend state changes need cluster consensus before executing.
    #[serde(default = "General::default_true")]
    pub failover_require_consensus: bool,
    /// Treat exactly half the votes as consensus on even clusters.
    #[serde(default)]
    pub enable_consensus_with_half_votes: bool,
    /// Let one node vote repeatedly for the same failover.
    #[serde(default)]
    pub allow_multiple_failover_requests_from_node: bool,
}

impl Default for General {
    fn default() -> Self {
        // serde(default) on every field makes an empty table valid.
        toml::from_str("").unwrap()
    }
}

impl General {
    fn default_host() -> String {
        "0.0.0.0".into()
    }

    fn default_port() -> u16 {
        9999
    }

    fn default_max_connections() -> usize {
        100
    }

    fn default_max_pool() -> usize {
        32
    }

    fn default_authentication_timeout() -> u64 {
        60_000
    }

    fn default_health_check_max_retries() -> usize {
        3
    }

    fn default_reset_query_list() -> Vec<String> {
        vec!["ABORT".into(), "DISCARD ALL".into()]
    }

    fn default_shutdown_timeout() -> u64 {
        60_000
    }

    fn default_true() -> bool {
        true
    }

    fn default_pid_file() -> PathBuf {
        "/var/run/pgherd/pgherd.pid".into()
    }

    fn default_status_file() -> PathBuf {
        "pgherd_status".into()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connection_life_time(&self) -> Option<Duration> {
        if self.connection_life_time == 0 {
            None
        } else {
            Some(Duration::from_millis(self.connection_life_time))
        }
    }

    pub fn authentication_timeout(&self) -> Duration {
        Duration::from_millis(self.authentication_timeout)
    }

    pub fn health_check_period(&self) -> Option<Duration> {
        if self.health_check_period == 0 {
            None
        } else {
            Some(Duration::from_millis(self.health_check_period))
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout)
    }

    /// Effective client limit.
    pub fn client_limit(&self) -> usize {
        self.max_connections.saturating_sub(self.reserved_connections)
    }
}
