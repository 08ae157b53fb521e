//! Command-line interface. A thin wrapper: everything interesting
//! lives in the config file.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pgherd",
    version,
    about = "PostgreSQL pooler, load balancer and failover coordinator"
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "pgherd.toml")]
    pub config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,

    /// Check the configuration and exit.
    #[arg(long, default_value_t = false)]
    pub check: bool,
}

impl Cli {
    pub fn load() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["pgherd"]);
        assert_eq!(cli.config, PathBuf::from("pgherd.toml"));
        assert!(!cli.json_logs);
        assert!(!cli.check);
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from(["pgherd", "-c", "/etc/pgherd.toml", "--json-logs", "--check"]);
        assert_eq!(cli.config, PathBuf::from("/etc/pgherd.toml"));
        assert!(cli.json_logs);
        assert!(cli.check);
    }
}
