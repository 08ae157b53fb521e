//! Backend status persistence.
//!
//! The status file is rewritten on every transition and read back at
//! boot so a restart doesn't resurrect a detached node.

use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{BackendNode, NodeStatus};

/// Writer for the status file and the PID file.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Persist current statuses, one line per node.
    pub fn write(&self, nodes: &[BackendNode]) -> std::io::Result<()> {
        let mut file = std::fs::File::create(&self.path)?;

        writeln!(file, "# last updated {}", Utc::now().to_rfc3339())?;
        for node in nodes {
            writeln!(file, "{}", node.status)?;
        }

        Ok(())
    }

    /// Load statuses from a previous run, if the file exists and
    /// parses. Anything else starts the cluster fresh.
    pub fn load(&self) -> Option<Vec<NodeStatus>> {
        let raw = std::fs::read_to_string(&self.path).ok()?;

        let statuses: Vec<NodeStatus> = raw
            .lines()
            .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
            .map(|line| match line.trim() {
                "up" => NodeStatus::Up,
                "down" => NodeStatus::Down,
                "quarantine" => NodeStatus::Quarantined,
                _ => NodeStatus::ConnectWait,
            })
            .collect();

        if statuses.is_empty() {
            None
        } else {
            Some(statuses)
        }
    }
}

/// Write our PID so operators can signal us.
pub fn write_pid_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
}

/// Best effort; the file may already be gone.
pub fn remove_pid_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}
