//! Process-wide cluster state: backend node registry, the node
//! operation request channel, and failover execution.

pub mod failover;
pub mod registry;
pub mod request;
pub mod status_file;

pub use registry::{registry, BackendNode, NodeStatus, Registry};
pub use status_file::StatusFile;
pub use request::{requests, NodeOpFlags, NodeOpKind, NodeOpRequest};
