//! Frontend sessions: accepting clients, authentication,
//! load balancing and the proxy loop.

pub mod auth;
pub mod cancel;
pub mod client;
pub mod comms;
pub mod error;
pub mod lb;
pub mod listener;

pub use comms::comms;
pub use error::Error;
pub use listener::Listener;

/// What a proxy-loop iteration decided. Every iteration is an
/// independent recovery boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResult {
    /// Keep going.
    Continue,
    /// Session caught between transactions; hand the backend back
    /// to the pool and close the client.
    Idle,
    /// Client finished cleanly with Terminate.
    End,
    /// Session is broken; close it, don't cache the backend.
    Error,
    /// Session task should exit immediately.
    Fatal,
    /// Backend reported a deadlock; force failover of its node.
    Deadlock,
    /// The backend connection died mid-session.
    BackendGone(usize),
}
