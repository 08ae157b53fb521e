//! OS signal funnel.
//!
//! Signal handlers only flip notifications; everything substantive
//! happens at loop boundaries in the tasks that observe them.
//! SIGTERM asks for a smart shutdown (stop accepting, wait for
//! sessions), SIGINT a fast one (abort at the next boundary),
//! SIGQUIT exits immediately.

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::frontend::comms::{comms, ShutdownMode};

/// Install signal listeners.
pub fn listen() {
    tokio::spawn(async {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => return,
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(quit) => quit,
            Err(_) => return,
        };

        loop {
            tokio::select! {
                _ = term.recv() => {
                    info!("SIGTERM received, smart shutdown");
                    comms().shutdown(ShutdownMode::Smart);
                }

                _ = quit.recv() => {
                    info!("SIGQUIT received, exiting now");
                    std::process::exit(0);
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, fast shutdown");
                    comms().shutdown(ShutdownMode::Fast);
                }
            }
        }
    });
}
