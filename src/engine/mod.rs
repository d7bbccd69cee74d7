//! Per-source polling and its supervision.
//!
//! Each configured source gets its own [`Poller`] running as an
//! independent task with its own dedup cache. Nothing flows between them;
//! the supervisor only joins them for process-lifetime bookkeeping.

mod poller;

pub use poller::{CycleReport, Outcome, Poller};

use tokio::sync::watch;
use tracing::{error, info};

/// Spawn every poller and wait for all of them to stop.
///
/// Pollers only stop when `shutdown` fires, so in practice this returns on
/// process shutdown.
pub async fn supervise(pollers: Vec<Poller>, shutdown: watch::Receiver<bool>) {
    let handles: Vec<_> = pollers
        .into_iter()
        .map(|poller| {
            let source = poller.source_type();
            info!(%source, "starting poller");
            (source, tokio::spawn(poller.run(shutdown.clone())))
        })
        .collect();

    for (source, handle) in handles {
        if let Err(e) = handle.await {
            error!(%source, error = %e, "poller task aborted");
        }
    }
}
