//! The async run loop.
//!
//! Ties the pieces together: filesystem notifications mark tree nodes, scan
//! completions wake the loop, and a poll interval catches everything driven
//! by timers (blocked-row backoffs, notification quiet time, remote
//! acknowledgements observed through the cloud port).
//!
//! ```text
//! FileWatcher ──→ mpsc ──→ ┐
//! scan workers ─→ cookie ─→ ├──→ Sync::tick()
//! interval ────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::{Sync, SyncError, SyncState};

/// How often the loop runs a pass with no other wake-up.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Drives the sync until its notification channel closes or it stops
/// running (cancelled or failed).
pub async fn run(
    sync: &mut Sync,
    changes: &mut mpsc::UnboundedReceiver<PathBuf>,
) -> Result<(), SyncError> {
    info!("sync run loop starting");
    let cookie = sync.scan_cookie();
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        if matches!(sync.state(), SyncState::Canceled | SyncState::Failed) {
            info!(state = ?sync.state(), "sync run loop stopping");
            return Ok(());
        }

        tokio::select! {
            changed = changes.recv() => {
                match changed {
                    Some(path) => sync.note_path_changed(&path),
                    None => {
                        info!("notification channel closed, run loop exiting");
                        return Ok(());
                    }
                }
            }
            _ = cookie.notified() => {
                debug!("scan completion wake-up");
            }
            _ = poll.tick() => {}
        }

        // Fold any burst of queued notifications into this pass.
        while let Ok(path) = changes.try_recv() {
            sync.note_path_changed(&path);
        }

        sync.tick()?;
    }
}
