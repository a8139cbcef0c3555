//! Local debris: quarantine instead of deletion.
//!
//! When the cloud side of a synced entry vanishes, the local copy is moved
//! into a dated folder under the sync's debris directory rather than
//! removed, so a surprising decision is always recoverable by the user.
//!
//! Layout: `.debris/YYYY-MM-DD/<name>`, falling back to
//! `.debris/YYYY-MM-DD HH.MM.SS.NN/<name>` suffixes when the plain dated
//! folder already holds an entry with that name. After about a hundred
//! attempts the move is abandoned for this pass.

use std::path::Path;

use chrono::Local;
use tracing::{debug, warn};

use skysync_core::ports::IFileSystem;

/// Moves `target` into a dated folder under `debris_root`.
///
/// Returns true when the entry was relocated. A transient rename failure
/// gives up immediately so the row retries after its backoff; name
/// collisions walk through timestamped suffixes.
pub fn move_to_local_debris(fs: &dyn IFileSystem, debris_root: &Path, target: &Path) -> bool {
    let Some(leaf) = target.file_name() else {
        return false;
    };
    let now = Local::now();
    let day = now.format("%Y-%m-%d").to_string();

    for attempt in -3i32..100 {
        if attempt == -2 || attempt > 95 {
            debug!(path = %debris_root.display(), "creating debris folder");
            let _ = fs.mkdir(debris_root, true);
        }

        let folder = if attempt >= 0 {
            format!("{day} {}.{:02}", now.format("%H.%M.%S"), attempt)
        } else {
            day.clone()
        };
        let dated = debris_root.join(folder);

        if attempt > -3 {
            // Either creates the daily folder or it already exists.
            let _ = fs.mkdir(&dated, false);
        }

        let destination = dated.join(leaf);
        if fs.open(&destination, false).is_ok() {
            // Occupied; try the next suffix.
            continue;
        }

        match fs.rename(target, &destination) {
            Ok(()) => {
                debug!(
                    from = %target.display(),
                    to = %destination.display(),
                    "moved to local debris"
                );
                return true;
            }
            Err(err) if err.is_transient() => {
                warn!(path = %target.display(), error = %err, "debris move blocked");
                return false;
            }
            Err(_) => continue,
        }
    }

    warn!(path = %target.display(), "exhausted debris name attempts");
    false
}
