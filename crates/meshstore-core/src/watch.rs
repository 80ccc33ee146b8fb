//! File-creation events for the watched directory.
//!
//! Realized as a polling scanner: every tick the directory is listed and
//! any regular file not seen before is reported exactly once.  Files
//! already present at startup are reported on the first pass.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Scan `dir` every `interval`, sending each newly sighted file path on
/// `events`.  Exits when `stop` fires or the receiver is dropped.
pub fn spawn_scanner(
    dir: PathBuf,
    interval: Duration,
    events: mpsc::Sender<PathBuf>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = async { while stop.changed().await.is_ok() { if *stop.borrow() { break; } } } => break,
                _ = tick.tick() => {
                    if !scan_once(&dir, &mut seen, &events).await {
                        break;
                    }
                }
            }
        }
        debug!(dir = %dir.display(), "watch loop stopped");
    })
}

/// One pass over the directory.  Returns `false` once the event receiver
/// has gone away.
async fn scan_once(
    dir: &PathBuf,
    seen: &mut HashSet<PathBuf>,
    events: &mpsc::Sender<PathBuf>,
) -> bool {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), %err, "failed to scan watch directory");
            return true;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "failed to read watch entry");
                break;
            }
        };
        let path = entry.path();
        let Ok(kind) = entry.file_type().await else {
            continue;
        };
        if !kind.is_file() {
            continue;
        }
        if seen.insert(path.clone()) {
            debug!(path = %path.display(), "new file in watch directory");
            if events.send(path).await.is_err() {
                return false;
            }
        }
    }
    true
}
