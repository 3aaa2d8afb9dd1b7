//! Socket removal detection.
//!
//! A notify watcher on the socket's directory drives the check; a polling
//! interval backs it up when the watcher cannot be created or misses events.

use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::ServerError;

pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(1);

fn dir_watcher(
    dir: &Path,
) -> Result<(RecommendedWatcher, mpsc::Receiver<Event>), Report<ServerError>> {
    let (fs_tx, fs_rx) = mpsc::channel(64);
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            // A full queue already guarantees a pending check.
            Ok(event) => {
                let _ = fs_tx.try_send(event);
            }
            Err(e) => warn!(error = %e, "socket directory watch error"),
        },
        Config::default(),
    )
    .change_context_lazy(|| ServerError::Watch {
        path: dir.display().to_string(),
    })?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .change_context_lazy(|| ServerError::Watch {
            path: dir.display().to_string(),
        })?;

    Ok((watcher, fs_rx))
}

/// Wait until `socket_path` no longer exists.
///
/// Returns `false` when `token` is cancelled first.
pub(crate) async fn wait_for_removal(
    socket_path: &Path,
    token: &CancellationToken,
    poll_every: Duration,
) -> bool {
    let dir = socket_path.parent().unwrap_or_else(|| Path::new("/"));
    let (_watcher, mut fs_rx) = match dir_watcher(dir) {
        Ok((watcher, fs_rx)) => (Some(watcher), fs_rx),
        Err(e) => {
            warn!(error = ?e, "falling back to polling for socket removal");
            let (_, fs_rx) = mpsc::channel(1);
            (None, fs_rx)
        }
    };

    let mut poll = interval(poll_every);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return false,
            Some(event) = fs_rx.recv() => {
                debug!(kind = ?event.kind, "socket directory event");
            }
            _ = poll.tick() => {}
        }

        if !socket_path.exists() {
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;
    use test_log::test;

    use super::*;

    #[test(tokio::test)]
    async fn removal_is_detected() {
        let dir = TempDir::new().expect("should create temp dir");
        let socket = dir.path().join("intel.com_nics.sock");
        fs::write(&socket, b"").expect("should create file");
        let token = CancellationToken::new();

        let waiter = {
            let socket = socket.clone();
            let token = token.clone();
            tokio::spawn(async move {
                wait_for_removal(&socket, &token, Duration::from_millis(20)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::remove_file(&socket).expect("should remove file");

        let removed = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("should notice removal")
            .expect("task should not panic");
        assert!(removed);
    }

    #[test(tokio::test)]
    async fn cancellation_stops_waiting() {
        let dir = TempDir::new().expect("should create temp dir");
        let socket = dir.path().join("intel.com_nics.sock");
        fs::write(&socket, b"").expect("should create file");
        let token = CancellationToken::new();
        token.cancel();

        let removed = wait_for_removal(&socket, &token, Duration::from_millis(20)).await;

        assert!(!removed);
        assert!(socket.exists());
    }
}
