//! Filesystem watcher driving the reload pipeline.
//!
//! notify delivers events on its own thread; they are forwarded into a
//! channel drained by one tokio task, which runs one reload per qualifying
//! event, strictly in order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::reload::{ReloadObserver, ReloadPipeline};

/// Create, write, remove and rename qualify; access and metadata changes do not.
pub fn qualifies(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
    )
}

fn is_removal(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)))
}

/// A running watch loop. Dropping it without [`WatchHandle::stop`] leaves
/// the loop running until the runtime's tasks are torn down.
pub struct WatchHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Cancel the loop; queued events that have not started are dropped.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

pub fn spawn_watcher(
    pipeline: Arc<ReloadPipeline>,
    roots: Vec<PathBuf>,
    observer: ReloadObserver,
) -> Result<WatchHandle> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let mut watcher = notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
        match res {
            Ok(event) if qualifies(&event.kind) => {
                let _ = tx.send(event);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "filesystem watcher error"),
        }
    })?;
    for root in &roots {
        watcher.watch(root, RecursiveMode::Recursive)?;
        info!(path = %root.display(), "watching local bundle path (recursive)");
    }

    let (shutdown, mut cancelled) = watch::channel(false);
    let task = tokio::spawn(async move {
        // Owned by the loop so it lives exactly as long as the loop does.
        let watcher: RecommendedWatcher = watcher;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancelled.changed() => break,
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            debug!(kind = ?event.kind, paths = ?event.paths, "registered file event");
            if is_removal(&event.kind) {
                for path in &event.paths {
                    debug!(path = %path.display(), "removed path");
                }
            }
            let started = Instant::now();
            let outcome = pipeline.reload().await;
            observer(started.elapsed(), outcome.as_ref().err());
        }
        drop(watcher);
        debug!("watch loop stopped");
    });

    Ok(WatchHandle { shutdown, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

    #[test]
    fn classifies_event_kinds() {
        assert!(qualifies(&EventKind::Create(CreateKind::File)));
        assert!(qualifies(&EventKind::Modify(ModifyKind::Data(DataChange::Content))));
        assert!(qualifies(&EventKind::Modify(ModifyKind::Name(RenameMode::From))));
        assert!(qualifies(&EventKind::Remove(RemoveKind::File)));
        assert!(!qualifies(&EventKind::Access(AccessKind::Read)));
        assert!(!qualifies(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions))));

        assert!(is_removal(&EventKind::Remove(RemoveKind::Any)));
        assert!(!is_removal(&EventKind::Create(CreateKind::Any)));
    }
}
