//! Background sync of the edit buffer into the sandbox filesystem.
//!
//! Edits are batched: every change restarts a quiet-period timer and one
//! pass runs when it fires. A pass writes only the paths whose contents
//! differ from what the previous pass wrote. Passes never overlap, since
//! the next wait starts only after the previous pass returns. Nothing is
//! ever read back from the sandbox.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::buffer::EditBuffer;
use crate::sandbox::{write_with_parent, Sandbox, SandboxHandle};

/// Keeps a sandbox eventually consistent with an edit buffer.
pub struct FileSyncEngine {
    sandbox: SandboxHandle,
    buffer: watch::Receiver<EditBuffer>,
    ready: watch::Receiver<bool>,
    debounce: Duration,
    snapshot: BTreeMap<String, String>,
}

/// Stops the engine when dropped.
#[derive(Debug)]
pub struct FileSyncHandle {
    task: JoinHandle<()>,
}

impl FileSyncHandle {
    /// Stops the engine. A pending debounce timer is discarded.
    pub fn stop(self) {}
}

impl Drop for FileSyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Trigger {
    Edit,
    Ready(bool),
}

impl FileSyncEngine {
    /// Starts syncing `buffer` into `sandbox`.
    ///
    /// The buffer's value at spawn time is assumed to be in the sandbox
    /// already. Nothing is written while `ready` is false; when it turns
    /// true every buffered file is written once.
    pub fn spawn(
        sandbox: SandboxHandle,
        mut buffer: watch::Receiver<EditBuffer>,
        ready: watch::Receiver<bool>,
        debounce: Duration,
    ) -> FileSyncHandle {
        let snapshot = buffer.borrow_and_update().as_map().clone();
        let engine = Self {
            sandbox,
            buffer,
            ready,
            debounce,
            snapshot,
        };
        FileSyncHandle {
            task: tokio::spawn(engine.run()),
        }
    }

    async fn run(mut self) {
        loop {
            let trigger = tokio::select! {
                changed = self.buffer.changed() => changed.map(|()| Trigger::Edit),
                changed = self.ready.changed() => {
                    changed.map(|()| Trigger::Ready(*self.ready.borrow_and_update()))
                }
            };

            match trigger {
                Ok(Trigger::Edit) => {}
                Ok(Trigger::Ready(true)) => {
                    debug!("Sandbox ready, resyncing every file");
                    self.snapshot.clear();
                }
                Ok(Trigger::Ready(false)) => continue,
                Err(_) => break,
            }

            if !self.settle().await {
                break;
            }

            if !*self.ready.borrow() {
                debug!("Sandbox not ready, deferring sync");
                continue;
            }

            let current = self.buffer.borrow_and_update().clone();
            self.sync_pass(&current).await;
        }
        debug!("File sync stopped");
    }

    /// Waits until the buffer has been quiet for one debounce window.
    /// Returns false once the buffer's sender is gone.
    async fn settle(&mut self) -> bool {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.debounce) => return true,
                changed = self.buffer.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn sync_pass(&mut self, current: &EditBuffer) {
        let changed: Vec<(&String, &String)> = current
            .iter()
            .filter(|(path, contents)| self.snapshot.get(*path) != Some(*contents))
            .collect();
        if changed.is_empty() {
            return;
        }
        debug!("Syncing {} changed files", changed.len());

        let sandbox: &dyn Sandbox = &*self.sandbox;
        let results = join_all(changed.iter().map(|(path, contents)| async move {
            (*path, write_with_parent(sandbox, path, contents).await)
        }))
        .await;

        let mut next = current.as_map().clone();
        for (path, result) in results {
            match result {
                Ok(()) => debug!("Synced {}", path),
                Err(e) => {
                    // Left stale so the next pass retries it.
                    warn!("Failed to sync {}: {}", path, e);
                    match self.snapshot.get(path) {
                        Some(previous) => next.insert(path.clone(), previous.clone()),
                        None => next.remove(path),
                    };
                }
            }
        }
        self.snapshot = next;
    }
}
