//! Create, delete and rename for the file tree.
//!
//! Delete and rename change the sandbox first and only touch the buffer
//! once that succeeded. Create adds the buffer entry first and removes it
//! again if the sandbox write fails. Failures are returned and also
//! published on an error channel the UI can show and dismiss.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::buffer::{normalize_path, EditBuffer, EntryKind};
use crate::sandbox::{parent_dir, write_with_parent, SandboxError, SandboxHandle};

/// Which file operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    /// Creating a file.
    Create,
    /// Deleting a file or folder.
    Delete,
    /// Renaming a file or folder.
    Rename,
}

impl std::fmt::Display for FileOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Delete => write!(f, "delete"),
            Self::Rename => write!(f, "rename"),
        }
    }
}

/// A failed file operation, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("Failed to {op} {path}: {message}")]
pub struct FileOpError {
    /// The operation that failed.
    pub op: FileOp,
    /// The path it was applied to.
    pub path: String,
    /// Short user-facing message.
    pub message: String,
    /// Technical detail for the curious.
    pub details: Option<String>,
    /// Trying again may succeed.
    pub retryable: bool,
}

impl FileOpError {
    /// The request itself is invalid; retrying will not help.
    pub fn rejected(op: FileOp, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    /// The sandbox refused the change.
    pub fn sandbox(op: FileOp, path: impl Into<String>, error: &SandboxError) -> Self {
        Self {
            op,
            path: path.into(),
            message: "The sandbox could not apply the change".to_string(),
            details: Some(error.to_string()),
            retryable: true,
        }
    }
}

/// Outcome of a file operation.
pub type FileOpResult = Result<(), FileOpError>;

/// Applies file tree changes to the sandbox and the edit buffer.
pub struct FileOperations {
    sandbox: SandboxHandle,
    buffer: Arc<watch::Sender<EditBuffer>>,
    errors: watch::Sender<Option<FileOpError>>,
}

impl FileOperations {
    /// Creates a coordinator over a live sandbox and the host's buffer.
    pub fn new(sandbox: SandboxHandle, buffer: Arc<watch::Sender<EditBuffer>>) -> Self {
        Self {
            sandbox,
            buffer,
            errors: watch::channel(None).0,
        }
    }

    /// Adds an empty file.
    pub async fn create(&self, path: &str) -> FileOpResult {
        let path = self.normalize(FileOp::Create, path)?;

        let added = self.buffer.send_if_modified(|buffer| {
            if buffer.contains(&path) {
                return false;
            }
            buffer.insert(path.as_str(), "");
            true
        });
        if !added {
            return self.fail(FileOpError::rejected(
                FileOp::Create,
                path,
                "A file with that name already exists",
            ));
        }

        if let Err(e) = write_with_parent(&*self.sandbox, &path, "").await {
            self.buffer.send_modify(|buffer| {
                buffer.remove(&path);
            });
            return self.fail(FileOpError::sandbox(FileOp::Create, path, &e));
        }

        info!("Created {}", path);
        Ok(())
    }

    /// Deletes a file, or a folder and everything under it.
    pub async fn delete(&self, path: &str, kind: EntryKind) -> FileOpResult {
        let path = self.normalize(FileOp::Delete, path)?;
        let affected = self.buffer.borrow().affected_paths(&path, kind);
        if affected.is_empty() {
            return self.fail(FileOpError::rejected(FileOp::Delete, path, "Nothing to delete"));
        }

        match self.sandbox.rm(&path).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("{} was never synced", path),
            Err(e) => return self.fail(FileOpError::sandbox(FileOp::Delete, path, &e)),
        }

        self.buffer.send_modify(|buffer| {
            for p in &affected {
                buffer.remove(p);
            }
        });
        info!("Deleted {} ({} files)", path, affected.len());
        Ok(())
    }

    /// Moves a file, or a folder and everything under it.
    pub async fn rename(&self, from: &str, to: &str, kind: EntryKind) -> FileOpResult {
        let from = self.normalize(FileOp::Rename, from)?;
        let to = self.normalize(FileOp::Rename, to)?;
        if from == to {
            return Ok(());
        }
        if kind == EntryKind::Folder && to.starts_with(&format!("{from}/")) {
            return self.fail(FileOpError::rejected(
                FileOp::Rename,
                from,
                "A folder cannot be moved into itself",
            ));
        }

        let pairs = {
            let buffer = self.buffer.borrow();
            let pairs = buffer.rename_pairs(&from, &to, kind);
            if let Some((_, taken)) = pairs.iter().find(|(_, new)| buffer.contains(new)) {
                let message = format!("{taken} already exists");
                drop(buffer);
                return self.fail(FileOpError::rejected(FileOp::Rename, from, message));
            }
            pairs
        };
        if pairs.is_empty() {
            return self.fail(FileOpError::rejected(FileOp::Rename, from, "Nothing to rename"));
        }

        if let Err(e) = self.rename_in_sandbox(&from, &to).await {
            return self.fail(FileOpError::sandbox(FileOp::Rename, from, &e));
        }

        self.buffer.send_modify(|buffer| {
            for (old, new) in &pairs {
                if let Some(content) = buffer.remove(old) {
                    buffer.insert(new.as_str(), content);
                }
            }
        });
        info!("Renamed {} to {} ({} files)", from, to, pairs.len());
        Ok(())
    }

    /// The error currently shown, if any.
    pub fn last_error(&self) -> Option<FileOpError> {
        self.errors.borrow().clone()
    }

    /// Watches the error channel.
    pub fn subscribe_errors(&self) -> watch::Receiver<Option<FileOpError>> {
        self.errors.subscribe()
    }

    /// Hides the current error.
    pub fn dismiss_error(&self) {
        self.errors.send_replace(None);
    }

    async fn rename_in_sandbox(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        if let Some(parent) = parent_dir(to) {
            self.sandbox.mkdir(parent).await?;
        }
        match self.sandbox.rename(from, to).await {
            Err(e) if e.is_not_found() => {
                debug!("{} was never synced", from);
                Ok(())
            }
            result => result,
        }
    }

    fn normalize(&self, op: FileOp, path: &str) -> Result<String, FileOpError> {
        normalize_path(path)
            .ok_or_else(|| self.publish(FileOpError::rejected(op, path, "Invalid path")))
    }

    fn fail(&self, error: FileOpError) -> FileOpResult {
        Err(self.publish(error))
    }

    fn publish(&self, error: FileOpError) -> FileOpError {
        warn!("{}", error);
        self.errors.send_replace(Some(error.clone()));
        error
    }
}
