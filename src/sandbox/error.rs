//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings. Boot failures are split
//! into "the backend cannot run here at all" and "the backend ran but
//! could not start", since only the latter is worth retrying.

use std::time::Duration;

/// Errors that can occur during sandbox operations.
///
/// `Clone` so a single failed boot can be handed to every caller that
/// was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    /// The backend cannot run in this environment (daemon down, root not writable).
    #[error("Sandbox backend is not available: {message}")]
    Unavailable {
        /// What was missing.
        message: String,
    },

    /// Container image was not found.
    #[error("Sandbox image not found: {image}")]
    ImageNotFound {
        /// The image reference that was looked up.
        image: String,
    },

    /// The backend was reachable but the environment failed to start.
    #[error("Sandbox failed to boot: {message}")]
    BootFailed {
        /// Underlying failure.
        message: String,
    },

    /// A path did not exist inside the sandbox.
    #[error("No such file or directory in sandbox: {path}")]
    NotFound {
        /// The sandbox-relative path.
        path: String,
    },

    /// A filesystem operation failed.
    #[error("Sandbox {op} failed for {path}: {message}")]
    Io {
        /// Operation name (`write`, `mkdir`, `rm`, ...).
        op: &'static str,
        /// The sandbox-relative path.
        path: String,
        /// Underlying failure.
        message: String,
    },

    /// A process could not be started.
    #[error("Failed to spawn '{command}': {message}")]
    Spawn {
        /// The command line that was spawned.
        command: String,
        /// Underlying failure.
        message: String,
    },

    /// A running process vanished without reporting how it ended.
    #[error("Sandbox process lost: {message}")]
    ProcessLost {
        /// What went missing.
        message: String,
    },

    /// A bounded operation exceeded its deadline.
    #[error("Sandbox operation timed out after {timeout_secs} seconds")]
    Timeout {
        /// The deadline that elapsed.
        timeout_secs: u64,
    },
}

impl SandboxError {
    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `BootFailed` error.
    pub fn boot_failed(message: impl Into<String>) -> Self {
        Self::BootFailed {
            message: message.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Creates an `Io` error.
    pub fn io(op: &'static str, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Io {
            op,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Maps a `std::io::Error`, keeping "not found" distinct.
    pub fn from_io(op: &'static str, path: &str, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::not_found(path)
        } else {
            Self::io(op, path, err.to_string())
        }
    }

    /// Creates a `Spawn` error.
    pub fn spawn(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Spawn {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Creates a `ProcessLost` error.
    pub fn lost(message: impl Into<String>) -> Self {
        Self::ProcessLost {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if a process disappeared without an exit code.
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::ProcessLost { .. })
    }

    /// Returns true if the backend cannot run here at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns true if this is an image not found error.
    pub fn is_image_not_found(&self) -> bool {
        matches!(self, Self::ImageNotFound { .. })
    }

    /// Returns true if the path was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for failures that happened while booting the environment.
    pub fn is_boot_failure(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::ImageNotFound { .. } | Self::BootFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_error() {
        let err = SandboxError::unavailable("daemon not running");
        assert!(err.is_unavailable());
        assert!(err.is_boot_failure());
        assert!(!err.is_timeout());
        assert_eq!(
            err.to_string(),
            "Sandbox backend is not available: daemon not running"
        );
    }

    #[test]
    fn test_image_not_found_error() {
        let err = SandboxError::image_not_found("node:20");
        assert!(err.is_image_not_found());
        assert!(err.is_boot_failure());
        assert_eq!(err.to_string(), "Sandbox image not found: node:20");
    }

    #[test]
    fn test_timeout_error() {
        let err = SandboxError::timeout(Duration::from_secs(90));
        assert!(err.is_timeout());
        assert!(!err.is_boot_failure());
        assert_eq!(
            err.to_string(),
            "Sandbox operation timed out after 90 seconds"
        );
    }

    #[test]
    fn test_io_error_display() {
        let err = SandboxError::io("write", "src/a.js", "disk full");
        assert_eq!(
            err.to_string(),
            "Sandbox write failed for src/a.js: disk full"
        );
    }

    #[test]
    fn test_from_io_keeps_not_found_distinct() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(SandboxError::from_io("rm", "src", &missing).is_not_found());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = SandboxError::from_io("rm", "src", &denied);
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_spawn_error() {
        let err = SandboxError::spawn("npm install", "No such file");
        assert_eq!(err.to_string(), "Failed to spawn 'npm install': No such file");
        assert!(!err.is_boot_failure());
    }

    #[test]
    fn test_error_variants_are_distinct() {
        let timeout = SandboxError::timeout(Duration::from_secs(60));
        let unavailable = SandboxError::unavailable("test");
        let image = SandboxError::image_not_found("test");

        assert!(timeout.is_timeout());
        assert!(!timeout.is_unavailable());
        assert!(!timeout.is_image_not_found());

        assert!(!unavailable.is_timeout());
        assert!(unavailable.is_unavailable());
        assert!(!unavailable.is_image_not_found());

        assert!(!image.is_timeout());
        assert!(!image.is_unavailable());
        assert!(image.is_image_not_found());
    }
}
