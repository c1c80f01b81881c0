//! Isolated execution environments.
//!
//! A [`Sandbox`] provides a virtual filesystem rooted at the project and
//! process spawning inside it. Everything above this module treats the
//! sandbox as opaque: the local backend runs in a private directory, the
//! Docker backend runs in a long-lived container.

mod acquire;
mod docker;
mod error;
mod local;
#[cfg(test)]
pub(crate) mod memory;
mod mount;
mod output;

pub use acquire::{boot_from_config, BootFn, EnvironmentAcquirer};
pub use docker::DockerSandbox;
pub use error::SandboxError;
pub use local::LocalSandbox;
pub use mount::{MountNode, MountTree};
pub use output::{OutputStream, ReadyAnnouncer, Utf8Decoder};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Shared reference to the one live sandbox of a session.
pub type SandboxHandle = Arc<dyn Sandbox>;

/// Emitted when a spawned process starts listening on a local HTTP port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReady {
    /// Id of the [`Process`] that printed the address.
    pub process: u64,
    /// Port the server bound.
    pub port: u16,
    /// Address a browser can open.
    pub url: String,
}

impl ServerReady {
    /// A server on `localhost:port` started by process `process`.
    pub fn local(process: u64, port: u16) -> Self {
        Self {
            process,
            port,
            url: format!("http://localhost:{port}/"),
        }
    }
}

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Trait for isolated execution environments.
///
/// Paths are relative to the project root inside the sandbox and always use `/`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Returns the backend name for display.
    fn name(&self) -> &'static str;

    /// Writes every file in the tree, creating directories as needed.
    async fn mount(&self, tree: &MountTree) -> Result<(), SandboxError>;

    /// Reads a file as UTF-8 text.
    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Writes a file. The parent directory must already exist.
    async fn write_file(&self, path: &str, contents: &str) -> Result<(), SandboxError>;

    /// Lists the entry names directly under a directory.
    async fn read_dir(&self, path: &str) -> Result<Vec<String>, SandboxError>;

    /// Creates a directory and any missing parents.
    async fn mkdir(&self, path: &str) -> Result<(), SandboxError>;

    /// Removes a file or a directory tree.
    async fn rm(&self, path: &str) -> Result<(), SandboxError>;

    /// Moves a file or directory.
    async fn rename(&self, from: &str, to: &str) -> Result<(), SandboxError>;

    /// Starts a process in the project root.
    async fn spawn(&self, program: &str, args: &[String]) -> Result<Process, SandboxError>;

    /// Subscribes to "server ready" events.
    ///
    /// Events are only delivered to receivers that exist when the server
    /// comes up, so subscribe before spawning.
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;

    /// Releases backend resources. Only the host calls this, at exit.
    async fn dispose(&self) -> Result<(), SandboxError>;
}

/// A process running inside a sandbox.
///
/// Output arrives as raw chunks. The output channel closes once the process
/// has closed its stdout and stderr. Dropping the process kills it.
#[derive(Debug)]
pub struct Process {
    /// Unique for the lifetime of the program.
    pub id: u64,
    /// Raw output chunks, stdout and stderr interleaved.
    pub output: mpsc::UnboundedReceiver<String>,
    /// Resolves with the exit code.
    pub exit: oneshot::Receiver<i32>,
    /// Kills the process when used or dropped.
    pub kill: KillHandle,
}

/// The backend side of a [`Process`].
#[derive(Debug)]
pub struct ProcessIo {
    /// Same as [`Process::id`].
    pub id: u64,
    /// Send output chunks here.
    pub output: mpsc::UnboundedSender<String>,
    /// Send the exit code here once.
    pub exit: oneshot::Sender<i32>,
    /// Resolves (with `Ok` or `Err`) when the consumer wants the process gone.
    pub kill: oneshot::Receiver<()>,
}

/// Requests termination of a [`Process`].
#[derive(Debug)]
pub struct KillHandle(Option<oneshot::Sender<()>>);

impl KillHandle {
    /// Asks the backend to terminate the process.
    pub fn kill(mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

impl Process {
    /// Creates a connected consumer/backend pair.
    pub fn channel() -> (Self, ProcessIo) {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let id = NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed);

        let process = Self {
            id,
            output: output_rx,
            exit: exit_rx,
            kill: KillHandle(Some(kill_tx)),
        };
        let io = ProcessIo {
            id,
            output: output_tx,
            exit: exit_tx,
            kill: kill_rx,
        };
        (process, io)
    }

    /// Forwards every output chunk to `on_chunk`, then returns the exit code.
    pub async fn pipe_to_end<F>(self, mut on_chunk: F) -> Result<i32, SandboxError>
    where
        F: FnMut(&str) + Send,
    {
        let Self {
            mut output,
            exit,
            kill,
            ..
        } = self;

        while let Some(chunk) = output.recv().await {
            on_chunk(&chunk);
        }

        let code = exit
            .await
            .map_err(|_| SandboxError::lost("process ended without an exit code"));
        drop(kill);
        code
    }

    /// Like [`Process::pipe_to_end`], but kills the process once `deadline`
    /// elapses. `None` waits forever.
    pub async fn pipe_until<F>(
        self,
        deadline: Option<Duration>,
        on_chunk: F,
    ) -> Result<i32, SandboxError>
    where
        F: FnMut(&str) + Send,
    {
        let run = self.pipe_to_end(on_chunk);
        match deadline {
            // Dropping the timed-out future drops the process, which kills it.
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .unwrap_or_else(|_| Err(SandboxError::timeout(limit))),
            None => run.await,
        }
    }
}

/// Finds a local HTTP address announced in process output and returns its
/// port.
///
/// Dev servers colour parts of the URL, so escape sequences are stripped
/// before matching.
pub fn detect_server_url(chunk: &str) -> Option<u16> {
    const HOSTS: &[&str] = &["http://localhost:", "http://127.0.0.1:", "http://0.0.0.0:"];

    let text = strip_ansi(chunk);
    HOSTS.iter().find_map(|host| {
        let start = text.find(host)? + host.len();
        let digits: String = text[start..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        digits.parse().ok()
    })
}

/// Removes ANSI CSI escape sequences (`ESC [ ... final`).
fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if ('@'..='~').contains(&next) {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Writes a file after creating its parent directory.
pub async fn write_with_parent(
    sandbox: &dyn Sandbox,
    path: &str,
    contents: &str,
) -> Result<(), SandboxError> {
    if let Some(parent) = parent_dir(path) {
        sandbox.mkdir(parent).await?;
    }
    sandbox.write_file(path, contents).await
}

/// Returns the parent directory of a sandbox path, if it has one.
pub fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|parent| !parent.is_empty())
}
