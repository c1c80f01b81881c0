//! Sandbox backed by a private directory on the host.
//!
//! Processes run with the directory as their working directory. This gives
//! filesystem separation from the user's checkout, not security isolation;
//! use the Docker backend for that.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{MountTree, OutputStream, Process, ReadyAnnouncer, Sandbox, SandboxError, ServerReady};
use crate::config::{expand_path, SandboxConfig};

/// Runs projects in a directory on this machine.
#[derive(Debug)]
pub struct LocalSandbox {
    root: PathBuf,
    /// Remove `root` on dispose (only for directories we created).
    owned: bool,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl LocalSandbox {
    /// Creates the working directory and returns a sandbox rooted there.
    pub async fn boot(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let (root, owned) = match &config.root {
            Some(root) => (
                expand_path(root).map_err(|e| SandboxError::unavailable(e.to_string()))?,
                false,
            ),
            None => (default_root(), true),
        };

        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            SandboxError::unavailable(format!(
                "cannot create sandbox directory {}: {e}",
                root.display()
            ))
        })?;

        info!("Local sandbox at {}", root.display());
        Ok(Self::at(root, owned))
    }

    /// Wraps an existing directory.
    pub fn at(root: PathBuf, owned: bool) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            root,
            owned,
            ready_tx,
        }
    }

    /// The host directory backing this sandbox.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a sandbox path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SandboxError::io("resolve", path, "path escapes sandbox root"));
        }
        Ok(self.root.join(relative))
    }
}

fn default_root() -> PathBuf {
    let id = uuid::Uuid::new_v4().simple().to_string();
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sandsync")
        .join(&id[..8])
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn mount(&self, tree: &MountTree) -> Result<(), SandboxError> {
        for dir in tree.directories() {
            self.mkdir(&dir).await?;
        }
        for (path, contents) in tree.flatten() {
            self.write_file(&path, &contents).await?;
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| SandboxError::from_io("read", path, &e))
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), SandboxError> {
        let full = self.resolve(path)?;
        tokio::fs::write(&full, contents)
            .await
            .map_err(|e| SandboxError::from_io("write", path, &e))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        let full = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| SandboxError::from_io("readdir", path, &e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SandboxError::from_io("readdir", path, &e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn mkdir(&self, path: &str) -> Result<(), SandboxError> {
        let full = self.resolve(path)?;
        tokio::fs::create_dir_all(&full)
            .await
            .map_err(|e| SandboxError::from_io("mkdir", path, &e))
    }

    async fn rm(&self, path: &str) -> Result<(), SandboxError> {
        let full = self.resolve(path)?;
        let meta = tokio::fs::symlink_metadata(&full)
            .await
            .map_err(|e| SandboxError::from_io("rm", path, &e))?;

        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        result.map_err(|e| SandboxError::from_io("rm", path, &e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::from_io("rename", to, &e))?;
        }
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| SandboxError::from_io("rename", from, &e))
    }

    async fn spawn(&self, program: &str, args: &[String]) -> Result<Process, SandboxError> {
        let command_line = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        debug!("Spawning in {}: {}", self.root.display(), command_line);

        let mut child = tokio::process::Command::new(program)
            .current_dir(&self.root)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::spawn(&command_line, e.to_string()))?;

        let (process, io) = Process::channel();
        let mut kill = io.kill;
        let announcer = ReadyAnnouncer::new(io.id, self.ready_tx.clone());

        if let Some(stdout) = child.stdout.take() {
            let stream = OutputStream::new(Arc::clone(&announcer));
            tokio::spawn(forward_output(stdout, io.output.clone(), stream));
        }
        if let Some(stderr) = child.stderr.take() {
            let stream = OutputStream::new(announcer);
            tokio::spawn(forward_output(stderr, io.output.clone(), stream));
        }
        drop(io.output);

        let exit = io.exit;
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(e) => {
                        warn!("Failed to wait for '{}': {}", command_line, e);
                        -1
                    }
                },
                _ = &mut kill => {
                    debug!("Killing '{}'", command_line);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill '{}': {}", command_line, e);
                    }
                    -1
                }
            };
            debug!("'{}' exited with code {}", command_line, code);
            let _ = exit.send(code);
        });

        Ok(process)
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn dispose(&self) -> Result<(), SandboxError> {
        if !self.owned {
            return Ok(());
        }
        debug!("Removing sandbox directory {}", self.root.display());
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::from_io("rm", &self.root.display().to_string(), &e)),
        }
    }
}

/// Copies decoded output into the process channel.
async fn forward_output<R>(
    mut reader: R,
    output: mpsc::UnboundedSender<String>,
    mut stream: OutputStream,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = stream.feed(&buf[..n]);
                if !chunk.is_empty() && output.send(chunk).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Error reading process output: {}", e);
                break;
            }
        }
    }
    if let Some(rest) = stream.finish() {
        let _ = output.send(rest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn sandbox_in(dir: &tempfile::TempDir) -> LocalSandbox {
        LocalSandbox::at(dir.path().to_path_buf(), false)
    }

    #[tokio::test]
    async fn test_mount_and_read_back() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);
        let files: BTreeMap<String, String> = [
            ("index.js".to_string(), "export const x = 1;".to_string()),
            ("src/app.js".to_string(), "app".to_string()),
        ]
        .into_iter()
        .collect();

        sandbox.mount(&MountTree::from_files(&files)).await.unwrap();

        assert_eq!(sandbox.read_file("src/app.js").await.unwrap(), "app");
        assert_eq!(
            sandbox.read_dir("").await.unwrap(),
            vec!["index.js".to_string(), "src".to_string()]
        );
    }

    #[tokio::test]
    async fn test_write_requires_parent() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);
        let err = sandbox.write_file("missing/a.txt", "x").await.unwrap_err();
        assert!(err.is_not_found());

        sandbox.mkdir("missing").await.unwrap();
        sandbox.write_file("missing/a.txt", "x").await.unwrap();
    }

    #[tokio::test]
    async fn test_rm_and_rename() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);
        sandbox.mkdir("a").await.unwrap();
        sandbox.write_file("a/x.js", "x").await.unwrap();

        sandbox.rename("a", "b").await.unwrap();
        assert_eq!(sandbox.read_file("b/x.js").await.unwrap(), "x");
        assert!(sandbox.read_file("a/x.js").await.unwrap_err().is_not_found());

        sandbox.rm("b").await.unwrap();
        assert!(sandbox.rm("b").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_paths_cannot_escape_root() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);
        assert!(sandbox.write_file("../evil.txt", "x").await.is_err());
        assert!(sandbox.rm("a/../../etc").await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_streams_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);
        let process = sandbox
            .spawn("sh", &["-c".to_string(), "echo hello; exit 3".to_string()])
            .await
            .unwrap();

        let mut output = String::new();
        let code = process.pipe_to_end(|c| output.push_str(c)).await.unwrap();
        assert_eq!(code, 3);
        assert!(output.contains("hello"));
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);
        let err = sandbox
            .spawn("definitely-not-a-real-program-xyz", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_server_ready_is_announced() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);
        let mut ready = sandbox.server_ready();

        let process = sandbox
            .spawn(
                "sh",
                &["-c".to_string(), "echo 'Local: http://localhost:4321/'".to_string()],
            )
            .await
            .unwrap();
        let id = process.id;
        process.pipe_to_end(|_| {}).await.unwrap();

        let event = ready.recv().await.unwrap();
        assert_eq!(event.port, 4321);
        assert_eq!(event.process, id);
    }

    #[tokio::test]
    async fn test_address_on_both_streams_is_announced_once() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);
        let mut ready = sandbox.server_ready();

        let script = "echo http://localhost:4321/; echo http://localhost:4321/ >&2";
        let process = sandbox
            .spawn("sh", &["-c".to_string(), script.to_string()])
            .await
            .unwrap();
        process.pipe_to_end(|_| {}).await.unwrap();

        assert_eq!(ready.recv().await.unwrap().port, 4321);
        assert!(ready.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multibyte_output_survives_read_boundary() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        // The check mark occupies bytes 8191..8194, across the 8 KiB read.
        let process = sandbox
            .spawn(
                "sh",
                &["-c".to_string(), "printf '%8191s✓ passed\\n' ''".to_string()],
            )
            .await
            .unwrap();
        let mut output = String::new();
        process.pipe_to_end(|c| output.push_str(c)).await.unwrap();

        assert!(!output.contains('\u{fffd}'));
        assert!(output.ends_with("✓ passed\n"));
        assert_eq!(output.len(), 8191 + "✓ passed\n".len());
    }

    #[tokio::test]
    async fn test_kill_stops_long_running_process() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);
        let Process {
            output,
            exit,
            kill,
            ..
        } = sandbox
            .spawn("sh", &["-c".to_string(), "sleep 30".to_string()])
            .await
            .unwrap();

        kill.kill();
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), exit)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(code, 0);
        drop(output);
    }

    #[tokio::test]
    async fn test_boot_creates_configured_root() {
        let dir = tempdir().unwrap();
        let config = SandboxConfig {
            root: Some(dir.path().join("box").display().to_string()),
            ..SandboxConfig::default()
        };
        let sandbox = LocalSandbox::boot(&config).await.unwrap();
        assert_eq!(sandbox.root(), dir.path().join("box"));
        assert!(sandbox.root().is_dir());
    }

    #[tokio::test]
    async fn test_dispose_only_removes_owned_root() {
        let dir = tempdir().unwrap();
        let kept = LocalSandbox::at(dir.path().join("kept"), false);
        kept.mkdir("").await.unwrap();
        kept.dispose().await.unwrap();
        assert!(dir.path().join("kept").exists());

        let owned = LocalSandbox::at(dir.path().join("owned"), true);
        owned.mkdir("").await.unwrap();
        owned.dispose().await.unwrap();
        assert!(!dir.path().join("owned").exists());
    }
}
