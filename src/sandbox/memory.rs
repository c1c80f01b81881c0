//! In-memory sandbox for tests.
//!
//! Behaves like a small filesystem (writes need an existing parent
//! directory), records every call, and runs scripted processes. Any
//! operation can be made to fail for a given path.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

use super::{parent_dir, MountTree, Process, Sandbox, SandboxError, ServerReady};

/// Which call to fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum FailOn {
    Mount,
    Write(String),
    Mkdir(String),
    Rm(String),
    Rename(String),
    Spawn(String),
}

/// How a spawned command behaves.
#[derive(Debug, Clone, Default)]
pub(crate) struct Script {
    pub output: Vec<String>,
    pub exit_code: i32,
    /// Keep running until killed.
    pub hang: bool,
    /// Port announced as a server once the output has been sent.
    pub ready: Option<u16>,
    pub delay: Option<Duration>,
}

impl Script {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn with_output(mut self, chunk: &str) -> Self {
        self.output.push(chunk.to_string());
        self
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    failures: HashSet<FailOn>,
    scripts: HashMap<String, Script>,
    spawned: Vec<String>,
    writes: Vec<String>,
    mounts: usize,
    kills: usize,
}

/// A sandbox that lives entirely in memory.
#[derive(Debug)]
pub(crate) struct MemorySandbox {
    state: std::sync::Arc<Mutex<MemoryState>>,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl Default for MemorySandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySandbox {
    pub fn new() -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            state: std::sync::Arc::default(),
            ready_tx,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail(&self, on: FailOn) {
        self.state().failures.insert(on);
    }

    pub fn heal(&self, on: &FailOn) {
        self.state().failures.remove(on);
    }

    pub fn script(&self, command: &str, script: Script) {
        self.state().scripts.insert(command.to_string(), script);
    }

    /// Populates `dir` with `count` subdirectories.
    pub fn seed_dir(&self, dir: &str, count: usize) {
        let mut state = self.state();
        insert_dir(&mut state.dirs, dir);
        for i in 0..count {
            insert_dir(&mut state.dirs, &format!("{dir}/pkg-{i}"));
        }
    }

    pub fn seed_file(&self, path: &str, contents: &str) {
        let mut state = self.state();
        if let Some(parent) = parent_dir(path) {
            insert_dir(&mut state.dirs, parent);
        }
        state.files.insert(path.to_string(), contents.to_string());
    }

    pub fn files(&self) -> BTreeMap<String, String> {
        self.state().files.clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state().dirs.contains(path)
    }

    pub fn spawned(&self) -> Vec<String> {
        self.state().spawned.clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    pub fn mount_count(&self) -> usize {
        self.state().mounts
    }

    pub fn kill_count(&self) -> usize {
        self.state().kills
    }

    pub fn ready_listeners(&self) -> usize {
        self.ready_tx.receiver_count()
    }

    fn check(&self, on: &FailOn) -> Result<(), SandboxError> {
        if self.state().failures.contains(on) {
            return Err(SandboxError::io("injected", format!("{on:?}"), "injected failure"));
        }
        Ok(())
    }
}

fn insert_dir(dirs: &mut BTreeSet<String>, path: &str) {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        dirs.insert(current.clone());
    }
}

fn under(path: &str, prefix: &str) -> bool {
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

#[async_trait]
impl Sandbox for MemorySandbox {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn mount(&self, tree: &MountTree) -> Result<(), SandboxError> {
        self.check(&FailOn::Mount)?;
        let mut state = self.state();
        state.mounts += 1;
        for dir in tree.directories() {
            insert_dir(&mut state.dirs, &dir);
        }
        for (path, contents) in tree.flatten() {
            state.files.insert(path, contents);
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.file(path).ok_or_else(|| SandboxError::not_found(path))
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), SandboxError> {
        self.check(&FailOn::Write(path.to_string()))?;
        let mut state = self.state();
        if let Some(parent) = parent_dir(path) {
            if !state.dirs.contains(parent) {
                return Err(SandboxError::not_found(parent));
            }
        }
        state.writes.push(path.to_string());
        state.files.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        let state = self.state();
        if !state.dirs.contains(path) {
            return Err(SandboxError::not_found(path));
        }
        let prefix = format!("{path}/");
        let mut names: BTreeSet<String> = BTreeSet::new();
        for entry in state.dirs.iter().chain(state.files.keys()) {
            if let Some(rest) = entry.strip_prefix(&prefix) {
                if let Some(name) = rest.split('/').next() {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn mkdir(&self, path: &str) -> Result<(), SandboxError> {
        self.check(&FailOn::Mkdir(path.to_string()))?;
        insert_dir(&mut self.state().dirs, path);
        Ok(())
    }

    async fn rm(&self, path: &str) -> Result<(), SandboxError> {
        self.check(&FailOn::Rm(path.to_string()))?;
        let mut state = self.state();
        let existed = state.files.keys().any(|p| under(p, path)) || state.dirs.contains(path);
        if !existed {
            return Err(SandboxError::not_found(path));
        }
        state.files.retain(|p, _| !under(p, path));
        state.dirs.retain(|d| !under(d, path));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        self.check(&FailOn::Rename(from.to_string()))?;
        let mut state = self.state();
        let moved: Vec<(String, String)> = state
            .files
            .iter()
            .filter(|(p, _)| under(p, from))
            .map(|(p, c)| (p.clone(), c.clone()))
            .collect();
        if moved.is_empty() && !state.dirs.contains(from) {
            return Err(SandboxError::not_found(from));
        }
        for (path, contents) in moved {
            state.files.remove(&path);
            let target = format!("{to}{}", &path[from.len()..]);
            if let Some(parent) = parent_dir(&target) {
                insert_dir(&mut state.dirs, parent);
            }
            state.files.insert(target, contents);
        }
        let dirs: Vec<String> = state.dirs.iter().filter(|d| under(d, from)).cloned().collect();
        for dir in dirs {
            state.dirs.remove(&dir);
            insert_dir(&mut state.dirs, &format!("{to}{}", &dir[from.len()..]));
        }
        Ok(())
    }

    async fn spawn(&self, program: &str, args: &[String]) -> Result<Process, SandboxError> {
        let command_line = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.check(&FailOn::Spawn(command_line.clone()))
            .map_err(|e| SandboxError::spawn(&command_line, e.to_string()))?;

        let script = {
            let mut state = self.state();
            state.spawned.push(command_line.clone());
            state.scripts.get(&command_line).cloned().unwrap_or_default()
        };

        let (process, io) = Process::channel();
        let ready_tx = self.ready_tx.clone();
        let state = std::sync::Arc::clone(&self.state);
        tokio::spawn(async move {
            if let Some(delay) = script.delay {
                tokio::time::sleep(delay).await;
            }
            for chunk in script.output {
                let _ = io.output.send(chunk);
            }
            if let Some(port) = script.ready {
                let _ = ready_tx.send(ServerReady::local(io.id, port));
            }
            let code = if script.hang {
                let _ = io.kill.await;
                state.lock().unwrap_or_else(PoisonError::into_inner).kills += 1;
                -1
            } else {
                script.exit_code
            };
            drop(io.output);
            let _ = io.exit.send(code);
        });

        Ok(process)
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn dispose(&self) -> Result<(), SandboxError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_needs_parent_dir() {
        let sandbox = MemorySandbox::new();
        assert!(sandbox.write_file("a/b.txt", "x").await.is_err());
        sandbox.mkdir("a").await.unwrap();
        sandbox.write_file("a/b.txt", "x").await.unwrap();
        assert_eq!(sandbox.file("a/b.txt").as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_read_dir_lists_direct_children() {
        let sandbox = MemorySandbox::new();
        sandbox.seed_dir("node_modules", 3);
        sandbox.seed_file("node_modules/.package-lock.json", "{}");
        let entries = sandbox.read_dir("node_modules").await.unwrap();
        assert_eq!(entries.len(), 4);
        assert!(sandbox.read_dir("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_rename_moves_folder() {
        let sandbox = MemorySandbox::new();
        sandbox.seed_file("a/x.js", "x");
        sandbox.seed_file("a/y.js", "y");
        sandbox.rename("a", "b").await.unwrap();
        assert_eq!(sandbox.file("b/x.js").as_deref(), Some("x"));
        assert!(sandbox.file("a/x.js").is_none());
        assert!(sandbox.has_dir("b"));
        assert!(!sandbox.has_dir("a"));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let sandbox = MemorySandbox::new();
        sandbox.fail(FailOn::Rm("src".to_string()));
        sandbox.seed_file("src/a.js", "a");
        assert!(sandbox.rm("src").await.is_err());
        sandbox.heal(&FailOn::Rm("src".to_string()));
        sandbox.rm("src").await.unwrap();
        assert!(sandbox.files().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_process() {
        let sandbox = MemorySandbox::new();
        sandbox.script("npm test", Script::exit(1).with_output("1 failed"));
        let process = sandbox
            .spawn("npm", &["test".to_string()])
            .await
            .unwrap();
        let mut out = String::new();
        let code = process.pipe_to_end(|c| out.push_str(c)).await.unwrap();
        assert_eq!(code, 1);
        assert_eq!(out, "1 failed");
        assert_eq!(sandbox.spawned(), vec!["npm test".to_string()]);
    }
}
