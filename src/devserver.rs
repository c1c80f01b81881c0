//! Preview dev server lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CommandLine;
use crate::sandbox::{KillHandle, Process, SandboxError, SandboxHandle, ServerReady};
use crate::session::SessionSignals;
use crate::terminal::{note, Terminal};

/// Starts, stops and reloads the long-running dev server of a sandbox.
///
/// One instance lives as long as its sandbox handle and serves every
/// project provisioned into it. Only the server process it is currently
/// tracking can set the preview address; addresses printed by installs,
/// test runs or a server that was already stopped are ignored.
pub struct DevServer {
    sandbox: SandboxHandle,
    terminal: Arc<dyn Terminal>,
    signals: Arc<SessionSignals>,
    command: CommandLine,
    listening: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    tracked: Arc<Mutex<Tracked>>,
}

#[derive(Default)]
struct Tracked {
    process: Option<(u64, KillHandle)>,
    /// Latest ready event that matched no tracked process. The server can
    /// announce itself before `start` has recorded its id.
    unclaimed: Option<ServerReady>,
}

impl Tracked {
    fn publish_if_current(&mut self, event: ServerReady, signals: &SessionSignals) {
        match &self.process {
            Some((id, _)) if *id == event.process => {
                info!("Preview ready on port {}: {}", event.port, event.url);
                signals.set_preview_url(Some(event.url));
            }
            _ => {
                debug!(
                    "Ignoring server on port {} from process {}",
                    event.port, event.process
                );
                self.unclaimed = Some(event);
            }
        }
    }
}

impl DevServer {
    /// Creates a stopped dev server.
    pub fn new(
        sandbox: SandboxHandle,
        terminal: Arc<dyn Terminal>,
        signals: Arc<SessionSignals>,
        command: CommandLine,
    ) -> Self {
        Self {
            sandbox,
            terminal,
            signals,
            command,
            listening: AtomicBool::new(false),
            listener: Mutex::new(None),
            tracked: Arc::new(Mutex::new(Tracked::default())),
        }
    }

    /// Spawns the dev server, replacing one that is already running.
    ///
    /// The preview address is published once the server announces itself.
    pub async fn start(&self) -> Result<(), SandboxError> {
        self.listen_for_ready();
        if let Some((_, previous)) = lock(&self.tracked).process.take() {
            debug!("Stopping previous dev server");
            previous.kill();
        }

        info!("Starting dev server: {}", self.command);
        self.terminal
            .writeln(&note(&format!("Starting dev server ({})...", self.command)));

        let Process {
            id,
            mut output,
            exit,
            kill,
        } = self
            .sandbox
            .spawn(&self.command.program, &self.command.args)
            .await?;
        {
            let mut tracked = lock(&self.tracked);
            tracked.process = Some((id, kill));
            if let Some(early) = tracked.unclaimed.take() {
                tracked.publish_if_current(early, &self.signals);
            }
        }

        let terminal = Arc::clone(&self.terminal);
        tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                terminal.write(&chunk);
            }
            match exit.await {
                Ok(code) => debug!("Dev server exited with code {}", code),
                Err(_) => debug!("Dev server ended without an exit code"),
            }
        });
        Ok(())
    }

    /// Kills the dev server and clears the preview address.
    pub fn stop(&self) {
        let mut tracked = lock(&self.tracked);
        tracked.unclaimed = None;
        if let Some((_, process)) = tracked.process.take() {
            info!("Stopping dev server");
            process.kill();
        }
        self.signals.set_preview_url(None);
    }

    /// Asks the preview surface to reload. The process is left alone.
    pub fn refresh(&self) -> u64 {
        let generation = self.signals.bump_reload();
        debug!("Preview reload generation {}", generation);
        generation
    }

    /// Returns true while a dev server process is tracked.
    pub fn is_running(&self) -> bool {
        lock(&self.tracked).process.is_some()
    }

    /// Subscribes to server-ready events, at most once per sandbox handle.
    fn listen_for_ready(&self) {
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut ready = self.sandbox.server_ready();
        let signals = Arc::clone(&self.signals);
        let tracked = Arc::clone(&self.tracked);
        let task = tokio::spawn(async move {
            loop {
                match ready.recv().await {
                    Ok(event) => lock(&tracked).publish_if_current(event, &signals),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Missed {} server-ready events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *lock(&self.listener) = Some(task);
    }
}

impl Drop for DevServer {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.listener).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::memory::{FailOn, MemorySandbox, Script};
    use crate::sandbox::Sandbox;
    use crate::terminal::capture::CaptureTerminal;
    use std::time::Duration;

    fn dev_server(sandbox: &Arc<MemorySandbox>) -> (DevServer, Arc<SessionSignals>) {
        let signals = Arc::new(SessionSignals::new());
        let server = DevServer::new(
            Arc::clone(sandbox) as SandboxHandle,
            Arc::new(CaptureTerminal::default()),
            Arc::clone(&signals),
            CommandLine::parse("npm run dev").unwrap(),
        );
        (server, signals)
    }

    fn serving(port: u16) -> Script {
        Script {
            hang: true,
            ready: Some(port),
            ..Default::default()
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_start_publishes_preview_address() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script("npm run dev", serving(5173));
        let (server, signals) = dev_server(&sandbox);
        let mut preview = signals.subscribe_preview();

        server.start().await.unwrap();
        preview.changed().await.unwrap();
        assert_eq!(
            preview.borrow().as_deref(),
            Some("http://localhost:5173/")
        );
        assert!(server.is_running());
    }

    #[tokio::test]
    async fn test_ready_listener_registered_once() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script("npm run dev", serving(5173));
        let (server, _signals) = dev_server(&sandbox);

        server.start().await.unwrap();
        server.start().await.unwrap();
        server.start().await.unwrap();
        assert_eq!(sandbox.ready_listeners(), 1);
        assert_eq!(sandbox.spawned().len(), 3);
    }

    #[tokio::test]
    async fn test_restart_kills_previous_process() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script("npm run dev", serving(5173));
        let (server, _signals) = dev_server(&sandbox);

        server.start().await.unwrap();
        server.start().await.unwrap();
        eventually(|| sandbox.kill_count() == 1).await;
    }

    #[tokio::test]
    async fn test_stop_kills_and_clears_preview() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script("npm run dev", serving(3000));
        let (server, signals) = dev_server(&sandbox);
        let mut preview = signals.subscribe_preview();

        server.start().await.unwrap();
        preview.changed().await.unwrap();

        server.stop();
        assert!(signals.preview_url().is_none());
        assert!(!server.is_running());
        eventually(|| sandbox.kill_count() == 1).await;
    }

    #[tokio::test]
    async fn test_refresh_leaves_process_alone() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script("npm run dev", serving(5173));
        let (server, signals) = dev_server(&sandbox);

        server.start().await.unwrap();
        assert_eq!(server.refresh(), 1);
        assert_eq!(server.refresh(), 2);
        assert_eq!(signals.reload_generation(), 2);
        assert_eq!(sandbox.spawned().len(), 1);
        assert!(server.is_running());
    }

    #[tokio::test]
    async fn test_other_processes_do_not_set_preview() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script(
            "npx vitest run",
            Script {
                ready: Some(4000),
                exit_code: 1,
                ..Default::default()
            },
        );
        let (server, signals) = dev_server(&sandbox);
        sandbox.script(
            "npm run dev",
            Script {
                hang: true,
                ..Default::default()
            },
        );
        server.start().await.unwrap();
        server.stop();

        let run = sandbox
            .spawn("npx", &["vitest".to_string(), "run".to_string()])
            .await
            .unwrap();
        assert_eq!(run.pipe_to_end(|_| {}).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(signals.preview_url().is_none());
    }

    #[tokio::test]
    async fn test_test_run_address_leaves_running_preview_alone() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script("npm run dev", serving(5173));
        sandbox.script(
            "npx vitest run",
            Script {
                ready: Some(4000),
                exit_code: 1,
                ..Default::default()
            },
        );
        let (server, signals) = dev_server(&sandbox);
        let mut preview = signals.subscribe_preview();
        server.start().await.unwrap();
        preview.wait_for(Option::is_some).await.unwrap();

        let run = sandbox
            .spawn("npx", &["vitest".to_string(), "run".to_string()])
            .await
            .unwrap();
        run.pipe_to_end(|_| {}).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            signals.preview_url().as_deref(),
            Some("http://localhost:5173/")
        );
    }

    #[tokio::test]
    async fn test_stopped_server_cannot_restore_preview() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script(
            "npm run dev",
            Script {
                hang: true,
                ready: Some(3000),
                delay: Some(Duration::from_millis(20)),
                ..Default::default()
            },
        );
        let (server, signals) = dev_server(&sandbox);

        server.start().await.unwrap();
        server.stop();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(signals.preview_url().is_none());
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_returned() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.fail(FailOn::Spawn("npm run dev".to_string()));
        let (server, _signals) = dev_server(&sandbox);

        let err = server.start().await.unwrap_err();
        assert!(err.to_string().contains("npm run dev"));
        assert!(!server.is_running());
    }
}
