//! Interactive session over JSON lines.
//!
//! Requests arrive on stdin, one JSON object per line:
//!
//! ```text
//! {"op": "edit", "path": "src/sum.js", "content": "..."}
//! {"op": "create", "path": "src/util.js"}
//! {"op": "delete", "path": "src/old", "kind": "folder"}
//! {"op": "rename", "from": "a.js", "to": "lib/a.js"}
//! {"op": "test"}
//! ```
//!
//! Every request gets one response line on stdout. Status, preview and
//! file error changes are pushed as event lines. Process output goes to
//! stderr so stdout stays parseable.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sandsync::buffer::EntryKind;
use sandsync::config::Config;
use sandsync::terminal::StderrTerminal;
use sandsync::workspace::Workspace;

use super::{load_project, open_workspace};

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Runs the session command until `quit` or end of input.
pub(crate) async fn run(config_path: &Path, project_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let project = load_project(project_path, &config)?;

    let workspace = open_workspace(&config, Arc::new(StderrTerminal)).await?;
    let events = spawn_event_printer(&workspace);

    let previewable = workspace.load(&project).await;
    emit(&json!({
        "event": "ready",
        "project": project.id,
        "previewable": previewable,
        "error": workspace.provisioner().last_error().map(|e| e.to_string()),
    }));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match parse_request(&line) {
            Ok(Request::Quit) => {
                emit(&json!({ "ok": true }));
                break;
            }
            Ok(request) => handle(&workspace, request).await,
            Err(e) => failure(&e),
        };
        emit(&response);
    }

    info!("Session ended");
    events.abort();
    workspace.close().await
}

// -----------------------------------------------------------------------------
// Requests
// -----------------------------------------------------------------------------

/// One request line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request {
    /// Replace a file's contents in the edit buffer.
    Edit { path: String, content: String },
    /// Create an empty file.
    Create { path: String },
    /// Delete a file or folder.
    Delete {
        path: String,
        #[serde(default)]
        kind: EntryKind,
    },
    /// Rename a file or folder.
    Rename {
        from: String,
        to: String,
        #[serde(default)]
        kind: EntryKind,
    },
    /// Read a file back from the sandbox.
    Cat { path: String },
    /// Run the tests.
    Test,
    /// Start the dev server.
    Start,
    /// Stop the dev server.
    Stop,
    /// Reload the preview.
    Refresh,
    /// Report session status.
    Status,
    /// Return the last test run's output.
    Output,
    /// Hide the current file error.
    Dismiss,
    /// End the session.
    Quit,
}

fn parse_request(line: &str) -> Result<Request> {
    serde_json::from_str(line).with_context(|| format!("Invalid request: {line}"))
}

async fn handle(workspace: &Workspace, request: Request) -> Value {
    debug!("Request: {:?}", request);
    match request {
        Request::Edit { path, content } => match workspace.edit(&path, &content) {
            Ok(()) => ok(),
            Err(e) => failure(&e),
        },
        Request::Create { path } => file_op(workspace.files().create(&path).await),
        Request::Delete { path, kind } => file_op(workspace.files().delete(&path, kind).await),
        Request::Rename { from, to, kind } => {
            file_op(workspace.files().rename(&from, &to, kind).await)
        }
        Request::Cat { path } => match workspace.sandbox().read_file(&path).await {
            Ok(content) => json!({ "ok": true, "content": content }),
            Err(e) => json!({ "ok": false, "error": e.to_string() }),
        },
        Request::Test => {
            let status = workspace.run_tests().await;
            json!({ "ok": true, "status": status })
        }
        Request::Start => match workspace.dev().start().await {
            Ok(()) => ok(),
            Err(e) => json!({ "ok": false, "error": e.to_string() }),
        },
        Request::Stop => {
            workspace.dev().stop();
            ok()
        }
        Request::Refresh => json!({ "ok": true, "generation": workspace.dev().refresh() }),
        Request::Status => {
            let signals = workspace.signals();
            json!({
                "ok": true,
                "status": signals.status(),
                "preview": signals.preview_url(),
                "files": workspace.buffer().paths().collect::<Vec<_>>(),
                "error": workspace.files().last_error(),
            })
        }
        Request::Output => json!({ "ok": true, "output": workspace.signals().test_output() }),
        Request::Dismiss => {
            workspace.files().dismiss_error();
            ok()
        }
        Request::Quit => ok(),
    }
}

fn ok() -> Value {
    json!({ "ok": true })
}

fn failure(error: &anyhow::Error) -> Value {
    json!({ "ok": false, "error": format!("{error:#}") })
}

fn file_op(result: sandsync::fileops::FileOpResult) -> Value {
    match result {
        Ok(()) => ok(),
        Err(e) => json!({ "ok": false, "error": e }),
    }
}

// -----------------------------------------------------------------------------
// Events
// -----------------------------------------------------------------------------

fn spawn_event_printer(workspace: &Workspace) -> JoinHandle<()> {
    let mut status = workspace.signals().subscribe_status();
    let mut preview = workspace.signals().subscribe_preview();
    let mut reload = workspace.signals().subscribe_reload();
    let mut errors = workspace.files().subscribe_errors();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                r = status.changed() => r.map(|()| {
                    json!({ "event": "status", "value": *status.borrow_and_update() })
                }),
                r = preview.changed() => r.map(|()| {
                    json!({ "event": "preview", "value": *preview.borrow_and_update() })
                }),
                r = reload.changed() => r.map(|()| {
                    json!({ "event": "reload", "value": *reload.borrow_and_update() })
                }),
                r = errors.changed() => r.map(|()| {
                    json!({ "event": "file_error", "value": *errors.borrow_and_update() })
                }),
            };
            match event {
                Ok(event) => emit(&event),
                Err(_) => break,
            }
        }
    })
}

fn emit(value: &Value) {
    let mut out = std::io::stdout().lock();
    if let Err(e) = writeln!(out, "{value}").and_then(|()| out.flush()) {
        warn!("Failed to write to stdout: {}", e);
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
