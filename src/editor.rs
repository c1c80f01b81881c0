//! Keeps an editor's model set in step with the edit buffer.
//!
//! Only models created here are ever disposed here. Contents of existing
//! models are never touched: the editor owns its open documents.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::buffer::EditBuffer;

/// A document model held by an editor.
pub trait EditorModel: Send + Sync {
    /// Releases the model.
    fn dispose(&self);
}

/// The editor surface the models belong to.
pub trait Editor: Send + Sync {
    /// Looks up the model for `uri`.
    fn get_model(&self, uri: &str) -> Option<Arc<dyn EditorModel>>;

    /// Creates a model for `uri`.
    fn create_model(
        &self,
        content: &str,
        language: Option<&str>,
        uri: &str,
    ) -> Arc<dyn EditorModel>;
}

/// Creates and disposes editor models for buffer paths.
pub struct EditorModelSync {
    editor: Arc<dyn Editor>,
    created: HashMap<String, Arc<dyn EditorModel>>,
}

impl EditorModelSync {
    /// Creates a sync with no models of its own yet.
    pub fn new(editor: Arc<dyn Editor>) -> Self {
        Self {
            editor,
            created: HashMap::new(),
        }
    }

    /// Creates models for new paths and disposes models for removed ones.
    pub fn sync(&mut self, buffer: &EditBuffer) {
        for (path, content) in buffer {
            if self.created.contains_key(path) {
                continue;
            }
            let uri = model_uri(path);
            if self.editor.get_model(&uri).is_some() {
                continue;
            }
            debug!("Creating editor model for {}", path);
            let model = self.editor.create_model(content, language_for(path), &uri);
            self.created.insert(path.clone(), model);
        }

        self.created.retain(|path, model| {
            if buffer.contains(path) {
                return true;
            }
            debug!("Disposing editor model for {}", path);
            model.dispose();
            false
        });
    }

    /// Paths whose models were created here.
    pub fn created_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.created.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Follows `buffer` until its sender is dropped.
    pub fn spawn(mut self, mut buffer: watch::Receiver<EditBuffer>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                {
                    let current = buffer.borrow_and_update();
                    self.sync(&current);
                }
                if buffer.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

/// The editor URI for a buffer path.
pub fn model_uri(path: &str) -> String {
    format!("file:///{path}")
}

/// Editor language id for a path, from its extension.
pub fn language_for(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?;
    let language = match ext.to_ascii_lowercase().as_str() {
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" | "mts" | "cts" => "typescript",
        "json" => "json",
        "css" => "css",
        "scss" => "scss",
        "less" => "less",
        "html" | "htm" => "html",
        "md" | "markdown" => "markdown",
        "vue" => "vue",
        "svelte" => "svelte",
        "py" => "python",
        "rs" => "rust",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "sh" => "shell",
        _ => return None,
    };
    Some(language)
}
