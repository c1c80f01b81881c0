//! Project definitions: the immutable file set of one challenge.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::buffer::EditBuffer;

/// One file of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFile {
    /// Initial contents.
    pub content: String,
    /// The learner may not edit this file.
    #[serde(default)]
    pub read_only: bool,
    /// Mounted but never shown (e.g. the test suite).
    #[serde(default)]
    pub hidden: bool,
}

impl ProjectFile {
    /// A visible, editable file.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            read_only: false,
            hidden: false,
        }
    }
}

/// The initial file set and identity of one challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Identity used for idempotent provisioning.
    pub id: String,
    /// Relative path to file.
    pub files: BTreeMap<String, ProjectFile>,
}

impl Project {
    /// Creates a project from `(path, content)` pairs, all visible.
    pub fn new<I, P, C>(id: impl Into<String>, files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        Self {
            id: id.into(),
            files: files
                .into_iter()
                .map(|(p, c)| (p.into(), ProjectFile::new(c)))
                .collect(),
        }
    }

    /// Loads a project from a JSON file or a directory.
    pub fn load(path: &Path, skip_dirs: &[&str]) -> Result<Self> {
        if path.is_dir() {
            Self::from_dir(path, skip_dirs)
        } else {
            Self::from_json_file(path)
        }
    }

    /// Parses `{"id": .., "files": {path: {content, readOnly?, hidden?}}}`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read project file: {}", path.display()))?;
        let project: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse project file: {}", path.display()))?;
        if project.files.is_empty() {
            bail!("Project '{}' has no files", project.id);
        }
        Ok(project)
    }

    /// Reads every regular file under `dir`.
    ///
    /// The id is the directory name. Dot-directories and `skip_dirs`
    /// (typically the dependency directory) are not descended into.
    pub fn from_dir(dir: &Path, skip_dirs: &[&str]) -> Result<Self> {
        let id = dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", dir.display()))?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());

        let mut files = BTreeMap::new();
        collect_files(dir, "", skip_dirs, &mut files)?;
        if files.is_empty() {
            bail!("No files found in {}", dir.display());
        }
        Ok(Self { id, files })
    }

    /// Every file's contents, for mounting.
    pub fn contents(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|(p, f)| (p.clone(), f.content.clone()))
            .collect()
    }

    /// The buffer a learner starts with: every file that is not hidden.
    pub fn initial_buffer(&self) -> EditBuffer {
        self.files
            .iter()
            .filter(|(_, f)| !f.hidden)
            .map(|(p, f)| (p.clone(), f.content.clone()))
            .collect()
    }

    /// Returns true if the project contains a file at `path`.
    pub fn has_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Contents of a file.
    pub fn content(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(|f| f.content.as_str())
    }
}

fn collect_files(
    dir: &Path,
    prefix: &str,
    skip_dirs: &[&str],
    files: &mut BTreeMap<String, ProjectFile>,
) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if name.starts_with('.') || skip_dirs.contains(&name.as_str()) {
                continue;
            }
            collect_files(&entry.path(), &rel, skip_dirs, files)?;
        } else if file_type.is_file() {
            let content = fs::read_to_string(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            files.insert(rel, ProjectFile::new(content));
        }
    }
    Ok(())
}
