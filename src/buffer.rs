//! The edit buffer: what the user currently has.
//!
//! The host owns the buffer and publishes it through a
//! `tokio::sync::watch` channel. Sync engines only ever read it; the file
//! operation coordinator and the host's edit handler are the only writers.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Live map of relative path to current text content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditBuffer(BTreeMap<String, String>);

/// Whether a file operation targets one file or a folder prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// A single file.
    #[default]
    File,
    /// Every file under a path prefix.
    Folder,
}

impl EditBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the content of a path.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    /// Returns true if the path is tracked.
    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    /// Sets the content of a path, returning the previous content.
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) -> Option<String> {
        self.0.insert(path.into(), content.into())
    }

    /// Stops tracking a path, returning its content.
    pub fn remove(&mut self, path: &str) -> Option<String> {
        self.0.remove(path)
    }

    /// Iterates paths and contents in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Iterates paths in order.
    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Number of tracked paths.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The underlying map.
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Every tracked path an operation on `path` touches.
    pub fn affected_paths(&self, path: &str, kind: EntryKind) -> Vec<String> {
        match kind {
            EntryKind::File => self
                .0
                .contains_key(path)
                .then(|| vec![path.to_string()])
                .unwrap_or_default(),
            EntryKind::Folder => {
                let prefix = folder_prefix(path);
                self.0
                    .keys()
                    .filter(|p| p.starts_with(&prefix))
                    .cloned()
                    .collect()
            }
        }
    }

    /// Old to new path pairs for renaming `from` to `to`.
    ///
    /// For a folder every tracked path under `from/` is moved under `to/`.
    pub fn rename_pairs(&self, from: &str, to: &str, kind: EntryKind) -> Vec<(String, String)> {
        match kind {
            EntryKind::File => self
                .0
                .contains_key(from)
                .then(|| vec![(from.to_string(), to.to_string())])
                .unwrap_or_default(),
            EntryKind::Folder => {
                let old_prefix = folder_prefix(from);
                let new_prefix = folder_prefix(to);
                self.0
                    .keys()
                    .filter_map(|p| {
                        p.strip_prefix(&old_prefix)
                            .map(|rest| (p.clone(), format!("{new_prefix}{rest}")))
                    })
                    .collect()
            }
        }
    }
}

impl FromIterator<(String, String)> for EditBuffer {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, String>> for EditBuffer {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<'a> IntoIterator for &'a EditBuffer {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// `src`, `src/` and `/src` all become `src/`.
fn folder_prefix(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("{trimmed}/")
}

/// Normalizes a user-supplied relative path.
///
/// Strips leading `./` and `/`, collapses repeated separators, and rejects
/// empty paths and `..` segments.
pub fn normalize_path(path: &str) -> Option<String> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(paths: &[&str]) -> EditBuffer {
        paths
            .iter()
            .map(|p| ((*p).to_string(), format!("// {p}")))
            .collect()
    }

    #[test]
    fn test_affected_paths_file() {
        let buf = buffer(&["a.js", "src/a.js"]);
        assert_eq!(buf.affected_paths("a.js", EntryKind::File), vec!["a.js"]);
        assert!(buf.affected_paths("missing.js", EntryKind::File).is_empty());
    }

    #[test]
    fn test_affected_paths_folder_uses_prefix_boundary() {
        let buf = buffer(&["src/a.js", "src/lib/b.js", "srcfile.js", "other/c.js"]);
        let affected = buf.affected_paths("src/", EntryKind::Folder);
        assert_eq!(affected, vec!["src/a.js", "src/lib/b.js"]);
        assert_eq!(buf.affected_paths("src", EntryKind::Folder), affected);
    }

    #[test]
    fn test_rename_pairs_folder() {
        let buf = buffer(&["a/x.js", "a/y.js", "ab/z.js"]);
        let pairs = buf.rename_pairs("a", "b/", EntryKind::Folder);
        assert_eq!(
            pairs,
            vec![
                ("a/x.js".to_string(), "b/x.js".to_string()),
                ("a/y.js".to_string(), "b/y.js".to_string()),
            ]
        );
    }

    #[test]
    fn test_rename_pairs_file() {
        let buf = buffer(&["a.js"]);
        assert_eq!(
            buf.rename_pairs("a.js", "b.js", EntryKind::File),
            vec![("a.js".to_string(), "b.js".to_string())]
        );
        assert!(buf.rename_pairs("c.js", "d.js", EntryKind::File).is_empty());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src//a.js").as_deref(), Some("src/a.js"));
        assert_eq!(normalize_path("/index.js").as_deref(), Some("index.js"));
        assert_eq!(normalize_path("src/"), Some("src".to_string()));
        assert!(normalize_path("").is_none());
        assert!(normalize_path("../etc/passwd").is_none());
        assert!(normalize_path("a/../b").is_none());
    }

    #[test]
    fn test_entry_kind_deserialize() {
        let kind: EntryKind = serde_json::from_str("\"folder\"").unwrap();
        assert_eq!(kind, EntryKind::Folder);
    }
}
