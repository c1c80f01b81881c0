//! Nested mount trees built from flat path maps.

use serde::Serialize;
use std::collections::BTreeMap;

/// A directory level of a mount tree, keyed by entry name.
///
/// Serializes as `{name: {"file": {"contents": ..}} | {"directory": {..}}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MountTree(BTreeMap<String, MountNode>);

/// One entry in a [`MountTree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountNode {
    /// A regular file.
    File {
        /// File contents.
        contents: String,
    },
    /// A nested directory.
    Directory(MountTree),
}

impl MountTree {
    /// Builds a tree from a flat `path -> contents` map.
    ///
    /// Empty path segments are ignored. When a path is used both as a file and
    /// as a directory prefix, the directory wins, so the result never depends
    /// on insertion order.
    pub fn from_files<'a, I>(files: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut root = Self::default();
        for (path, contents) in files {
            let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
            if let Some((file_name, dirs)) = segments.split_last() {
                root.insert(dirs, file_name, contents);
            }
        }
        root
    }

    fn insert(&mut self, dirs: &[&str], file_name: &str, contents: &str) {
        match dirs.split_first() {
            None => {
                if !matches!(self.0.get(file_name), Some(MountNode::Directory(_))) {
                    self.0.insert(
                        file_name.to_string(),
                        MountNode::File {
                            contents: contents.to_string(),
                        },
                    );
                }
            }
            Some((dir, rest)) => {
                let node = self
                    .0
                    .entry((*dir).to_string())
                    .or_insert_with(|| MountNode::Directory(Self::default()));
                if matches!(node, MountNode::File { .. }) {
                    *node = MountNode::Directory(Self::default());
                }
                if let MountNode::Directory(child) = node {
                    child.insert(rest, file_name, contents);
                }
            }
        }
    }

    /// Flattens the tree back into `path -> contents`.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        self.flatten_into("", &mut files);
        files
    }

    fn flatten_into(&self, prefix: &str, files: &mut BTreeMap<String, String>) {
        for (name, node) in &self.0 {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            match node {
                MountNode::File { contents } => {
                    files.insert(path, contents.clone());
                }
                MountNode::Directory(child) => child.flatten_into(&path, files),
            }
        }
    }

    /// Every directory path in the tree, parents before children.
    pub fn directories(&self) -> Vec<String> {
        let mut dirs = Vec::new();
        self.directories_into("", &mut dirs);
        dirs
    }

    fn directories_into(&self, prefix: &str, dirs: &mut Vec<String>) {
        for (name, node) in &self.0 {
            if let MountNode::Directory(child) = node {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                dirs.push(path.clone());
                child.directories_into(&path, dirs);
            }
        }
    }

    /// Returns the node stored under a top-level name.
    pub fn get(&self, name: &str) -> Option<&MountNode> {
        self.0.get(name)
    }

    /// Returns true if the tree has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
