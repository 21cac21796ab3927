//! Seam to the externally owned context collection.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use crate::fs::tree::TreeNode;

/// Metadata handed to the context collection alongside a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextMetadata {
    pub name: String,
    pub extension: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl From<&TreeNode> for ContextMetadata {
    fn from(node: &TreeNode) -> Self {
        Self {
            name: node.name.clone(),
            extension: node.extension.clone(),
            size: node.size,
            modified: node.modified,
        }
    }
}

/// Receives add/remove notifications for the context collection.
///
/// The controller never reads the collection back; it only reports changes.
pub trait ContextSink: Send {
    fn add(&mut self, path: &Path, metadata: ContextMetadata);
    fn remove(&mut self, path: &Path);
}

/// Sink that drops every notification.
#[derive(Debug, Default)]
pub struct NoopContext;

impl ContextSink for NoopContext {
    fn add(&mut self, _path: &Path, _metadata: ContextMetadata) {}
    fn remove(&mut self, _path: &Path) {}
}

/// Ordered, deduplicated in-memory context collection.
#[derive(Debug, Default, Clone)]
pub struct ContextList {
    entries: Vec<(PathBuf, ContextMetadata)>,
}

impl ContextList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.entries.iter().map(|(p, _)| p.as_path()).collect()
    }

    pub fn get(&self, path: &Path) -> Option<&ContextMetadata> {
        self.entries
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, meta)| meta)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ContextSink for ContextList {
    fn add(&mut self, path: &Path, metadata: ContextMetadata) {
        match self.entries.iter_mut().find(|(p, _)| p == path) {
            Some(entry) => entry.1 = metadata,
            None => self.entries.push((path.to_path_buf(), metadata)),
        }
    }

    fn remove(&mut self, path: &Path) {
        self.entries.retain(|(p, _)| p != path);
    }
}
