use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::controller::VisibleNode;
use crate::fs::tree::TreeNode;

/// Notifications the controller emits to the rendering surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrowserEvent {
    /// The visible list was rebuilt (load, expand, collapse, refresh).
    TreeLoaded { nodes: Vec<VisibleNode> },
    /// The cursor moved to a new path.
    FileSelected { path: PathBuf },
    /// A file joined the context collection.
    FileAddedToContext { path: PathBuf, node: TreeNode },
    /// A file left the context collection.
    FileRemovedFromContext { path: PathBuf },
    /// The multi-selection set changed; paths are sorted.
    MultiSelectionChanged { paths: Vec<PathBuf> },
    /// A search finished.
    SearchCompleted { query: String, results: Vec<TreeNode> },
}

/// Sending half held by the controller.
///
/// Sends never fail the caller: a dropped receiver only means nobody is
/// listening any more.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<BrowserEvent>,
}

impl EventSender {
    pub fn send(&self, event: BrowserEvent) {
        let _ = self.tx.send(event);
    }
}

/// Create a connected sender/receiver pair.
pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<BrowserEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}
