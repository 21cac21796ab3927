//! Interactive browser state over a [`TreeStore`].
//!
//! The controller owns the cursor, the expanded set, multi-selection, context
//! membership, search state and the optional watch subscription. It reads the
//! filesystem only through the store and reports every change through
//! [`BrowserEvent`]s. Methods take `&mut self`, so callers serialize
//! operations; watch batches queue up until the next
//! [`BrowserController::process_watch_events`] call and therefore never
//! interleave with a user operation.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::{ContextMetadata, ContextSink};
use crate::error::{BrowserError, Result};
use crate::event::{BrowserEvent, EventSender};
use crate::fs::search::SearchOptions;
use crate::fs::tree::{NodeKind, ScanOptions, TreeNode, TreeStore};
use crate::fs::watcher::{FsWatcher, WatchEvent, WatchSettings};

/// One row of the flattened view handed to the rendering surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisibleNode {
    pub path: PathBuf,
    pub name: String,
    pub kind: NodeKind,
    pub depth: usize,
    pub is_last_sibling: bool,
    pub is_expanded: bool,
    pub is_selected: bool,
    pub is_in_context: bool,
    pub is_multi_selected: bool,
    pub is_ignored: bool,
}

impl VisibleNode {
    fn new(node: &TreeNode, depth: usize, is_last_sibling: bool, state: &ControllerState) -> Self {
        Self {
            path: node.path.clone(),
            name: node.name.clone(),
            kind: node.kind,
            depth,
            is_last_sibling,
            is_expanded: state.expanded.contains(&node.path),
            is_selected: state.selected_path.as_deref() == Some(node.path.as_path()),
            is_in_context: state.context.contains(&node.path),
            is_multi_selected: state.multi_selected.contains(&node.path),
            is_ignored: node.is_ignored,
        }
    }
}

/// Interactive state. Paths are keys into the store, never node copies.
#[derive(Debug, Clone, Default)]
pub struct ControllerState {
    /// Always a visible path, or `None`.
    pub selected_path: Option<PathBuf>,
    /// Expanded directories; each one exists in the store.
    pub expanded: HashSet<PathBuf>,
    pub multi_select_mode: bool,
    /// Empty whenever `multi_select_mode` is off.
    pub multi_selected: HashSet<PathBuf>,
    /// Paths mirrored into the context collection. May hold paths that have
    /// since vanished from disk.
    pub context: HashSet<PathBuf>,
    pub search_query: String,
    pub file_type_filter: SearchOptions,
    pub show_hidden: bool,
}

struct WatchSubscription {
    watcher: FsWatcher,
    rx: mpsc::Receiver<WatchEvent>,
}

/// The object the rendering surface talks to.
pub struct BrowserController {
    store: TreeStore,
    state: ControllerState,
    respect_ignore_rules: bool,
    visible: Vec<VisibleNode>,
    /// Active search results; `None` shows the expanded tree.
    search_results: Option<Vec<PathBuf>>,
    events: EventSender,
    context_sink: Box<dyn ContextSink>,
    watch_settings: WatchSettings,
    watch: Option<WatchSubscription>,
    last_error: Option<String>,
}

impl BrowserController {
    pub fn new(store: TreeStore, context_sink: Box<dyn ContextSink>, events: EventSender) -> Self {
        Self {
            store,
            state: ControllerState::default(),
            respect_ignore_rules: true,
            visible: Vec::new(),
            search_results: None,
            events,
            context_sink,
            watch_settings: WatchSettings::default(),
            watch: None,
            last_error: None,
        }
    }

    /// Initial scan-time filters, applied on the next load.
    pub fn with_scan_options(mut self, options: ScanOptions) -> Self {
        self.state.show_hidden = options.show_hidden;
        self.respect_ignore_rules = options.respect_ignore_rules;
        self
    }

    pub fn with_watch_settings(mut self, settings: WatchSettings) -> Self {
        self.watch_settings = settings;
        self
    }

    // ── Read access ─────────────────────────────────────────────────────────

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn store(&self) -> &TreeStore {
        &self.store
    }

    pub fn root(&self) -> Option<&Path> {
        self.store.root()
    }

    /// The flattened view: the expanded tree, or search results while a
    /// search is active.
    pub fn visible_nodes(&self) -> &[VisibleNode] {
        &self.visible
    }

    pub fn selected_node(&self) -> Option<&TreeNode> {
        self.state
            .selected_path
            .as_deref()
            .and_then(|p| self.store.node(p))
    }

    /// Message of the most recent failed load, expand or refresh.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_searching(&self) -> bool {
        self.search_results.is_some()
    }

    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            show_hidden: self.state.show_hidden,
            respect_ignore_rules: self.respect_ignore_rules,
        }
    }

    /// Relative paths are taken against the loaded root.
    fn resolve(&self, path: &Path) -> PathBuf {
        match self.store.root() {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn is_visible(&self, path: &Path) -> bool {
        self.visible.iter().any(|v| v.path == path)
    }

    // ── Loading ─────────────────────────────────────────────────────────────

    /// Load `path` as the root (or refresh it, when it lies inside the current
    /// root). The context set is left as is.
    ///
    /// On failure the previous tree and state stay in place.
    pub async fn load_directory(&mut self, path: &Path) -> Result<()> {
        self.load(path, None).await
    }

    /// Load `path` and seed the context set with the caller's known context
    /// paths. Seeding does not notify the context collection.
    pub async fn load_directory_with_context(
        &mut self,
        path: &Path,
        known_context: HashSet<PathBuf>,
    ) -> Result<()> {
        self.load(path, Some(known_context)).await
    }

    async fn load(&mut self, path: &Path, known_context: Option<HashSet<PathBuf>>) -> Result<()> {
        let path = self.resolve(path);
        let previous_root = self.store.root().map(Path::to_path_buf);
        let options = self.scan_options();

        if let Err(e) = self.store.load_directory(&path, options).await {
            self.record_error(&e);
            return Err(e);
        }

        if self.store.root() != previous_root.as_deref() {
            let context = std::mem::take(&mut self.state.context);
            self.state = ControllerState {
                context,
                show_hidden: self.state.show_hidden,
                ..ControllerState::default()
            };
            self.search_results = None;
        }
        if let Some(context) = known_context {
            self.state.context = context;
        }

        self.last_error = None;
        self.reconcile().await;
        self.emit_tree();
        self.sync_watches();
        Ok(())
    }

    /// Rescan the root from scratch, keeping expanded directories expanded.
    pub async fn refresh(&mut self) -> Result<()> {
        let Some(root) = self.store.root().map(Path::to_path_buf) else {
            return Ok(());
        };
        self.load_directory(&root).await
    }

    /// Bring state back in line with the store after it changed.
    async fn reconcile(&mut self) {
        self.restore_expanded().await;
        self.state
            .expanded
            .retain(|p| self.store.node(p).is_some_and(TreeNode::is_dir));
        self.state.multi_selected.retain(|p| self.store.contains(p));
        if self.search_results.is_some() {
            let results = self
                .store
                .search(&self.state.search_query, &self.state.file_type_filter);
            self.search_results = Some(results.into_iter().map(|n| n.path).collect());
        }
        self.rebuild_visible();
        self.ensure_selection_visible();
    }

    /// Re-expand directories whose listing was dropped, ancestors first.
    async fn restore_expanded(&mut self) {
        for path in expanded_paths_in_restore_order(&self.state.expanded) {
            let needs_scan = self
                .store
                .node(&path)
                .is_some_and(|n| n.is_dir() && !n.children_loaded);
            if !needs_scan {
                continue;
            }
            if let Err(e) = self.store.expand(&path).await {
                debug!(path = %path.display(), error = %e, "dropping unexpandable directory");
                self.state.expanded.remove(&path);
            }
        }
    }

    // ── Selection and navigation ────────────────────────────────────────────

    /// Move the cursor to `path`. Ignored unless `path` is visible.
    pub fn select_file(&mut self, path: &Path) -> bool {
        let path = self.resolve(path);
        if !self.is_visible(&path) {
            return false;
        }
        self.set_selection(Some(path));
        true
    }

    pub fn navigate_down(&mut self) {
        let next = match self.selected_index() {
            Some(i) => (i + 1).min(self.visible.len().saturating_sub(1)),
            None => 0,
        };
        self.select_index(next);
    }

    pub fn navigate_up(&mut self) {
        let prev = match self.selected_index() {
            Some(i) => i.saturating_sub(1),
            None => 0,
        };
        self.select_index(prev);
    }

    pub fn select_first(&mut self) {
        self.select_index(0);
    }

    pub fn select_last(&mut self) {
        self.select_index(self.visible.len().saturating_sub(1));
    }

    fn selected_index(&self) -> Option<usize> {
        let selected = self.state.selected_path.as_deref()?;
        self.visible.iter().position(|v| v.path == selected)
    }

    fn select_index(&mut self, index: usize) {
        if let Some(item) = self.visible.get(index) {
            let path = item.path.clone();
            self.set_selection(Some(path));
        }
    }

    fn set_selection(&mut self, path: Option<PathBuf>) {
        if self.state.selected_path == path {
            return;
        }
        for item in &mut self.visible {
            item.is_selected = path.as_deref() == Some(item.path.as_path());
        }
        self.state.selected_path = path.clone();
        if let Some(path) = path {
            self.events.send(BrowserEvent::FileSelected { path });
        }
    }

    /// Move a selection that is no longer visible to its nearest visible
    /// ancestor, or clear it.
    fn ensure_selection_visible(&mut self) {
        let Some(selected) = self.state.selected_path.clone() else {
            return;
        };
        if self.is_visible(&selected) {
            return;
        }
        let fallback = selected
            .ancestors()
            .skip(1)
            .find(|a| self.is_visible(a))
            .map(Path::to_path_buf);
        self.set_selection(fallback);
    }

    // ── Expand / collapse ───────────────────────────────────────────────────

    /// Collapse an expanded directory or expand a collapsed one.
    ///
    /// Collapsing keeps the listing cached. A selection inside the collapsed
    /// directory moves to the directory itself. Files are ignored.
    pub async fn toggle_directory(&mut self, path: &Path) -> Result<()> {
        let path = self.resolve(path);
        match self.store.node(&path) {
            Some(node) if node.is_dir() => {}
            Some(_) => return Ok(()),
            None => return Err(BrowserError::NotFound(path)),
        }

        if self.state.expanded.remove(&path) {
            debug!(path = %path.display(), "collapsed");
            let hides_selection = self
                .state
                .selected_path
                .as_deref()
                .is_some_and(|s| s != path && s.starts_with(&path));
            self.rebuild_visible();
            if hides_selection {
                self.set_selection(Some(path.clone()));
            }
        } else {
            if let Err(e) = self.store.expand(&path).await {
                self.record_error(&e);
                return Err(e);
            }
            debug!(path = %path.display(), "expanded");
            self.last_error = None;
            self.state.expanded.insert(path.clone());
            // Nested directories that were expanded before the collapse come
            // back with their own cached listings.
            self.restore_expanded().await;
            self.rebuild_visible();
        }

        self.ensure_selection_visible();
        self.emit_tree();
        self.sync_watches();
        Ok(())
    }

    // ── Context ─────────────────────────────────────────────────────────────

    /// Add a file to the context collection, or remove it if already there.
    ///
    /// Directories and unknown paths are ignored. A path already in context is
    /// removed even if it has vanished from disk.
    pub fn toggle_file_context(&mut self, path: &Path) {
        let path = self.resolve(path);
        if self.state.context.contains(&path) {
            self.remove_from_context(&path);
        } else if let Some(node) = self.store.node(&path).filter(|n| n.is_file()).cloned() {
            self.add_to_context(node);
        }
        self.refresh_flags();
    }

    fn add_to_context(&mut self, node: TreeNode) {
        self.state.context.insert(node.path.clone());
        self.context_sink
            .add(&node.path, ContextMetadata::from(&node));
        self.events.send(BrowserEvent::FileAddedToContext {
            path: node.path.clone(),
            node,
        });
    }

    fn remove_from_context(&mut self, path: &Path) {
        self.state.context.remove(path);
        self.context_sink.remove(path);
        self.events.send(BrowserEvent::FileRemovedFromContext {
            path: path.to_path_buf(),
        });
    }

    // ── Multi-select ────────────────────────────────────────────────────────

    pub fn enable_multi_select_mode(&mut self) {
        self.state.multi_select_mode = true;
    }

    /// Leave multi-select mode, dropping the current multi-selection.
    pub fn disable_multi_select_mode(&mut self) {
        self.state.multi_select_mode = false;
        self.clear_multi_selection();
    }

    /// Flip `path` in the multi-selection. Ignored outside multi-select mode.
    pub fn toggle_multi_select(&mut self, path: &Path) {
        if !self.state.multi_select_mode {
            return;
        }
        let path = self.resolve(path);
        if !self.state.multi_selected.remove(&path) {
            if !self.store.contains(&path) {
                return;
            }
            self.state.multi_selected.insert(path);
        }
        self.refresh_flags();
        self.emit_multi_selection();
    }

    /// Empty the multi-selection without leaving multi-select mode.
    pub fn clear_multi_selection(&mut self) {
        if self.state.multi_selected.is_empty() {
            return;
        }
        self.state.multi_selected.clear();
        self.refresh_flags();
        self.emit_multi_selection();
    }

    /// Add every multi-selected file that is not yet in context, then clear
    /// the multi-selection. Returns the number of files added.
    pub fn add_multi_selection_to_context(&mut self) -> usize {
        let mut paths: Vec<PathBuf> = self.state.multi_selected.iter().cloned().collect();
        paths.sort();
        let mut added = 0;
        for path in paths {
            if self.state.context.contains(&path) {
                continue;
            }
            if let Some(node) = self.store.node(&path).filter(|n| n.is_file()).cloned() {
                self.add_to_context(node);
                added += 1;
            }
        }
        self.clear_multi_selection();
        self.refresh_flags();
        added
    }

    fn emit_multi_selection(&self) {
        let mut paths: Vec<PathBuf> = self.state.multi_selected.iter().cloned().collect();
        paths.sort();
        self.events
            .send(BrowserEvent::MultiSelectionChanged { paths });
    }

    // ── Search and filters ──────────────────────────────────────────────────

    /// Replace the visible list with matches from the scanned tree.
    ///
    /// An empty query with no type filter ends the search and restores the
    /// expanded tree.
    pub fn search_files(&mut self, query: &str, options: SearchOptions) -> Vec<TreeNode> {
        self.state.search_query = query.to_string();
        self.state.file_type_filter = options;

        if query.is_empty() && self.state.file_type_filter.is_empty() {
            self.search_results = None;
            self.rebuild_visible();
            self.ensure_selection_visible();
            self.emit_tree();
            return Vec::new();
        }

        let results = self
            .store
            .search(query, &self.state.file_type_filter);
        debug!(query, hits = results.len(), "search");
        self.search_results = Some(results.iter().map(|n| n.path.clone()).collect());
        self.rebuild_visible();
        self.ensure_selection_visible();
        self.events.send(BrowserEvent::SearchCompleted {
            query: query.to_string(),
            results: results.clone(),
        });
        results
    }

    /// Change the type filter, keeping the current query.
    pub fn set_file_type_filter(&mut self, options: SearchOptions) -> Vec<TreeNode> {
        let query = self.state.search_query.clone();
        self.search_files(&query, options)
    }

    /// Flip hidden-file visibility and rescan the root.
    pub async fn toggle_hidden_files(&mut self) -> Result<()> {
        self.state.show_hidden = !self.state.show_hidden;
        if self.store.root().is_none() {
            return Ok(());
        }
        if let Err(e) = self.refresh().await {
            self.state.show_hidden = !self.state.show_hidden;
            return Err(e);
        }
        Ok(())
    }

    // ── Watching ────────────────────────────────────────────────────────────

    /// Subscribe to changes of the root and every expanded directory.
    ///
    /// On failure the controller keeps working with manual refresh only.
    pub fn enable_file_system_watching(&mut self) -> Result<()> {
        if self.watch.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(self.watch_settings.queue_capacity.max(1));
        let mut watcher = match FsWatcher::new(self.watch_settings, tx) {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "file watching disabled");
                self.record_error(&e);
                return Err(e);
            }
        };
        if let Some(root) = self.store.root() {
            if let Err(e) = watcher.watch(root) {
                warn!(error = %e, "file watching disabled");
                self.record_error(&e);
                return Err(e);
            }
        }
        info!("file watching enabled");
        self.watch = Some(WatchSubscription { watcher, rx });
        self.sync_watches();
        Ok(())
    }

    pub fn disable_file_system_watching(&mut self) {
        if self.watch.take().is_some() {
            info!("file watching disabled");
        }
    }

    fn watched_dirs(&self) -> HashSet<PathBuf> {
        let mut dirs = self.state.expanded.clone();
        if let Some(root) = self.store.root() {
            dirs.insert(root.to_path_buf());
        }
        dirs
    }

    fn sync_watches(&mut self) {
        let dirs = self.watched_dirs();
        if let Some(sub) = self.watch.as_mut() {
            for dir in sub.watcher.sync(&dirs) {
                debug!(path = %dir.display(), "not watched");
            }
        }
    }

    /// Apply every queued watch batch. Returns the number of directories
    /// rescanned.
    pub async fn process_watch_events(&mut self) -> Result<usize> {
        let dirs = match self.watch.as_mut() {
            Some(sub) => {
                let flooded = sub.watcher.take_overflow();
                drain_batch(&mut sub.rx, None, flooded)
            }
            None => return Ok(0),
        };
        self.apply_batch(dirs).await
    }

    /// Wait for the next watch batch and apply it. Never resolves while
    /// watching is disabled.
    pub async fn next_watch_batch(&mut self) -> Result<usize> {
        let dirs = match self.watch.as_mut() {
            Some(sub) => match sub.rx.recv().await {
                Some(first) => {
                    let flooded = sub.watcher.take_overflow();
                    drain_batch(&mut sub.rx, Some(first), flooded)
                }
                None => return Ok(0),
            },
            None => std::future::pending().await,
        };
        self.apply_batch(dirs).await
    }

    async fn apply_batch(&mut self, batch: WatchBatch) -> Result<usize> {
        let dirs: Vec<PathBuf> = match batch {
            WatchBatch::Dirs(dirs) => dirs.into_iter().collect(),
            WatchBatch::Everything => {
                let mut dirs: Vec<PathBuf> = self.watched_dirs().into_iter().collect();
                dirs.sort();
                dirs
            }
        };
        if dirs.is_empty() {
            return Ok(0);
        }
        self.apply_fs_changes(dirs).await
    }

    /// Refresh the listed directories as if change notifications had arrived
    /// for them.
    ///
    /// Expanded directories (and the root) are rescanned and merged in place;
    /// other directories only lose their cache entry. The first refresh
    /// failure is returned after all directories were processed.
    pub async fn apply_fs_changes(&mut self, mut dirs: Vec<PathBuf>) -> Result<usize> {
        // Parents first, so a vanished subdirectory is evicted before its own
        // refresh is attempted.
        dirs.sort_by(|a, b| {
            a.components()
                .count()
                .cmp(&b.components().count())
                .then_with(|| a.cmp(b))
        });
        dirs.dedup();

        let root = self.store.root().map(Path::to_path_buf);
        let mut refreshed = 0;
        let mut first_error = None;

        for dir in dirs {
            if !self.store.contains(&dir) {
                continue;
            }
            let is_root = root.as_deref() == Some(dir.as_path());
            if is_root || self.state.expanded.contains(&dir) {
                match self.store.refresh(&dir).await {
                    Ok(_) => refreshed += 1,
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "refresh failed");
                        first_error.get_or_insert(e);
                    }
                }
            } else {
                self.store.invalidate(&dir);
            }
        }

        self.reconcile().await;
        if refreshed > 0 {
            self.emit_tree();
        }
        self.sync_watches();

        match first_error {
            Some(e) => {
                self.record_error(&e);
                Err(e)
            }
            None => Ok(refreshed),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn rebuild_visible(&mut self) {
        self.visible = match &self.search_results {
            Some(results) => {
                let root = self.store.root();
                let count = results.len();
                results
                    .iter()
                    .enumerate()
                    .filter_map(|(i, p)| self.store.node(p).map(|n| (i, n)))
                    .map(|(i, node)| {
                        VisibleNode::new(node, depth_below(root, &node.path), i + 1 == count, &self.state)
                    })
                    .collect()
            }
            None => {
                let mut out = Vec::new();
                if let Some(root) = self.store.root() {
                    flatten_into(&self.store, &self.state, root, 0, &mut out);
                }
                out
            }
        };
    }

    /// Recompute per-row flags without rebuilding the list.
    fn refresh_flags(&mut self) {
        for item in &mut self.visible {
            item.is_in_context = self.state.context.contains(&item.path);
            item.is_multi_selected = self.state.multi_selected.contains(&item.path);
        }
    }

    fn emit_tree(&self) {
        self.events.send(BrowserEvent::TreeLoaded {
            nodes: self.visible.clone(),
        });
    }

    fn record_error(&mut self, err: &BrowserError) {
        warn!(error = %err, "operation failed");
        self.last_error = Some(err.to_string());
    }
}

/// Pre-order walk that descends only into expanded, scanned directories.
fn flatten_into(
    store: &TreeStore,
    state: &ControllerState,
    dir: &Path,
    depth: usize,
    out: &mut Vec<VisibleNode>,
) {
    let Some(children) = store.children(dir) else {
        return;
    };
    let count = children.len();
    for (i, child) in children.iter().enumerate() {
        let Some(node) = store.node(child) else {
            continue;
        };
        out.push(VisibleNode::new(node, depth, i + 1 == count, state));
        if node.is_dir() && state.expanded.contains(child) {
            flatten_into(store, state, child, depth + 1, out);
        }
    }
}

fn depth_below(root: Option<&Path>, path: &Path) -> usize {
    root.and_then(|r| path.strip_prefix(r).ok())
        .map(|rel| rel.components().count().saturating_sub(1))
        .unwrap_or(0)
}

/// Expanded paths sorted so ancestors are restored before descendants.
fn expanded_paths_in_restore_order(expanded: &HashSet<PathBuf>) -> Vec<PathBuf> {
    let mut ordered: Vec<PathBuf> = expanded.iter().cloned().collect();
    ordered.sort_by(|a, b| {
        a.components()
            .count()
            .cmp(&b.components().count())
            .then_with(|| a.cmp(b))
    });
    ordered
}

#[derive(Debug, PartialEq, Eq)]
enum WatchBatch {
    Dirs(BTreeSet<PathBuf>),
    Everything,
}

/// Collapse everything currently queued into one batch.
fn drain_batch(
    rx: &mut mpsc::Receiver<WatchEvent>,
    first: Option<WatchEvent>,
    flooded: bool,
) -> WatchBatch {
    let mut dirs = BTreeSet::new();
    let mut everything = flooded;
    let mut next = first.or_else(|| rx.try_recv().ok());
    while let Some(event) = next {
        match event {
            WatchEvent::Changed(changed) => dirs.extend(changed),
            WatchEvent::Flood => everything = true,
        }
        next = rx.try_recv().ok();
    }
    if everything {
        WatchBatch::Everything
    } else {
        WatchBatch::Dirs(dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextList;
    use crate::event;
    use std::fs::{self, File};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Clone, Default)]
    struct RecordingSink {
        calls: Arc<Mutex<Vec<String>>>,
        list: Arc<Mutex<ContextList>>,
    }

    impl ContextSink for RecordingSink {
        fn add(&mut self, path: &Path, metadata: ContextMetadata) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("add {}", metadata.name));
            self.list.lock().unwrap().add(path, metadata);
        }

        fn remove(&mut self, path: &Path) {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            self.calls.lock().unwrap().push(format!("remove {}", name));
            self.list.lock().unwrap().remove(path);
        }
    }

    struct Fixture {
        dir: TempDir,
        root: PathBuf,
        controller: BrowserController,
        events: UnboundedReceiver<BrowserEvent>,
        sink: RecordingSink,
    }

    impl Fixture {
        fn path(&self, rel: &str) -> PathBuf {
            self.root.join(rel)
        }

        fn visible_names(&self) -> Vec<String> {
            self.controller
                .visible_nodes()
                .iter()
                .map(|v| v.name.clone())
                .collect()
        }

        fn drain(&mut self) -> Vec<BrowserEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    async fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src").join("main.ts"), "main").unwrap();
        fs::write(dir.path().join("src").join("utils.ts"), "utils").unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        File::create(dir.path().join(".hidden")).unwrap();
        let root = dir.path().canonicalize().unwrap();

        let sink = RecordingSink::default();
        let (tx, events) = event::channel();
        let mut controller = BrowserController::new(TreeStore::new(), Box::new(sink.clone()), tx);
        controller.load_directory(&root).await.unwrap();

        let mut fixture = Fixture {
            dir,
            root,
            controller,
            events,
            sink,
        };
        fixture.drain();
        fixture
    }

    #[tokio::test]
    async fn example_session() {
        let mut f = setup().await;
        assert_eq!(f.visible_names(), vec!["src", "package.json"]);

        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        assert_eq!(
            f.visible_names(),
            vec!["src", "main.ts", "utils.ts", "package.json"]
        );
        assert_eq!(f.controller.visible_nodes()[1].depth, 1);

        let results = f.controller.search_files("util", SearchOptions::default());
        let names: Vec<&str> = results.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["utils.ts"]);
        assert_eq!(f.visible_names(), vec!["utils.ts"]);

        f.drain();
        f.controller.toggle_file_context(Path::new("src/utils.ts"));
        let utils = f.path("src/utils.ts");
        assert_eq!(f.controller.state().context, HashSet::from([utils.clone()]));
        let added: Vec<_> = f
            .drain()
            .into_iter()
            .filter(|e| matches!(e, BrowserEvent::FileAddedToContext { .. }))
            .collect();
        assert_eq!(added.len(), 1);
        assert!(f.controller.visible_nodes()[0].is_in_context);
    }

    #[tokio::test]
    async fn load_emits_tree_loaded() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("a.rs")).unwrap();
        let (tx, mut rx) = event::channel();
        let mut controller =
            BrowserController::new(TreeStore::new(), Box::new(ContextList::new()), tx);
        controller.load_directory(dir.path()).await.unwrap();
        match rx.try_recv().unwrap() {
            BrowserEvent::TreeLoaded { nodes } => assert_eq!(nodes.len(), 1),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn collapsing_moves_selection_to_directory() {
        let mut f = setup().await;
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        assert!(f.controller.select_file(Path::new("src/main.ts")));
        f.drain();

        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        assert_eq!(f.controller.state().selected_path, Some(f.path("src")));
        assert_eq!(f.visible_names(), vec!["src", "package.json"]);
        assert!(f
            .drain()
            .iter()
            .any(|e| matches!(e, BrowserEvent::FileSelected { path } if path.ends_with("src"))));
    }

    #[tokio::test]
    async fn selection_stays_visible_through_nested_collapses() {
        let mut f = setup().await;
        fs::create_dir(f.path("src/nested")).unwrap();
        File::create(f.path("src/nested/deep.rs")).unwrap();
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        f.controller
            .toggle_directory(Path::new("src/nested"))
            .await
            .unwrap();
        assert!(f.controller.select_file(Path::new("src/nested/deep.rs")));

        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        assert_eq!(f.controller.state().selected_path, Some(f.path("src")));

        // Re-expanding brings the nested expansion back from cache.
        let scans = f.controller.store().scan_count();
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        assert_eq!(f.controller.store().scan_count(), scans);
        assert!(f.visible_names().contains(&"deep.rs".to_string()));
    }

    #[tokio::test]
    async fn repeated_toggle_does_not_rescan() {
        let mut f = setup().await;
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        let scans = f.controller.store().scan_count();
        for _ in 0..4 {
            f.controller.toggle_directory(Path::new("src")).await.unwrap();
        }
        assert_eq!(f.controller.store().scan_count(), scans);
    }

    #[tokio::test]
    async fn select_file_ignores_hidden_nodes() {
        let mut f = setup().await;
        assert!(!f.controller.select_file(Path::new("src/main.ts")));
        assert!(f.controller.state().selected_path.is_none());
        assert!(f.drain().is_empty());
    }

    #[tokio::test]
    async fn navigation_clamps_at_both_ends() {
        let mut f = setup().await;
        f.controller.navigate_down();
        assert_eq!(f.controller.state().selected_path, Some(f.path("src")));
        f.controller.navigate_up();
        assert_eq!(f.controller.state().selected_path, Some(f.path("src")));

        f.controller.navigate_down();
        f.controller.navigate_down();
        assert_eq!(
            f.controller.state().selected_path,
            Some(f.path("package.json"))
        );
        assert_eq!(
            f.controller.selected_node().unwrap().name,
            "package.json"
        );
    }

    #[tokio::test]
    async fn navigation_follows_flattened_order() {
        let mut f = setup().await;
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        f.controller.select_first();
        f.controller.navigate_down();
        assert_eq!(f.controller.state().selected_path, Some(f.path("src/main.ts")));
        f.controller.select_last();
        f.controller.navigate_up();
        assert_eq!(
            f.controller.state().selected_path,
            Some(f.path("src/utils.ts"))
        );
    }

    #[tokio::test]
    async fn context_toggle_round_trips() {
        let mut f = setup().await;
        let before = f.controller.state().context.clone();
        f.controller.toggle_file_context(Path::new("package.json"));
        f.controller.toggle_file_context(Path::new("package.json"));
        assert_eq!(f.controller.state().context, before);

        let context_events: Vec<BrowserEvent> = f
            .drain()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    BrowserEvent::FileAddedToContext { .. }
                        | BrowserEvent::FileRemovedFromContext { .. }
                )
            })
            .collect();
        assert_eq!(context_events.len(), 2);
        assert!(matches!(
            context_events[0],
            BrowserEvent::FileAddedToContext { .. }
        ));
        assert!(matches!(
            context_events[1],
            BrowserEvent::FileRemovedFromContext { .. }
        ));
        assert_eq!(
            *f.sink.calls.lock().unwrap(),
            vec!["add package.json", "remove package.json"]
        );
        assert!(f.sink.list.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn context_toggle_on_directory_is_noop() {
        let mut f = setup().await;
        f.controller.toggle_file_context(Path::new("src"));
        assert!(f.controller.state().context.is_empty());
        assert!(f.sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleted_context_file_stays_in_context() {
        let mut f = setup().await;
        f.controller.toggle_file_context(Path::new("package.json"));
        let package = f.path("package.json");
        fs::remove_file(&package).unwrap();
        let root = f.root.clone();
        f.controller.apply_fs_changes(vec![root]).await.unwrap();

        assert!(!f.controller.store().contains(&package));
        assert!(f.controller.state().context.contains(&package));

        f.controller.toggle_file_context(&package);
        assert!(f.controller.state().context.is_empty());
        assert_eq!(
            *f.sink.calls.lock().unwrap(),
            vec!["add package.json", "remove package.json"]
        );
    }

    #[tokio::test]
    async fn search_narrows_and_clearing_restores() {
        let mut f = setup().await;
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        let before: Vec<VisibleNode> = f.controller.visible_nodes().to_vec();
        let scanned: Vec<PathBuf> = f
            .controller
            .store()
            .scanned_preorder()
            .iter()
            .map(|n| n.path.clone())
            .collect();

        for query in ["s", "ts", "main", "pkg", "zzz"] {
            let results = f.controller.search_files(query, SearchOptions::default());
            assert!(results.iter().all(|n| scanned.contains(&n.path)), "{}", query);
        }

        f.controller.search_files("", SearchOptions::default());
        assert!(!f.controller.is_searching());
        assert_eq!(f.controller.visible_nodes(), before.as_slice());
    }

    #[tokio::test]
    async fn search_emits_completed_event() {
        let mut f = setup().await;
        f.controller.search_files("pack", SearchOptions::default());
        let events = f.drain();
        assert!(events.iter().any(|e| matches!(
            e,
            BrowserEvent::SearchCompleted { query, results }
                if query == "pack" && results.len() == 1
        )));
    }

    #[tokio::test]
    async fn type_filter_intersects_with_query() {
        let mut f = setup().await;
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        let results = f
            .controller
            .search_files("", SearchOptions::with_file_types(["json"]));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "package.json");

        let results = f
            .controller
            .search_files("main", SearchOptions::with_file_types(["json"]));
        assert!(results.is_empty());

        let results = f
            .controller
            .set_file_type_filter(SearchOptions::with_file_types(["ts"]));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "main.ts");
    }

    #[tokio::test]
    async fn search_clears_selection_outside_results() {
        let mut f = setup().await;
        f.controller.select_file(Path::new("package.json"));
        f.controller.search_files("src", SearchOptions::default());
        assert!(f.controller.state().selected_path.is_none());
    }

    #[tokio::test]
    async fn hidden_toggle_rescans_and_keeps_expansion() {
        let mut f = setup().await;
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        assert!(f.visible_names().iter().all(|n| !n.starts_with('.')));

        f.controller.toggle_hidden_files().await.unwrap();
        assert!(f.controller.state().show_hidden);
        assert!(f.visible_names().contains(&".hidden".to_string()));
        assert!(f.visible_names().contains(&"main.ts".to_string()));
        assert!(f.controller.state().expanded.contains(&f.path("src")));

        f.controller.toggle_hidden_files().await.unwrap();
        assert!(!f.visible_names().contains(&".hidden".to_string()));
    }

    #[tokio::test]
    async fn watch_refresh_picks_up_new_file_and_keeps_flags() {
        let mut f = setup().await;
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        f.controller.select_file(Path::new("src/main.ts"));
        f.controller.toggle_file_context(Path::new("src/main.ts"));

        fs::write(f.path("src/added.ts"), "").unwrap();
        let src = f.path("src");
        let refreshed = f.controller.apply_fs_changes(vec![src.clone()]).await.unwrap();
        assert_eq!(refreshed, 1);

        assert_eq!(
            f.visible_names(),
            vec!["src", "added.ts", "main.ts", "utils.ts", "package.json"]
        );
        let main = f
            .controller
            .visible_nodes()
            .iter()
            .find(|v| v.name == "main.ts")
            .unwrap();
        assert!(main.is_selected);
        assert!(main.is_in_context);

        let scans = f.controller.store().scan_count();
        f.controller.toggle_directory(&src).await.unwrap();
        f.controller.toggle_directory(&src).await.unwrap();
        assert_eq!(f.controller.store().scan_count(), scans);
    }

    #[tokio::test]
    async fn watch_change_on_collapsed_dir_only_invalidates() {
        let mut f = setup().await;
        let src = f.path("src");
        f.controller.toggle_directory(&src).await.unwrap();
        f.controller.toggle_directory(&src).await.unwrap();

        fs::write(src.join("later.ts"), "").unwrap();
        let refreshed = f.controller.apply_fs_changes(vec![src.clone()]).await.unwrap();
        assert_eq!(refreshed, 0);
        assert!(f.controller.store().cache_entry(&src).is_none());

        f.controller.toggle_directory(&src).await.unwrap();
        assert!(f.visible_names().contains(&"later.ts".to_string()));
    }

    #[tokio::test]
    async fn removed_selected_file_falls_back_to_parent() {
        let mut f = setup().await;
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        f.controller.select_file(Path::new("src/utils.ts"));
        fs::remove_file(f.path("src/utils.ts")).unwrap();
        let src = f.path("src");
        f.controller.apply_fs_changes(vec![src]).await.unwrap();
        assert_eq!(f.controller.state().selected_path, Some(f.path("src")));
    }

    #[tokio::test]
    async fn removed_expanded_directory_leaves_expanded_set() {
        let mut f = setup().await;
        let src = f.path("src");
        f.controller.toggle_directory(&src).await.unwrap();
        fs::remove_dir_all(&src).unwrap();
        let root = f.root.clone();
        f.controller
            .apply_fs_changes(vec![root, src.clone()])
            .await
            .unwrap();
        assert!(!f.controller.state().expanded.contains(&src));
        assert_eq!(f.visible_names(), vec!["package.json"]);
    }

    #[tokio::test]
    async fn multi_select_requires_mode() {
        let mut f = setup().await;
        f.controller.toggle_multi_select(Path::new("package.json"));
        assert!(f.controller.state().multi_selected.is_empty());

        f.controller.enable_multi_select_mode();
        f.controller.toggle_multi_select(Path::new("package.json"));
        f.controller.toggle_multi_select(Path::new("src"));
        assert_eq!(f.controller.state().multi_selected.len(), 2);

        f.controller.toggle_multi_select(Path::new("src"));
        assert_eq!(f.controller.state().multi_selected.len(), 1);

        f.controller.disable_multi_select_mode();
        assert!(!f.controller.state().multi_select_mode);
        assert!(f.controller.state().multi_selected.is_empty());
        let last_change = f
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                BrowserEvent::MultiSelectionChanged { paths } => Some(paths),
                _ => None,
            })
            .last()
            .unwrap();
        assert!(last_change.is_empty());
    }

    #[tokio::test]
    async fn clear_multi_selection_stays_in_mode() {
        let mut f = setup().await;
        f.controller.enable_multi_select_mode();
        f.controller.toggle_multi_select(Path::new("package.json"));
        f.controller.clear_multi_selection();
        assert!(f.controller.state().multi_select_mode);
        assert!(f.controller.state().multi_selected.is_empty());
    }

    #[tokio::test]
    async fn multi_selection_adds_files_to_context() {
        let mut f = setup().await;
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        f.controller.enable_multi_select_mode();
        for p in ["src", "src/main.ts", "src/utils.ts", "package.json"] {
            f.controller.toggle_multi_select(Path::new(p));
        }
        f.controller.toggle_file_context(Path::new("package.json"));

        let added = f.controller.add_multi_selection_to_context();
        assert_eq!(added, 2);
        assert_eq!(f.controller.state().context.len(), 3);
        assert!(f.controller.state().multi_selected.is_empty());
        assert_eq!(f.sink.list.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_load_keeps_last_known_good_tree() {
        let mut f = setup().await;
        let missing = f.dir.path().join("missing");
        let err = f.controller.load_directory(&missing).await.unwrap_err();
        assert!(matches!(err, BrowserError::NotFound(_)));
        assert_eq!(f.visible_names(), vec!["src", "package.json"]);
        assert!(f.controller.last_error().is_some());

        f.controller.refresh().await.unwrap();
        assert!(f.controller.last_error().is_none());
    }

    #[tokio::test]
    async fn failed_expand_reports_error_and_keeps_state() {
        let mut f = setup().await;
        let src = f.path("src");
        fs::remove_dir_all(&src).unwrap();
        let err = f.controller.toggle_directory(&src).await.unwrap_err();
        assert!(matches!(err, BrowserError::NotFound(_)));
        assert!(!f.controller.state().expanded.contains(&src));
        assert_eq!(f.visible_names(), vec!["src", "package.json"]);
    }

    #[tokio::test]
    async fn known_context_seeds_flags_without_notifications() {
        let mut f = setup().await;
        let package = f.path("package.json");
        let root = f.root.clone();
        f.controller
            .load_directory_with_context(&root, HashSet::from([package.clone()]))
            .await
            .unwrap();
        let row = f
            .controller
            .visible_nodes()
            .iter()
            .find(|v| v.path == package)
            .unwrap();
        assert!(row.is_in_context);
        assert!(f.sink.calls.lock().unwrap().is_empty());

        let loads: Vec<Vec<VisibleNode>> = f
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                BrowserEvent::TreeLoaded { nodes } => Some(nodes),
                _ => None,
            })
            .collect();
        assert_eq!(loads.len(), 1);
        assert!(loads[0].iter().any(|v| v.path == package && v.is_in_context));
    }

    #[tokio::test]
    async fn loading_a_new_root_resets_navigation_state() {
        let mut f = setup().await;
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        f.controller.select_file(Path::new("src/main.ts"));
        let src = f.path("src");
        let other = TempDir::new().unwrap();
        File::create(other.path().join("x.rs")).unwrap();

        f.controller.load_directory(other.path()).await.unwrap();
        assert!(f.controller.state().expanded.is_empty());
        assert!(f.controller.state().selected_path.is_none());
        assert_eq!(f.visible_names(), vec!["x.rs"]);
        assert!(!f.controller.store().contains(&src));
    }

    #[tokio::test]
    async fn burst_of_writes_arrives_as_one_refresh() {
        let mut f = setup().await;
        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        f.controller.enable_file_system_watching().unwrap();
        f.drain();

        for i in 0..5 {
            fs::write(f.path(&format!("src/n{}.ts", i)), "new").unwrap();
        }

        let applied = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            f.controller.next_watch_batch(),
        )
        .await
        .expect("no watch batch arrived")
        .unwrap();
        assert_eq!(applied, 1);

        // A slow backend may split the burst; pick up any remainder.
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        f.controller.process_watch_events().await.unwrap();

        let names = f.visible_names();
        for i in 0..5 {
            let name = format!("n{}.ts", i);
            assert!(names.contains(&name), "{} missing from {:?}", name, names);
        }
        assert!(f
            .drain()
            .iter()
            .any(|e| matches!(e, BrowserEvent::TreeLoaded { .. })));
    }

    #[tokio::test]
    async fn watch_set_follows_expanded_directories() {
        let mut f = setup().await;
        f.controller.enable_file_system_watching().unwrap();
        assert!(f.controller.is_watching());
        assert_eq!(f.controller.process_watch_events().await.unwrap(), 0);

        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        let watched = f.controller.watch.as_ref().unwrap().watcher.watched();
        assert_eq!(watched, vec![f.root.clone(), f.path("src")]);

        f.controller.toggle_directory(Path::new("src")).await.unwrap();
        let watched = f.controller.watch.as_ref().unwrap().watcher.watched();
        assert_eq!(watched, vec![f.root.clone()]);

        f.controller.disable_file_system_watching();
        assert!(!f.controller.is_watching());
        assert_eq!(f.controller.process_watch_events().await.unwrap(), 0);
    }

    #[test]
    fn expanded_restore_order_is_parent_first() {
        let root = PathBuf::from("/tmp/root");
        let alpha = root.join("alpha");
        let nested = alpha.join("nested");
        let expanded = HashSet::from([nested.clone(), root.clone(), alpha.clone()]);
        assert_eq!(
            expanded_paths_in_restore_order(&expanded),
            vec![root, alpha, nested]
        );
    }

    #[test]
    fn drain_batch_merges_queued_events() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.try_send(WatchEvent::Changed(vec![PathBuf::from("/p/a")]))
            .unwrap();
        tx.try_send(WatchEvent::Changed(vec![
            PathBuf::from("/p/a"),
            PathBuf::from("/p/b"),
        ]))
        .unwrap();
        let batch = drain_batch(&mut rx, None, false);
        assert_eq!(
            batch,
            WatchBatch::Dirs(BTreeSet::from([PathBuf::from("/p/a"), PathBuf::from("/p/b")]))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn drain_batch_flood_or_overflow_means_everything() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.try_send(WatchEvent::Flood).unwrap();
        assert_eq!(drain_batch(&mut rx, None, false), WatchBatch::Everything);
        assert_eq!(drain_batch(&mut rx, None, true), WatchBatch::Everything);
        assert_eq!(
            drain_batch(&mut rx, None, false),
            WatchBatch::Dirs(BTreeSet::new())
        );
    }

    #[test]
    fn depth_below_root() {
        let root = Path::new("/p");
        assert_eq!(depth_below(Some(root), Path::new("/p/a.rs")), 0);
        assert_eq!(depth_below(Some(root), Path::new("/p/src/a.rs")), 1);
        assert_eq!(depth_below(None, Path::new("/p/src/a.rs")), 0);
    }
}
