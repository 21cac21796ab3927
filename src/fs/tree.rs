use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{BrowserError, Result};
use crate::fs::ignore::IgnoreRules;
use crate::fs::search::{self, SearchOptions};

/// Type of filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// A scanned filesystem entry.
///
/// Nodes live in the [`TreeStore`] arena keyed by absolute path; children are
/// referenced by path through the store's cache entry for the directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub path: PathBuf,
    pub name: String,
    pub kind: NodeKind,
    /// Empty for directories and extensionless files.
    pub extension: String,
    /// Zero for directories.
    pub size: u64,
    pub modified: Option<SystemTime>,
    /// Flagged by the ignore-rule evaluator; the node is still listed.
    pub is_ignored: bool,
    /// Whether the directory's children have been scanned since the last
    /// invalidation.
    pub children_loaded: bool,
}

impl TreeNode {
    fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());

        let kind = if metadata.is_dir() {
            NodeKind::Directory
        } else {
            NodeKind::File
        };

        let extension = match kind {
            NodeKind::File => path
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default(),
            NodeKind::Directory => String::new(),
        };

        Self {
            name,
            kind,
            extension,
            size: if kind == NodeKind::File { metadata.len() } else { 0 },
            modified: metadata.modified().ok(),
            is_ignored: false,
            children_loaded: false,
            path,
        }
    }

    #[cfg(test)]
    pub(crate) fn synthetic(path: PathBuf, kind: NodeKind) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let extension = match kind {
            NodeKind::File => path
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default(),
            NodeKind::Directory => String::new(),
        };
        Self {
            path,
            name,
            kind,
            extension,
            size: 0,
            modified: None,
            is_ignored: false,
            children_loaded: false,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// Take the scanned metadata of `fresh` while keeping this node's identity.
    fn refresh_from(&mut self, fresh: TreeNode) {
        self.name = fresh.name;
        self.extension = fresh.extension;
        self.size = fresh.size;
        self.modified = fresh.modified;
        self.is_ignored = fresh.is_ignored;
        if self.kind != fresh.kind {
            self.kind = fresh.kind;
            self.children_loaded = false;
        }
    }
}

/// Scan-time filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// Include entries whose name starts with `.`.
    pub show_hidden: bool,
    /// Consult the ignore-rule evaluator and flag matching entries.
    pub respect_ignore_rules: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            show_hidden: false,
            respect_ignore_rules: true,
        }
    }
}

/// Cached listing of one directory.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
    /// Child paths in display order.
    pub children: Vec<PathBuf>,
    pub scanned_at: SystemTime,
}

/// Scans directories and owns the node arena and its read-through cache.
///
/// A cache entry exists only for directories scanned since their last
/// invalidation, and its presence always coincides with `children_loaded`
/// on the directory node.
pub struct TreeStore {
    root: Option<PathBuf>,
    options: ScanOptions,
    nodes: HashMap<PathBuf, TreeNode>,
    cache: HashMap<PathBuf, CacheEntry>,
    ignore: Option<Arc<dyn IgnoreRules>>,
    scans: u64,
}

impl Default for TreeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeStore {
    pub fn new() -> Self {
        Self {
            root: None,
            options: ScanOptions::default(),
            nodes: HashMap::new(),
            cache: HashMap::new(),
            ignore: None,
            scans: 0,
        }
    }

    pub fn with_ignore_rules(rules: Arc<dyn IgnoreRules>) -> Self {
        let mut store = Self::new();
        store.ignore = Some(rules);
        store
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Options used by the last full load; `expand` scans with these.
    pub fn options(&self) -> ScanOptions {
        self.options
    }

    /// Number of directory listings performed so far.
    pub fn scan_count(&self) -> u64 {
        self.scans
    }

    pub fn node(&self, path: &Path) -> Option<&TreeNode> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn cache_entry(&self, path: &Path) -> Option<&CacheEntry> {
        self.cache.get(path)
    }

    /// Child paths of a scanned directory, in display order.
    pub fn children(&self, path: &Path) -> Option<&[PathBuf]> {
        self.cache.get(path).map(|entry| entry.children.as_slice())
    }

    /// Scan `path` and return its immediate entries.
    ///
    /// Loading the current root, or a path outside it, discards every node and
    /// cache entry and starts over from `path`. Loading a scanned directory
    /// inside the current root (with unchanged options) refreshes that
    /// directory in place. Nothing is modified when the scan fails.
    pub async fn load_directory(
        &mut self,
        path: &Path,
        options: ScanOptions,
    ) -> Result<Vec<TreeNode>> {
        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| BrowserError::from_io(e, path))?;

        if self.is_refreshable_subdir(&canonical, options) {
            debug!(path = %canonical.display(), "targeted reload");
            return self.refresh(&canonical).await;
        }

        let metadata = tokio::fs::metadata(&canonical)
            .await
            .map_err(|e| BrowserError::from_io(e, &canonical))?;
        if !metadata.is_dir() {
            return Err(BrowserError::NotADirectory(canonical));
        }
        let scanned = self.scan(&canonical, options).await?;

        info!(
            root = %canonical.display(),
            entries = scanned.len(),
            "loaded root directory"
        );
        self.nodes.clear();
        self.cache.clear();
        self.options = options;
        self.root = Some(canonical.clone());
        self.nodes.insert(
            canonical.clone(),
            TreeNode::from_metadata(canonical.clone(), &metadata),
        );
        self.attach(&canonical, scanned);
        Ok(self.child_nodes(&canonical))
    }

    fn is_refreshable_subdir(&self, path: &Path, options: ScanOptions) -> bool {
        let Some(root) = self.root.as_deref() else {
            return false;
        };
        path != root
            && path.starts_with(root)
            && options == self.options
            && self.nodes.get(path).is_some_and(TreeNode::is_dir)
    }

    /// Return the children of a resident directory, scanning only on a miss.
    pub async fn expand(&mut self, path: &Path) -> Result<Vec<TreeNode>> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| BrowserError::NotFound(path.to_path_buf()))?;
        if !node.is_dir() {
            return Err(BrowserError::NotADirectory(path.to_path_buf()));
        }
        if node.children_loaded && self.cache.contains_key(path) {
            debug!(path = %path.display(), "cache hit");
            return Ok(self.child_nodes(path));
        }

        let scanned = self.scan(path, self.options).await?;
        self.attach(path, scanned);
        Ok(self.child_nodes(path))
    }

    /// Rescan a resident directory and merge the result in place.
    ///
    /// Equivalent to `invalidate` followed by `expand`, except that a failed
    /// scan leaves the previous listing cached.
    pub async fn refresh(&mut self, path: &Path) -> Result<Vec<TreeNode>> {
        match self.nodes.get(path) {
            Some(node) if node.is_dir() => {}
            Some(_) => return Err(BrowserError::NotADirectory(path.to_path_buf())),
            None => return Err(BrowserError::NotFound(path.to_path_buf())),
        }
        let scanned = self.scan(path, self.options).await?;
        self.attach(path, scanned);
        Ok(self.child_nodes(path))
    }

    /// Drop the cache entry for `path`. Cache entries of its descendants stay.
    pub fn invalidate(&mut self, path: &Path) {
        if self.cache.remove(path).is_some() {
            debug!(path = %path.display(), "invalidated");
        }
        if let Some(node) = self.nodes.get_mut(path) {
            node.children_loaded = false;
        }
    }

    /// Search the scanned part of the tree. Never touches the filesystem.
    ///
    /// Cached listings of collapsed directories are searched too, so results
    /// can include nodes that are not currently visible.
    pub fn search(&self, query: &str, options: &SearchOptions) -> Vec<TreeNode> {
        let candidates = self.scanned_preorder();
        search::rank(candidates, query, options)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Every node reachable from the root through scanned directories, in
    /// display order. The root itself is excluded.
    pub fn scanned_preorder(&self) -> Vec<&TreeNode> {
        let mut out = Vec::new();
        if let Some(root) = self.root.as_deref() {
            self.collect_preorder(root, &mut out);
        }
        out
    }

    fn collect_preorder<'a>(&'a self, dir: &Path, out: &mut Vec<&'a TreeNode>) {
        let Some(children) = self.children(dir) else {
            return;
        };
        for child in children {
            if let Some(node) = self.nodes.get(child) {
                out.push(node);
                if node.is_dir() {
                    self.collect_preorder(child, out);
                }
            }
        }
    }

    fn child_nodes(&self, dir: &Path) -> Vec<TreeNode> {
        self.children(dir)
            .unwrap_or_default()
            .iter()
            .filter_map(|p| self.nodes.get(p).cloned())
            .collect()
    }

    async fn scan(&mut self, dir: &Path, options: ScanOptions) -> Result<Vec<TreeNode>> {
        let ignore = self.ignore.clone();
        let nodes = scan_directory(dir, options, ignore.as_deref()).await?;
        self.scans += 1;
        debug!(path = %dir.display(), entries = nodes.len(), "scanned directory");
        Ok(nodes)
    }

    /// Merge a fresh listing into the arena.
    ///
    /// Nodes whose path survives keep their identity and their own cache
    /// entry; vanished paths are evicted together with everything below them.
    /// Directories that turned into files lose their descendants.
    fn attach(&mut self, dir: &Path, scanned: Vec<TreeNode>) {
        let children: Vec<PathBuf> = scanned.iter().map(|n| n.path.clone()).collect();
        let fresh: HashSet<&Path> = children.iter().map(PathBuf::as_path).collect();

        // An invalidated directory has no listing left; its resident
        // children are still in the arena.
        let previous: Vec<PathBuf> = match self.cache.get(dir) {
            Some(entry) => entry.children.clone(),
            None => self
                .nodes
                .keys()
                .filter(|p| p.parent() == Some(dir))
                .cloned()
                .collect(),
        };
        let vanished: HashSet<PathBuf> = previous
            .into_iter()
            .filter(|p| !fresh.contains(p.as_path()))
            .collect();

        let mut emptied = HashSet::new();
        for node in scanned {
            match self.nodes.get_mut(&node.path) {
                Some(existing) => {
                    let was_dir = existing.is_dir();
                    existing.refresh_from(node);
                    if was_dir && !existing.is_dir() {
                        emptied.insert(existing.path.clone());
                    }
                }
                None => {
                    self.nodes.insert(node.path.clone(), node);
                }
            }
        }

        self.prune_below(dir, &vanished, &emptied);

        self.cache.insert(
            dir.to_path_buf(),
            CacheEntry {
                path: dir.to_path_buf(),
                children,
                scanned_at: SystemTime::now(),
            },
        );
        if let Some(node) = self.nodes.get_mut(dir) {
            node.children_loaded = true;
        }
    }

    /// Drop `vanished` children of `dir` with their subtrees, and everything
    /// below the `emptied` children, in a single pass over the arena.
    fn prune_below(
        &mut self,
        dir: &Path,
        vanished: &HashSet<PathBuf>,
        emptied: &HashSet<PathBuf>,
    ) {
        if vanished.is_empty() && emptied.is_empty() {
            return;
        }
        debug!(
            path = %dir.display(),
            vanished = vanished.len(),
            emptied = emptied.len(),
            "pruning stale entries"
        );
        self.nodes.retain(|p, _| match child_of(dir, p) {
            Some(top) => !(vanished.contains(&top) || (emptied.contains(&top) && top != *p)),
            None => true,
        });
        self.cache.retain(|p, _| match child_of(dir, p) {
            Some(top) => !(vanished.contains(&top) || emptied.contains(&top)),
            None => true,
        });
    }
}

/// The immediate child of `dir` that `path` lies under (or is).
fn child_of(dir: &Path, path: &Path) -> Option<PathBuf> {
    let first = path.strip_prefix(dir).ok()?.components().next()?;
    Some(dir.join(first))
}

/// List the immediate entries of `dir`, filtered and sorted for display.
///
/// Entries whose metadata cannot be read (dangling symlinks, races with
/// deletion) are skipped.
pub async fn scan_directory(
    dir: &Path,
    options: ScanOptions,
    ignore: Option<&dyn IgnoreRules>,
) -> Result<Vec<TreeNode>> {
    let metadata = tokio::fs::metadata(dir)
        .await
        .map_err(|e| BrowserError::from_io(e, dir))?;
    if !metadata.is_dir() {
        return Err(BrowserError::NotADirectory(dir.to_path_buf()));
    }

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| BrowserError::from_io(e, dir))?;

    let mut nodes = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BrowserError::from_io(e, dir))?
    {
        if !options.show_hidden && entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(_) => match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            },
        };
        let mut node = TreeNode::from_metadata(path, &metadata);
        if options.respect_ignore_rules {
            node.is_ignored = ignore.is_some_and(|rules| rules.should_ignore(&node.path));
        }
        nodes.push(node);
    }

    sort_nodes(&mut nodes);
    Ok(nodes)
}

/// Directories first, then files, each case-insensitively by name.
pub fn sort_nodes(nodes: &mut [TreeNode]) {
    nodes.sort_by(|a, b| {
        b.is_dir()
            .cmp(&a.is_dir())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.name.cmp(&b.name))
    });
}
