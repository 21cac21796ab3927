//! Incrementally scanned, cached project file tree with an interactive
//! browser state machine: expand/collapse, selection, multi-selection,
//! search, context sync and live refresh from filesystem changes.

pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod event;
pub mod fs;
pub mod logging;

pub use context::{ContextList, ContextMetadata, ContextSink, NoopContext};
pub use controller::{BrowserController, ControllerState, VisibleNode};
pub use error::{BrowserError, Result};
pub use event::BrowserEvent;
pub use fs::ignore::{IgnoreRules, PatternIgnore};
pub use fs::search::SearchOptions;
pub use fs::tree::{CacheEntry, NodeKind, ScanOptions, TreeNode, TreeStore};
pub use fs::watcher::{FsWatcher, WatchSettings};
