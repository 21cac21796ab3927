//! Configuration: TOML file loading, CLI overrides, and defaults.
//!
//! Resolution order (first found wins, values merge/override):
//! 1. CLI flags (`--hidden`, `--no-ignore`, `--types`, ...)
//! 2. Explicit `--config <FILE>`
//! 3. `$CTX_TREE_CONFIG` environment variable (path to config file)
//! 4. Project-local `.ctx-tree.toml` in the current working directory
//! 5. Global `<config_dir>/ctx-tree/config.toml`
//! 6. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::fs::ignore::DEFAULT_IGNORE_PATTERNS;
use crate::fs::search::SearchOptions;
use crate::fs::tree::ScanOptions;
use crate::fs::watcher::{
    WatchSettings, DEFAULT_DEBOUNCE_MS, DEFAULT_FLOOD_THRESHOLD, DEFAULT_QUEUE_CAPACITY,
};

// ── Section configs ──────────────────────────────────────────────────────────

/// Tree scanning settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TreeConfig {
    /// Show dotfiles.
    pub show_hidden: Option<bool>,
    /// Flag entries matched by the ignore patterns.
    pub respect_ignore_rules: Option<bool>,
    /// Path components treated as ignored.
    pub ignore_patterns: Option<Vec<String>>,
}

/// Filesystem watcher settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WatcherConfig {
    /// Enable filesystem watching for auto-refresh.
    pub enabled: Option<bool>,
    /// Debounce interval in milliseconds.
    pub debounce_ms: Option<u64>,
    /// Capacity of the change queue.
    pub queue_capacity: Option<usize>,
    /// Directories per window above which everything is refreshed.
    pub flood_threshold: Option<usize>,
}

/// Search settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SearchConfig {
    /// Default extension filter, e.g. `["rs", "toml"]`.
    pub file_types: Option<Vec<String>>,
}

// ── Top-level config ─────────────────────────────────────────────────────────

/// Top-level configuration.
///
/// All fields are optional so that partial configs from different sources
/// can be merged together (CLI overrides file, file overrides defaults).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub tree: TreeConfig,
    pub watcher: WatcherConfig,
    pub search: SearchConfig,
}

// ── Config file locator ──────────────────────────────────────────────────────

/// Return the list of candidate config file paths in priority order.
///
/// Does NOT include the CLI `--config` path, which is handled separately.
fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(env_path) = std::env::var("CTX_TREE_CONFIG") {
        paths.push(PathBuf::from(env_path));
    }

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".ctx-tree.toml"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("ctx-tree").join("config.toml"));
    }

    paths
}

/// Try to read and parse a TOML config file. Returns `None` if the file
/// doesn't exist or can't be parsed (with a warning logged).
fn load_file(path: &Path) -> Option<AppConfig> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<AppConfig>(&content) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse config file");
            None
        }
    }
}

// ── Merge logic ──────────────────────────────────────────────────────────────

impl AppConfig {
    /// Merge `other` on top of `self`; `other`'s `Some` values win.
    pub fn merge(self, other: &AppConfig) -> AppConfig {
        AppConfig {
            tree: TreeConfig {
                show_hidden: other.tree.show_hidden.or(self.tree.show_hidden),
                respect_ignore_rules: other
                    .tree
                    .respect_ignore_rules
                    .or(self.tree.respect_ignore_rules),
                ignore_patterns: other
                    .tree
                    .ignore_patterns
                    .clone()
                    .or(self.tree.ignore_patterns),
            },
            watcher: WatcherConfig {
                enabled: other.watcher.enabled.or(self.watcher.enabled),
                debounce_ms: other.watcher.debounce_ms.or(self.watcher.debounce_ms),
                queue_capacity: other.watcher.queue_capacity.or(self.watcher.queue_capacity),
                flood_threshold: other
                    .watcher
                    .flood_threshold
                    .or(self.watcher.flood_threshold),
            },
            search: SearchConfig {
                file_types: other
                    .search
                    .file_types
                    .clone()
                    .or(self.search.file_types),
            },
        }
    }

    /// Load the final merged configuration.
    ///
    /// `cli_config_path` is an explicit config file path from `--config`.
    /// `cli_overrides` are partial overrides derived from CLI flags.
    pub fn load(cli_config_path: Option<&Path>, cli_overrides: Option<&AppConfig>) -> AppConfig {
        let mut config = AppConfig::default();

        // Lowest priority first so higher sources overwrite.
        for path in candidate_paths().iter().rev() {
            if let Some(file_cfg) = load_file(path) {
                config = config.merge(&file_cfg);
            }
        }

        if let Some(cli_path) = cli_config_path {
            if let Some(file_cfg) = load_file(cli_path) {
                config = config.merge(&file_cfg);
            }
        }

        if let Some(overrides) = cli_overrides {
            config = config.merge(overrides);
        }

        config
    }

    // ── Convenience getters with built-in defaults ──────────────────────────

    pub fn show_hidden(&self) -> bool {
        self.tree.show_hidden.unwrap_or(false)
    }

    pub fn respect_ignore_rules(&self) -> bool {
        self.tree.respect_ignore_rules.unwrap_or(true)
    }

    pub fn ignore_patterns(&self) -> Vec<String> {
        self.tree.ignore_patterns.clone().unwrap_or_else(|| {
            DEFAULT_IGNORE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect()
        })
    }

    pub fn watcher_enabled(&self) -> bool {
        self.watcher.enabled.unwrap_or(true)
    }

    pub fn debounce_ms(&self) -> u64 {
        self.watcher.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS)
    }

    pub fn queue_capacity(&self) -> usize {
        self.watcher
            .queue_capacity
            .unwrap_or(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn flood_threshold(&self) -> usize {
        self.watcher
            .flood_threshold
            .unwrap_or(DEFAULT_FLOOD_THRESHOLD)
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            show_hidden: self.show_hidden(),
            respect_ignore_rules: self.respect_ignore_rules(),
        }
    }

    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            debounce: Duration::from_millis(self.debounce_ms()),
            queue_capacity: self.queue_capacity(),
            flood_threshold: self.flood_threshold(),
        }
    }

    pub fn search_options(&self) -> SearchOptions {
        SearchOptions::with_file_types(self.search.file_types.clone().unwrap_or_default())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
