use std::path::{Component, Path};

/// Default patterns treated as ignored during scans.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    "venv",
    ".venv",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    "target",
    "dist",
];

/// Ignore-rule evaluator consulted by the tree store while scanning.
///
/// Matching is owned by the implementor (gitignore files, fixed lists, ...);
/// the store only asks whether a given absolute path is ignored.
pub trait IgnoreRules: Send + Sync {
    fn should_ignore(&self, path: &Path) -> bool;
}

/// Ignores a path when any of its components equals one of the patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternIgnore {
    patterns: Vec<String>,
}

impl PatternIgnore {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    /// Evaluator seeded with [`DEFAULT_IGNORE_PATTERNS`].
    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_IGNORE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl IgnoreRules for PatternIgnore {
    fn should_ignore(&self, path: &Path) -> bool {
        matches_any_component(path, &self.patterns)
    }
}

/// Exact component match; `target2` does not match `target`.
pub fn matches_any_component(path: &Path, patterns: &[String]) -> bool {
    path.components().any(|component| match component {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            patterns.iter().any(|p| name == p.as_str())
        }
        _ => false,
    })
}
