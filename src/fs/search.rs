//! Name matching and ranking for tree search.
//!
//! A candidate matches when its name contains the query as a case-insensitive
//! substring, or when the query characters appear in order inside the name
//! (subsequence). Substring hits always rank ahead of subsequence hits.

use std::cmp::Ordering;
use std::collections::HashSet;

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;

use crate::fs::tree::TreeNode;

/// Options narrowing a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Extensions (without the leading dot, lowercase) a result must carry.
    /// Empty means no type restriction.
    pub file_types: HashSet<String>,
}

impl SearchOptions {
    /// Build options from user-supplied extensions such as `".rs"` or `"TS"`.
    pub fn with_file_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let file_types = types
            .into_iter()
            .map(|t| normalize_extension(t.as_ref()))
            .filter(|t| !t.is_empty())
            .collect();
        Self { file_types }
    }

    pub fn is_empty(&self) -> bool {
        self.file_types.is_empty()
    }

    fn accepts(&self, node: &TreeNode) -> bool {
        self.file_types.is_empty() || self.file_types.contains(&node.extension.to_lowercase())
    }
}

/// Strip a leading dot and lowercase.
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

/// How a name matched the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NameMatch {
    /// Query found as a contiguous, case-insensitive substring.
    Substring,
    /// Query characters found in order. `density` is matched chars over
    /// name length; `score` is the matcher's contiguity-weighted score.
    Subsequence { density: f64, score: i64 },
}

/// Matches names against a query.
pub struct NameMatcher {
    query: String,
    query_lower: String,
    fuzzy: SkimMatcherV2,
}

impl NameMatcher {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            query_lower: query.to_lowercase(),
            fuzzy: SkimMatcherV2::default().ignore_case(),
        }
    }

    pub fn matches(&self, name: &str) -> Option<NameMatch> {
        if name.to_lowercase().contains(&self.query_lower) {
            return Some(NameMatch::Substring);
        }
        let score = self.fuzzy.fuzzy_match(name, &self.query)?;
        let name_len = name.chars().count().max(1);
        let density = self.query.chars().count() as f64 / name_len as f64;
        Some(NameMatch::Subsequence { density, score })
    }
}

/// Filter and rank `candidates` against `query`.
///
/// An empty query with no type restriction returns the candidates unchanged.
/// An empty query with a type restriction keeps candidate order.
pub fn rank<'a, I>(candidates: I, query: &str, options: &SearchOptions) -> Vec<&'a TreeNode>
where
    I: IntoIterator<Item = &'a TreeNode>,
{
    if query.is_empty() {
        return candidates
            .into_iter()
            .filter(|node| options.accepts(node))
            .collect();
    }

    let matcher = NameMatcher::new(query);
    let mut hits: Vec<(&TreeNode, NameMatch)> = candidates
        .into_iter()
        .filter(|node| options.accepts(node))
        .filter_map(|node| matcher.matches(&node.name).map(|m| (node, m)))
        .collect();

    hits.sort_by(|(a, ma), (b, mb)| compare_hits(a, ma, b, mb));
    hits.into_iter().map(|(node, _)| node).collect()
}

fn compare_hits(a: &TreeNode, ma: &NameMatch, b: &TreeNode, mb: &NameMatch) -> Ordering {
    match (ma, mb) {
        (NameMatch::Substring, NameMatch::Subsequence { .. }) => Ordering::Less,
        (NameMatch::Subsequence { .. }, NameMatch::Substring) => Ordering::Greater,
        (NameMatch::Substring, NameMatch::Substring) => a
            .name
            .chars()
            .count()
            .cmp(&b.name.chars().count())
            .then_with(|| tie_break(a, b)),
        (
            NameMatch::Subsequence {
                density: da,
                score: sa,
            },
            NameMatch::Subsequence {
                density: db,
                score: sb,
            },
        ) => db
            .partial_cmp(da)
            .unwrap_or(Ordering::Equal)
            .then_with(|| sb.cmp(sa))
            .then_with(|| tie_break(a, b)),
    }
}

fn tie_break(a: &TreeNode, b: &TreeNode) -> Ordering {
    a.name
        .to_lowercase()
        .cmp(&b.name.to_lowercase())
        .then_with(|| a.path.cmp(&b.path))
}
