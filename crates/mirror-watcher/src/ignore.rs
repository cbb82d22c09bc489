//! Path filtering for watch events.
//!
//! Filtering happens at the source, before events reach the debounce
//! stage, so bursty writes under `.git/` or `target/` never cost a
//! channel send.

use std::path::Path;

/// A set of glob-lite ignore patterns.
///
/// Two pattern shapes are supported:
/// - Literal names (`.git`, `node_modules`) match any path component.
/// - Patterns containing `*` (`*.swp`, `cache-*`) match against the
///   file name with simple wildcard semantics.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<String>,
}

impl IgnoreSet {
    /// Build a set from pattern strings. Empty patterns are dropped.
    #[must_use]
    pub fn new<I>(patterns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(Into::into)
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// An empty set that ignores nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self { patterns: Vec::new() }
    }

    /// Whether `path` matches any ignore pattern.
    #[must_use]
    pub fn is_ignored(&self, path: &Path) -> bool {
        self.patterns.iter().any(|pattern| {
            if pattern.contains('*') {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| wildcard_match(pattern, name))
            } else {
                path.components()
                    .any(|c| c.as_os_str().to_str() == Some(pattern))
            }
        })
    }
}

/// Match `name` against a pattern where `*` spans any run of characters.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = name;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            // Anchored at the start.
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            // Anchored at the end.
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }

    // Only reachable when the pattern ends with '*', which matches any tail.
    true
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn literal_pattern_matches_any_component() {
        let set = IgnoreSet::new([".git", "node_modules"]);
        assert!(set.is_ignored(&PathBuf::from("/repo/.git/HEAD")));
        assert!(set.is_ignored(&PathBuf::from("/repo/web/node_modules/left-pad/index.js")));
        assert!(!set.is_ignored(&PathBuf::from("/repo/src/main.rs")));
    }

    #[test]
    fn literal_pattern_does_not_match_substrings() {
        let set = IgnoreSet::new(["target"]);
        assert!(!set.is_ignored(&PathBuf::from("/repo/retargeting/notes.md")));
        assert!(set.is_ignored(&PathBuf::from("/repo/target/debug/app")));
    }

    #[test]
    fn wildcard_matches_file_name() {
        let set = IgnoreSet::new(["*.swp", "cache-*"]);
        assert!(set.is_ignored(&PathBuf::from("/repo/src/.main.rs.swp")));
        assert!(set.is_ignored(&PathBuf::from("/repo/cache-v2")));
        assert!(!set.is_ignored(&PathBuf::from("/repo/src/main.rs")));
        assert!(!set.is_ignored(&PathBuf::from("/repo/swp-notes.txt")));
    }

    #[test]
    fn interior_wildcard() {
        let set = IgnoreSet::new(["build-*-tmp"]);
        assert!(set.is_ignored(&PathBuf::from("/repo/build-x86-tmp")));
        assert!(!set.is_ignored(&PathBuf::from("/repo/build-x86")));
    }

    #[test]
    fn empty_set_ignores_nothing() {
        assert!(!IgnoreSet::empty().is_ignored(&PathBuf::from("/anything")));
    }
}
