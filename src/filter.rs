//! Include/exclude pattern filtering for captures.
//!
//! Patterns are compiled once into [`globset::GlobSet`]s and consulted for
//! every path the scanner visits. Matching is segment-aware: a pattern
//! containing `/` is matched against the whole slash-normalized relative
//! path, a pattern without `/` against each individual path segment. So
//! `target` excludes any `target/` directory at any depth without also
//! matching `retargeting.rs`, and `*.log` matches log files anywhere in the
//! tree.

use crate::utils::errors::{Result, StoreError};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Decides whether a relative path participates in a capture.
///
/// Excludes are a deny-override: a path matching any default or user exclude
/// is rejected regardless of include patterns. When user include patterns
/// are present, a file must match at least one of them; no includes means
/// accept-unless-excluded.
#[derive(Debug)]
pub struct PatternFilter {
    excludes: PatternSet,
    includes: Option<PatternSet>,
}

impl PatternFilter {
    /// Compile a filter from the configured default excludes plus the
    /// caller's per-operation patterns. Invalid glob syntax is reported
    /// before any filesystem work happens.
    pub fn build(
        default_excludes: &[String],
        user_excludes: &[String],
        user_includes: &[String],
    ) -> Result<Self> {
        let excludes = PatternSet::compile(default_excludes.iter().chain(user_excludes))?;
        let includes = if user_includes.is_empty() {
            None
        } else {
            Some(PatternSet::compile(user_includes.iter())?)
        };

        Ok(Self { excludes, includes })
    }

    /// Whether the scanner may descend into a directory.
    ///
    /// Only excludes apply here: include patterns describe files, and a file
    /// include such as `src/*.rs` must not prune the `src/` directory that
    /// contains its matches.
    pub fn allows_dir(&self, relative: &str) -> bool {
        !self.excludes.matches(relative)
    }

    /// Whether a file is part of the capture.
    pub fn allows_file(&self, relative: &str) -> bool {
        if self.excludes.matches(relative) {
            return false;
        }
        match &self.includes {
            Some(includes) => includes.matches(relative),
            None => true,
        }
    }
}

/// Compiled patterns, split by matching scope.
#[derive(Debug)]
struct PatternSet {
    /// Patterns without `/`, matched against each path segment
    segment: GlobSet,
    /// Patterns with `/`, matched against the whole relative path
    full_path: GlobSet,
}

impl PatternSet {
    fn compile<'a>(patterns: impl Iterator<Item = &'a String>) -> Result<Self> {
        let mut segment = GlobSetBuilder::new();
        let mut full_path = GlobSetBuilder::new();

        for pattern in patterns {
            // literal_separator keeps `*` within one segment; `**` is the
            // explicit cross-segment form
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| StoreError::Pattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;

            if pattern.contains('/') {
                full_path.add(glob);
            } else {
                segment.add(glob);
            }
        }

        let segment = segment
            .build()
            .map_err(|e| StoreError::Storage(format!("Failed to build glob set: {}", e)))?;
        let full_path = full_path
            .build()
            .map_err(|e| StoreError::Storage(format!("Failed to build glob set: {}", e)))?;

        Ok(Self { segment, full_path })
    }

    fn matches(&self, relative: &str) -> bool {
        if self.full_path.is_match(relative) {
            return true;
        }
        relative.split('/').any(|part| self.segment.is_match(part))
    }
}
