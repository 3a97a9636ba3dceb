//! Select tests whose coverage touches the files a fix changed.
//!
//! Matching is by full relative path. Two files with the same basename in
//! different directories never match each other.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use vfec_core::CoverageConfig;

/// Decides which tests are worth measuring for a commit pair.
///
/// # Examples
///
/// ```
/// use vfec_difflens::relevance::RelevanceFilter;
/// use std::path::PathBuf;
///
/// let filter = RelevanceFilter::default();
/// let changed = vec![PathBuf::from("lib/url.c")];
/// assert!(filter.is_relevant(&[PathBuf::from("lib/url.c")], &changed));
/// assert!(!filter.is_relevant(&[PathBuf::from("src/url.c")], &changed));
/// ```
#[derive(Debug, Clone)]
pub struct RelevanceFilter {
    source_extensions: Vec<String>,
    exclude: Vec<glob::Pattern>,
}

impl Default for RelevanceFilter {
    fn default() -> Self {
        Self::from_config(&CoverageConfig::default())
    }
}

impl RelevanceFilter {
    /// Build from the coverage section. Invalid glob patterns are ignored
    /// with a warning.
    pub fn from_config(config: &CoverageConfig) -> Self {
        let mut exclude = Vec::new();
        for pat in &config.exclude_patterns {
            match glob::Pattern::new(pat) {
                Ok(p) => exclude.push(p),
                Err(e) => tracing::warn!(pattern = %pat, error = %e, "ignoring invalid exclude pattern"),
            }
        }
        Self {
            source_extensions: config.source_extensions.clone(),
            exclude,
        }
    }

    /// Whether `path` is a source file that is not excluded.
    pub fn is_source(&self, path: &Path) -> bool {
        let has_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.source_extensions.iter().any(|s| s == ext));
        if !has_ext {
            return false;
        }
        let text = path.to_string_lossy();
        !self.exclude.iter().any(|p| p.matches(&text))
    }

    /// Changed source files that a test touched.
    pub fn relevant_files(&self, touched: &[PathBuf], changed: &[PathBuf]) -> Vec<PathBuf> {
        let changed: Vec<PathBuf> = changed
            .iter()
            .filter(|p| self.is_source(p))
            .map(|p| clean(p))
            .collect();
        let mut hits = Vec::new();
        for file in touched {
            let file = clean(file);
            if changed.contains(&file) && !hits.contains(&file) {
                hits.push(file);
            }
        }
        hits
    }

    pub fn is_relevant(&self, touched: &[PathBuf], changed: &[PathBuf]) -> bool {
        !self.relevant_files(touched, changed).is_empty()
    }

    /// Tests whose touched files intersect `changed`, in key order.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::BTreeMap;
    /// use std::path::PathBuf;
    /// use vfec_difflens::relevance::RelevanceFilter;
    ///
    /// let mut touched = BTreeMap::new();
    /// touched.insert("1".to_string(), vec![PathBuf::from("lib/url.c")]);
    /// touched.insert("2".to_string(), vec![PathBuf::from("lib/http.c")]);
    /// let selected = RelevanceFilter::default()
    ///     .select(&touched, &[PathBuf::from("lib/http.c")]);
    /// assert_eq!(selected, vec!["2".to_string()]);
    /// ```
    pub fn select(
        &self,
        touched_by_test: &BTreeMap<String, Vec<PathBuf>>,
        changed: &[PathBuf],
    ) -> Vec<String> {
        touched_by_test
            .iter()
            .filter(|(_, touched)| self.is_relevant(touched, changed))
            .map(|(test, _)| test.clone())
            .collect()
    }
}

/// Drop `.` components so `./lib/a.c` and `lib/a.c` compare equal.
fn clean(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
