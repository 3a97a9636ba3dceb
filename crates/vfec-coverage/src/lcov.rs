//! LCOV tracefile parsing into a per-file, per-line hit index.
//!
//! Only `SF:`, `DA:` and `end_of_record` records matter here. A line is in
//! the index only when the report carries an explicit `DA` record for it, so
//! a missing line means "not executable", never "zero hits".

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use vfec_core::CoverageConfig;

/// Path handling applied to every `SF:` record.
///
/// # Examples
///
/// ```
/// use vfec_coverage::lcov::LcovOptions;
///
/// let opts = LcovOptions::new().with_root("/src/curl");
/// assert!(opts.is_excluded("/usr/include/stdio.h", "/usr/include/stdio.h"));
/// ```
#[derive(Debug, Clone)]
pub struct LcovOptions {
    root: Option<PathBuf>,
    exclude: Vec<glob::Pattern>,
}

impl Default for LcovOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl LcovOptions {
    /// No root and the default exclusions (`/usr/*`, `*/tests/*`).
    pub fn new() -> Self {
        Self::from_config(&CoverageConfig::default())
    }

    pub fn from_config(config: &CoverageConfig) -> Self {
        let exclude = config
            .exclude_patterns
            .iter()
            .filter_map(|pat| match glob::Pattern::new(pat) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(pattern = %pat, error = %e, "ignoring invalid exclude pattern");
                    None
                }
            })
            .collect();
        Self {
            root: config.project_root.clone(),
            exclude,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Drop every exclusion pattern.
    pub fn without_exclusions(mut self) -> Self {
        self.exclude.clear();
        self
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Whether a section is dropped; patterns are tried against both the raw
    /// `SF:` path and its normalized form.
    pub fn is_excluded(&self, raw: &str, normalized: &str) -> bool {
        self.exclude
            .iter()
            .any(|p| p.matches(raw) || p.matches(normalized))
    }
}

/// `file → {line → hits}` for one coverage report.
///
/// # Examples
///
/// ```
/// use vfec_coverage::lcov::{CoverageIndex, LcovOptions};
/// use std::path::Path;
///
/// let report = "SF:/src/app/lib/a.c\nDA:4,0\nDA:5,7\nend_of_record\n";
/// let index = CoverageIndex::parse(report, &LcovOptions::new().with_root("/src/app"));
/// assert_eq!(index.hits(Path::new("lib/a.c"), 5), Some(7));
/// assert_eq!(index.hits(Path::new("lib/a.c"), 4), Some(0));
/// assert_eq!(index.hits(Path::new("lib/a.c"), 6), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageIndex {
    files: BTreeMap<PathBuf, BTreeMap<u32, u64>>,
    #[serde(default)]
    malformed_records: usize,
}

impl CoverageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse LCOV text. Malformed `DA` records are skipped and counted.
    ///
    /// Repeated sections for one file and repeated `DA` records for one line
    /// are merged by summing hits.
    pub fn parse(text: &str, options: &LcovOptions) -> Self {
        let mut index = Self::new();
        // None: outside any section, or inside an excluded one.
        let mut section: Option<Option<PathBuf>> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();

            if let Some(sf) = line.strip_prefix("SF:") {
                let normalized = normalize_path(Path::new(sf), options.root());
                let shown = normalized.to_string_lossy();
                if options.is_excluded(sf, &shown) {
                    tracing::trace!(file = %sf, "excluded coverage section");
                    section = Some(None);
                } else {
                    index.files.entry(normalized.clone()).or_default();
                    section = Some(Some(normalized));
                }
                continue;
            }

            if line == "end_of_record" {
                section = None;
                continue;
            }

            let Some(record) = line.strip_prefix("DA:") else {
                continue;
            };

            let file = match &section {
                Some(Some(file)) => file,
                Some(None) => continue,
                None => {
                    tracing::debug!(line_number = idx + 1, "DA record outside a file section");
                    index.malformed_records += 1;
                    continue;
                }
            };

            match parse_da(record) {
                Some((line_no, hits)) => {
                    if let Some(lines) = index.files.get_mut(file) {
                        let slot = lines.entry(line_no).or_insert(0);
                        *slot = slot.saturating_add(hits);
                    }
                }
                None => {
                    tracing::debug!(line_number = idx + 1, record = %line, "malformed DA record");
                    index.malformed_records += 1;
                }
            }
        }

        if index.malformed_records > 0 {
            tracing::warn!(
                skipped = index.malformed_records,
                "skipped malformed coverage records"
            );
        }
        index
    }

    /// Read and parse a report. A missing or unreadable file gives an empty
    /// index and a warning.
    pub fn from_file(path: &Path, options: &LcovOptions) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => Self::parse(&String::from_utf8_lossy(&bytes), options),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "coverage report unavailable, using empty index");
                Self::new()
            }
        }
    }

    /// Record `hits` for a line, summing with any existing entry.
    pub fn insert(&mut self, file: impl Into<PathBuf>, line: u32, hits: u64) {
        let slot = self
            .files
            .entry(file.into())
            .or_default()
            .entry(line)
            .or_insert(0);
        *slot = slot.saturating_add(hits);
    }

    pub fn hits(&self, file: &Path, line: u32) -> Option<u64> {
        self.files.get(file)?.get(&line).copied()
    }

    pub fn has_entry(&self, file: &Path, line: u32) -> bool {
        self.hits(file, line).is_some()
    }

    pub fn file(&self, file: &Path) -> Option<&BTreeMap<u32, u64>> {
        self.files.get(file)
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }

    /// Files with at least one executed line.
    pub fn covered_files(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter(|(_, lines)| lines.values().any(|&h| h > 0))
            .map(|(file, _)| file.clone())
            .collect()
    }

    pub fn malformed_records(&self) -> usize {
        self.malformed_records
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// `<line>,<hits>[,<checksum>]`
fn parse_da(record: &str) -> Option<(u32, u64)> {
    let mut parts = record.split(',');
    let line = parts.next()?.trim().parse::<u32>().ok()?;
    let hits = parts.next()?.trim();
    if hits.starts_with('-') {
        return None;
    }
    let hits = hits.parse::<u64>().ok()?;
    Some((line, hits))
}

/// Make `raw` relative to `root` when it lies beneath it, resolving `.` and
/// `..` lexically. Paths outside the root are returned cleaned but otherwise
/// unchanged.
///
/// # Examples
///
/// ```
/// use vfec_coverage::lcov::normalize_path;
/// use std::path::{Path, PathBuf};
///
/// let root = Path::new("/work/curl");
/// assert_eq!(normalize_path(Path::new("/work/curl/lib/../src/x.c"), Some(root)), PathBuf::from("src/x.c"));
/// assert_eq!(normalize_path(Path::new("/usr/include/s.h"), Some(root)), PathBuf::from("/usr/include/s.h"));
/// assert_eq!(normalize_path(Path::new("./lib/a.c"), None), PathBuf::from("lib/a.c"));
/// ```
pub fn normalize_path(raw: &Path, root: Option<&Path>) -> PathBuf {
    let cleaned = lexical_clean(raw);
    if let Some(root) = root {
        let root = lexical_clean(root);
        if let Ok(rel) = cleaned.strip_prefix(&root) {
            return rel.to_path_buf();
        }
    }
    cleaned
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}
