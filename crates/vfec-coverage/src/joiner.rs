//! Join line correspondences with hit counts from both revisions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vfec_core::{LineClassification, LineCorrespondence, PairKey, SourceLookup};

use crate::lcov::CoverageIndex;

/// Snippet shown when the vulnerable side has no line at an offset.
pub const ADDED_MARKER: &str = "[ADDED]";
/// Snippet shown when the fixed side has no line at an offset.
pub const DELETED_MARKER: &str = "[DELETED]";

/// Classifies correspondences against a vulnerable-side and a fixed-side
/// [`CoverageIndex`].
///
/// # Examples
///
/// ```
/// use vfec_core::LineCorrespondence;
/// use vfec_coverage::joiner::DiffCoverageJoiner;
/// use vfec_coverage::lcov::CoverageIndex;
/// use std::path::PathBuf;
///
/// let mut vuln = CoverageIndex::new();
/// vuln.insert("a.c", 11, 3);
/// let fix = CoverageIndex::new();
///
/// let joiner = DiffCoverageJoiner::new(&vuln, &fix);
/// let row = joiner.classify(&LineCorrespondence {
///     file: PathBuf::from("a.c"),
///     vuln_line: Some(11),
///     fix_line: None,
/// });
/// assert_eq!(row.vuln_hits, Some(3));
/// assert!(row.executable);
/// ```
pub struct DiffCoverageJoiner<'a> {
    vuln: &'a CoverageIndex,
    fix: &'a CoverageIndex,
    vuln_source: Option<&'a dyn SourceLookup>,
    fix_source: Option<&'a dyn SourceLookup>,
}

impl<'a> DiffCoverageJoiner<'a> {
    pub fn new(vuln: &'a CoverageIndex, fix: &'a CoverageIndex) -> Self {
        Self {
            vuln,
            fix,
            vuln_source: None,
            fix_source: None,
        }
    }

    /// Attach per-revision source lookups so rows carry snippets.
    pub fn with_sources(
        mut self,
        vuln_source: &'a dyn SourceLookup,
        fix_source: &'a dyn SourceLookup,
    ) -> Self {
        self.vuln_source = Some(vuln_source);
        self.fix_source = Some(fix_source);
        self
    }

    pub fn classify(&self, c: &LineCorrespondence) -> LineClassification {
        let vuln_hits = c.vuln_line.and_then(|l| self.vuln.hits(&c.file, l));
        let fix_hits = c.fix_line.and_then(|l| self.fix.hits(&c.file, l));

        LineClassification {
            file: c.file.clone(),
            vuln_line: c.vuln_line,
            fix_line: c.fix_line,
            vuln_hits,
            fix_hits,
            executable: vuln_hits.is_some() || fix_hits.is_some(),
            vuln_snippet: snippet(self.vuln_source, &c.file, c.vuln_line, ADDED_MARKER),
            fix_snippet: snippet(self.fix_source, &c.file, c.fix_line, DELETED_MARKER),
        }
    }

    /// Classify every correspondence, keeping input order.
    pub fn join(&self, correspondences: &[LineCorrespondence]) -> CoverageDiffReport {
        let rows: Vec<LineClassification> =
            correspondences.iter().map(|c| self.classify(c)).collect();
        let report = CoverageDiffReport {
            pair: None,
            test: None,
            rows,
        };
        tracing::debug!(
            rows = report.rows.len(),
            executable = report.clean().count(),
            "joined diff with coverage"
        );
        report
    }
}

fn snippet(
    lookup: Option<&dyn SourceLookup>,
    file: &Path,
    line: Option<u32>,
    absent_marker: &str,
) -> Option<String> {
    let lookup = lookup?;
    match line {
        Some(l) => lookup.line(file, l).map(|text| text.trim().to_string()),
        None => Some(absent_marker.to_string()),
    }
}

/// Joined rows for one commit pair, optionally scoped to one test.
///
/// The master view is every row; the clean view keeps executable rows only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageDiffReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair: Option<PairKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    pub rows: Vec<LineClassification>,
}

impl CoverageDiffReport {
    pub fn with_key(mut self, pair: PairKey, test: Option<String>) -> Self {
        self.pair = Some(pair);
        self.test = test;
        self
    }

    pub fn master(&self) -> impl Iterator<Item = &LineClassification> {
        self.rows.iter()
    }

    pub fn clean(&self) -> impl Iterator<Item = &LineClassification> {
        self.rows.iter().filter(|r| r.executable)
    }

    /// Coverage figures over the clean view.
    pub fn summary(&self) -> CoverageSummary {
        CoverageSummary::from_rows(self.clean())
    }
}

/// Executable and executed line counts per side.
///
/// # Examples
///
/// ```
/// use vfec_coverage::joiner::CoverageSummary;
///
/// let s = CoverageSummary { vuln_lines: 4, vuln_hits: 1, fix_lines: 0, fix_hits: 0 };
/// assert_eq!(s.vuln_pct(), 25.0);
/// assert_eq!(s.fix_pct(), 0.0);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageSummary {
    pub vuln_lines: usize,
    pub vuln_hits: usize,
    pub fix_lines: usize,
    pub fix_hits: usize,
}

impl CoverageSummary {
    /// Summarize rows. A side counts a row only when it has a hit count.
    pub fn from_rows<'r>(rows: impl Iterator<Item = &'r LineClassification>) -> Self {
        let mut s = Self::default();
        for row in rows {
            if let Some(h) = row.vuln_hits {
                s.vuln_lines += 1;
                if h > 0 {
                    s.vuln_hits += 1;
                }
            }
            if let Some(h) = row.fix_hits {
                s.fix_lines += 1;
                if h > 0 {
                    s.fix_hits += 1;
                }
            }
        }
        s
    }

    pub fn vuln_pct(&self) -> f64 {
        pct(self.vuln_hits, self.vuln_lines)
    }

    pub fn fix_pct(&self) -> f64 {
        pct(self.fix_hits, self.fix_lines)
    }
}

fn pct(hits: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64 * 100.0
    }
}

/// Line text keyed by (file, 1-based line), for snippets from any source.
///
/// # Examples
///
/// ```
/// use vfec_core::SourceLookup;
/// use vfec_coverage::joiner::InMemorySource;
/// use std::path::Path;
///
/// let mut src = InMemorySource::new();
/// src.add_file("a.c", "int x;\nreturn x;\n");
/// assert_eq!(src.line(Path::new("a.c"), 2).as_deref(), Some("return x;"));
/// assert_eq!(src.line(Path::new("a.c"), 3), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    files: HashMap<PathBuf, Vec<String>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, file: impl Into<PathBuf>, contents: &str) {
        self.files
            .insert(file.into(), contents.lines().map(str::to_string).collect());
    }
}

impl SourceLookup for InMemorySource {
    fn line(&self, file: &Path, line: u32) -> Option<String> {
        let idx = usize::try_from(line).ok()?.checked_sub(1)?;
        self.files.get(file)?.get(idx).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corr(vuln: Option<u32>, fix: Option<u32>) -> LineCorrespondence {
        LineCorrespondence {
            file: PathBuf::from("lib/url.c"),
            vuln_line: vuln,
            fix_line: fix,
        }
    }

    #[test]
    fn hit_counts_are_na_without_entries() {
        let mut vuln = CoverageIndex::new();
        vuln.insert("lib/url.c", 4, 0);
        vuln.insert("lib/url.c", 5, 7);
        let fix = CoverageIndex::new();

        let joiner = DiffCoverageJoiner::new(&vuln, &fix);
        let rows = joiner.join(&[corr(Some(4), None), corr(Some(5), None), corr(Some(6), None)]);

        assert_eq!(rows.rows[0].vuln_hits, Some(0));
        assert!(rows.rows[0].executable);
        assert_eq!(rows.rows[1].vuln_hits, Some(7));
        assert_eq!(rows.rows[2].vuln_hits, None);
        assert!(!rows.rows[2].executable);
    }

    #[test]
    fn other_files_do_not_leak_hits() {
        let mut vuln = CoverageIndex::new();
        vuln.insert("lib/http.c", 10, 9);
        let fix = CoverageIndex::new();
        let row = DiffCoverageJoiner::new(&vuln, &fix).classify(&corr(Some(10), Some(10)));
        assert_eq!(row.vuln_hits, None);
        assert!(!row.executable);
    }

    #[test]
    fn summary_counts_clean_view() {
        let mut vuln = CoverageIndex::new();
        vuln.insert("lib/url.c", 1, 2);
        vuln.insert("lib/url.c", 2, 0);
        let mut fix = CoverageIndex::new();
        fix.insert("lib/url.c", 1, 0);

        let report = DiffCoverageJoiner::new(&vuln, &fix).join(&[
            corr(Some(1), Some(1)),
            corr(Some(2), None),
            corr(Some(3), None),
            corr(None, Some(2)),
        ]);
        assert_eq!(report.master().count(), 4);
        assert_eq!(report.clean().count(), 2);
        let s = report.summary();
        assert_eq!((s.vuln_lines, s.vuln_hits), (2, 1));
        assert_eq!((s.fix_lines, s.fix_hits), (1, 0));
        assert_eq!(s.vuln_pct(), 50.0);
        assert_eq!(s.fix_pct(), 0.0);
    }

    #[test]
    fn empty_report_summary_is_zero() {
        let s = CoverageDiffReport::default().summary();
        assert_eq!(s, CoverageSummary::default());
        assert_eq!(s.vuln_pct(), 0.0);
    }

    #[test]
    fn snippets_use_markers_for_absent_sides() {
        let vuln = CoverageIndex::new();
        let fix = CoverageIndex::new();
        let mut vsrc = InMemorySource::new();
        vsrc.add_file("lib/url.c", "  int a;\n  int b;\n");
        let mut fsrc = InMemorySource::new();
        fsrc.add_file("lib/url.c", "  int c;\n");

        let joiner = DiffCoverageJoiner::new(&vuln, &fix).with_sources(&vsrc, &fsrc);
        let a = joiner.classify(&corr(Some(2), None));
        assert_eq!(a.vuln_snippet.as_deref(), Some("int b;"));
        assert_eq!(a.fix_snippet.as_deref(), Some(DELETED_MARKER));

        let b = joiner.classify(&corr(None, Some(1)));
        assert_eq!(b.vuln_snippet.as_deref(), Some(ADDED_MARKER));
        assert_eq!(b.fix_snippet.as_deref(), Some("int c;"));
    }

    #[test]
    fn no_sources_means_no_snippets() {
        let idx = CoverageIndex::new();
        let row = DiffCoverageJoiner::new(&idx, &idx).classify(&corr(Some(1), None));
        assert_eq!(row.vuln_snippet, None);
        assert_eq!(row.fix_snippet, None);
    }

    #[test]
    fn report_key_serializes() {
        let report = CoverageDiffReport::default()
            .with_key(PairKey::new("curl", "aaaa", "bbbb"), Some("1".into()));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["pair"]["vulnCommit"], "aaaa");
        assert_eq!(json["test"], "1");
    }
}
