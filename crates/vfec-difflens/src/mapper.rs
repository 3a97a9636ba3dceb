//! Line alignment between the vulnerable and fixed side of each hunk.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vfec_core::{DiffHunk, LineCorrespondence};

use crate::parser::{changed_files, parse_hunks, ParseSkip};

/// Correspondences for one hunk, in offset order.
///
/// For offset `i` in `[0, max(vuln_len, fix_len))` the vulnerable line is
/// `vuln_start + i` while `i < vuln_len` (symmetrically for the fixed side).
///
/// # Examples
///
/// ```
/// use vfec_core::DiffHunk;
/// use vfec_difflens::mapper::correspondences;
/// use std::path::PathBuf;
///
/// let hunk = DiffHunk {
///     file: PathBuf::from("a.c"),
///     vuln_start: 10, vuln_len: 3,
///     fix_start: 10, fix_len: 1,
/// };
/// let rows: Vec<_> = correspondences(&hunk)
///     .map(|c| (c.vuln_line, c.fix_line))
///     .collect();
/// assert_eq!(rows, vec![(Some(10), Some(10)), (Some(11), None), (Some(12), None)]);
/// ```
pub fn correspondences(hunk: &DiffHunk) -> impl Iterator<Item = LineCorrespondence> + '_ {
    (0..hunk.extent()).map(move |i| LineCorrespondence {
        file: hunk.file.clone(),
        vuln_line: (i < hunk.vuln_len).then(|| hunk.vuln_start + i),
        fix_line: (i < hunk.fix_len).then(|| hunk.fix_start + i),
    })
}

/// Correspondences for every hunk, ordered by file, then hunk, then offset.
pub fn map_hunks(hunks: &[DiffHunk]) -> Vec<LineCorrespondence> {
    hunks.iter().flat_map(correspondences).collect()
}

/// Result of mapping one diff.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedDiff {
    pub hunks: Vec<DiffHunk>,
    pub correspondences: Vec<LineCorrespondence>,
    pub skips: Vec<ParseSkip>,
}

impl MappedDiff {
    pub fn changed_files(&self) -> Vec<PathBuf> {
        changed_files(&self.hunks)
    }

    /// Correspondences touching `file` only.
    pub fn for_file<'a>(
        &'a self,
        file: &'a std::path::Path,
    ) -> impl Iterator<Item = &'a LineCorrespondence> + 'a {
        self.correspondences.iter().filter(move |c| c.file == file)
    }
}

/// Turns zero-context diff text into line correspondences.
///
/// # Examples
///
/// ```
/// use vfec_difflens::mapper::HunkMapper;
///
/// let diff = "--- a/x.c\n+++ b/x.c\n@@ -5,0 +5,2 @@\n+a\n+b\n";
/// let mapped = HunkMapper::map(diff);
/// assert_eq!(mapped.correspondences.len(), 2);
/// assert!(mapped.correspondences.iter().all(|c| c.vuln_line.is_none()));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct HunkMapper;

impl HunkMapper {
    pub fn map(diff: &str) -> MappedDiff {
        let parsed = parse_hunks(diff);
        let correspondences = map_hunks(&parsed.hunks);
        tracing::debug!(
            hunks = parsed.hunks.len(),
            lines = correspondences.len(),
            skipped = parsed.skips.len(),
            "mapped diff"
        );
        MappedDiff {
            hunks: parsed.hunks,
            correspondences,
            skips: parsed.skips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hunk(vuln_start: u32, vuln_len: u32, fix_start: u32, fix_len: u32) -> DiffHunk {
        DiffHunk {
            file: PathBuf::from("src/f.c"),
            vuln_start,
            vuln_len,
            fix_start,
            fix_len,
        }
    }

    #[test]
    fn record_count_is_max_of_lengths() {
        for (vl, fl) in [(0, 1), (1, 0), (3, 1), (1, 3), (4, 4), (0, 0)] {
            let h = hunk(20, vl, 30, fl);
            let rows: Vec<_> = correspondences(&h).collect();
            assert_eq!(rows.len() as u32, vl.max(fl));
            for (i, row) in rows.iter().enumerate() {
                let i = i as u32;
                assert_eq!(row.vuln_line, (i < vl).then_some(20 + i));
                assert_eq!(row.fix_line, (i < fl).then_some(30 + i));
                assert!(row.vuln_line.is_some() || row.fix_line.is_some());
            }
        }
    }

    #[test]
    fn three_to_one_replacement() {
        let rows: Vec<_> = correspondences(&hunk(10, 3, 10, 1)).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!((rows[0].vuln_line, rows[0].fix_line), (Some(10), Some(10)));
        assert_eq!((rows[1].vuln_line, rows[1].fix_line), (Some(11), None));
        assert_eq!((rows[2].vuln_line, rows[2].fix_line), (Some(12), None));
    }

    #[test]
    fn pure_insertion_has_no_vuln_side() {
        let rows: Vec<_> = correspondences(&hunk(5, 0, 5, 2)).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.vuln_line.is_none()));
        assert_eq!(rows[0].fix_line, Some(5));
        assert_eq!(rows[1].fix_line, Some(6));
    }

    #[test]
    fn pure_deletion_has_no_fix_side() {
        let rows: Vec<_> = correspondences(&hunk(8, 2, 7, 0)).collect();
        assert!(rows.iter().all(|r| r.fix_line.is_none()));
        assert_eq!(rows[1].vuln_line, Some(9));
    }

    #[test]
    fn map_keeps_file_then_hunk_order() {
        let diff = "\
--- a/b.c
+++ b/b.c
@@ -1 +1 @@
-x
+y
@@ -9,2 +9 @@
-x
-x
+y
--- a/a.c
+++ b/a.c
@@ -3 +3 @@
-x
+y
";
        let mapped = HunkMapper::map(diff);
        let lines: Vec<_> = mapped
            .correspondences
            .iter()
            .map(|c| (c.file.to_string_lossy().into_owned(), c.vuln_line))
            .collect();
        assert_eq!(
            lines,
            vec![
                ("b.c".to_string(), Some(1)),
                ("b.c".to_string(), Some(9)),
                ("b.c".to_string(), Some(10)),
                ("a.c".to_string(), Some(3)),
            ]
        );
        assert_eq!(mapped.for_file(std::path::Path::new("a.c")).count(), 1);
        assert_eq!(mapped.changed_files().len(), 2);
    }
}
