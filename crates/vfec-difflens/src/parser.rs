use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vfec_core::{DiffHunk, VfecError};

/// A hunk header that was skipped instead of parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseSkip {
    /// 1-based line number in the diff text.
    pub line_number: usize,
    /// The offending line.
    pub line: String,
    pub reason: String,
}

/// Hunks recovered from a diff, plus every header that was skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedDiff {
    pub hunks: Vec<DiffHunk>,
    pub skips: Vec<ParseSkip>,
}

/// Parse a zero-context unified diff (`git diff -U0`) into [`DiffHunk`]s.
///
/// The current file comes from the `--- a/<path>` header, or from
/// `+++ b/<path>` when the old side is `/dev/null`. Malformed hunk headers
/// and hunks that appear before any file header are recorded in
/// [`ParsedDiff::skips`]; parsing always continues.
///
/// # Examples
///
/// ```
/// use vfec_difflens::parser::parse_hunks;
///
/// let diff = "--- a/lib/url.c\n\
///             +++ b/lib/url.c\n\
///             @@ -10,3 +10 @@\n\
///             -a\n\
///             -b\n\
///             -c\n\
///             +d\n";
/// let parsed = parse_hunks(diff);
/// assert_eq!(parsed.hunks.len(), 1);
/// assert_eq!(parsed.hunks[0].vuln_len, 3);
/// assert_eq!(parsed.hunks[0].fix_len, 1);
/// assert!(parsed.skips.is_empty());
/// ```
pub fn parse_hunks(input: &str) -> ParsedDiff {
    let mut parsed = ParsedDiff::default();
    let mut current: Option<PathBuf> = None;
    // Body lines still owed by the last hunk, so `--- ` content lines are
    // never mistaken for file headers.
    let mut pending_old = 0u32;
    let mut pending_new = 0u32;

    for (idx, line) in input.lines().enumerate() {
        if pending_old > 0 && line.starts_with('-') {
            pending_old -= 1;
            continue;
        }
        if pending_new > 0 && line.starts_with('+') {
            pending_new -= 1;
            continue;
        }
        if line.starts_with('\\') {
            continue;
        }
        pending_old = 0;
        pending_new = 0;

        if line.starts_with("diff --git ") {
            current = None;
            continue;
        }

        if let Some(path) = line.strip_prefix("--- ") {
            current = parse_path(path);
            continue;
        }

        if let Some(path) = line.strip_prefix("+++ ") {
            if current.is_none() {
                current = parse_path(path);
            }
            continue;
        }

        if !line.starts_with("@@") {
            continue;
        }

        let skip = |reason: String| ParseSkip {
            line_number: idx + 1,
            line: line.to_string(),
            reason,
        };

        let Some(file) = current.as_ref() else {
            tracing::warn!(line_number = idx + 1, "hunk before any file header");
            parsed.skips.push(skip("hunk before any file header".into()));
            continue;
        };

        match parse_hunk_header(line) {
            Ok((vuln_start, vuln_len, fix_start, fix_len)) => {
                pending_old = vuln_len;
                pending_new = fix_len;
                parsed.hunks.push(DiffHunk {
                    file: file.clone(),
                    vuln_start,
                    vuln_len,
                    fix_start,
                    fix_len,
                });
            }
            Err(e) => {
                tracing::warn!(line_number = idx + 1, error = %e, "skipping malformed hunk header");
                parsed.skips.push(skip(e.to_string()));
            }
        }
    }

    parsed
}

/// Distinct changed files in first-seen order.
///
/// # Examples
///
/// ```
/// use vfec_core::DiffHunk;
/// use vfec_difflens::parser::changed_files;
/// use std::path::PathBuf;
///
/// let hunk = |f: &str, s| DiffHunk {
///     file: PathBuf::from(f), vuln_start: s, vuln_len: 1, fix_start: s, fix_len: 1,
/// };
/// let files = changed_files(&[hunk("b.c", 1), hunk("a.c", 2), hunk("b.c", 9)]);
/// assert_eq!(files, vec![PathBuf::from("b.c"), PathBuf::from("a.c")]);
/// ```
pub fn changed_files(hunks: &[DiffHunk]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    for hunk in hunks {
        if !files.contains(&hunk.file) {
            files.push(hunk.file.clone());
        }
    }
    files
}

/// Strip quoting and the `a/` or `b/` prefix. `/dev/null` yields `None`.
fn parse_path(raw: &str) -> Option<PathBuf> {
    // git appends a tab before timestamps in some patch styles
    let raw = raw.split('\t').next().unwrap_or(raw);
    let normalized = raw.trim().trim_matches('"');

    if normalized == "/dev/null" || normalized.is_empty() {
        return None;
    }

    let stripped = normalized
        .strip_prefix("a/")
        .or_else(|| normalized.strip_prefix("b/"))
        .unwrap_or(normalized);

    Some(PathBuf::from(stripped))
}

fn parse_hunk_header(line: &str) -> Result<(u32, u32, u32, u32), VfecError> {
    let inner = line
        .strip_prefix("@@ ")
        .and_then(|s| {
            let end = s.find(" @@")?;
            Some(&s[..end])
        })
        .ok_or_else(|| VfecError::Parse(format!("invalid hunk header: {line}")))?;

    let parts: Vec<&str> = inner.split(' ').collect();
    if parts.len() != 2 {
        return Err(VfecError::Parse(format!("invalid hunk header: {line}")));
    }

    let old = parts[0]
        .strip_prefix('-')
        .ok_or_else(|| VfecError::Parse(format!("invalid old range in hunk: {line}")))?;
    let new = parts[1]
        .strip_prefix('+')
        .ok_or_else(|| VfecError::Parse(format!("invalid new range in hunk: {line}")))?;

    let (old_start, old_lines) = parse_range(old, line)?;
    let (new_start, new_lines) = parse_range(new, line)?;

    Ok((old_start, old_lines, new_start, new_lines))
}

fn parse_range(range: &str, context: &str) -> Result<(u32, u32), VfecError> {
    let number = |s: &str| -> Result<u32, VfecError> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(VfecError::Parse(format!("invalid range number in: {context}")));
        }
        s.parse()
            .map_err(|_| VfecError::Parse(format!("range number out of bounds in: {context}")))
    };

    match range.split_once(',') {
        Some((start, count)) => Ok((number(start)?, number(count)?)),
        None => Ok((number(range)?, 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_diff_has_no_hunks() {
        let parsed = parse_hunks("");
        assert!(parsed.hunks.is_empty());
        assert!(parsed.skips.is_empty());
    }

    #[test]
    fn omitted_lengths_default_to_one() {
        let diff = "\
--- a/src/a.c
+++ b/src/a.c
@@ -7 +8 @@
-x
+y
";
        let parsed = parse_hunks(diff);
        assert_eq!(
            parsed.hunks,
            vec![DiffHunk {
                file: PathBuf::from("src/a.c"),
                vuln_start: 7,
                vuln_len: 1,
                fix_start: 8,
                fix_len: 1,
            }]
        );
    }

    #[test]
    fn header_with_function_context() {
        let (vs, vl, fs, fl) =
            parse_hunk_header("@@ -120,4 +121,0 @@ static int parse_url(struct Curl_easy *data)")
                .unwrap();
        assert_eq!((vs, vl, fs, fl), (120, 4, 121, 0));
    }

    #[test]
    fn multiple_files_and_hunks() {
        let diff = "\
diff --git a/lib/url.c b/lib/url.c
index 1111111..2222222 100644
--- a/lib/url.c
+++ b/lib/url.c
@@ -10,2 +10,2 @@ int f(void)
-a
-b
+c
+d
@@ -40,0 +41 @@
+e
diff --git a/lib/http.c b/lib/http.c
--- a/lib/http.c
+++ b/lib/http.c
@@ -3 +2,0 @@
-gone
";
        let parsed = parse_hunks(diff);
        assert_eq!(parsed.hunks.len(), 3);
        assert_eq!(parsed.hunks[0].file, PathBuf::from("lib/url.c"));
        assert_eq!(parsed.hunks[1].vuln_len, 0);
        assert_eq!(parsed.hunks[1].fix_start, 41);
        assert_eq!(parsed.hunks[2].file, PathBuf::from("lib/http.c"));
        assert_eq!(parsed.hunks[2].fix_len, 0);
        assert_eq!(
            changed_files(&parsed.hunks),
            vec![PathBuf::from("lib/url.c"), PathBuf::from("lib/http.c")]
        );
    }

    #[test]
    fn new_file_takes_path_from_new_side() {
        let diff = "\
--- a/old.c
+++ b/old.c
@@ -1 +1 @@
-a
+b
diff --git a/new.c b/new.c
new file mode 100644
--- /dev/null
+++ b/new.c
@@ -0,0 +1,2 @@
+x
+y
";
        let parsed = parse_hunks(diff);
        assert_eq!(parsed.hunks.len(), 2);
        assert_eq!(parsed.hunks[1].file, PathBuf::from("new.c"));
    }

    #[test]
    fn deleted_file_keeps_old_path() {
        let diff = "\
--- a/dead.c
+++ /dev/null
@@ -1,2 +0,0 @@
-x
-y
";
        let parsed = parse_hunks(diff);
        assert_eq!(parsed.hunks[0].file, PathBuf::from("dead.c"));
        assert_eq!(parsed.hunks[0].fix_len, 0);
    }

    #[test]
    fn removed_lines_that_look_like_headers_are_content() {
        let diff = "\
--- a/q.sql
+++ b/q.sql
@@ -1,2 +1 @@
--- a/comment
-++ b/not-a-header
+select 1;
@@ -9 +8 @@
-x
+y
";
        let parsed = parse_hunks(diff);
        assert_eq!(parsed.hunks.len(), 2);
        assert!(parsed.hunks.iter().all(|h| h.file == PathBuf::from("q.sql")));
    }

    #[test]
    fn malformed_header_is_skipped_and_parsing_continues() {
        let diff = "\
--- a/a.c
+++ b/a.c
@@ -x,1 +1 @@
@@ -5,1 +5,1
@@ -9 +9 @@
-old
+new
";
        let parsed = parse_hunks(diff);
        assert_eq!(parsed.hunks.len(), 1);
        assert_eq!(parsed.hunks[0].vuln_start, 9);
        assert_eq!(parsed.skips.len(), 2);
        assert_eq!(parsed.skips[0].line_number, 3);
        assert_eq!(parsed.skips[1].line, "@@ -5,1 +5,1");
    }

    #[test]
    fn hunk_without_file_is_skipped() {
        let parsed = parse_hunks("@@ -1 +1 @@\n-a\n+b\n");
        assert!(parsed.hunks.is_empty());
        assert_eq!(parsed.skips.len(), 1);
        assert!(parsed.skips[0].reason.contains("before any file header"));
    }

    #[test]
    fn parse_path_handles_quotes_and_tabs() {
        assert_eq!(
            parse_path("\"a/src/my file.c\""),
            Some(PathBuf::from("src/my file.c"))
        );
        assert_eq!(
            parse_path("b/src/x.c\t2024-01-01 00:00:00"),
            Some(PathBuf::from("src/x.c"))
        );
        assert_eq!(parse_path("/dev/null"), None);
    }

    #[test]
    fn negative_range_is_rejected() {
        assert!(parse_hunk_header("@@ -1,-2 +1 @@").is_err());
    }
}
