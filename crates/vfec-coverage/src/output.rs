use std::fmt::Write;

use vfec_core::{LineClassification, VfecError};

use crate::joiner::CoverageDiffReport;

/// Which rows of a report to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// Every correspondence.
    Master,
    /// Executable rows only.
    Clean,
}

fn rows<'r>(report: &'r CoverageDiffReport, view: View) -> Vec<&'r LineClassification> {
    match view {
        View::Master => report.master().collect(),
        View::Clean => report.clean().collect(),
    }
}

fn line_label(line: Option<u32>) -> String {
    line.map_or_else(|| "N/A".to_string(), |l| l.to_string())
}

fn header(report: &CoverageDiffReport) -> Option<String> {
    let pair = report.pair.as_ref()?;
    Some(match &report.test {
        Some(test) => format!("{} {} test {}", pair.project, pair.label(), test),
        None => format!("{} {}", pair.project, pair.label()),
    })
}

/// Plain-text table followed by the summary line.
///
/// # Examples
///
/// ```
/// use vfec_coverage::joiner::CoverageDiffReport;
/// use vfec_coverage::output::{format_text, View};
///
/// let out = format_text(&CoverageDiffReport::default(), View::Master);
/// assert!(out.contains("no changed lines"));
/// ```
pub fn format_text(report: &CoverageDiffReport, view: View) -> String {
    let mut out = String::new();
    if let Some(h) = header(report) {
        let _ = writeln!(out, "{h}");
    }

    let selected = rows(report, view);
    if selected.is_empty() {
        out.push_str("no changed lines\n");
    } else {
        let width = selected
            .iter()
            .map(|r| r.file.display().to_string().len())
            .max()
            .unwrap_or(4)
            .max(4);
        let _ = writeln!(
            out,
            "{:<width$}  {:>8}  {:>8}  {:>9}  {:>9}  EXEC",
            "FILE", "V_LINE", "F_LINE", "V_HITS", "F_HITS"
        );
        for r in &selected {
            let _ = writeln!(
                out,
                "{:<width$}  {:>8}  {:>8}  {:>9}  {:>9}  {}",
                r.file.display().to_string(),
                line_label(r.vuln_line),
                line_label(r.fix_line),
                r.vuln_hits_label(),
                r.fix_hits_label(),
                if r.executable { "yes" } else { "no" },
            );
            if let (Some(v), Some(f)) = (&r.vuln_snippet, &r.fix_snippet) {
                let _ = writeln!(out, "    - {v}");
                let _ = writeln!(out, "    + {f}");
            }
        }
    }

    let s = report.summary();
    let _ = writeln!(
        out,
        "\nvuln: {}/{} lines hit ({:.2}%)  fix: {}/{} lines hit ({:.2}%)",
        s.vuln_hits,
        s.vuln_lines,
        s.vuln_pct(),
        s.fix_hits,
        s.fix_lines,
        s.fix_pct()
    );
    out
}

/// Markdown table plus a summary table.
pub fn format_markdown(report: &CoverageDiffReport, view: View) -> String {
    let mut out = String::new();
    let title = header(report).unwrap_or_else(|| "Coverage differential".into());
    let _ = writeln!(out, "## {title}\n");

    let selected = rows(report, view);
    let with_snippets = selected.iter().any(|r| r.vuln_snippet.is_some());
    if with_snippets {
        out.push_str("| File | Vuln line | Vuln snippet | Vuln hits | Fix line | Fix snippet | Fix hits |\n");
        out.push_str("|------|----------:|--------------|----------:|---------:|-------------|---------:|\n");
    } else {
        out.push_str("| File | Vuln line | Vuln hits | Fix line | Fix hits | Executable |\n");
        out.push_str("|------|----------:|----------:|---------:|---------:|:----------:|\n");
    }
    for r in &selected {
        let file = r.file.display();
        if with_snippets {
            let _ = writeln!(
                out,
                "| `{file}` | {} | `{}` | {} | {} | `{}` | {} |",
                line_label(r.vuln_line),
                escape_cell(r.vuln_snippet.as_deref().unwrap_or("")),
                r.vuln_hits_label(),
                line_label(r.fix_line),
                escape_cell(r.fix_snippet.as_deref().unwrap_or("")),
                r.fix_hits_label(),
            );
        } else {
            let _ = writeln!(
                out,
                "| `{file}` | {} | {} | {} | {} | {} |",
                line_label(r.vuln_line),
                r.vuln_hits_label(),
                line_label(r.fix_line),
                r.fix_hits_label(),
                if r.executable { "yes" } else { "no" },
            );
        }
    }

    let s = report.summary();
    out.push_str("\n| Side | Lines | Hits | Coverage |\n|------|------:|-----:|---------:|\n");
    let _ = writeln!(
        out,
        "| vuln | {} | {} | {:.2}% |",
        s.vuln_lines,
        s.vuln_hits,
        s.vuln_pct()
    );
    let _ = writeln!(
        out,
        "| fix | {} | {} | {:.2}% |",
        s.fix_lines,
        s.fix_hits,
        s.fix_pct()
    );
    out
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('`', "'")
}

/// JSON object with the selected rows and the summary.
///
/// # Errors
///
/// Returns [`VfecError::Serialization`] if serialization fails.
pub fn format_json(report: &CoverageDiffReport, view: View) -> Result<String, VfecError> {
    let value = serde_json::json!({
        "pair": report.pair,
        "test": report.test,
        "view": match view { View::Master => "master", View::Clean => "clean" },
        "rows": rows(report, view),
        "summary": report.summary(),
    });
    serde_json::to_string_pretty(&value).map_err(VfecError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use vfec_core::PairKey;

    fn sample() -> CoverageDiffReport {
        let row = |v: Option<u32>, f: Option<u32>, vh: Option<u64>, fh: Option<u64>| LineClassification {
            file: PathBuf::from("lib/url.c"),
            vuln_line: v,
            fix_line: f,
            vuln_hits: vh,
            fix_hits: fh,
            executable: vh.is_some() || fh.is_some(),
            vuln_snippet: None,
            fix_snippet: None,
        };
        CoverageDiffReport {
            pair: Some(PairKey::new("curl", "da0db499fd1f", "192c4f788d48")),
            test: None,
            rows: vec![
                row(Some(10), Some(10), None, Some(5)),
                row(Some(11), None, Some(3), None),
                row(Some(12), None, None, None),
            ],
        }
    }

    #[test]
    fn text_clean_view_hides_non_executable() {
        let report = sample();
        let master = format_text(&report, View::Master);
        let clean = format_text(&report, View::Clean);
        assert_eq!(master.matches("lib/url.c").count(), 3);
        assert_eq!(clean.matches("lib/url.c").count(), 2);
        assert!(master.starts_with("curl da0db499...192c4f78"));
        assert!(clean.contains("vuln: 1/1 lines hit (100.00%)"));
        assert!(clean.contains("fix: 1/1 lines hit (100.00%)"));
    }

    #[test]
    fn markdown_has_summary_table() {
        let md = format_markdown(&sample(), View::Master);
        assert!(md.contains("| Side | Lines | Hits | Coverage |"));
        assert!(md.contains("| `lib/url.c` | 12 | N/A | N/A | N/A | no |"));
    }

    #[test]
    fn markdown_escapes_snippets() {
        let mut report = sample();
        report.rows[1].vuln_snippet = Some("a | b".into());
        report.rows[1].fix_snippet = Some("[DELETED]".into());
        let md = format_markdown(&report, View::Clean);
        assert!(md.contains("Vuln snippet"));
        assert!(md.contains("a \\| b"));
    }

    #[test]
    fn json_carries_view_and_summary() {
        let json = format_json(&sample(), View::Clean).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["view"], "clean");
        assert_eq!(value["rows"].as_array().unwrap().len(), 2);
        assert_eq!(value["summary"]["vulnLines"], 1);
        assert_eq!(value["rows"][0]["fixHits"], 5);
        assert!(value["rows"][0]["vulnHits"].is_null());
    }
}
