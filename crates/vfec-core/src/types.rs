use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A single hunk from a zero-context unified diff.
///
/// Lengths default to 1 when the hunk header omits them.
///
/// # Examples
///
/// ```
/// use vfec_core::{ChangeType, DiffHunk};
/// use std::path::PathBuf;
///
/// let hunk = DiffHunk {
///     file: PathBuf::from("lib/url.c"),
///     vuln_start: 10,
///     vuln_len: 3,
///     fix_start: 10,
///     fix_len: 1,
/// };
/// assert_eq!(hunk.extent(), 3);
/// assert_eq!(hunk.change_type(), ChangeType::Modify);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffHunk {
    /// Path of the changed file, relative to the repository root.
    pub file: PathBuf,
    /// First line of the hunk in the vulnerable revision.
    pub vuln_start: u32,
    /// Number of lines in the vulnerable revision.
    pub vuln_len: u32,
    /// First line of the hunk in the fixed revision.
    pub fix_start: u32,
    /// Number of lines in the fixed revision.
    pub fix_len: u32,
}

impl DiffHunk {
    /// Number of line offsets the hunk spans: `max(vuln_len, fix_len)`.
    pub fn extent(&self) -> u32 {
        self.vuln_len.max(self.fix_len)
    }

    /// Classify the hunk by which sides carry lines.
    pub fn change_type(&self) -> ChangeType {
        if self.vuln_len == 0 {
            ChangeType::Add
        } else if self.fix_len == 0 {
            ChangeType::Delete
        } else {
            ChangeType::Modify
        }
    }
}

/// Classification of a diff hunk.
///
/// # Examples
///
/// ```
/// use vfec_core::ChangeType;
///
/// let ct = ChangeType::Add;
/// assert_eq!(format!("{ct}"), "add");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Pure insertion: the vulnerable side is empty.
    Add,
    /// Pure deletion: the fixed side is empty.
    Delete,
    /// Lines replaced in place.
    Modify,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Add => write!(f, "add"),
            ChangeType::Delete => write!(f, "delete"),
            ChangeType::Modify => write!(f, "modify"),
        }
    }
}

/// One aligned line pair inside a hunk.
///
/// At least one side is always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineCorrespondence {
    /// Changed file.
    pub file: PathBuf,
    /// Line in the vulnerable revision, `None` for inserted lines.
    pub vuln_line: Option<u32>,
    /// Line in the fixed revision, `None` for deleted lines.
    pub fix_line: Option<u32>,
}

/// A correspondence joined with execution hit counts from both revisions.
///
/// A hit count of `None` means "N/A": either the side has no line at this
/// offset or the coverage report has no executable-line record for it. It is
/// never the same as zero hits.
///
/// # Examples
///
/// ```
/// use vfec_core::LineClassification;
/// use std::path::PathBuf;
///
/// let row = LineClassification {
///     file: PathBuf::from("lib/url.c"),
///     vuln_line: Some(11),
///     fix_line: None,
///     vuln_hits: Some(3),
///     fix_hits: None,
///     executable: true,
///     vuln_snippet: None,
///     fix_snippet: None,
/// };
/// assert_eq!(row.vuln_hits_label(), "3");
/// assert_eq!(row.fix_hits_label(), "N/A");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineClassification {
    pub file: PathBuf,
    pub vuln_line: Option<u32>,
    pub fix_line: Option<u32>,
    pub vuln_hits: Option<u64>,
    pub fix_hits: Option<u64>,
    /// True iff either side has a coverage entry for its line.
    pub executable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vuln_snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_snippet: Option<String>,
}

impl LineClassification {
    pub fn vuln_hits_label(&self) -> String {
        hits_label(self.vuln_hits)
    }

    pub fn fix_hits_label(&self) -> String {
        hits_label(self.fix_hits)
    }
}

fn hits_label(hits: Option<u64>) -> String {
    match hits {
        Some(n) => n.to_string(),
        None => "N/A".to_string(),
    }
}

/// Counter readings for one sampling repetition, normalized to a single
/// logical run of the measured command.
///
/// Metrics that the host could not count are `None`, never zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyMeasurement {
    /// 1-based repetition index.
    pub run_index: u32,
    /// Wall-clock seconds per logical run.
    pub time_sec: f64,
    /// Joules of the primary energy domain per logical run.
    pub energy_j: Option<f64>,
    /// Joules per logical run for every counted energy domain.
    #[serde(default)]
    pub energy_domains: BTreeMap<String, f64>,
    pub cycles: Option<f64>,
    pub instructions: Option<f64>,
    /// `instructions / cycles` after normalization, 0 when cycles is 0.
    pub ipc: Option<f64>,
}

/// How many times a command must be looped inside one sampling session.
///
/// # Examples
///
/// ```
/// use vfec_core::CalibrationResult;
///
/// let c = CalibrationResult { loop_count: 250, dry_run_duration_sec: 0.002 };
/// assert!(c.is_batched());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationResult {
    pub loop_count: u32,
    pub dry_run_duration_sec: f64,
}

impl CalibrationResult {
    /// Whether the command runs more than once per session.
    pub fn is_batched(&self) -> bool {
        self.loop_count > 1
    }
}

/// Descriptive statistics for one metric across successful repetitions.
///
/// A `sample_count` of 0 is the explicit "no data" marker: every statistic
/// is `None` rather than zero.
///
/// # Examples
///
/// ```
/// use vfec_core::AggregatedMetric;
///
/// let none = AggregatedMetric::absent();
/// assert!(none.is_absent());
/// assert_eq!(none.mean, None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetric {
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub stdev: Option<f64>,
    pub sample_count: usize,
}

impl AggregatedMetric {
    pub fn absent() -> Self {
        Self {
            mean: None,
            median: None,
            stdev: None,
            sample_count: 0,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.sample_count == 0
    }
}

/// Which revision of a commit pair is being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Vuln,
    Fix,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Vuln => write!(f, "vuln"),
            Side::Fix => write!(f, "fix"),
        }
    }
}

/// Identity of a (vulnerable, fixed) commit pair within a project.
///
/// # Examples
///
/// ```
/// use vfec_core::{PairKey, Side};
///
/// let pair = PairKey::new("curl", "da0db499fd1fed3a", "192c4f788d48f82c");
/// assert_eq!(pair.label(), "da0db499...192c4f78");
/// assert_eq!(pair.unit(Side::Fix, "1234").commit, "192c4f788d48f82c");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairKey {
    pub project: String,
    pub vuln_commit: String,
    pub fix_commit: String,
}

impl PairKey {
    pub fn new(
        project: impl Into<String>,
        vuln_commit: impl Into<String>,
        fix_commit: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            vuln_commit: vuln_commit.into(),
            fix_commit: fix_commit.into(),
        }
    }

    pub fn commit(&self, side: Side) -> &str {
        match side {
            Side::Vuln => &self.vuln_commit,
            Side::Fix => &self.fix_commit,
        }
    }

    /// Short `vuln...fix` label using 8-character hashes.
    pub fn label(&self) -> String {
        format!(
            "{}...{}",
            short_hash(&self.vuln_commit),
            short_hash(&self.fix_commit)
        )
    }

    /// Unit key for one test on one side of this pair.
    pub fn unit(&self, side: Side, test: &str) -> UnitKey {
        UnitKey {
            project: self.project.clone(),
            commit: self.commit(side).to_string(),
            test: test.to_string(),
        }
    }
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}

/// Identity of one (project, commit, test) unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitKey {
    pub project: String,
    pub commit: String,
    pub test: String,
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}",
            self.project,
            short_hash(&self.commit),
            self.test
        )
    }
}

/// Processing stage of a unit.
///
/// Stages advance in declaration order; `Failed` is reachable from any
/// stage. `Aggregated` and `Failed` are terminal.
///
/// # Examples
///
/// ```
/// use vfec_core::UnitStage;
///
/// assert!(UnitStage::Built.precedes(UnitStage::CoverageCollected));
/// assert!(UnitStage::Failed.is_terminal());
/// assert_eq!("energy_measured".parse::<UnitStage>().unwrap(), UnitStage::EnergyMeasured);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStage {
    CheckedOut,
    Built,
    CoverageCollected,
    EnergyCalibrated,
    EnergyMeasured,
    Aggregated,
    Failed,
}

impl UnitStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStage::Aggregated | UnitStage::Failed)
    }

    /// Whether `self` comes strictly before `other` in the forward chain.
    /// `Failed` is outside the chain and precedes nothing.
    pub fn precedes(self, other: UnitStage) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    fn rank(self) -> Option<u8> {
        match self {
            UnitStage::CheckedOut => Some(0),
            UnitStage::Built => Some(1),
            UnitStage::CoverageCollected => Some(2),
            UnitStage::EnergyCalibrated => Some(3),
            UnitStage::EnergyMeasured => Some(4),
            UnitStage::Aggregated => Some(5),
            UnitStage::Failed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitStage::CheckedOut => "checked_out",
            UnitStage::Built => "built",
            UnitStage::CoverageCollected => "coverage_collected",
            UnitStage::EnergyCalibrated => "energy_calibrated",
            UnitStage::EnergyMeasured => "energy_measured",
            UnitStage::Aggregated => "aggregated",
            UnitStage::Failed => "failed",
        }
    }
}

impl fmt::Display for UnitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checked_out" => Ok(UnitStage::CheckedOut),
            "built" => Ok(UnitStage::Built),
            "coverage_collected" => Ok(UnitStage::CoverageCollected),
            "energy_calibrated" => Ok(UnitStage::EnergyCalibrated),
            "energy_measured" => Ok(UnitStage::EnergyMeasured),
            "aggregated" => Ok(UnitStage::Aggregated),
            "failed" => Ok(UnitStage::Failed),
            other => Err(format!("unknown unit stage: {other}")),
        }
    }
}

/// Per-line source text lookup used to attach snippets to joined rows.
pub trait SourceLookup {
    /// Text of `line` (1-based) in `file`, if known.
    fn line(&self, file: &Path, line: u32) -> Option<String>;
}

/// Output format for CLI subcommands.
///
/// Implements [`FromStr`] so it can be used directly with `clap` argument parsing.
///
/// # Examples
///
/// ```
/// use vfec_core::OutputFormat;
///
/// let fmt: OutputFormat = "json".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Json);
///
/// let fmt: OutputFormat = "md".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Markdown);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable tables and summaries.
    #[default]
    Text,
    /// Machine-readable JSON with camelCase keys.
    Json,
    /// Markdown-formatted output.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_from_str() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!(
            "markdown".parse::<OutputFormat>().unwrap(),
            OutputFormat::Markdown
        );
        assert_eq!("md".parse::<OutputFormat>().unwrap(), OutputFormat::Markdown);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("sarif".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn hunk_change_type_follows_lengths() {
        let mut hunk = DiffHunk {
            file: PathBuf::from("a.c"),
            vuln_start: 5,
            vuln_len: 0,
            fix_start: 5,
            fix_len: 2,
        };
        assert_eq!(hunk.change_type(), ChangeType::Add);
        assert_eq!(hunk.extent(), 2);

        hunk.vuln_len = 3;
        hunk.fix_len = 0;
        assert_eq!(hunk.change_type(), ChangeType::Delete);
        assert_eq!(hunk.extent(), 3);
    }

    #[test]
    fn stage_order_and_terminality() {
        let chain = [
            UnitStage::CheckedOut,
            UnitStage::Built,
            UnitStage::CoverageCollected,
            UnitStage::EnergyCalibrated,
            UnitStage::EnergyMeasured,
            UnitStage::Aggregated,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].precedes(pair[1]));
            assert!(!pair[1].precedes(pair[0]));
        }
        assert!(!UnitStage::Failed.precedes(UnitStage::Aggregated));
        assert!(!UnitStage::Built.precedes(UnitStage::Failed));
        assert!(UnitStage::Aggregated.is_terminal());
        assert!(!UnitStage::EnergyMeasured.is_terminal());
    }

    #[test]
    fn stage_strings_roundtrip() {
        for stage in [
            UnitStage::CheckedOut,
            UnitStage::Built,
            UnitStage::CoverageCollected,
            UnitStage::EnergyCalibrated,
            UnitStage::EnergyMeasured,
            UnitStage::Aggregated,
            UnitStage::Failed,
        ] {
            assert_eq!(stage.as_str().parse::<UnitStage>().unwrap(), stage);
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage.as_str()));
        }
    }

    #[test]
    fn unit_key_display_shortens_commit() {
        let pair = PairKey::new("openssl", "0123456789abcdef", "fedcba9876543210");
        let unit = pair.unit(Side::Vuln, "test_x509");
        assert_eq!(unit.to_string(), "openssl@01234567:test_x509");
    }

    #[test]
    fn classification_serializes_camel_case_without_empty_snippets() {
        let row = LineClassification {
            file: PathBuf::from("lib/url.c"),
            vuln_line: Some(10),
            fix_line: Some(10),
            vuln_hits: None,
            fix_hits: Some(5),
            executable: true,
            vuln_snippet: None,
            fix_snippet: None,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["vulnLine"], 10);
        assert!(json["vulnHits"].is_null());
        assert_eq!(json["fixHits"], 5);
        assert!(json.get("vulnSnippet").is_none());
    }
}
