use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::VfecError;

/// Top-level configuration loaded from `vfec.toml`.
///
/// Every field has a default, so an empty file is a valid configuration.
///
/// # Examples
///
/// ```
/// use vfec_core::VfecConfig;
///
/// let config = VfecConfig::default();
/// assert_eq!(config.energy.max_loops, 2000);
/// assert_eq!(config.energy.repetitions, 3);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VfecConfig {
    #[serde(default)]
    pub coverage: CoverageConfig,
    #[serde(default)]
    pub energy: EnergyConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub state: StateConfig,
    /// Per-project build profiles, keyed by project identity.
    #[serde(default)]
    pub projects: HashMap<String, ProjectProfile>,
}

impl VfecConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`VfecError::Io`] if the file cannot be read, or
    /// [`VfecError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use vfec_core::VfecConfig;
    /// use std::path::Path;
    ///
    /// let config = VfecConfig::from_file(Path::new("vfec.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, VfecError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`VfecError::Toml`] if parsing fails, or [`VfecError::Config`]
    /// if a duration cannot be represented.
    ///
    /// # Examples
    ///
    /// ```
    /// use vfec_core::VfecConfig;
    ///
    /// let toml = r#"
    /// [energy]
    /// repetitions = 10
    /// "#;
    /// let config = VfecConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.energy.repetitions, 10);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, VfecError> {
        let config: Self = toml::from_str(content)?;
        config.energy.validate()?;
        Ok(config)
    }

    /// Build profile for `project`, falling back to the autotools preset.
    pub fn profile(&self, project: &str) -> ProjectProfile {
        self.projects.get(project).cloned().unwrap_or_default()
    }
}

/// Coverage report handling.
///
/// # Examples
///
/// ```
/// use vfec_core::CoverageConfig;
///
/// let config = CoverageConfig::default();
/// assert_eq!(config.accumulator_extension, "gcda");
/// assert!(config.exclude_patterns.contains(&"/usr/*".to_string()));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageConfig {
    /// Root that absolute source paths in coverage reports are made relative to.
    pub project_root: Option<PathBuf>,
    /// Glob patterns of source files to drop from coverage reports.
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    /// Extensions that count as source files for test relevance.
    #[serde(default = "default_source_extensions")]
    pub source_extensions: Vec<String>,
    /// Extension of per-translation-unit coverage accumulator files.
    #[serde(default = "default_accumulator_extension")]
    pub accumulator_extension: String,
    /// Extension substituted when recovering a source file from an accumulator.
    #[serde(default = "default_source_extension")]
    pub default_source_extension: String,
}

fn default_exclude_patterns() -> Vec<String> {
    vec!["/usr/*".into(), "*/tests/*".into()]
}

fn default_source_extensions() -> Vec<String> {
    ["c", "h", "cc", "cpp", "cxx", "hpp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_accumulator_extension() -> String {
    "gcda".into()
}

fn default_source_extension() -> String {
    "c".into()
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            project_root: None,
            exclude_patterns: default_exclude_patterns(),
            source_extensions: default_source_extensions(),
            accumulator_extension: default_accumulator_extension(),
            default_source_extension: default_source_extension(),
        }
    }
}

/// Energy calibration, sampling, and aggregation settings.
///
/// # Examples
///
/// ```
/// use vfec_core::EnergyConfig;
///
/// let config = EnergyConfig::default();
/// assert_eq!(config.min_duration_secs, 0.5);
/// assert_eq!(config.cool_down_secs, 1.0);
/// assert_eq!(config.field_separator, ",");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyConfig {
    /// Minimum per-session duration a reading is trusted at (default: 0.5s).
    #[serde(default = "default_min_duration_secs")]
    pub min_duration_secs: f64,
    /// Upper bound on the loop multiplier (default: 2000).
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    /// Sampling repetitions per test (default: 3).
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    /// Pause between repetitions (default: 1.0s).
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_secs: f64,
    #[serde(default = "default_perf_program")]
    pub perf_program: String,
    /// Arguments placed before the perf program, e.g. `["sudo", "-n"]`.
    #[serde(default)]
    pub perf_prefix: Vec<String>,
    /// Energy events to request when the host exposes them.
    #[serde(default = "default_candidate_energy_events")]
    pub candidate_energy_events: Vec<String>,
    /// Energy domain reported as the measurement's headline value.
    #[serde(default = "default_primary_energy_event")]
    pub primary_energy_event: String,
    #[serde(default = "default_cycles_event")]
    pub cycles_event: String,
    #[serde(default = "default_instructions_event")]
    pub instructions_event: String,
    /// Count system-wide (`perf stat -a`); energy domains are package-wide
    /// regardless.
    #[serde(default = "default_true")]
    pub system_wide: bool,
    /// Field separator passed to `perf stat -x`.
    #[serde(default = "default_field_separator")]
    pub field_separator: String,
    /// Time limit for one sampling session.
    pub timeout_secs: Option<u64>,
    /// Only measure tests whose coverage touches a changed file.
    #[serde(default = "default_true")]
    pub only_relevant_tests: bool,
}

fn default_min_duration_secs() -> f64 {
    0.5
}

fn default_max_loops() -> u32 {
    2000
}

fn default_repetitions() -> u32 {
    3
}

fn default_cool_down_secs() -> f64 {
    1.0
}

fn default_perf_program() -> String {
    "perf".into()
}

fn default_candidate_energy_events() -> Vec<String> {
    [
        "power/energy-pkg/",
        "power/energy-cores/",
        "power/energy-ram/",
        "power/energy-psys/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_primary_energy_event() -> String {
    "power/energy-pkg/".into()
}

fn default_cycles_event() -> String {
    "cycles".into()
}

fn default_instructions_event() -> String {
    "instructions".into()
}

fn default_field_separator() -> String {
    ",".into()
}

fn default_true() -> bool {
    true
}

/// Converts a seconds value from configuration or the command line.
///
/// # Errors
///
/// Returns [`VfecError::Config`] for negative, NaN, infinite or overflowing
/// values.
pub fn secs_to_duration(field: &str, secs: f64) -> Result<Duration, VfecError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        VfecError::Config(format!(
            "{field} must be a finite, non-negative number of seconds (got {secs})"
        ))
    })
}

impl EnergyConfig {
    /// Checks that every seconds field converts to a [`Duration`].
    pub fn validate(&self) -> Result<(), VfecError> {
        secs_to_duration("energy.min_duration_secs", self.min_duration_secs)?;
        secs_to_duration("energy.cool_down_secs", self.cool_down_secs)?;
        Ok(())
    }

    /// Zero when the value was never validated and is out of range.
    pub fn min_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.min_duration_secs).unwrap_or(Duration::ZERO)
    }

    pub fn cool_down(&self) -> Duration {
        Duration::try_from_secs_f64(self.cool_down_secs).unwrap_or(Duration::ZERO)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: default_min_duration_secs(),
            max_loops: default_max_loops(),
            repetitions: default_repetitions(),
            cool_down_secs: default_cool_down_secs(),
            perf_program: default_perf_program(),
            perf_prefix: Vec::new(),
            candidate_energy_events: default_candidate_energy_events(),
            primary_energy_event: default_primary_energy_event(),
            cycles_event: default_cycles_event(),
            instructions_event: default_instructions_event(),
            system_wide: true,
            field_separator: default_field_separator(),
            timeout_secs: None,
            only_relevant_tests: true,
        }
    }
}

/// Time limits and parallelism for external build and test processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    /// Parallel build jobs (default: available parallelism).
    pub jobs: Option<usize>,
}

fn default_build_timeout_secs() -> u64 {
    1200
}

fn default_test_timeout_secs() -> u64 {
    600
}

impl ExecutionConfig {
    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            build_timeout_secs: default_build_timeout_secs(),
            test_timeout_secs: default_test_timeout_secs(),
            jobs: None,
        }
    }
}

/// Location of the resumable state ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(".vfec/state.db")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
        }
    }
}

/// Build-system preset a project profile starts from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    /// `./configure && make`
    #[default]
    Autotools,
    /// Out-of-tree `cmake ..` in a scratch build directory.
    Cmake,
    /// Plain `make` with flags passed as make variables.
    Make,
    /// Every command supplied explicitly.
    Custom,
}

/// Declarative description of how to configure, build, and test a project.
///
/// Commands are argument vectors; `{test}`, `{jobs}`, `{output}`,
/// `{cflags}` and `{ldflags}` are expanded inside individual arguments, so
/// no shell quoting is ever involved. Unset commands come from the
/// [`BuildSystem`] preset.
///
/// # Examples
///
/// ```
/// use vfec_core::{BuildSystem, VfecConfig};
///
/// let toml = r#"
/// [projects.curl]
/// build_system = "autotools"
/// bootstrap = ["./buildconf"]
/// test = ["./runtests.pl", "{test}"]
/// test_dir = "tests"
/// tests = ["1", "2"]
/// "#;
/// let config = VfecConfig::from_toml(toml).unwrap();
/// let curl = config.profile("curl");
/// assert_eq!(curl.build_system, BuildSystem::Autotools);
/// assert_eq!(curl.tests, vec!["1", "2"]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectProfile {
    #[serde(default)]
    pub build_system: BuildSystem,
    /// Build directory relative to the project root (CMake default: `build_vfec`).
    pub build_dir: Option<PathBuf>,
    /// Run once before configure, e.g. `./buildconf` or `autoreconf -fi`.
    pub bootstrap: Option<Vec<String>>,
    pub configure: Option<Vec<String>>,
    pub build: Option<Vec<String>>,
    /// Test invocation template; must contain `{test}` somewhere.
    #[serde(default)]
    pub test: Vec<String>,
    /// Directory tests run in, relative to the project root.
    pub test_dir: Option<PathBuf>,
    /// Static test identifiers.
    #[serde(default)]
    pub tests: Vec<String>,
    /// Command whose non-empty stdout lines are test identifiers.
    pub list_tests: Option<Vec<String>>,
    /// Command producing an LCOV report at `{output}`.
    pub coverage_capture: Option<Vec<String>>,
    /// Environment applied to every command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_coverage_cflags")]
    pub coverage_cflags: String,
    #[serde(default = "default_coverage_ldflags")]
    pub coverage_ldflags: String,
    #[serde(default = "default_release_cflags")]
    pub release_cflags: String,
}

fn default_coverage_cflags() -> String {
    "-fprofile-arcs -ftest-coverage -g -O0".into()
}

fn default_coverage_ldflags() -> String {
    "-fprofile-arcs -ftest-coverage".into()
}

fn default_release_cflags() -> String {
    "-O2".into()
}

impl Default for ProjectProfile {
    fn default() -> Self {
        Self {
            build_system: BuildSystem::default(),
            build_dir: None,
            bootstrap: None,
            configure: None,
            build: None,
            test: Vec::new(),
            test_dir: None,
            tests: Vec::new(),
            list_tests: None,
            coverage_capture: None,
            env: BTreeMap::new(),
            coverage_cflags: default_coverage_cflags(),
            coverage_ldflags: default_coverage_ldflags(),
            release_cflags: default_release_cflags(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = VfecConfig::default();
        assert_eq!(config.energy.min_duration_secs, 0.5);
        assert_eq!(config.energy.max_loops, 2000);
        assert_eq!(config.energy.repetitions, 3);
        assert_eq!(config.energy.cool_down_secs, 1.0);
        assert_eq!(config.energy.perf_program, "perf");
        assert!(config.energy.perf_prefix.is_empty());
        assert_eq!(config.energy.candidate_energy_events.len(), 4);
        assert!(config.energy.only_relevant_tests);
        assert!(config.energy.system_wide);
        assert_eq!(config.execution.build_timeout_secs, 1200);
        assert_eq!(config.execution.test_timeout_secs, 600);
        assert_eq!(config.state.ledger_path, PathBuf::from(".vfec/state.db"));
        assert!(config.projects.is_empty());
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = VfecConfig::from_toml("").unwrap();
        assert_eq!(config.energy.max_loops, 2000);
        assert_eq!(config.coverage.default_source_extension, "c");
    }

    #[test]
    fn parse_energy_overrides() {
        let toml = r#"
[energy]
min_duration_secs = 0.1
max_loops = 500
repetitions = 50
cool_down_secs = 0.2
perf_prefix = ["sudo", "-n"]
timeout_secs = 900
only_relevant_tests = false
"#;
        let config = VfecConfig::from_toml(toml).unwrap();
        assert_eq!(config.energy.min_duration(), Duration::from_millis(100));
        assert_eq!(config.energy.max_loops, 500);
        assert_eq!(config.energy.repetitions, 50);
        assert_eq!(config.energy.cool_down(), Duration::from_millis(200));
        assert_eq!(config.energy.perf_prefix, vec!["sudo", "-n"]);
        assert_eq!(config.energy.timeout(), Some(Duration::from_secs(900)));
        assert!(!config.energy.only_relevant_tests);
        assert_eq!(config.energy.cycles_event, "cycles");
    }

    #[test]
    fn parse_project_profiles() {
        let toml = r#"
[projects.openssl]
build_system = "custom"
configure = ["./config", "no-shared"]
build = ["make", "-j{jobs}"]
test = ["make", "test", "TESTS={test}"]
list_tests = ["sh", "-c", "ls test/recipes"]

[projects.openssl.env]
CC = "gcc"

[projects.libpng]
build_system = "cmake"
"#;
        let config = VfecConfig::from_toml(toml).unwrap();
        let openssl = config.profile("openssl");
        assert_eq!(openssl.build_system, BuildSystem::Custom);
        assert_eq!(
            openssl.configure.as_deref(),
            Some(&["./config".to_string(), "no-shared".to_string()][..])
        );
        assert_eq!(openssl.env.get("CC").map(String::as_str), Some("gcc"));
        assert_eq!(openssl.coverage_cflags, "-fprofile-arcs -ftest-coverage -g -O0");

        assert_eq!(config.profile("libpng").build_system, BuildSystem::Cmake);
        assert_eq!(config.profile("unknown").build_system, BuildSystem::Autotools);
    }

    #[test]
    fn invalid_toml_returns_error() {
        let result = VfecConfig::from_toml("{{invalid}}");
        assert!(matches!(result, Err(VfecError::Toml(_))));
    }

    #[test]
    fn infinite_cool_down_is_a_config_error() {
        let toml = "[energy]\ncool_down_secs = inf\n";
        let err = VfecConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, VfecError::Config(ref m) if m.contains("energy.cool_down_secs")));
    }

    #[test]
    fn negative_and_huge_durations_are_rejected() {
        for (field, value) in [("min_duration_secs", "-0.5"), ("cool_down_secs", "1e300")] {
            let toml = format!("[energy]\n{field} = {value}\n");
            assert!(
                matches!(VfecConfig::from_toml(&toml), Err(VfecError::Config(_))),
                "{field} = {value}"
            );
        }
        assert_eq!(
            secs_to_duration("x", 0.25).unwrap(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn unvalidated_out_of_range_durations_read_as_zero() {
        let config = EnergyConfig {
            cool_down_secs: f64::INFINITY,
            min_duration_secs: f64::NAN,
            ..EnergyConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.cool_down(), Duration::ZERO);
        assert_eq!(config.min_duration(), Duration::ZERO);
    }

    #[test]
    fn unknown_build_system_is_rejected() {
        let toml = r#"
[projects.x]
build_system = "bazel"
"#;
        assert!(VfecConfig::from_toml(toml).is_err());
    }
}
