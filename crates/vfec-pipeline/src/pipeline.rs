//! Drives one commit pair through the per-unit state machine.
//!
//! For each side of the pair, in order:
//!
//! 1. check out the commit and build it with coverage instrumentation
//! 2. per test: reset accumulators, run, extract artifacts, capture LCOV
//! 3. select the tests whose coverage touches a changed source file
//! 4. check out again, build without instrumentation
//! 5. per selected test: calibrate, sample, aggregate
//!
//! The two sides are then joined with the diff into one coverage
//! differential per test. A failure halts only the units it affects.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::Serialize;
use vfec_core::exec::CommandRunner;
use vfec_core::{
    FailureKind, PairKey, ProjectProfile, Side, UnitKey, UnitStage, VfecConfig, VfecError,
};
use vfec_coverage::accumulator::Accumulators;
use vfec_coverage::joiner::{CoverageDiffReport, DiffCoverageJoiner};
use vfec_coverage::lcov::{CoverageIndex, LcovOptions};
use vfec_difflens::mapper::{HunkMapper, MappedDiff};
use vfec_difflens::parser::ParseSkip;
use vfec_difflens::relevance::RelevanceFilter;
use vfec_energy::{EnergyMeter, EnergyReport};
use vfec_gitpulse::GitSnippets;

use crate::adapter::{BuildAdapter, ProfileAdapter};
use crate::context::{FailureRecord, RunContext};
use crate::state::{StateLedger, UnitRecord};
use crate::worktree::WorkTree;

/// Test name used for failures that affect a whole side of a pair.
pub const ALL_TESTS: &str = "*";

/// Joined results for one test.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub test: String,
    /// Whether the test's coverage touched a changed source file on either side.
    pub relevant: bool,
    pub coverage: CoverageDiffReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vuln_energy: Option<EnergyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_energy: Option<EnergyReport>,
}

/// Everything one [`Pipeline::run_pair`] call produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairOutcome {
    pub pair: PairKey,
    pub changed_files: Vec<PathBuf>,
    pub hunks: usize,
    pub parse_skips: Vec<ParseSkip>,
    pub tests: Vec<TestOutcome>,
    pub failures: Vec<FailureRecord>,
}

impl PairOutcome {
    pub fn relevant_tests(&self) -> impl Iterator<Item = &TestOutcome> {
        self.tests.iter().filter(|t| t.relevant)
    }
}

#[derive(Debug, Default)]
struct SideRun {
    records: BTreeMap<String, UnitRecord>,
    relevant: BTreeSet<String>,
}

/// Orchestrates checkout, builds, coverage, and energy for one project.
pub struct Pipeline<'a> {
    runner: &'a dyn CommandRunner,
    worktree: &'a dyn WorkTree,
    ledger: &'a StateLedger,
    config: &'a VfecConfig,
    project: String,
    profile: ProjectProfile,
    scratch: PathBuf,
    selected_tests: Vec<String>,
}

impl<'a> Pipeline<'a> {
    /// `scratch` holds coverage reports and the counter file; it must lie
    /// outside the working tree, which is wiped on every checkout.
    pub fn new(
        runner: &'a dyn CommandRunner,
        worktree: &'a dyn WorkTree,
        ledger: &'a StateLedger,
        config: &'a VfecConfig,
        project: impl Into<String>,
        scratch: impl Into<PathBuf>,
    ) -> Self {
        let project = project.into();
        Self {
            runner,
            worktree,
            ledger,
            config,
            profile: config.profile(&project),
            project,
            scratch: scratch.into(),
            selected_tests: Vec::new(),
        }
    }

    /// Restrict the run to `tests` instead of every test the project lists.
    pub fn with_tests(mut self, tests: Vec<String>) -> Self {
        self.selected_tests = tests;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Run both sides of `pair` and join their coverage with the diff.
    ///
    /// # Errors
    ///
    /// Only failures that leave nothing to report are returned: the diff
    /// between the commits cannot be computed or the scratch directory cannot
    /// be created. Everything else is recorded in `ctx` and the outcome.
    pub async fn run_pair(
        &self,
        ctx: &mut RunContext,
        pair: &PairKey,
    ) -> Result<PairOutcome, VfecError> {
        std::fs::create_dir_all(&self.scratch)?;
        let root = self.worktree.root().to_path_buf();

        let diff = vfec_gitpulse::diff_text(&root, &pair.vuln_commit, &pair.fix_commit)?;
        let mapped = HunkMapper::map(&diff);
        for skip in &mapped.skips {
            let err = VfecError::Parse(format!(
                "diff line {}: {} ({})",
                skip.line_number, skip.reason, skip.line
            ));
            ctx.fail(
                &pair.unit(Side::Fix, ALL_TESTS),
                UnitStage::CheckedOut,
                None,
                &err,
            );
        }
        let changed = mapped.changed_files();
        tracing::info!(
            project = %self.project,
            pair = %pair.label(),
            hunks = mapped.hunks.len(),
            files = changed.len(),
            "mapped commit pair"
        );

        let vuln = self.run_side(ctx, pair, Side::Vuln, &changed).await;
        let fix = self.run_side(ctx, pair, Side::Fix, &changed).await;

        let tests = self.join(pair, &mapped, &changed, &vuln, &fix);

        Ok(PairOutcome {
            pair: pair.clone(),
            changed_files: changed,
            hunks: mapped.hunks.len(),
            parse_skips: mapped.skips.clone(),
            tests,
            failures: ctx.take_failures(),
        })
    }

    /// Tests known before building: the explicit selection, else the
    /// profile's static list. Empty when tests must be listed after a build.
    fn planned_tests(&self) -> Vec<String> {
        if self.selected_tests.is_empty() {
            self.profile.tests.clone()
        } else {
            self.selected_tests.clone()
        }
    }

    fn adapter(&self, commit: &str) -> ProfileAdapter<'a> {
        ProfileAdapter::new(
            self.runner,
            self.project.clone(),
            self.profile.clone(),
            self.worktree.root(),
            &self.config.execution,
        )
        .at_commit(commit)
        .with_accumulators(Accumulators::from_config(&self.config.coverage))
    }

    fn mark(&self, ctx: &RunContext, key: &UnitKey, stage: UnitStage) {
        if let Err(e) = self.ledger.advance(key, stage) {
            tracing::warn!(unit = %key, stage = %stage, error = %e, "failed to update ledger");
        }
        ctx.advanced(key, stage);
    }

    fn store(&self, ctx: &RunContext, key: &UnitKey, stage: UnitStage, record: &UnitRecord) {
        if let Err(e) = self.ledger.store(key, stage, record) {
            tracing::warn!(unit = %key, stage = %stage, error = %e, "failed to store unit results");
        }
        ctx.advanced(key, stage);
    }

    /// Record `error` and move every unit in `keys` to `Failed`.
    fn fail_units(
        &self,
        ctx: &mut RunContext,
        keys: &[UnitKey],
        stage: UnitStage,
        kind: FailureKind,
        error: &VfecError,
    ) {
        for key in keys {
            ctx.fail(key, stage, Some(kind), error);
            self.mark(ctx, key, UnitStage::Failed);
        }
    }

    fn keys(pair: &PairKey, side: Side, tests: &[String]) -> Vec<UnitKey> {
        if tests.is_empty() {
            vec![pair.unit(side, ALL_TESTS)]
        } else {
            tests.iter().map(|t| pair.unit(side, t)).collect()
        }
    }

    /// Stored records of every terminal unit among `tests`.
    ///
    /// An aggregated unit whose results cannot be read back is left out and
    /// runs again.
    fn finished(&self, pair: &PairKey, side: Side, tests: &[String]) -> BTreeMap<String, UnitRecord> {
        let mut done = BTreeMap::new();
        for test in tests {
            let key = pair.unit(side, test);
            let stage = match self.ledger.stage(&key) {
                Ok(Some(stage)) if stage.is_terminal() => stage,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(unit = %key, error = %e, "failed to read ledger");
                    continue;
                }
            };
            match self.ledger.record(&key) {
                Ok(Some(record)) => {
                    done.insert(test.clone(), record);
                }
                // Build failures never stored anything.
                Ok(None) if stage == UnitStage::Failed => {
                    done.insert(test.clone(), UnitRecord::default());
                }
                Ok(None) => {
                    tracing::warn!(unit = %key, "finished unit has no stored results, running it again");
                }
                Err(e) => {
                    tracing::warn!(unit = %key, error = %e, "failed to read stored results, running it again");
                }
            }
        }
        done
    }

    async fn run_side(
        &self,
        ctx: &mut RunContext,
        pair: &PairKey,
        side: Side,
        changed: &[PathBuf],
    ) -> SideRun {
        let commit = pair.commit(side).to_string();
        let planned = self.planned_tests();

        let mut run = SideRun::default();
        let finished = self.finished(pair, side, &planned);
        if !planned.is_empty() && finished.len() == planned.len() {
            tracing::info!(project = %self.project, commit = %commit, side = %side, "all units finished, reusing results");
            for (test, record) in finished {
                if record.energy.is_some() {
                    run.relevant.insert(test.clone());
                }
                run.records.insert(test, record);
            }
            return run;
        }

        // Coverage phase.
        if let Err(e) = self.worktree.checkout(&commit).await {
            let keys = Self::keys(pair, side, &planned);
            self.fail_units(ctx, &keys, UnitStage::CheckedOut, FailureKind::Build, &e);
            return run;
        }
        let adapter = self.adapter(&commit);
        let built = async {
            adapter.configure(true).await?;
            adapter.build().await
        }
        .await;
        if let Err(e) = built {
            let keys = Self::keys(pair, side, &planned);
            self.fail_units(ctx, &keys, UnitStage::CheckedOut, FailureKind::Build, &e);
            return run;
        }

        let tests = match adapter.list_tests().await {
            Ok(listed) if self.selected_tests.is_empty() => listed,
            Ok(listed) => self
                .selected_tests
                .iter()
                .filter(|t| {
                    let known = listed.contains(t);
                    if !known {
                        tracing::warn!(project = %self.project, test = %t, "selected test not listed by project");
                    }
                    known
                })
                .cloned()
                .collect(),
            Err(e) => {
                let keys = Self::keys(pair, side, &planned);
                self.fail_units(ctx, &keys, UnitStage::Built, FailureKind::Build, &e);
                return run;
            }
        };

        let mut touched_by_test = BTreeMap::new();
        for test in &tests {
            let key = pair.unit(side, test);
            if let Some(record) = finished.get(test) {
                if record.energy.is_some() {
                    run.relevant.insert(test.clone());
                }
                run.records.insert(test.clone(), record.clone());
                continue;
            }
            self.mark(ctx, &key, UnitStage::CheckedOut);
            self.mark(ctx, &key, UnitStage::Built);

            match self.collect_coverage(ctx, &adapter, &key, side).await {
                Ok(record) => {
                    touched_by_test.insert(test.clone(), record.touched.clone());
                    self.store(ctx, &key, UnitStage::CoverageCollected, &record);
                    run.records.insert(test.clone(), record);
                }
                Err(e) => {
                    self.fail_units(ctx, &[key], UnitStage::Built, FailureKind::Environment, &e);
                }
            }
        }

        let selected: Vec<String> = if self.config.energy.only_relevant_tests {
            RelevanceFilter::from_config(&self.config.coverage).select(&touched_by_test, changed)
        } else {
            touched_by_test.keys().cloned().collect()
        };
        tracing::info!(
            project = %self.project,
            commit = %commit,
            side = %side,
            tests = tests.len(),
            relevant = selected.len(),
            "coverage phase done"
        );

        // Units not selected for energy are complete with coverage alone.
        for test in touched_by_test.keys() {
            if !selected.contains(test) {
                if let Some(record) = run.records.get(test) {
                    self.store(ctx, &pair.unit(side, test), UnitStage::Aggregated, record);
                }
            }
        }

        if !selected.is_empty() {
            self.measure_side(ctx, pair, side, &selected, &mut run).await;
        }
        run
    }

    /// Reset accumulators, run one test, and read back what it covered.
    async fn collect_coverage(
        &self,
        ctx: &mut RunContext,
        adapter: &dyn BuildAdapter,
        key: &UnitKey,
        side: Side,
    ) -> Result<UnitRecord, VfecError> {
        let accumulators = Accumulators::from_config(&self.config.coverage);
        accumulators.reset(&adapter.build_dir())?;

        let test_passed = match adapter.run_test(&key.test).await {
            Ok(_) => true,
            Err(e) => {
                ctx.fail(key, UnitStage::Built, None, &e);
                false
            }
        };

        let mut touched = adapter.extract_coverage_artifacts(&key.test);
        let report = self.scratch.join(format!(
            "{side}-{}-{}.info",
            short(&key.commit),
            file_safe(&key.test)
        ));
        // A stale report from an earlier run must never be read back.
        if report.exists() {
            std::fs::remove_file(&report)?;
        }
        adapter.capture_coverage(&key.test, &report).await?;

        let options = LcovOptions::from_config(&self.config.coverage).with_root(adapter.root());
        let coverage = CoverageIndex::from_file(&report, &options);
        // Accumulator names can differ from their sources (libtool's
        // `<lib>_la-<src>`); the report's SF records carry the real paths.
        touched.extend(coverage.covered_files());
        touched.sort();
        touched.dedup();
        tracing::debug!(
            unit = %key,
            passed = test_passed,
            touched = touched.len(),
            files = coverage.len(),
            "coverage collected"
        );

        Ok(UnitRecord {
            test_passed: Some(test_passed),
            touched,
            coverage: Some(coverage),
            energy: None,
        })
    }

    async fn measure_side(
        &self,
        ctx: &mut RunContext,
        pair: &PairKey,
        side: Side,
        selected: &[String],
        run: &mut SideRun,
    ) {
        let commit = pair.commit(side).to_string();
        let keys = Self::keys(pair, side, selected);

        if let Err(e) = self.worktree.checkout(&commit).await {
            self.fail_units(ctx, &keys, UnitStage::CoverageCollected, FailureKind::Build, &e);
            return;
        }
        let adapter = self.adapter(&commit);
        let built = async {
            adapter.configure(false).await?;
            adapter.build().await
        }
        .await;
        if let Err(e) = built {
            self.fail_units(ctx, &keys, UnitStage::CoverageCollected, FailureKind::Build, &e);
            return;
        }

        let mut meter = EnergyMeter::new(
            self.runner,
            &self.config.energy,
            self.scratch.join("perf-counters.csv"),
        );

        for key in keys {
            let mut record = run.records.remove(&key.test).unwrap_or_default();
            let stage = self.measure_unit(ctx, &adapter, &mut meter, &key, &mut record).await;
            self.store(ctx, &key, stage, &record);
            if record.energy.is_some() {
                run.relevant.insert(key.test.clone());
            }
            run.records.insert(key.test.clone(), record);
        }
    }

    /// Calibrate and sample one unit, returning the stage it ends in.
    async fn measure_unit(
        &self,
        ctx: &mut RunContext,
        adapter: &dyn BuildAdapter,
        meter: &mut EnergyMeter<'_>,
        key: &UnitKey,
        record: &mut UnitRecord,
    ) -> UnitStage {
        let cmd = match adapter.test_command(&key.test) {
            Ok(cmd) => cmd,
            Err(e) => {
                ctx.fail(key, UnitStage::CoverageCollected, None, &e);
                return UnitStage::Failed;
            }
        };

        let calibration = match meter.calibrate(&cmd).await {
            Ok(c) => c,
            Err(e) => {
                ctx.fail(key, UnitStage::CoverageCollected, Some(FailureKind::Calibration), &e);
                return UnitStage::Failed;
            }
        };
        self.mark(ctx, key, UnitStage::EnergyCalibrated);

        let report = meter.sample(&cmd, &calibration).await.with_key(key.clone());
        self.mark(ctx, key, UnitStage::EnergyMeasured);

        for failure in &report.failures {
            ctx.fail(
                key,
                UnitStage::EnergyMeasured,
                None,
                &VfecError::Measurement(failure.clone()),
            );
        }

        let stage = if report.is_empty() {
            ctx.fail(
                key,
                UnitStage::EnergyMeasured,
                None,
                &VfecError::Measurement("no repetition succeeded".into()),
            );
            UnitStage::Failed
        } else {
            UnitStage::Aggregated
        };
        record.energy = Some(report);
        stage
    }

    fn join(
        &self,
        pair: &PairKey,
        mapped: &MappedDiff,
        changed: &[PathBuf],
        vuln: &SideRun,
        fix: &SideRun,
    ) -> Vec<TestOutcome> {
        let root = self.worktree.root();
        let snippets = |commit: &str| match GitSnippets::load(root, commit, changed) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(commit, error = %e, "snippets unavailable");
                None
            }
        };
        let vuln_src = snippets(&pair.vuln_commit);
        let fix_src = snippets(&pair.fix_commit);

        let empty = CoverageIndex::new();
        let tests: BTreeSet<&String> = vuln.records.keys().chain(fix.records.keys()).collect();

        tests
            .into_iter()
            .map(|test| {
                let v = vuln.records.get(test);
                let f = fix.records.get(test);
                let vuln_idx = v.and_then(|r| r.coverage.as_ref()).unwrap_or(&empty);
                let fix_idx = f.and_then(|r| r.coverage.as_ref()).unwrap_or(&empty);

                let mut joiner = DiffCoverageJoiner::new(vuln_idx, fix_idx);
                if let (Some(vs), Some(fs)) = (&vuln_src, &fix_src) {
                    joiner = joiner.with_sources(vs, fs);
                }
                let coverage = joiner
                    .join(&mapped.correspondences)
                    .with_key(pair.clone(), Some(test.clone()));

                TestOutcome {
                    test: test.clone(),
                    relevant: vuln.relevant.contains(test) || fix.relevant.contains(test),
                    coverage,
                    vuln_energy: v.and_then(|r| r.energy.clone()),
                    fix_energy: f.and_then(|r| r.energy.clone()),
                }
            })
            .collect()
    }
}

fn short(commit: &str) -> &str {
    &commit[..commit.len().min(12)]
}

fn file_safe(test: &str) -> String {
    test.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_safe_replaces_separators() {
        assert_eq!(file_safe("test/x509 v3"), "test_x509_v3");
        assert_eq!(file_safe("unit-1300_a"), "unit-1300_a");
    }

    #[test]
    fn short_truncates_hashes() {
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
    }

    #[test]
    fn unit_keys_fall_back_to_whole_side() {
        let pair = PairKey::new("curl", "aaaa", "bbbb");
        let keys = Pipeline::keys(&pair, Side::Vuln, &[]);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].test, ALL_TESTS);
        assert_eq!(keys[0].commit, "aaaa");

        let keys = Pipeline::keys(&pair, Side::Fix, &["1".into(), "2".into()]);
        assert_eq!(keys.iter().map(|k| k.test.as_str()).collect::<Vec<_>>(), ["1", "2"]);
        assert!(keys.iter().all(|k| k.commit == "bbbb"));
    }
}
