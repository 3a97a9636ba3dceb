//! Build capability interface and the profile-driven implementation.
//!
//! Every supported project is described by a [`ProjectProfile`]; there is one
//! adapter type, and per-project differences are data, not subclasses.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use vfec_core::exec::{CommandRunner, CommandSpec, ExecOutput};
use vfec_core::{BuildSystem, ExecutionConfig, ProjectProfile, VfecError};
use vfec_coverage::accumulator::Accumulators;

/// What the pipeline needs from a project's build system.
#[async_trait]
pub trait BuildAdapter: Send + Sync {
    /// Working tree the adapter builds in.
    fn root(&self) -> &Path;

    /// Where build outputs, and with them coverage accumulators, land.
    fn build_dir(&self) -> PathBuf;

    /// Prepare the tree, instrumented for coverage or optimized for timing.
    async fn configure(&self, coverage: bool) -> Result<(), VfecError>;

    async fn build(&self) -> Result<(), VfecError>;

    async fn list_tests(&self) -> Result<Vec<String>, VfecError>;

    /// Command that runs one test; also the command energy is sampled for.
    fn test_command(&self, test: &str) -> Result<CommandSpec, VfecError>;

    /// Run one test.
    ///
    /// Returns [`VfecError::TestExecution`] on a non-zero exit; coverage
    /// artifacts may still have been written.
    async fn run_test(&self, test: &str) -> Result<ExecOutput, VfecError>;

    /// Write an LCOV report of the current accumulators to `output`.
    async fn capture_coverage(&self, test: &str, output: &Path) -> Result<(), VfecError>;

    /// Source files whose accumulators exist after the last test run.
    fn extract_coverage_artifacts(&self, test: &str) -> Vec<PathBuf>;
}

/// Replace `{name}` placeholders inside one argument.
///
/// # Examples
///
/// ```
/// use vfec_pipeline::adapter::expand;
///
/// let arg = expand("TESTS={test}", &[("test", "1300")]);
/// assert_eq!(arg, "TESTS=1300");
/// ```
pub fn expand(arg: &str, vars: &[(&str, &str)]) -> String {
    let mut out = arg.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

/// Test names from `ctest -N` output (`  Test  #3: unit1300`).
pub fn parse_ctest_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|l| l.contains("Test") && l.contains('#'))
        .filter_map(|l| l.split_once(':').map(|(_, name)| name.trim().to_string()))
        .filter(|name| !name.is_empty())
        .collect()
}

fn parse_plain_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// [`BuildAdapter`] driven by a [`ProjectProfile`].
///
/// Commands run through the shared [`CommandRunner`], so tests can script
/// the whole build without a compiler.
pub struct ProfileAdapter<'r> {
    runner: &'r dyn CommandRunner,
    project: String,
    commit: String,
    profile: ProjectProfile,
    root: PathBuf,
    jobs: usize,
    build_timeout: Duration,
    test_timeout: Duration,
    accumulators: Accumulators,
    coverage: AtomicBool,
}

impl<'r> ProfileAdapter<'r> {
    pub fn new(
        runner: &'r dyn CommandRunner,
        project: impl Into<String>,
        profile: ProjectProfile,
        root: impl Into<PathBuf>,
        execution: &ExecutionConfig,
    ) -> Self {
        Self {
            runner,
            project: project.into(),
            commit: "worktree".into(),
            profile,
            root: root.into(),
            jobs: execution.jobs(),
            build_timeout: Duration::from_secs(execution.build_timeout_secs),
            test_timeout: Duration::from_secs(execution.test_timeout_secs),
            accumulators: Accumulators::default(),
            coverage: AtomicBool::new(false),
        }
    }

    /// Commit the tree is checked out at, for error reports.
    pub fn at_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = commit.into();
        self
    }

    pub fn with_accumulators(mut self, accumulators: Accumulators) -> Self {
        self.accumulators = accumulators;
        self
    }

    fn test_dir(&self) -> PathBuf {
        match (&self.profile.test_dir, self.profile.build_system) {
            (Some(dir), _) => self.root.join(dir),
            (None, BuildSystem::Cmake) => self.build_dir(),
            (None, _) => self.root.clone(),
        }
    }

    fn flags(&self) -> (String, String) {
        if self.coverage.load(Ordering::SeqCst) {
            (
                self.profile.coverage_cflags.clone(),
                self.profile.coverage_ldflags.clone(),
            )
        } else {
            (self.profile.release_cflags.clone(), String::new())
        }
    }

    /// Expand a template into a command running in `cwd` with the profile env.
    fn command(
        &self,
        template: &[String],
        extra: &[(&str, &str)],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandSpec, VfecError> {
        let (cflags, ldflags) = self.flags();
        let jobs = self.jobs.to_string();
        let mut vars = vec![
            ("jobs", jobs.as_str()),
            ("cflags", cflags.as_str()),
            ("ldflags", ldflags.as_str()),
        ];
        vars.extend_from_slice(extra);

        let argv: Vec<String> = template.iter().map(|a| expand(a, &vars)).collect();
        Ok(CommandSpec::from_argv(&argv)?
            .envs(self.profile.env.clone())
            .cwd(cwd)
            .timeout(timeout))
    }

    fn bootstrap_template(&self) -> Option<Vec<String>> {
        if let Some(cmd) = &self.profile.bootstrap {
            return Some(cmd.clone());
        }
        let needs_autoreconf = self.profile.build_system == BuildSystem::Autotools
            && !self.root.join("configure").exists()
            && self.root.join("configure.ac").exists();
        needs_autoreconf.then(|| argv(&["autoreconf", "-fi"]))
    }

    fn configure_template(&self) -> Option<Vec<String>> {
        if let Some(cmd) = &self.profile.configure {
            return Some(cmd.clone());
        }
        match self.profile.build_system {
            BuildSystem::Autotools => Some(argv(&["./configure"])),
            BuildSystem::Cmake => {
                let build_dir = self.build_dir().to_string_lossy().into_owned();
                Some(argv(&[
                    "cmake",
                    "-S",
                    ".",
                    "-B",
                    &build_dir,
                    "-DCMAKE_BUILD_TYPE=Debug",
                    "-DCMAKE_C_FLAGS={cflags}",
                    "-DCMAKE_CXX_FLAGS={cflags}",
                    "-DCMAKE_EXE_LINKER_FLAGS={ldflags}",
                    "-DCMAKE_SHARED_LINKER_FLAGS={ldflags}",
                ]))
            }
            BuildSystem::Make | BuildSystem::Custom => None,
        }
    }

    fn build_template(&self) -> Result<Vec<String>, VfecError> {
        if let Some(cmd) = &self.profile.build {
            return Ok(cmd.clone());
        }
        match self.profile.build_system {
            BuildSystem::Autotools => Ok(argv(&["make", "-j{jobs}"])),
            BuildSystem::Cmake => {
                let build_dir = self.build_dir().to_string_lossy().into_owned();
                Ok(argv(&["cmake", "--build", &build_dir, "--parallel", "{jobs}"]))
            }
            BuildSystem::Make => Ok(argv(&[
                "make",
                "-j{jobs}",
                "CFLAGS={cflags}",
                "LDFLAGS={ldflags}",
            ])),
            BuildSystem::Custom => Err(VfecError::Config(format!(
                "project {} uses a custom build system but has no build command",
                self.project
            ))),
        }
    }

    fn test_template(&self) -> Result<Vec<String>, VfecError> {
        if !self.profile.test.is_empty() {
            return Ok(self.profile.test.clone());
        }
        match self.profile.build_system {
            BuildSystem::Autotools => Ok(argv(&["make", "check", "TESTS={test}"])),
            BuildSystem::Cmake => Ok(argv(&["ctest", "-R", "^{test}$", "--output-on-failure"])),
            BuildSystem::Make => Ok(argv(&["make", "{test}"])),
            BuildSystem::Custom => Err(VfecError::Config(format!(
                "project {} uses a custom build system but has no test command",
                self.project
            ))),
        }
    }

    /// Run a configure or build step, mapping any failure to a build error.
    async fn build_step(&self, step: &str, spec: CommandSpec) -> Result<(), VfecError> {
        tracing::info!(project = %self.project, commit = %self.commit, step, command = %spec, "running build step");
        let output = self.runner.run(&spec).await.map_err(|e| VfecError::Build {
            project: self.project.clone(),
            commit: self.commit.clone(),
            detail: format!("{step} `{spec}`: {e}"),
        })?;

        if !output.success() {
            return Err(VfecError::Build {
                project: self.project.clone(),
                commit: self.commit.clone(),
                detail: format!(
                    "{step} `{spec}` ended with {}: {}",
                    output.status_label(),
                    output.tail(10)
                ),
            });
        }
        Ok(())
    }
}

fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl BuildAdapter for ProfileAdapter<'_> {
    fn root(&self) -> &Path {
        &self.root
    }

    /// Only CMake builds out of tree by default.
    fn build_dir(&self) -> PathBuf {
        match (&self.profile.build_dir, self.profile.build_system) {
            (Some(dir), _) => self.root.join(dir),
            (None, BuildSystem::Cmake) => self.root.join("build_vfec"),
            (None, _) => self.root.clone(),
        }
    }

    async fn configure(&self, coverage: bool) -> Result<(), VfecError> {
        self.coverage.store(coverage, Ordering::SeqCst);

        if let Some(template) = self.bootstrap_template() {
            let spec = self.command(&template, &[], &self.root, self.build_timeout)?;
            self.build_step("bootstrap", spec).await?;
        }

        let Some(template) = self.configure_template() else {
            tracing::debug!(project = %self.project, "no configure step");
            return Ok(());
        };
        let (cflags, ldflags) = self.flags();
        let mut spec = self.command(&template, &[], &self.root, self.build_timeout)?;
        if self.profile.build_system == BuildSystem::Autotools {
            spec = spec.env("CFLAGS", cflags).env("LDFLAGS", ldflags);
        }
        self.build_step("configure", spec).await
    }

    async fn build(&self) -> Result<(), VfecError> {
        let template = self.build_template()?;
        let spec = self.command(&template, &[], &self.root, self.build_timeout)?;
        self.build_step("build", spec).await
    }

    async fn list_tests(&self) -> Result<Vec<String>, VfecError> {
        if let Some(template) = &self.profile.list_tests {
            let spec = self.command(template, &[], &self.test_dir(), self.test_timeout)?;
            let output = self.runner.run(&spec).await?;
            if !output.success() {
                return Err(VfecError::Build {
                    project: self.project.clone(),
                    commit: self.commit.clone(),
                    detail: format!("listing tests with `{spec}` ended with {}", output.status_label()),
                });
            }
            return Ok(parse_plain_listing(&output.stdout));
        }

        if !self.profile.tests.is_empty() {
            return Ok(self.profile.tests.clone());
        }

        if self.profile.build_system == BuildSystem::Cmake {
            let spec = CommandSpec::new("ctest")
                .arg("-N")
                .envs(self.profile.env.clone())
                .cwd(self.build_dir())
                .timeout(self.test_timeout);
            let output = self.runner.run(&spec).await?;
            return Ok(parse_ctest_listing(&output.stdout));
        }

        Err(VfecError::Config(format!(
            "project {} has neither a test list nor a list_tests command",
            self.project
        )))
    }

    fn test_command(&self, test: &str) -> Result<CommandSpec, VfecError> {
        let template = self.test_template()?;
        self.command(&template, &[("test", test)], &self.test_dir(), self.test_timeout)
    }

    async fn run_test(&self, test: &str) -> Result<ExecOutput, VfecError> {
        let spec = self.test_command(test)?;
        tracing::debug!(project = %self.project, commit = %self.commit, test, command = %spec, "running test");
        let output = self.runner.run(&spec).await.map_err(|e| VfecError::TestExecution {
            test: test.to_string(),
            detail: e.to_string(),
        })?;
        if !output.success() {
            return Err(VfecError::TestExecution {
                test: test.to_string(),
                detail: format!("{}: {}", output.status_label(), output.tail(5)),
            });
        }
        Ok(output)
    }

    async fn capture_coverage(&self, test: &str, output: &Path) -> Result<(), VfecError> {
        let out = output.to_string_lossy().into_owned();
        let template = match &self.profile.coverage_capture {
            Some(cmd) => cmd.clone(),
            None => argv(&[
                "lcov",
                "--capture",
                "--directory",
                ".",
                "--output-file",
                "{output}",
                "--ignore-errors",
                "gcov",
            ]),
        };
        let spec = self.command(
            &template,
            &[("output", &out), ("test", test)],
            &self.build_dir(),
            self.build_timeout,
        )?;
        let result = self.runner.run(&spec).await?;
        if !result.success() {
            tracing::warn!(
                project = %self.project,
                test,
                status = %result.status_label(),
                "coverage capture failed"
            );
        }
        Ok(())
    }

    fn extract_coverage_artifacts(&self, test: &str) -> Vec<PathBuf> {
        let sources = self.accumulators.touched_sources(&self.build_dir());
        if sources.is_empty() {
            tracing::info!(project = %self.project, commit = %self.commit, test, "test left no coverage artifacts");
        }
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfec_core::exec::ScriptedRunner;

    fn ok_runner() -> ScriptedRunner {
        ScriptedRunner::new(|_| {
            Ok(ExecOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        })
    }

    fn execution() -> ExecutionConfig {
        ExecutionConfig {
            jobs: Some(4),
            ..ExecutionConfig::default()
        }
    }

    #[test]
    fn expand_replaces_every_occurrence() {
        assert_eq!(
            expand("{test}-{test}:{jobs}", &[("test", "a"), ("jobs", "2")]),
            "a-a:2"
        );
        assert_eq!(expand("{unknown}", &[("test", "a")]), "{unknown}");
    }

    #[test]
    fn ctest_listing_extracts_names() {
        let out = "Test project /src/build\n  Test  #1: test_x509\n  Test #12: unit1300\n\nTotal Tests: 2\n";
        assert_eq!(parse_ctest_listing(out), vec!["test_x509", "unit1300"]);
    }

    #[tokio::test]
    async fn autotools_configure_passes_flags_through_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("configure"), "").unwrap();
        let runner = ok_runner();
        let adapter = ProfileAdapter::new(&runner, "curl", ProjectProfile::default(), dir.path(), &execution());

        adapter.configure(true).await.unwrap();
        adapter.build().await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].program, "./configure");
        assert_eq!(calls[0].env["CFLAGS"], "-fprofile-arcs -ftest-coverage -g -O0");
        assert_eq!(calls[1].argv(), vec!["make", "-j4"]);
        assert_eq!(calls[1].timeout, Some(Duration::from_secs(1200)));

        adapter.configure(false).await.unwrap();
        assert_eq!(runner.calls()[2].env["CFLAGS"], "-O2");
    }

    #[tokio::test]
    async fn autotools_without_configure_script_bootstraps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("configure.ac"), "").unwrap();
        let runner = ok_runner();
        let adapter = ProfileAdapter::new(&runner, "curl", ProjectProfile::default(), dir.path(), &execution());
        adapter.configure(true).await.unwrap();
        assert_eq!(runner.calls()[0].argv(), vec!["autoreconf", "-fi"]);
    }

    #[tokio::test]
    async fn cmake_preset_builds_out_of_tree() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(|spec| {
            let stdout = if spec.program == "ctest" {
                "  Test #1: test_x509\n  Test #2: test_asn1\n".to_string()
            } else {
                String::new()
            };
            Ok(ExecOutput {
                exit_code: Some(0),
                stdout,
                ..Default::default()
            })
        });
        let profile = ProjectProfile {
            build_system: BuildSystem::Cmake,
            ..ProjectProfile::default()
        };
        let adapter = ProfileAdapter::new(&runner, "openssl", profile, dir.path(), &execution());

        adapter.configure(true).await.unwrap();
        let configure = &runner.calls()[0];
        assert_eq!(configure.program, "cmake");
        assert!(configure
            .args
            .contains(&"-DCMAKE_C_FLAGS=-fprofile-arcs -ftest-coverage -g -O0".to_string()));

        let tests = adapter.list_tests().await.unwrap();
        assert_eq!(tests, vec!["test_x509", "test_asn1"]);

        let cmd = adapter.test_command("test_x509").unwrap();
        assert_eq!(cmd.argv(), vec!["ctest", "-R", "^test_x509$", "--output-on-failure"]);
        assert_eq!(cmd.cwd, Some(dir.path().join("build_vfec")));
    }

    #[tokio::test]
    async fn failing_build_names_project_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(|_| {
            Ok(ExecOutput {
                exit_code: Some(2),
                stderr: "url.c:10: error: expected ';'".into(),
                ..Default::default()
            })
        });
        let adapter = ProfileAdapter::new(&runner, "curl", ProjectProfile::default(), dir.path(), &execution())
            .at_commit("da0db499");
        let err = adapter.build().await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("curl@da0db499"), "{msg}");
        assert!(msg.contains("expected ';'"));
    }

    #[tokio::test]
    async fn custom_profile_requires_commands() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ok_runner();
        let profile = ProjectProfile {
            build_system: BuildSystem::Custom,
            ..ProjectProfile::default()
        };
        let adapter = ProfileAdapter::new(&runner, "x", profile, dir.path(), &execution());
        adapter.configure(true).await.unwrap();
        assert!(matches!(adapter.build().await, Err(VfecError::Config(_))));
        assert!(matches!(adapter.test_command("t"), Err(VfecError::Config(_))));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_template_and_listing_from_profile() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(|_| {
            Ok(ExecOutput {
                exit_code: Some(0),
                stdout: "1\n\n2\n 3 \n".into(),
                ..Default::default()
            })
        });
        let mut profile = ProjectProfile {
            test: vec!["./runtests.pl".into(), "{test}".into()],
            test_dir: Some(PathBuf::from("tests")),
            list_tests: Some(vec!["./list.sh".into()]),
            ..ProjectProfile::default()
        };
        profile.env.insert("NO_INTERACTION".into(), "1".into());
        let adapter = ProfileAdapter::new(&runner, "curl", profile, dir.path(), &execution());

        assert_eq!(adapter.list_tests().await.unwrap(), vec!["1", "2", "3"]);
        let cmd = adapter.test_command("1300").unwrap();
        assert_eq!(cmd.argv(), vec!["./runtests.pl", "1300"]);
        assert_eq!(cmd.cwd, Some(dir.path().join("tests")));
        assert_eq!(cmd.env["NO_INTERACTION"], "1");
        assert_eq!(cmd.timeout, Some(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn failing_test_is_test_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(|_| {
            Ok(ExecOutput {
                exit_code: Some(1),
                stdout: "FAILED 1300".into(),
                ..Default::default()
            })
        });
        let profile = ProjectProfile {
            tests: vec!["1300".into()],
            ..ProjectProfile::default()
        };
        let adapter = ProfileAdapter::new(&runner, "curl", profile, dir.path(), &execution());
        let err = adapter.run_test("1300").await.unwrap_err();
        assert!(matches!(err, VfecError::TestExecution { ref test, .. } if test == "1300"));
    }

    #[tokio::test]
    async fn coverage_capture_expands_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ok_runner();
        let adapter = ProfileAdapter::new(&runner, "curl", ProjectProfile::default(), dir.path(), &execution());
        adapter
            .capture_coverage("1", Path::new("/tmp/out/vuln-1.info"))
            .await
            .unwrap();
        let call = &runner.calls()[0];
        assert_eq!(call.program, "lcov");
        assert!(call.args.contains(&"/tmp/out/vuln-1.info".to_string()));
    }
}
