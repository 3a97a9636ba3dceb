//! External process execution.
//!
//! Commands are described as argument vectors with a declarative environment
//! map and run through a [`CommandRunner`]. The production runner spawns real
//! processes with `tokio`; tests substitute a [`ScriptedRunner`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::VfecError;

/// An argument-vector command with its environment and limits.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vfec_core::exec::CommandSpec;
///
/// let spec = CommandSpec::new("make")
///     .arg("-j4")
///     .env("CFLAGS", "-O2")
///     .timeout(Duration::from_secs(60));
/// assert_eq!(spec.to_string(), "make -j4");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            timeout: None,
        }
    }

    /// Build a spec from a full argument vector (program first).
    ///
    /// # Errors
    ///
    /// Returns [`VfecError::Config`] if `argv` is empty.
    pub fn from_argv(argv: &[String]) -> Result<Self, VfecError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| VfecError::Config("empty command".into()))?;
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Program followed by arguments.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time from spawn to exit.
    pub elapsed: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Human-readable exit status, e.g. `exit code 2` or `killed by signal`.
    pub fn status_label(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "killed by signal".into(),
        }
    }

    /// Last `n` lines of stderr, falling back to stdout when stderr is empty.
    pub fn tail(&self, n: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Runs commands on behalf of the build, coverage, and energy phases.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion and capture its output.
    ///
    /// A nonzero exit is not an error; callers inspect
    /// [`ExecOutput::success`]. Errors are reserved for spawn failures and
    /// timeouts.
    async fn run(&self, spec: &CommandSpec) -> Result<ExecOutput, VfecError>;
}

/// Spawns real processes with piped output.
///
/// Each child leads its own process group. On timeout the whole group is
/// killed, so shells and test drivers cannot leave workers behind, and
/// [`VfecError::Timeout`] is returned.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecOutput, VfecError> {
        let start = Instant::now();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        tracing::debug!(command = %spec, cwd = ?spec.cwd, "spawning");
        let child = command.spawn().map_err(|e| {
            VfecError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to spawn {}: {e}", spec.program),
            ))
        })?;
        let pid = child.id();

        let output = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    kill_process_group(pid);
                    tracing::warn!(command = %spec, ?limit, "timed out, process group killed");
                    return Err(VfecError::Timeout {
                        program: spec.program.clone(),
                        limit,
                    });
                }
            },
            None => child.wait_with_output().await?,
        };

        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: start.elapsed(),
        })
    }
}

/// Sends SIGKILL to the group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

type Handler = dyn Fn(&CommandSpec) -> Result<ExecOutput, VfecError> + Send + Sync;

/// A [`CommandRunner`] that answers from a closure and records every call.
///
/// Useful wherever real builds or hardware counters are unavailable.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vfec_core::exec::{CommandRunner, CommandSpec, ExecOutput, ScriptedRunner};
///
/// # tokio_test_block(async {
/// let runner = ScriptedRunner::new(|_spec| {
///     Ok(ExecOutput { exit_code: Some(0), elapsed: Duration::from_millis(5), ..Default::default() })
/// });
/// let out = runner.run(&CommandSpec::new("true")).await.unwrap();
/// assert!(out.success());
/// assert_eq!(runner.calls().len(), 1);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone)]
pub struct ScriptedRunner {
    handler: Arc<Handler>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

impl ScriptedRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<ExecOutput, VfecError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every spec passed to [`CommandRunner::run`], in call order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

impl fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("calls", &self.calls().len())
            .finish()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecOutput, VfecError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.clone());
        }
        (self.handler)(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_argv_splits_program() {
        let argv = vec!["make".to_string(), "test".to_string(), "TESTS=1".to_string()];
        let spec = CommandSpec::from_argv(&argv).unwrap();
        assert_eq!(spec.program, "make");
        assert_eq!(spec.args, vec!["test", "TESTS=1"]);
        assert_eq!(spec.argv(), argv);
    }

    #[test]
    fn from_argv_rejects_empty() {
        assert!(matches!(
            CommandSpec::from_argv(&[]),
            Err(VfecError::Config(_))
        ));
    }

    #[test]
    fn tail_prefers_stderr() {
        let out = ExecOutput {
            exit_code: Some(2),
            stdout: "a\nb".into(),
            stderr: "e1\ne2\ne3".into(),
            elapsed: Duration::ZERO,
        };
        assert_eq!(out.tail(2), "e2\ne3");
        assert_eq!(out.status_label(), "exit code 2");

        let quiet = ExecOutput {
            stdout: "only\nstdout".into(),
            ..Default::default()
        };
        assert_eq!(quiet.tail(5), "only\nstdout");
        assert_eq!(quiet.status_label(), "killed by signal");
        assert!(!quiet.success());
    }

    #[tokio::test]
    async fn process_runner_captures_output() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo \"$GREETING\"; exit 3"])
            .env("GREETING", "hello");
        let out = ProcessRunner.run(&spec).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn process_runner_honours_cwd() {
        let dir = std::env::temp_dir();
        let spec = CommandSpec::new("pwd").cwd(&dir);
        let out = ProcessRunner.run(&spec).await.unwrap();
        assert!(out.success());
        let reported = PathBuf::from(out.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn process_runner_times_out() {
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));
        let start = Instant::now();
        let err = ProcessRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, VfecError::Timeout { ref program, .. } if program == "sleep"));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sh -c 'sleep 1; touch {}'; true", marker.display());
        let spec = CommandSpec::new("sh")
            .args(["-c", script.as_str()])
            .timeout(Duration::from_millis(300));

        let err = ProcessRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, VfecError::Timeout { limit, .. } if limit == Duration::from_millis(300)));
        assert!(err.to_string().ends_with("300ms"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "grandchild outlived the timeout");
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let spec = CommandSpec::new("vfec-definitely-not-a-program");
        let err = ProcessRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, VfecError::Io(_)));
    }

    #[tokio::test]
    async fn scripted_runner_records_calls() {
        let runner = ScriptedRunner::new(|spec| {
            Ok(ExecOutput {
                exit_code: Some(if spec.program == "false" { 1 } else { 0 }),
                ..Default::default()
            })
        });
        assert!(runner.run(&CommandSpec::new("true")).await.unwrap().success());
        assert!(!runner.run(&CommandSpec::new("false")).await.unwrap().success());
        let programs: Vec<String> = runner.calls().into_iter().map(|c| c.program).collect();
        assert_eq!(programs, vec!["true", "false"]);
    }
}
