use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use vfec_core::exec::{CommandRunner, CommandSpec};
use vfec_core::VfecError;

/// The shared working tree one project is built in.
///
/// Only one commit can be materialized at a time; callers must never
/// process two commits of the same tree concurrently.
#[async_trait]
pub trait WorkTree: Send + Sync {
    fn root(&self) -> &Path;

    /// Discard local state and materialize `commit`.
    async fn checkout(&self, commit: &str) -> Result<(), VfecError>;
}

/// [`WorkTree`] backed by the `git` CLI: `clean -fdx`, then `checkout -f`.
///
/// Paths registered with [`GitWorkTree::preserve`] survive the clean.
pub struct GitWorkTree<'r> {
    runner: &'r dyn CommandRunner,
    root: PathBuf,
    timeout: Duration,
    preserved: Vec<String>,
}

impl<'r> GitWorkTree<'r> {
    pub fn new(runner: &'r dyn CommandRunner, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            root: root.into(),
            timeout: Duration::from_secs(300),
            preserved: Vec::new(),
        }
    }

    /// Keep `path` (relative to the root) across checkouts.
    pub fn preserve(mut self, path: impl AsRef<Path>) -> Self {
        let pattern = path.as_ref().to_string_lossy().trim_end_matches('/').to_string();
        if !pattern.is_empty() {
            self.preserved.push(format!("/{pattern}"));
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn git(&self, args: &[&str]) -> Result<(), VfecError> {
        let spec = CommandSpec::new("git")
            .args(args.iter().map(|a| a.to_string()))
            .cwd(&self.root)
            .timeout(self.timeout);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| VfecError::Git(format!("`{spec}` failed: {e}")))?;
        if !output.success() {
            return Err(VfecError::Git(format!(
                "`{spec}` ended with {}: {}",
                output.status_label(),
                output.tail(5)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkTree for GitWorkTree<'_> {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn checkout(&self, commit: &str) -> Result<(), VfecError> {
        let mut clean = vec!["clean", "-fdx", "--quiet"];
        for pattern in &self.preserved {
            clean.extend(["-e", pattern.as_str()]);
        }
        self.git(&clean).await?;
        self.git(&["checkout", "-f", "--quiet", commit]).await?;
        tracing::info!(root = %self.root.display(), commit, "checked out");
        Ok(())
    }
}
