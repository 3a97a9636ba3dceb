//! Commit resolution and zero-context diffs via git2.

use std::path::{Path, PathBuf};

use git2::{Commit, Diff, DiffFormat, DiffOptions, Repository};
use vfec_core::VfecError;

fn open(repo_path: &Path) -> Result<Repository, VfecError> {
    Repository::open(repo_path)
        .map_err(|e| VfecError::Git(format!("failed to open repository: {e}")))
}

fn find_commit<'r>(repo: &'r Repository, spec: &str) -> Result<Commit<'r>, VfecError> {
    repo.revparse_single(spec)
        .and_then(|obj| obj.peel_to_commit())
        .map_err(|e| VfecError::Git(format!("failed to resolve '{spec}': {e}")))
}

/// Full hash of the commit named by `spec` (hash prefix, branch, tag, `HEAD~1`).
///
/// # Errors
///
/// Returns [`VfecError::Git`] if the repository cannot be opened or `spec`
/// does not name a commit.
pub fn resolve_commit(repo_path: &Path, spec: &str) -> Result<String, VfecError> {
    let repo = open(repo_path)?;
    let commit = find_commit(&repo, spec)?;
    Ok(commit.id().to_string())
}

/// Full hash of the first parent of `spec`.
///
/// This is the default vulnerable commit for a fix commit.
///
/// # Errors
///
/// Returns [`VfecError::Git`] if `spec` cannot be resolved or is a root commit.
pub fn parent_of(repo_path: &Path, spec: &str) -> Result<String, VfecError> {
    let repo = open(repo_path)?;
    let commit = find_commit(&repo, spec)?;
    let parent = commit
        .parent(0)
        .map_err(|e| VfecError::Git(format!("commit {spec} has no parent: {e}")))?;
    Ok(parent.id().to_string())
}

fn tree_diff<'r>(
    repo: &'r Repository,
    vuln: &str,
    fix: &str,
) -> Result<Diff<'r>, VfecError> {
    let old_tree = find_commit(repo, vuln)?
        .tree()
        .map_err(|e| VfecError::Git(format!("failed to get tree of {vuln}: {e}")))?;
    let new_tree = find_commit(repo, fix)?
        .tree()
        .map_err(|e| VfecError::Git(format!("failed to get tree of {fix}: {e}")))?;

    let mut opts = DiffOptions::new();
    opts.context_lines(0);
    repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))
        .map_err(|e| VfecError::Git(format!("failed to compute diff: {e}")))
}

/// Unified diff from `vuln` to `fix` with zero context lines.
///
/// The text has the same shape as `git diff -U0 vuln fix` and is the input
/// the hunk mapper expects.
///
/// # Errors
///
/// Returns [`VfecError::Git`] if either commit cannot be resolved or the
/// diff cannot be printed.
pub fn diff_text(repo_path: &Path, vuln: &str, fix: &str) -> Result<String, VfecError> {
    let repo = open(repo_path)?;
    let diff = tree_diff(&repo, vuln, fix)?;

    let mut out = String::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        let origin = line.origin();
        match origin {
            '+' | '-' | ' ' => out.push(origin),
            // End-of-file newline markers carry no line of their own.
            '=' | '>' | '<' => return true,
            _ => {}
        }
        out.push_str(&String::from_utf8_lossy(line.content()));
        if !out.ends_with('\n') {
            out.push('\n');
        }
        true
    })
    .map_err(|e| VfecError::Git(format!("failed to print diff: {e}")))?;

    tracing::debug!(vuln, fix, bytes = out.len(), "computed zero-context diff");
    Ok(out)
}

/// Files that differ between `vuln` and `fix`, in diff order.
///
/// Deleted files are reported by their old path.
///
/// # Errors
///
/// Returns [`VfecError::Git`] if either commit cannot be resolved.
pub fn changed_files(repo_path: &Path, vuln: &str, fix: &str) -> Result<Vec<PathBuf>, VfecError> {
    let repo = open(repo_path)?;
    let diff = tree_diff(&repo, vuln, fix)?;

    Ok(diff
        .deltas()
        .filter_map(|delta| {
            delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(Path::to_path_buf)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_repository_is_git_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_commit(dir.path(), "HEAD").unwrap_err();
        assert!(matches!(err, VfecError::Git(ref m) if m.contains("open repository")));
    }
}
