use std::collections::HashMap;
use std::path::{Path, PathBuf};

use git2::Repository;
use vfec_core::{SourceLookup, VfecError};

/// Contents of `file` as of commit `spec`, or `None` if the file does not
/// exist in that commit.
///
/// # Errors
///
/// Returns [`VfecError::Git`] if the repository or commit cannot be read.
pub fn file_at_commit(
    repo_path: &Path,
    spec: &str,
    file: &Path,
) -> Result<Option<String>, VfecError> {
    let repo = Repository::open(repo_path)
        .map_err(|e| VfecError::Git(format!("failed to open repository: {e}")))?;
    read_blob(&repo, spec, file)
}

fn read_blob(repo: &Repository, spec: &str, file: &Path) -> Result<Option<String>, VfecError> {
    let tree = repo
        .revparse_single(spec)
        .and_then(|obj| obj.peel_to_tree())
        .map_err(|e| VfecError::Git(format!("failed to resolve '{spec}': {e}")))?;

    let Ok(entry) = tree.get_path(file) else {
        return Ok(None);
    };
    let blob = entry
        .to_object(repo)
        .and_then(|obj| obj.peel_to_blob())
        .map_err(|e| VfecError::Git(format!("failed to read {}: {e}", file.display())))?;
    Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
}

/// Snippet source backed by file contents at one commit.
///
/// Files are read eagerly when the lookup is built; files absent from the
/// commit simply yield no lines.
///
/// # Examples
///
/// ```no_run
/// use std::path::{Path, PathBuf};
/// use vfec_core::SourceLookup;
/// use vfec_gitpulse::GitSnippets;
///
/// let files = vec![PathBuf::from("lib/url.c")];
/// let snippets = GitSnippets::load(Path::new("."), "HEAD", &files).unwrap();
/// println!("{:?}", snippets.line(Path::new("lib/url.c"), 10));
/// ```
#[derive(Debug, Clone, Default)]
pub struct GitSnippets {
    commit: String,
    files: HashMap<PathBuf, Vec<String>>,
}

impl GitSnippets {
    /// Read `files` as of `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`VfecError::Git`] if the repository or commit cannot be read.
    pub fn load(repo_path: &Path, spec: &str, files: &[PathBuf]) -> Result<Self, VfecError> {
        let repo = Repository::open(repo_path)
            .map_err(|e| VfecError::Git(format!("failed to open repository: {e}")))?;

        let mut loaded = HashMap::new();
        for file in files {
            if loaded.contains_key(file) {
                continue;
            }
            match read_blob(&repo, spec, file)? {
                Some(text) => {
                    loaded.insert(file.clone(), text.lines().map(str::to_string).collect());
                }
                None => tracing::debug!(commit = spec, file = %file.display(), "file absent at commit"),
            }
        }

        Ok(Self {
            commit: spec.to_string(),
            files: loaded,
        })
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn contains(&self, file: &Path) -> bool {
        self.files.contains_key(file)
    }
}

impl SourceLookup for GitSnippets {
    fn line(&self, file: &Path, line: u32) -> Option<String> {
        let idx = usize::try_from(line).ok()?.checked_sub(1)?;
        self.files.get(file)?.get(idx).cloned()
    }
}
