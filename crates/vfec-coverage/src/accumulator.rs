//! Coverage accumulator files (`.gcda`) in a working tree.
//!
//! Accumulators are cumulative across process runs, so per-test attribution
//! depends on deleting them right before a test and reading them right after.

use std::path::{Component, Path, PathBuf};

use vfec_core::{CoverageConfig, VfecError};

/// Finds, resets, and maps accumulator files back to their sources.
///
/// # Examples
///
/// ```
/// use vfec_coverage::accumulator::Accumulators;
/// use std::path::{Path, PathBuf};
///
/// let acc = Accumulators::default();
/// assert_eq!(acc.source_for(Path::new("lib/url.gcda")), PathBuf::from("lib/url.c"));
/// assert_eq!(acc.source_for(Path::new("lib/url.c.gcda")), PathBuf::from("lib/url.c"));
/// ```
#[derive(Debug, Clone)]
pub struct Accumulators {
    extension: String,
    default_source_extension: String,
    source_extensions: Vec<String>,
}

impl Default for Accumulators {
    fn default() -> Self {
        Self::from_config(&CoverageConfig::default())
    }
}

impl Accumulators {
    pub fn from_config(config: &CoverageConfig) -> Self {
        Self {
            extension: config.accumulator_extension.trim_start_matches('.').to_string(),
            default_source_extension: config
                .default_source_extension
                .trim_start_matches('.')
                .to_string(),
            source_extensions: config.source_extensions.clone(),
        }
    }

    /// Every accumulator under `root`, relative to it, sorted.
    ///
    /// Ignore files are not honoured; build trees are usually git-ignored.
    pub fn discover(&self, root: &Path) -> Vec<PathBuf> {
        let walker = ignore::WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .build();
        let mut found = Vec::new();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
                continue;
            }
            let rel = path.strip_prefix(root).unwrap_or(path).to_path_buf();
            found.push(rel);
        }

        found.sort();
        found
    }

    /// Delete every accumulator under `root`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`VfecError::Io`] if an accumulator cannot be deleted; a file
    /// vanishing between discovery and deletion is not an error.
    pub fn reset(&self, root: &Path) -> Result<usize, VfecError> {
        let mut removed = 0;
        for rel in self.discover(root) {
            match std::fs::remove_file(root.join(&rel)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(root = %root.display(), removed, "reset coverage accumulators");
        Ok(removed)
    }

    /// Source file an accumulator was produced for.
    ///
    /// `foo.gcda` maps to `foo.c` (the default source extension);
    /// `foo.c.gcda` maps to `foo.c`. CMake object directories
    /// (`CMakeFiles/<target>.dir/`) are stripped so the result is relative
    /// to the source tree.
    pub fn source_for(&self, accumulator: &Path) -> PathBuf {
        let stem = accumulator
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem_has_source_ext = Path::new(&stem)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.source_extensions.iter().any(|s| s == ext));
        let file_name = if stem_has_source_ext {
            stem
        } else {
            format!("{stem}.{}", self.default_source_extension)
        };

        let parent = accumulator.parent().unwrap_or_else(|| Path::new(""));
        strip_cmake_object_dir(parent).join(file_name)
    }

    /// Distinct source files touched by the last run, sorted.
    pub fn touched_sources(&self, root: &Path) -> Vec<PathBuf> {
        let mut sources: Vec<PathBuf> = self
            .discover(root)
            .iter()
            .map(|acc| self.source_for(acc))
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }
}

/// `build/CMakeFiles/curl.dir/lib` becomes `lib`.
fn strip_cmake_object_dir(dir: &Path) -> PathBuf {
    let components: Vec<Component<'_>> = dir.components().collect();
    let marker = components.windows(2).position(|pair| {
        pair[0].as_os_str() == "CMakeFiles"
            && pair[1].as_os_str().to_string_lossy().ends_with(".dir")
    });
    match marker {
        Some(pos) => components[pos + 2..].iter().collect(),
        None => dir.to_path_buf(),
    }
}
