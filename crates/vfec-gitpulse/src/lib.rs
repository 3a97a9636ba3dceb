//! Read-only git access for commit pairs.
//!
//! Produces the zero-context diff between a vulnerable and a fixed commit,
//! lists the files a pair touches, resolves parents, and serves file
//! contents at a commit as snippet sources.

pub mod revision;
pub mod snippets;

pub use revision::{changed_files, diff_text, parent_of, resolve_commit};
pub use snippets::{file_at_commit, GitSnippets};
