//! Mapping of (package, version) pairs to payload locations.
//!
//! Locations are relative to the repository root and always take the shape
//! `{package}/{version}`. Names must already be in normalized form, so each
//! pair maps to exactly one location and no location escapes its package.

use crate::error::{RepoError, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// A validated, normalized, `/`-separated path relative to the repository root.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RelativePath(String);

impl RelativePath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Debug for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelativePath({})", self.0)
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves artifact locations under a repository root.
#[derive(Clone, Debug)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the payload for `version` of `package`.
    ///
    /// Only canonical names are accepted so that distinct pairs never share a
    /// location: the package is one segment, and the version is a
    /// `/`-separated path without empty, `.` or `..` segments.
    pub fn resolve(&self, package: &str, version: &str) -> Result<RelativePath> {
        if self.check_package(package).is_err() || !is_canonical(version) {
            return Err(traversal(package, version));
        }
        Ok(RelativePath(format!("{}/{}", package, version)))
    }

    /// Reject package names that cannot be a single directory under the root.
    pub fn check_package(&self, package: &str) -> Result<()> {
        if package.contains('/') || !is_canonical(package) {
            return Err(RepoError::PathTraversal(package.to_string()));
        }
        Ok(())
    }

    /// Re-validate a stored relative path, e.g. one read back from a record.
    pub fn parse(&self, stored: &str) -> Result<RelativePath> {
        let segments = normalize(stored)?;
        if segments.is_empty() {
            return Err(RepoError::PathTraversal(stored.to_string()));
        }
        Ok(RelativePath(segments.join("/")))
    }

    /// Absolute (root-joined) location of a relative path.
    pub fn absolute(&self, path: &RelativePath) -> PathBuf {
        path.segments()
            .fold(self.root.clone(), |acc, segment| acc.join(segment))
    }
}

/// True when `input` is non-empty and already in normalized form.
fn is_canonical(input: &str) -> bool {
    normalize(input).is_ok_and(|segments| !segments.is_empty() && segments.join("/") == input)
}

fn traversal(package: &str, version: &str) -> RepoError {
    RepoError::PathTraversal(format!("{}/{}", package, version))
}

/// Lexically normalize a `/`-separated path.
///
/// Empty and `.` segments are dropped and `..` pops the previous segment.
/// Absolute paths, a `..` that would climb above the start, and segments
/// with backslashes, NUL bytes or drive prefixes are errors.
fn normalize(input: &str) -> Result<Vec<String>> {
    let unsafe_path = || RepoError::PathTraversal(input.to_string());

    if input.starts_with('/') {
        return Err(unsafe_path());
    }

    let mut segments: Vec<String> = Vec::new();
    for segment in input.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop().ok_or_else(unsafe_path)?;
            }
            other => {
                if other.contains(['\\', '\0', ':']) {
                    return Err(unsafe_path());
                }
                segments.push(other.to_string());
            }
        }
    }
    Ok(segments)
}
