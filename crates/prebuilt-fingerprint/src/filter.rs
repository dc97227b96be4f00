use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{FingerprintError, Result};

/// Paths that never contribute to a fingerprint.
///
/// These are matched against paths relative to the root of each hashed
/// directory, so a native module living under `node_modules/` is still hashed
/// while a dependency tree nested *inside* it is not.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    // build outputs
    "**/build/**",
    "**/.cxx/**",
    "**/.externalNativeBuild/**",
    "**/.gradle/**",
    // dependency-manager trees and caches
    "**/node_modules/**",
    "**/Pods/**",
    // IDE derived data
    "**/DerivedData/**",
    "**/xcuserdata/**",
    "**/.idea/**",
    "**/.vscode/**",
    // machine-local files
    "**/local.properties",
    // OS metadata
    "**/.DS_Store",
    "**/Thumbs.db",
];

/// Compiled exclusion rules for one fingerprint computation.
#[derive(Clone, Debug)]
pub struct PathFilter {
    defaults: GlobSet,
    ignore: GlobSet,
}

impl PathFilter {
    /// Build a filter from the built-in defaults plus caller `ignore_paths`.
    ///
    /// An invalid caller pattern is a configuration error.
    pub fn new<S: AsRef<str>>(ignore_paths: &[S]) -> Result<Self> {
        Ok(Self {
            defaults: build_globset(DEFAULT_EXCLUDES)?,
            ignore: build_globset(ignore_paths)?,
        })
    }

    /// Whether a file is excluded.
    ///
    /// `dir_relative` is the path relative to the hashed directory and
    /// `project_relative` the path relative to the project root, both using `/`.
    pub fn is_excluded(&self, dir_relative: &str, project_relative: &str) -> bool {
        self.defaults.is_match(dir_relative) || self.ignore.is_match(project_relative)
    }

    /// Whether a directory and everything below it is excluded.
    pub fn is_dir_excluded(&self, dir_relative: &str, project_relative: &str) -> bool {
        matches_dir(&self.defaults, dir_relative) || matches_dir(&self.ignore, project_relative)
    }

    /// Whether a project-relative path matches a caller ignore pattern.
    pub fn is_ignored(&self, project_relative: &str) -> bool {
        self.ignore.is_match(project_relative)
    }

    /// Whether a project-relative directory matches a caller ignore pattern.
    pub fn is_dir_ignored(&self, project_relative: &str) -> bool {
        matches_dir(&self.ignore, project_relative)
    }
}

// `**/build/**` matches `build/` but not `build`; probe both spellings so whole
// subtrees can be pruned during traversal.
fn matches_dir(set: &GlobSet, dir: &str) -> bool {
    set.is_match(dir) || set.is_match(format!("{dir}/"))
}

pub(crate) fn build_glob(pattern: &str) -> Result<globset::Glob> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|err| FingerprintError::InvalidGlob {
            pattern: pattern.to_owned(),
            message: err.kind().to_string(),
        })
}

fn build_globset<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(build_glob(pattern.as_ref())?);
    }
    builder.build().map_err(|err| FingerprintError::InvalidGlob {
        pattern: patterns
            .iter()
            .map(|p| p.as_ref())
            .collect::<Vec<_>>()
            .join(", "),
        message: err.to_string(),
    })
}

/// Whether an `extra_sources` entry should be expanded as a glob.
pub(crate) fn is_glob_pattern(entry: &str) -> bool {
    entry.contains(['*', '?', '[', '{'])
}
