use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::platform::Platform;

/// The kind of a [`HashSource`], used as the primary sort key when combining
/// contributions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
    Dir,
    ExtraValue,
    File,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Dir => "dir",
            SourceKind::ExtraValue => "extraValue",
            SourceKind::File => "file",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hashable input of a native build.
///
/// Paths are either absolute or relative to the project root. `reasons` are
/// human-readable attribution strings surfaced by diagnostics; they never
/// affect the digest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HashSource {
    File {
        path: PathBuf,
        reasons: Vec<String>,
    },
    Dir {
        path: PathBuf,
        reasons: Vec<String>,
    },
    ExtraValue {
        key: String,
        value: serde_json::Value,
        reasons: Vec<String>,
    },
}

impl HashSource {
    pub fn file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        HashSource::File {
            path: path.into(),
            reasons: vec![reason.into()],
        }
    }

    pub fn dir(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        HashSource::Dir {
            path: path.into(),
            reasons: vec![reason.into()],
        }
    }

    pub fn extra_value(
        key: impl Into<String>,
        value: serde_json::Value,
        reason: impl Into<String>,
    ) -> Self {
        HashSource::ExtraValue {
            key: key.into(),
            value,
            reasons: vec![reason.into()],
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            HashSource::File { .. } => SourceKind::File,
            HashSource::Dir { .. } => SourceKind::Dir,
            HashSource::ExtraValue { .. } => SourceKind::ExtraValue,
        }
    }

    pub fn reasons(&self) -> &[String] {
        match self {
            HashSource::File { reasons, .. }
            | HashSource::Dir { reasons, .. }
            | HashSource::ExtraValue { reasons, .. } => reasons,
        }
    }

    /// Stable identity of this source: the extra-value key, or the path
    /// relative to `project_root` with `/` separators.
    pub fn identity(&self, project_root: &Path) -> String {
        match self {
            HashSource::File { path, .. } | HashSource::Dir { path, .. } => {
                path_identity(project_root, path)
            }
            HashSource::ExtraValue { key, .. } => key.clone(),
        }
    }
}

/// Render `path` relative to `project_root` using `/` separators.
///
/// Paths outside the project keep their absolute form (still with `/`
/// separators) so they remain distinguishable from in-project paths.
pub(crate) fn path_identity(project_root: &Path, path: &Path) -> String {
    let relative = if path.is_absolute() {
        path.strip_prefix(project_root).unwrap_or(path)
    } else {
        path
    };

    let mut out = String::new();
    for component in relative.components() {
        let part = match component {
            Component::Prefix(prefix) => prefix.as_os_str().to_string_lossy(),
            Component::RootDir => {
                if !out.ends_with('/') {
                    out.push('/');
                }
                continue;
            }
            Component::CurDir => continue,
            Component::ParentDir => "..".into(),
            Component::Normal(part) => part.to_string_lossy(),
        };
        if !out.is_empty() && !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(&part);
    }

    if out.is_empty() {
        ".".to_owned()
    } else {
        out
    }
}

/// Caller-controlled inputs of one fingerprint computation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintOptions {
    pub platform: Platform,
    /// Extra files, directories or glob patterns (relative to the project root).
    #[serde(default)]
    pub extra_sources: Vec<String>,
    /// Glob patterns (relative to the project root) excluded from hashing.
    #[serde(default)]
    pub ignore_paths: Vec<String>,
}

impl FingerprintOptions {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            extra_sources: Vec::new(),
            ignore_paths: Vec::new(),
        }
    }

    pub fn with_extra_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_sources.extend(sources.into_iter().map(Into::into));
        self
    }

    pub fn with_ignore_paths<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_paths.extend(patterns.into_iter().map(Into::into));
        self
    }
}
