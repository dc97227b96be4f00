use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::digest::Fingerprint;
use crate::error::{FingerprintError, Result};
use crate::filter::PathFilter;
use crate::source::{path_identity, HashSource, SourceKind};
use crate::LOG_TARGET;

/// Digest input for a directory with no hashable files.
pub const EMPTY_DIR_SENTINEL: &[u8] = b"prebuilt:empty-dir";

/// One source's share of a fingerprint. Diagnostics only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceContribution {
    pub kind: SourceKind,
    pub identity: String,
    pub contribution_hash: Fingerprint,
    pub reasons: Vec<String>,
}

/// The reproducible hash of a source set plus its per-source breakdown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintResult {
    pub hash: Fingerprint,
    /// Sorted by `(kind, identity)`, the same order used to compute `hash`.
    pub sources: Vec<SourceContribution>,
}

/// Reduces a set of [`HashSource`]s to a [`FingerprintResult`].
#[derive(Clone, Debug)]
pub struct FingerprintEngine {
    project_root: PathBuf,
    filter: PathFilter,
}

impl FingerprintEngine {
    pub fn new(project_root: impl AsRef<Path>, filter: PathFilter) -> Result<Self> {
        let project_root = project_root.as_ref();
        let project_root =
            std::fs::canonicalize(project_root).map_err(|source| FingerprintError::ProjectRoot {
                path: project_root.to_path_buf(),
                source,
            })?;
        Ok(Self {
            project_root,
            filter,
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Hash `sources` and combine the contributions.
    ///
    /// Sources are hashed in parallel. The top-level digest is computed only
    /// after every contribution is known, over contributions sorted by
    /// `(kind, identity)`, so the supplied order never matters. Sources that
    /// cannot be read at all are logged and omitted.
    pub fn hash_sources(&self, sources: Vec<HashSource>) -> FingerprintResult {
        let keyed = self.dedup(sources);

        let mut contributions: Vec<SourceContribution> = keyed
            .into_par_iter()
            .filter_map(|((kind, identity), source)| {
                let contribution_hash = self.contribution(&source, &identity)?;
                Some(SourceContribution {
                    kind,
                    identity,
                    contribution_hash,
                    reasons: source.reasons().to_vec(),
                })
            })
            .collect();
        contributions.sort_by(|a, b| {
            (a.kind.as_str(), a.identity.as_str()).cmp(&(b.kind.as_str(), b.identity.as_str()))
        });

        let mut hasher = Sha256::new();
        for contribution in &contributions {
            hasher.update(contribution.kind.as_str().as_bytes());
            hasher.update(b":");
            hasher.update(contribution.identity.as_bytes());
            hasher.update(b"\n");
            hasher.update(contribution.contribution_hash.as_str().as_bytes());
        }
        let hash = Fingerprint::from_digest(hasher.finalize().as_slice());

        FingerprintResult {
            hash,
            sources: contributions,
        }
    }

    // Sources sharing `(kind, identity)` are the same input; keep the first and
    // union the reasons so the digest depends on the set, not the list.
    fn dedup(&self, sources: Vec<HashSource>) -> Vec<((SourceKind, String), HashSource)> {
        let mut keyed: BTreeMap<(SourceKind, String), HashSource> = BTreeMap::new();
        for source in sources {
            let key = (source.kind(), self.identity(&source));
            match keyed.get_mut(&key) {
                Some(existing) => merge_reasons(existing, source.reasons()),
                None => {
                    keyed.insert(key, source);
                }
            }
        }
        keyed.into_iter().collect()
    }

    fn identity(&self, source: &HashSource) -> String {
        match source {
            HashSource::File { path, .. } | HashSource::Dir { path, .. } if path.is_absolute() => {
                let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
                path_identity(&self.project_root, &canonical)
            }
            _ => source.identity(&self.project_root),
        }
    }

    fn contribution(&self, source: &HashSource, identity: &str) -> Option<Fingerprint> {
        match source {
            HashSource::File { path, .. } => {
                let full = self.resolve(path);
                match Fingerprint::from_file(&full) {
                    Ok(fp) => Some(fp),
                    Err(err) => {
                        tracing::warn!(
                            target: LOG_TARGET,
                            path = %full.display(),
                            error = %err,
                            "failed to read fingerprint source; excluding it"
                        );
                        None
                    }
                }
            }
            HashSource::Dir { path, .. } => {
                let full = self.resolve(path);
                if !full.is_dir() {
                    tracing::warn!(
                        target: LOG_TARGET,
                        path = %full.display(),
                        "fingerprint directory does not exist; excluding it"
                    );
                    return None;
                }
                Some(self.hash_dir(&full, identity))
            }
            HashSource::ExtraValue { value, .. } => {
                let canonical = canonicalize_json(value);
                match serde_json::to_vec(&canonical) {
                    Ok(bytes) => Some(Fingerprint::from_bytes(bytes)),
                    Err(err) => {
                        tracing::warn!(
                            target: LOG_TARGET,
                            key = identity,
                            error = %err,
                            "failed to serialize extra fingerprint value; excluding it"
                        );
                        None
                    }
                }
            }
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    /// Digest of every non-excluded file below `dir`, keyed by relative path.
    fn hash_dir(&self, dir: &Path, identity: &str) -> Fingerprint {
        let mut files = self.list_dir_files(dir, identity);
        files.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));

        let hashed: Vec<(String, Fingerprint)> = files
            .into_par_iter()
            .filter_map(|(rel, full)| match Fingerprint::from_file(&full) {
                Ok(fp) => Some((rel, fp)),
                Err(err) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        path = %full.display(),
                        error = %err,
                        "failed to read file while fingerprinting directory; skipping it"
                    );
                    None
                }
            })
            .collect();

        if hashed.is_empty() {
            return Fingerprint::from_bytes(EMPTY_DIR_SENTINEL);
        }

        let mut hasher = Sha256::new();
        for (rel, fp) in &hashed {
            hasher.update(rel.as_bytes());
            hasher.update(b"\n");
            hasher.update(fp.as_str().as_bytes());
        }
        Fingerprint::from_digest(hasher.finalize().as_slice())
    }

    fn list_dir_files(&self, dir: &Path, identity: &str) -> Vec<(String, PathBuf)> {
        let mut files = Vec::new();
        let mut walker = WalkDir::new(dir).follow_links(false).into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        dir = %dir.display(),
                        error = %err,
                        "failed to walk fingerprint directory entry; skipping it"
                    );
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let dir_relative = path_identity(Path::new(""), relative);
            let project_relative = join_identity(identity, &dir_relative);

            let file_type = entry.file_type();
            if file_type.is_dir() {
                if self.filter.is_dir_excluded(&dir_relative, &project_relative) {
                    walker.skip_current_dir();
                }
                continue;
            }

            // Symlinked files are hashed through the link; symlinked
            // directories are not followed.
            let is_file = file_type.is_file() || (file_type.is_symlink() && entry.path().is_file());
            if !is_file || self.filter.is_excluded(&dir_relative, &project_relative) {
                continue;
            }
            files.push((dir_relative, entry.into_path()));
        }
        files
    }
}

fn join_identity(base: &str, rel: &str) -> String {
    if base == "." {
        rel.to_owned()
    } else {
        format!("{base}/{rel}")
    }
}

fn merge_reasons(existing: &mut HashSource, extra: &[String]) {
    let reasons = match existing {
        HashSource::File { reasons, .. }
        | HashSource::Dir { reasons, .. }
        | HashSource::ExtraValue { reasons, .. } => reasons,
    };
    for reason in extra {
        if !reasons.contains(reason) {
            reasons.push(reason.clone());
        }
    }
}

/// Rebuild `value` with every object's keys in sorted order.
pub(crate) fn canonicalize_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize_json(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize_json).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine(root: &Path, ignore: &[&str]) -> FingerprintEngine {
        FingerprintEngine::new(root, PathFilter::new(ignore).unwrap()).unwrap()
    }

    #[test]
    fn extra_value_hash_ignores_key_order() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), &[]);
        let a = engine.hash_sources(vec![HashSource::extra_value(
            "scripts",
            json!({"build": "gradle", "start": "expo start"}),
            "a",
        )]);
        let b = engine.hash_sources(vec![HashSource::extra_value(
            "scripts",
            json!({"start": "expo start", "build": "gradle"}),
            "b",
        )]);
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn reasons_never_affect_the_hash() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("app.json"), b"{}").unwrap();
        let engine = engine(tmp.path(), &[]);
        let a = engine.hash_sources(vec![HashSource::file("app.json", "one")]);
        let b = engine.hash_sources(vec![HashSource::file("app.json", "two")]);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.sources[0].reasons, vec!["one".to_string()]);
    }

    #[test]
    fn duplicate_sources_are_merged() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("app.json"), b"{}").unwrap();
        let engine = engine(tmp.path(), &[]);
        let once = engine.hash_sources(vec![HashSource::file("app.json", "a")]);
        let twice = engine.hash_sources(vec![
            HashSource::file("app.json", "a"),
            HashSource::file(tmp.path().join("app.json"), "b"),
        ]);
        assert_eq!(once.hash, twice.hash);
        assert_eq!(twice.sources.len(), 1);
        assert_eq!(twice.sources[0].reasons, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn empty_dir_contributes_sentinel() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("android/build")).unwrap();
        std::fs::write(tmp.path().join("android/build/out.class"), b"x").unwrap();
        let engine = engine(tmp.path(), &[]);
        let result = engine.hash_sources(vec![HashSource::dir("android", "platform")]);
        assert_eq!(
            result.sources[0].contribution_hash,
            Fingerprint::from_bytes(EMPTY_DIR_SENTINEL)
        );
    }

    #[test]
    fn missing_sources_are_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), &[]);
        let result = engine.hash_sources(vec![
            HashSource::file("missing.json", "x"),
            HashSource::dir("missing-dir", "x"),
        ]);
        assert!(result.sources.is_empty());
        assert_eq!(result.hash, engine.hash_sources(Vec::new()).hash);
    }

    #[test]
    fn contributions_are_sorted_by_kind_then_identity() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("b.json"), b"b").unwrap();
        std::fs::write(tmp.path().join("a.json"), b"a").unwrap();
        std::fs::create_dir_all(tmp.path().join("ios")).unwrap();
        let engine = engine(tmp.path(), &[]);
        let result = engine.hash_sources(vec![
            HashSource::file("b.json", "x"),
            HashSource::extra_value("k", json!(1), "x"),
            HashSource::file("a.json", "x"),
            HashSource::dir("ios", "x"),
        ]);
        let order: Vec<_> = result
            .sources
            .iter()
            .map(|s| format!("{}:{}", s.kind, s.identity))
            .collect();
        assert_eq!(order, vec!["dir:ios", "extraValue:k", "file:a.json", "file:b.json"]);
    }

    #[test]
    fn canonicalize_sorts_nested_objects() {
        let value = json!({"b": {"d": 1, "c": [ {"z": 0, "y": 1} ]}, "a": null});
        let text = serde_json::to_string(&canonicalize_json(&value)).unwrap();
        assert_eq!(text, r#"{"a":null,"b":{"c":[{"y":1,"z":0}],"d":1}}"#);
    }
}
