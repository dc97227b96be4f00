use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{CacheError, Result};
use crate::namer::ArtifactName;
use crate::util::{
    is_aside_name, remove_path_best_effort, rename_replacing, sync_dir_best_effort, unique_suffix,
};
use crate::LOG_TARGET;

/// Directory under the cache root holding in-flight writes.
pub const STAGING_DIR_NAME: &str = ".tmp";

const PAYLOAD_NAME: &str = "payload";

/// An artifact present in the local cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalArtifact {
    pub name: ArtifactName,
    pub path: PathBuf,
}

/// One entry reported by [`LocalCacheStore::list`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub is_dir: bool,
}

/// Filesystem-backed artifact storage.
///
/// Each artifact is one file or directory directly under the root, named
/// exactly as its [`ArtifactName`]. Writes are assembled under
/// `<root>/.tmp/` and published with a single rename, so readers never see a
/// partially written entry.
#[derive(Clone, Debug)]
pub struct LocalCacheStore {
    root: PathBuf,
}

impl LocalCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR_NAME)
    }

    pub fn entry_path(&self, name: &ArtifactName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// The stored path for `name`, or `None` when absent or empty.
    pub fn get(&self, name: &ArtifactName) -> Option<PathBuf> {
        let path = self.entry_path(name);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target: LOG_TARGET,
                        path = %path.display(),
                        error = %err,
                        "failed to stat local cache entry"
                    );
                }
                return None;
            }
        };

        let populated = if meta.is_dir() {
            fs::read_dir(&path)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false)
        } else {
            meta.len() > 0
        };
        populated.then_some(path)
    }

    /// Copy the file or directory at `source` into the cache as `name`.
    pub fn put(&self, name: &ArtifactName, source: &Path) -> Result<LocalArtifact> {
        let meta = fs::metadata(source).map_err(|_| CacheError::MissingArtifact {
            path: source.to_path_buf(),
        })?;
        if !meta.is_dir() && meta.len() == 0 {
            return Err(CacheError::MissingArtifact {
                path: source.to_path_buf(),
            });
        }

        let staged = self.stage(name)?;
        if meta.is_dir() {
            copy_dir_recursive(source, staged.payload_path())?;
        } else {
            fs::copy(source, staged.payload_path())?;
        }
        staged.commit()
    }

    /// Reserve a private staging area for `name`.
    ///
    /// Write the artifact to [`StagedArtifact::payload_path`] and call
    /// [`StagedArtifact::commit`]. Dropping the stage without committing
    /// discards everything written to it.
    pub fn stage(&self, name: &ArtifactName) -> Result<StagedArtifact> {
        let staging_root = self.staging_dir();
        fs::create_dir_all(&staging_root)?;
        let dir = staging_root.join(format!("{name}.{}", unique_suffix()));
        fs::create_dir(&dir)?;
        Ok(StagedArtifact {
            name: name.clone(),
            payload: dir.join(PAYLOAD_NAME),
            dir,
            dest: self.entry_path(name),
            committed: false,
        })
    }

    /// Delete the entry for `name`. Returns whether one existed.
    pub fn remove(&self, name: &ArtifactName) -> Result<bool> {
        let path = self.entry_path(name);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        tracing::debug!(target: LOG_TARGET, %name, "removed local cache entry");
        Ok(true)
    }

    /// Entries moved aside during a replacement whose removal failed.
    fn aside_leftovers(&self) -> Vec<PathBuf> {
        let Ok(read_dir) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        read_dir
            .filter_map(|entry| entry.ok())
            .filter(|entry| is_aside_name(&entry.file_name().to_string_lossy()))
            .map(|entry| entry.path())
            .collect()
    }

    /// Every committed entry, sorted by name. Staging data is not reported.
    pub fn list(&self) -> Result<Vec<CacheEntry>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let is_dir = entry.file_type()?.is_dir();
            let size_bytes = if is_dir {
                dir_size(&path)
            } else {
                entry.metadata()?.len()
            };
            entries.push(CacheEntry {
                name,
                path,
                size_bytes,
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Remove every entry and any abandoned staging data. Returns the number
    /// of entries removed.
    pub fn clean(&self) -> Result<usize> {
        let entries = self.list()?;
        for entry in &entries {
            if entry.is_dir {
                fs::remove_dir_all(&entry.path)?;
            } else {
                fs::remove_file(&entry.path)?;
            }
        }
        remove_path_best_effort(&self.staging_dir(), "clean.staging");
        for leftover in self.aside_leftovers() {
            remove_path_best_effort(&leftover, "clean.aside");
        }
        tracing::debug!(
            target: LOG_TARGET,
            root = %self.root.display(),
            removed = entries.len(),
            "cleaned local cache"
        );
        Ok(entries.len())
    }
}

/// A write in progress. See [`LocalCacheStore::stage`].
#[derive(Debug)]
pub struct StagedArtifact {
    name: ArtifactName,
    dir: PathBuf,
    payload: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl StagedArtifact {
    /// Where the artifact (file or directory) must be written.
    pub fn payload_path(&self) -> &Path {
        &self.payload
    }

    /// Scratch directory for auxiliary files; removed with the stage.
    pub fn scratch_dir(&self) -> &Path {
        &self.dir
    }

    /// If the payload is a directory with exactly one entry, make that entry
    /// the payload.
    pub fn collapse_single_entry(&mut self) -> Result<()> {
        if !self.payload.is_dir() {
            return Ok(());
        }
        let mut children = fs::read_dir(&self.payload)?;
        let Some(only) = children.next().transpose()? else {
            return Ok(());
        };
        if children.next().is_some() {
            return Ok(());
        }

        let collapsed = self.dir.join("single");
        fs::rename(only.path(), &collapsed)?;
        fs::remove_dir(&self.payload)?;
        self.payload = collapsed;
        Ok(())
    }

    /// Publish the payload under its final name, replacing any existing entry.
    pub fn commit(mut self) -> Result<LocalArtifact> {
        match fs::symlink_metadata(&self.payload) {
            Ok(meta) if meta.is_dir() || meta.len() > 0 => {}
            _ => {
                return Err(CacheError::MissingArtifact {
                    path: self.payload.clone(),
                })
            }
        }

        rename_replacing(&self.payload, &self.dest)?;
        self.committed = true;
        if let Some(parent) = self.dest.parent() {
            sync_dir_best_effort(parent, "staged_artifact.commit");
        }
        remove_path_best_effort(&self.dir, "staged_artifact.commit_cleanup");
        tracing::debug!(
            target: LOG_TARGET,
            name = %self.name,
            path = %self.dest.display(),
            "published local cache entry"
        );
        Ok(LocalArtifact {
            name: self.name.clone(),
            path: self.dest.clone(),
        })
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if !self.committed {
            remove_path_best_effort(&self.dir, "staged_artifact.abandoned");
        }
    }
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in WalkDir::new(source).follow_links(false).min_depth(1) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| CacheError::InvalidArchivePath {
                path: entry.path().to_path_buf(),
            })?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    let points_to = fs::read_link(link)?;
    std::os::unix::fs::symlink(points_to, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    if link.is_dir() {
        copy_dir_recursive(link, target)
    } else {
        fs::copy(link, target)?;
        Ok(())
    }
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
