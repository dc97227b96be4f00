//! Object-storage backend.
//!
//! Each upload is stored as a `tar.zst` bundle under
//! `<prefix><name>/<created_ms>-<sha256>.tar.zst`. Keys are never reused, so
//! concurrent or repeated uploads only ever add objects; the sha256 in the key
//! is checked on download.

use prebuilt_config::{ObjectStorageLocation, ObjectStorageSettings};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{rank_newest_first, RemoteArtifact, RemoteCacheProvider};
use crate::bundle::{unpack_tar_zst, write_tar_zst};
use crate::error::{CacheError, Result};
use crate::local::{LocalArtifact, LocalCacheStore};
use crate::namer::ArtifactName;
use crate::retry::RetryPolicy;
use crate::util::{atomic_write_with, copy_cancellable, now_millis};
use crate::{CancelToken, LOG_TARGET};

pub const BUNDLE_EXTENSION: &str = ".tar.zst";

/// Minimal blob-store operations the object-storage provider needs.
pub trait ObjectStoreClient: Send + Sync + fmt::Debug {
    /// Human-readable location for logs.
    fn describe(&self) -> String;

    /// Every key starting with `prefix`.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Stream the object at `key` into `out`. Returns the byte count.
    fn get(&self, key: &str, out: &mut dyn Write, cancel: &CancelToken) -> Result<u64>;

    /// Store the file at `source` as `key`. Readers never observe a partial
    /// object.
    fn put(&self, key: &str, source: &Path) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;
}

/// The parts of a bundle key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectKey {
    pub name: ArtifactName,
    pub created_at: u64,
    pub sha256: String,
}

/// Split `key` into its parts, or `None` when it is not a bundle key under
/// `prefix`.
pub fn parse_object_key(prefix: &str, key: &str) -> Option<ObjectKey> {
    let rest = key.strip_prefix(prefix)?;
    let (name, file) = rest.split_once('/')?;
    let stem = file.strip_suffix(BUNDLE_EXTENSION)?;
    let (created_at, sha256) = stem.split_once('-')?;
    let valid_sha = sha256.len() == 64
        && sha256
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !valid_sha {
        return None;
    }
    Some(ObjectKey {
        name: ArtifactName::parse(name)?,
        created_at: created_at.parse().ok()?,
        sha256: sha256.to_owned(),
    })
}

/// A directory used as a bucket, e.g. a network share mounted on every agent.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(CacheError::UnsupportedLocation {
                    url: key.to_owned(),
                });
            }
            path.push(segment);
        }
        Ok(path)
    }
}

impl ObjectStoreClient for FsObjectStore {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let base = match prefix.rsplit_once('/') {
            Some((dir, _)) => self.key_path(dir)?,
            None => self.root.clone(),
        };
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&base).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn get(&self, key: &str, out: &mut dyn Write, cancel: &CancelToken) -> Result<u64> {
        let mut file = File::open(self.key_path(key)?)?;
        copy_cancellable(&mut file, out, cancel)
    }

    fn put(&self, key: &str, source: &Path) -> Result<()> {
        let dest = self.key_path(key)?;
        atomic_write_with(&dest, |out| {
            io::copy(&mut File::open(source)?, out)?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        // Drop the per-name directory once it is empty.
        if let Some(parent) = path.parent() {
            remove_empty_dir_best_effort(parent);
        }
        Ok(())
    }
}

fn remove_empty_dir_best_effort(dir: &Path) {
    match fs::remove_dir(dir) {
        Ok(()) => {}
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::DirectoryNotEmpty
            ) => {}
        Err(err) => tracing::debug!(
            target: LOG_TARGET,
            dir = %dir.display(),
            error = %err,
            "failed to remove object directory"
        ),
    }
}

#[derive(Debug)]
pub struct ObjectStorageProvider {
    client: Box<dyn ObjectStoreClient>,
    prefix: String,
    retry: RetryPolicy,
}

impl ObjectStorageProvider {
    pub fn new(client: Box<dyn ObjectStoreClient>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_settings(settings: &ObjectStorageSettings) -> Result<Self> {
        match &settings.location {
            ObjectStorageLocation::Filesystem { root } => {
                Ok(Self::new(Box::new(FsObjectStore::new(root)), ""))
            }
            #[cfg(feature = "s3")]
            ObjectStorageLocation::S3 { bucket, prefix } => {
                let client = super::S3ObjectStore::new(bucket.clone(), settings)?;
                Ok(Self::new(Box::new(client), prefix.clone()))
            }
            #[cfg(not(feature = "s3"))]
            ObjectStorageLocation::S3 { bucket, prefix } => Err(CacheError::UnsupportedLocation {
                url: format!("s3://{bucket}/{prefix} (built without the `s3` feature)"),
            }),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn name_prefix(&self, name: &ArtifactName) -> String {
        format!("{}{name}/", self.prefix)
    }

    fn keys_for(&self, name: &ArtifactName, cancel: &CancelToken) -> Result<Vec<ObjectKeyWithRaw>> {
        let query = self.name_prefix(name);
        let keys = self
            .retry
            .run("object.list", cancel, || self.client.list_keys(&query))?;
        Ok(keys
            .into_iter()
            .filter_map(|raw| {
                let parsed = parse_object_key(&self.prefix, &raw)?;
                (parsed.name == *name).then_some(ObjectKeyWithRaw { raw, parsed })
            })
            .collect())
    }
}

struct ObjectKeyWithRaw {
    raw: String,
    parsed: ObjectKey,
}

impl RemoteCacheProvider for ObjectStorageProvider {
    fn id(&self) -> &'static str {
        "object-storage"
    }

    fn list(&self, name: &ArtifactName, cancel: &CancelToken) -> Result<Vec<RemoteArtifact>> {
        let mut artifacts: Vec<RemoteArtifact> = self
            .keys_for(name, cancel)?
            .into_iter()
            .map(|key| RemoteArtifact {
                name: key.parsed.name,
                locator: key.raw,
                created_at: Some(key.parsed.created_at),
            })
            .collect();
        rank_newest_first(&mut artifacts);
        tracing::debug!(
            target: LOG_TARGET,
            store = %self.client.describe(),
            %name,
            matches = artifacts.len(),
            "listed object storage"
        );
        Ok(artifacts)
    }

    fn download(
        &self,
        artifact: &RemoteArtifact,
        store: &LocalCacheStore,
        cancel: &CancelToken,
    ) -> Result<LocalArtifact> {
        let key = artifact.locator.as_str();
        let expected = parse_object_key(&self.prefix, key)
            .ok_or_else(|| CacheError::MalformedResponse {
                message: format!("not a bundle key: {key}"),
            })?
            .sha256;

        let mut staged = store.stage(&artifact.name)?;
        let bundle_path = staged.scratch_dir().join(format!("bundle{BUNDLE_EXTENSION}"));

        let found = self.retry.run("object.download", cancel, || {
            let mut writer = HashingWriter::new(File::create(&bundle_path)?);
            self.client.get(key, &mut writer, cancel)?;
            let (file, digest) = writer.finish();
            file.sync_all()?;
            Ok(digest)
        })?;
        if found != expected {
            return Err(CacheError::ChecksumMismatch {
                locator: key.to_owned(),
                expected,
                found,
            });
        }

        unpack_tar_zst(File::open(&bundle_path)?, staged.payload_path(), cancel)?;
        staged.collapse_single_entry()?;
        staged.commit()
    }

    fn upload(&self, path: &Path, name: &ArtifactName, cancel: &CancelToken) -> Result<()> {
        let bundle = tempfile::Builder::new()
            .prefix("prebuilt-upload-")
            .suffix(BUNDLE_EXTENSION)
            .tempfile()?;
        let mut writer = HashingWriter::new(bundle.as_file());
        write_tar_zst(path, name.as_str(), &mut writer)?;
        let (_, sha256) = writer.finish();
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let key = format!(
            "{}{}-{sha256}{BUNDLE_EXTENSION}",
            self.name_prefix(name),
            now_millis()
        );
        self.client.put(&key, bundle.path())?;
        tracing::debug!(
            target: LOG_TARGET,
            store = %self.client.describe(),
            %key,
            "uploaded artifact bundle"
        );
        Ok(())
    }

    fn delete(&self, name: &ArtifactName, cancel: &CancelToken) -> Result<bool> {
        let keys = self.keys_for(name, cancel)?;
        for key in &keys {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            self.client.delete(&key.raw)?;
        }
        Ok(!keys.is_empty())
    }
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
