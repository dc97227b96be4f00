//! The remote cache tier.
//!
//! [`RemoteCacheProvider`] is the capability every backend implements.
//! [`RemoteProvider`] is the closed set of backends this build knows about,
//! selected once per process from a [`RemoteSelection`].

mod ci;
mod object;
#[cfg(feature = "s3")]
mod s3;

pub use ci::CiArtifactStore;
pub use object::{
    parse_object_key, FsObjectStore, ObjectKey, ObjectStorageProvider, ObjectStoreClient,
    BUNDLE_EXTENSION,
};
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

use prebuilt_config::RemoteSelection;
use serde::Serialize;
use std::path::Path;

use crate::error::{CacheError, Result};
use crate::local::{LocalArtifact, LocalCacheStore};
use crate::namer::ArtifactName;
use crate::CancelToken;

/// One downloadable copy of an artifact in a remote store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteArtifact {
    pub name: ArtifactName,
    /// Backend-specific address (download URL, object key, ...).
    pub locator: String,
    /// Creation time in milliseconds since the unix epoch, when known.
    pub created_at: Option<u64>,
}

/// Sort newest first. Entries without a creation time sort last; ties fall
/// back to the locator so the order is total.
pub fn rank_newest_first(artifacts: &mut [RemoteArtifact]) {
    artifacts.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.locator.cmp(&a.locator))
    });
}

pub trait RemoteCacheProvider {
    /// Short identifier used in logs.
    fn id(&self) -> &'static str;

    /// Whether the provider can currently serve requests.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Matching artifacts, newest first. Empty means no hit.
    fn list(&self, name: &ArtifactName, cancel: &CancelToken) -> Result<Vec<RemoteArtifact>>;

    /// Fetch `artifact` into `store`. Nothing becomes visible in `store`
    /// unless the whole transfer succeeds.
    fn download(
        &self,
        artifact: &RemoteArtifact,
        store: &LocalCacheStore,
        cancel: &CancelToken,
    ) -> Result<LocalArtifact>;

    /// Publish the file or directory at `path` as `name`. A disabled
    /// provider accepts and discards the upload.
    ///
    /// Repeating an upload never damages an entry that is already readable.
    fn upload(&self, path: &Path, name: &ArtifactName, cancel: &CancelToken) -> Result<()>;

    /// Delete every remote copy of `name`. Returns whether anything was deleted.
    fn delete(&self, name: &ArtifactName, cancel: &CancelToken) -> Result<bool>;
}

/// The remote backend for this run.
#[derive(Debug, Default)]
pub enum RemoteProvider {
    #[default]
    Disabled,
    CiArtifacts(CiArtifactStore),
    ObjectStorage(ObjectStorageProvider),
}

impl RemoteProvider {
    pub fn from_selection(selection: &RemoteSelection) -> Result<Self> {
        Ok(match selection {
            RemoteSelection::Disabled => RemoteProvider::Disabled,
            RemoteSelection::CiArtifacts(settings) => {
                RemoteProvider::CiArtifacts(CiArtifactStore::new(settings.clone()))
            }
            RemoteSelection::ObjectStorage(settings) => {
                RemoteProvider::ObjectStorage(ObjectStorageProvider::from_settings(settings)?)
            }
        })
    }

    fn inner(&self) -> Option<&dyn RemoteCacheProvider> {
        match self {
            RemoteProvider::Disabled => None,
            RemoteProvider::CiArtifacts(store) => Some(store),
            RemoteProvider::ObjectStorage(store) => Some(store),
        }
    }
}

impl RemoteCacheProvider for RemoteProvider {
    fn id(&self) -> &'static str {
        self.inner().map_or("none", |inner| inner.id())
    }

    fn is_enabled(&self) -> bool {
        self.inner().is_some_and(|inner| inner.is_enabled())
    }

    fn list(&self, name: &ArtifactName, cancel: &CancelToken) -> Result<Vec<RemoteArtifact>> {
        match self.inner() {
            Some(inner) => inner.list(name, cancel),
            None => Ok(Vec::new()),
        }
    }

    fn download(
        &self,
        artifact: &RemoteArtifact,
        store: &LocalCacheStore,
        cancel: &CancelToken,
    ) -> Result<LocalArtifact> {
        match self.inner() {
            Some(inner) => inner.download(artifact, store, cancel),
            None => Err(CacheError::ProviderDisabled),
        }
    }

    fn upload(&self, path: &Path, name: &ArtifactName, cancel: &CancelToken) -> Result<()> {
        match self.inner() {
            Some(inner) => inner.upload(path, name, cancel),
            None => Ok(()),
        }
    }

    fn delete(&self, name: &ArtifactName, cancel: &CancelToken) -> Result<bool> {
        match self.inner() {
            Some(inner) => inner.delete(name, cancel),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prebuilt_fingerprint::{Fingerprint, Platform};

    fn artifact(locator: &str, created_at: Option<u64>) -> RemoteArtifact {
        RemoteArtifact {
            name: ArtifactName::new::<&str>("", Platform::Ios, &[], &Fingerprint::from_bytes("x")),
            locator: locator.to_owned(),
            created_at,
        }
    }

    #[test]
    fn newest_wins_and_unknown_times_sort_last() {
        let mut artifacts = vec![
            artifact("a", Some(10)),
            artifact("b", None),
            artifact("c", Some(30)),
            artifact("d", Some(30)),
        ];
        rank_newest_first(&mut artifacts);
        let order: Vec<_> = artifacts.iter().map(|a| a.locator.as_str()).collect();
        assert_eq!(order, ["d", "c", "a", "b"]);
    }

    #[test]
    fn disabled_provider_reports_nothing() {
        let provider = RemoteProvider::from_selection(&RemoteSelection::Disabled).unwrap();
        let name = artifact("x", None).name;
        assert!(!provider.is_enabled());
        assert_eq!(provider.id(), "none");
        assert!(provider.list(&name, &CancelToken::new()).unwrap().is_empty());
        assert!(!provider.delete(&name, &CancelToken::new()).unwrap());
    }
}
