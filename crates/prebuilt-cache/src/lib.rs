//! Tiered cache of native build artifacts keyed by fingerprint.
//!
//! Lookups go through [`CacheResolver`]: the [`LocalCacheStore`] first, then
//! the configured [`RemoteProvider`]. A remote hit is downloaded into the
//! local store before it is returned. Artifacts are named by [`ArtifactName`],
//! a pure function of tool prefix, platform, build traits and fingerprint.
//!
//! Remote backends:
//! - [`CiArtifactStore`]: a CI service's artifact API, exchanging zip archives.
//! - [`ObjectStorageProvider`]: `tar.zst` bundles in a bucket. Buckets are
//!   reached through an [`ObjectStoreClient`]; [`FsObjectStore`] is always
//!   available and `S3ObjectStore` is behind the `s3` feature.

mod bundle;
mod error;
mod local;
mod namer;
mod remote;
mod resolver;
mod retry;
mod util;

pub use bundle::{unpack_tar_zst, unpack_zip, write_tar_zst, write_zip};
pub use error::{CacheError, Result};
pub use local::{CacheEntry, LocalArtifact, LocalCacheStore, StagedArtifact, STAGING_DIR_NAME};
pub use namer::{ArtifactName, MAX_ARTIFACT_NAME_LEN};
pub use remote::{
    parse_object_key, rank_newest_first, CiArtifactStore, FsObjectStore, ObjectKey,
    ObjectStorageProvider, ObjectStoreClient, RemoteArtifact, RemoteCacheProvider,
    RemoteProvider, BUNDLE_EXTENSION,
};
#[cfg(feature = "s3")]
pub use remote::S3ObjectStore;
pub use resolver::{CacheOutcome, CacheResolver, Resolution, ResolverOptions};
pub use retry::RetryPolicy;
pub use util::{now_millis, sanitize_url};

/// Cooperative cancellation for remote transfers.
pub type CancelToken = tokio_util::sync::CancellationToken;

pub(crate) const LOG_TARGET: &str = "prebuilt.cache";
