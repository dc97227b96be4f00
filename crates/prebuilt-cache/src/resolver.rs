use prebuilt_fingerprint::{
    Fingerprint, FingerprintOptions, FingerprintResult, NativeDependencyResolver, Platform,
    SourceCollector,
};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};
use crate::local::LocalCacheStore;
use crate::namer::ArtifactName;
use crate::remote::{RemoteCacheProvider, RemoteProvider};
use crate::{CancelToken, LOG_TARGET};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolverOptions {
    /// Readable prefix of every artifact name; may be empty.
    pub tool_prefix: String,
    /// Consult the remote tier on a local miss.
    pub remote_lookup: bool,
    /// Upload freshly stored artifacts.
    pub upload: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            tool_prefix: String::new(),
            remote_lookup: true,
            upload: true,
        }
    }
}

impl ResolverOptions {
    /// Never touch the remote tier.
    pub fn local_only(mut self) -> Self {
        self.remote_lookup = false;
        self.upload = false;
        self
    }
}

/// Where an artifact came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum CacheOutcome {
    LocalHit { path: PathBuf },
    RemoteHit { path: PathBuf },
    NotFound,
    /// Produced by [`CacheResolver::resolve_or_build`] after a miss.
    Built { path: PathBuf },
}

impl CacheOutcome {
    pub fn path(&self) -> Option<&Path> {
        match self {
            CacheOutcome::LocalHit { path }
            | CacheOutcome::RemoteHit { path }
            | CacheOutcome::Built { path } => Some(path),
            CacheOutcome::NotFound => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(
            self,
            CacheOutcome::LocalHit { .. } | CacheOutcome::RemoteHit { .. }
        )
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub name: ArtifactName,
    pub fingerprint: FingerprintResult,
    #[serde(flatten)]
    pub outcome: CacheOutcome,
}

/// Tiered artifact lookup: local store first, then the remote provider.
///
/// Only a failure to fingerprint (or a failed build in
/// [`CacheResolver::resolve_or_build`]) is an error. Every cache-side failure
/// is logged and degrades to a miss, so a broken cache can slow a build down
/// but never break it.
pub struct CacheResolver<'r, R: ?Sized, P = RemoteProvider> {
    collector: SourceCollector<'r, R>,
    store: LocalCacheStore,
    provider: P,
    options: ResolverOptions,
    cancel: CancelToken,
}

impl<'r, R, P> CacheResolver<'r, R, P>
where
    R: NativeDependencyResolver + ?Sized,
    P: RemoteCacheProvider,
{
    pub fn new(collector: SourceCollector<'r, R>, store: LocalCacheStore, provider: P) -> Self {
        Self {
            collector,
            store,
            provider,
            options: ResolverOptions::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &LocalCacheStore {
        &self.store
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    pub fn artifact_name<S: AsRef<str>>(
        &self,
        platform: Platform,
        traits: &[S],
        hash: &Fingerprint,
    ) -> ArtifactName {
        ArtifactName::new(&self.options.tool_prefix, platform, traits, hash)
    }

    /// Fingerprint the project for `platform`, which overrides
    /// `options.platform`.
    pub fn fingerprint(
        &self,
        platform: Platform,
        options: &FingerprintOptions,
    ) -> Result<FingerprintResult> {
        let mut options = options.clone();
        options.platform = platform;
        let fingerprint = self.collector.fingerprint(&options)?;
        log_breakdown(&fingerprint);
        Ok(fingerprint)
    }

    /// Fingerprint the project and look the result up in each tier.
    ///
    /// `platform` overrides `options.platform`.
    pub fn resolve_artifact<S: AsRef<str>>(
        &self,
        platform: Platform,
        traits: &[S],
        options: &FingerprintOptions,
    ) -> Result<Resolution> {
        let fingerprint = self.fingerprint(platform, options)?;
        let name = self.artifact_name(platform, traits, &fingerprint.hash);
        let outcome = self.lookup(&name);
        tracing::debug!(
            target: LOG_TARGET,
            %name,
            outcome = outcome_label(&outcome),
            "resolved native build"
        );
        Ok(Resolution {
            name,
            fingerprint,
            outcome,
        })
    }

    fn lookup(&self, name: &ArtifactName) -> CacheOutcome {
        if let Some(path) = self.store.get(name) {
            return CacheOutcome::LocalHit { path };
        }

        if !self.options.remote_lookup || !self.provider.is_enabled() {
            tracing::debug!(
                target: LOG_TARGET,
                %name,
                remote_lookup = self.options.remote_lookup,
                provider = self.provider.id(),
                "remote tier not consulted"
            );
            return CacheOutcome::NotFound;
        }

        let matches = match self.provider.list(name, &self.cancel) {
            Ok(matches) => matches,
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    %name,
                    provider = self.provider.id(),
                    error = %err,
                    "remote cache lookup failed; treating as miss"
                );
                return CacheOutcome::NotFound;
            }
        };
        let Some(newest) = matches.first() else {
            tracing::debug!(target: LOG_TARGET, %name, provider = self.provider.id(), "no remote match");
            return CacheOutcome::NotFound;
        };

        tracing::debug!(
            target: LOG_TARGET,
            %name,
            candidates = matches.len(),
            created_at = newest.created_at,
            "downloading newest remote match"
        );
        match self.provider.download(newest, &self.store, &self.cancel) {
            Ok(local) => CacheOutcome::RemoteHit { path: local.path },
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    %name,
                    provider = self.provider.id(),
                    error = %err,
                    "remote cache download failed; treating as miss"
                );
                CacheOutcome::NotFound
            }
        }
    }

    /// Store a freshly built artifact locally and, when enabled, upload it.
    ///
    /// Returns the cached path, or `built` itself when it could not be cached.
    /// Never fails.
    pub fn store_artifact(&self, name: &ArtifactName, built: &Path) -> PathBuf {
        let path = match self.store.put(name, built) {
            Ok(local) => local.path,
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    %name,
                    path = %built.display(),
                    error = %err,
                    "failed to write local cache entry"
                );
                built.to_path_buf()
            }
        };

        if self.options.upload && self.provider.is_enabled() {
            match self.provider.upload(&path, name, &self.cancel) {
                Ok(()) => tracing::debug!(
                    target: LOG_TARGET,
                    %name,
                    provider = self.provider.id(),
                    "uploaded artifact"
                ),
                Err(err) => tracing::warn!(
                    target: LOG_TARGET,
                    %name,
                    provider = self.provider.id(),
                    error = %err,
                    "failed to upload artifact"
                ),
            }
        }
        path
    }

    /// Resolve, and on a miss run `build` and store what it produced.
    pub fn resolve_or_build<S, F>(
        &self,
        platform: Platform,
        traits: &[S],
        options: &FingerprintOptions,
        build: F,
    ) -> Result<Resolution>
    where
        S: AsRef<str>,
        F: FnOnce(&ArtifactName) -> io::Result<PathBuf>,
    {
        let mut resolution = self.resolve_artifact(platform, traits, options)?;
        if resolution.outcome != CacheOutcome::NotFound {
            return Ok(resolution);
        }

        let built = build(&resolution.name).map_err(|source| CacheError::Build { source })?;
        let path = self.store_artifact(&resolution.name, &built);
        resolution.outcome = CacheOutcome::Built { path };
        Ok(resolution)
    }
}

impl<R: ?Sized, P: std::fmt::Debug> std::fmt::Debug for CacheResolver<'_, R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheResolver")
            .field("collector", &self.collector)
            .field("store", &self.store)
            .field("provider", &self.provider)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn outcome_label(outcome: &CacheOutcome) -> &'static str {
    match outcome {
        CacheOutcome::LocalHit { .. } => "local-hit",
        CacheOutcome::RemoteHit { .. } => "remote-hit",
        CacheOutcome::NotFound => "not-found",
        CacheOutcome::Built { .. } => "built",
    }
}

fn log_breakdown(fingerprint: &FingerprintResult) {
    tracing::debug!(
        target: LOG_TARGET,
        hash = %fingerprint.hash,
        sources = fingerprint.sources.len(),
        "computed fingerprint"
    );
    for source in &fingerprint.sources {
        tracing::debug!(
            target: LOG_TARGET,
            kind = %source.kind,
            identity = %source.identity,
            contribution = %source.contribution_hash,
            reasons = ?source.reasons,
            "fingerprint source"
        );
    }
}
