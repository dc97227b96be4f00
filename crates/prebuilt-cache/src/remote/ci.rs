//! Artifact store of a CI service (GitHub Actions REST API compatible).

use prebuilt_config::CiArtifactSettings;
use serde::Deserialize;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::{rank_newest_first, RemoteArtifact, RemoteCacheProvider};
use crate::bundle::{unpack_zip, write_zip};
use crate::error::{CacheError, Result};
use crate::local::{LocalArtifact, LocalCacheStore};
use crate::namer::ArtifactName;
use crate::retry::RetryPolicy;
use crate::util::{copy_cancellable, sanitize_url};
use crate::{CancelToken, LOG_TARGET};

const ACCEPT: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct ArtifactPage {
    #[serde(default)]
    artifacts: Vec<ApiArtifact>,
}

#[derive(Debug, Deserialize)]
struct ApiArtifact {
    id: u64,
    name: String,
    #[serde(default)]
    expired: bool,
    created_at: Option<String>,
    archive_download_url: Option<String>,
}

pub struct CiArtifactStore {
    settings: CiArtifactSettings,
    agent: ureq::Agent,
    retry: RetryPolicy,
}

impl std::fmt::Debug for CiArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CiArtifactStore")
            .field("api_url", &self.settings.api_url)
            .field("repository", &self.settings.repository)
            .field("has_token", &self.settings.token.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}

impl CiArtifactStore {
    pub fn new(settings: CiArtifactSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Self {
            settings,
            agent,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn artifacts_url(&self) -> String {
        format!(
            "{}/repos/{}/actions/artifacts",
            self.settings.api_url, self.settings.repository
        )
    }

    fn upload_url(&self) -> String {
        self.settings
            .upload_url
            .clone()
            .unwrap_or_else(|| self.artifacts_url())
    }

    fn token(&self) -> Option<&str> {
        self.settings.token.as_ref().map(|token| token.expose())
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let mut request = self
            .agent
            .request(method, url)
            .set("Accept", ACCEPT)
            .set("X-GitHub-Api-Version", API_VERSION)
            .set("User-Agent", "prebuilt");
        if let Some(token) = self.token() {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        request
    }

    /// Every live entry named exactly `name`, in listing order.
    fn list_entries(&self, name: &ArtifactName, cancel: &CancelToken) -> Result<Vec<ApiArtifact>> {
        let url = self.artifacts_url();
        let page_size = self.settings.page_size;
        let mut matches = Vec::new();

        for page in 1..=self.settings.max_pages {
            let batch = self.retry.run("ci.list", cancel, || {
                let response = self
                    .request("GET", &url)
                    .query("name", name.as_str())
                    .query("per_page", &page_size.to_string())
                    .query("page", &page.to_string())
                    .call()
                    .map_err(|err| http_error(err, &url))?;
                let page: ArtifactPage = serde_json::from_reader(response.into_reader())
                    .map_err(|err| CacheError::MalformedResponse {
                        message: format!("artifact listing: {err}"),
                    })?;
                Ok(page.artifacts)
            })?;

            let returned = batch.len();
            matches.extend(batch.into_iter().filter(|entry| {
                let usable = !entry.expired
                    && entry.name == name.as_str()
                    && entry.archive_download_url.is_some();
                if !usable {
                    tracing::trace!(
                        target: LOG_TARGET,
                        id = entry.id,
                        expired = entry.expired,
                        "skipping artifact entry"
                    );
                }
                usable
            }));

            if returned < page_size as usize {
                break;
            }
        }
        Ok(matches)
    }
}

impl RemoteCacheProvider for CiArtifactStore {
    fn id(&self) -> &'static str {
        "ci-artifacts"
    }

    fn is_enabled(&self) -> bool {
        self.settings.token.is_some()
    }

    fn list(&self, name: &ArtifactName, cancel: &CancelToken) -> Result<Vec<RemoteArtifact>> {
        if !self.is_enabled() {
            tracing::debug!(target: LOG_TARGET, "no CI token; skipping artifact listing");
            return Ok(Vec::new());
        }

        let mut artifacts: Vec<RemoteArtifact> = self
            .list_entries(name, cancel)?
            .into_iter()
            .filter_map(|entry| {
                let created_at = entry.created_at.as_deref().and_then(parse_created_at);
                Some(RemoteArtifact {
                    name: name.clone(),
                    locator: entry.archive_download_url?,
                    created_at,
                })
            })
            .collect();
        rank_newest_first(&mut artifacts);
        Ok(artifacts)
    }

    fn download(
        &self,
        artifact: &RemoteArtifact,
        store: &LocalCacheStore,
        cancel: &CancelToken,
    ) -> Result<LocalArtifact> {
        let mut staged = store.stage(&artifact.name)?;
        let archive_path = staged.scratch_dir().join("artifact.zip");
        let url = artifact.locator.as_str();

        // Each attempt starts from an empty file.
        self.retry.run("ci.download", cancel, || {
            let response = self
                .request("GET", url)
                .call()
                .map_err(|err| http_error(err, url))?;
            let mut file = File::create(&archive_path)?;
            copy_cancellable(&mut response.into_reader(), &mut file, cancel)?;
            Ok(())
        })?;

        unpack_zip(File::open(&archive_path)?, staged.payload_path(), cancel)?;
        staged.collapse_single_entry()?;
        staged.commit()
    }

    fn upload(&self, path: &Path, name: &ArtifactName, cancel: &CancelToken) -> Result<()> {
        if !self.is_enabled() {
            tracing::debug!(target: LOG_TARGET, %name, "no CI token; skipping upload");
            return Ok(());
        }

        let mut archive = tempfile::tempfile()?;
        write_zip(path, name.as_str(), &mut archive)?;
        archive.seek(SeekFrom::Start(0))?;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let url = self.upload_url();
        self.request("POST", &url)
            .query("name", name.as_str())
            .set("Content-Type", "application/zip")
            .send(archive)
            .map_err(|err| http_error(err, &url))?;
        tracing::debug!(target: LOG_TARGET, %name, "uploaded artifact to CI store");
        Ok(())
    }

    fn delete(&self, name: &ArtifactName, cancel: &CancelToken) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }

        let entries = self.list_entries(name, cancel)?;
        for entry in &entries {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            let url = format!("{}/{}", self.artifacts_url(), entry.id);
            self.request("DELETE", &url)
                .call()
                .map_err(|err| http_error(err, &url))?;
        }
        Ok(!entries.is_empty())
    }
}

fn http_error(err: ureq::Error, url: &str) -> CacheError {
    let safe_url = sanitize_url(url);
    match err {
        ureq::Error::Status(code, _response) => CacheError::Http {
            status: Some(code),
            message: format!("server returned status {code} for {safe_url}"),
        },
        ureq::Error::Transport(transport) => CacheError::Http {
            status: None,
            message: format!("transport error for {safe_url}: {}", transport.kind()),
        },
    }
}

fn parse_created_at(raw: &str) -> Option<u64> {
    let parsed = OffsetDateTime::parse(raw, &Rfc3339).ok()?;
    u64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok()
}
