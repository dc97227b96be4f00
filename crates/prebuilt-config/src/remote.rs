use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

use crate::env::{EnvSnapshot, Secret};
use crate::{ConfigError, LOG_TARGET};

pub const DEFAULT_CI_API_URL: &str = "https://api.github.com";
pub const DEFAULT_CI_PAGE_SIZE: u32 = 100;
const DEFAULT_CI_MAX_PAGES: u32 = 50;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Pick a provider from the available environment.
    #[default]
    Auto,
    None,
    CiArtifacts,
    ObjectStorage,
}

/// The `[remote]` section.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub provider: ProviderKind,
    pub ci_artifacts: CiArtifactsConfig,
    pub object_storage: ObjectStorageConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiArtifactsConfig {
    pub api_url: Option<String>,
    pub repository: Option<String>,
    pub page_size: Option<u32>,
    pub max_pages: Option<u32>,
    pub upload_url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStorageConfig {
    /// `s3://bucket/prefix` or `file:///path`.
    pub url: Option<String>,
    pub region: Option<String>,
    /// Custom endpoint for self-hosted or non-AWS stores.
    pub endpoint: Option<String>,
    /// Address buckets by path rather than by virtual host.
    pub force_path_style: Option<bool>,
}

/// The remote tier for this run. Chosen once and never changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteSelection {
    Disabled,
    CiArtifacts(CiArtifactSettings),
    ObjectStorage(ObjectStorageSettings),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CiArtifactSettings {
    pub api_url: String,
    pub repository: String,
    /// Without a token the store reports no results.
    pub token: Option<Secret>,
    pub page_size: u32,
    pub max_pages: u32,
    /// Upload endpoint; defaults to `{api_url}/repos/{repository}/actions/artifacts`.
    pub upload_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectStorageSettings {
    pub location: ObjectStorageLocation,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub credentials: Option<StaticCredentials>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticCredentials {
    pub access_key_id: Secret,
    pub secret_access_key: Secret,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectStorageLocation {
    /// Keys live under `prefix` (empty or ending in `/`) in `bucket`.
    S3 { bucket: String, prefix: String },
    /// A directory acting as a bucket, typically a shared mount.
    Filesystem { root: PathBuf },
}

impl ObjectStorageLocation {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            key: "remote.object_storage.url",
            message,
        };
        let url = Url::parse(raw).map_err(|err| invalid(err.to_string()))?;
        match url.scheme() {
            "s3" => {
                let bucket = url
                    .host_str()
                    .filter(|host| !host.is_empty())
                    .ok_or_else(|| invalid("missing bucket".to_owned()))?
                    .to_owned();
                let prefix = url.path().trim_matches('/');
                let prefix = if prefix.is_empty() {
                    String::new()
                } else {
                    format!("{prefix}/")
                };
                Ok(ObjectStorageLocation::S3 { bucket, prefix })
            }
            "file" => {
                let root = url
                    .to_file_path()
                    .map_err(|()| invalid("not a local path".to_owned()))?;
                Ok(ObjectStorageLocation::Filesystem { root })
            }
            other => Err(invalid(format!(
                "unsupported scheme `{other}` (expected s3 or file)"
            ))),
        }
    }
}

impl RemoteSelection {
    /// Combine the `[remote]` section with the environment snapshot.
    ///
    /// Config values win over environment values; credentials only come from
    /// the environment. `auto` prefers the CI artifact store when a token and
    /// repository are known, then object storage when a URL is known.
    pub fn resolve(config: &RemoteConfig, env: &EnvSnapshot) -> Result<Self, ConfigError> {
        let selection = match config.provider {
            ProviderKind::None => RemoteSelection::Disabled,
            ProviderKind::CiArtifacts => {
                RemoteSelection::CiArtifacts(ci_settings(config, env).ok_or(
                    ConfigError::Invalid {
                        key: "remote.ci_artifacts.repository",
                        message: "required when remote.provider = \"ci-artifacts\" \
                                  (or set GITHUB_REPOSITORY)"
                            .to_owned(),
                    },
                )?)
            }
            ProviderKind::ObjectStorage => {
                RemoteSelection::ObjectStorage(object_storage_settings(config, env)?.ok_or(
                    ConfigError::Invalid {
                        key: "remote.object_storage.url",
                        message: "required when remote.provider = \"object-storage\" \
                                  (or set PREBUILT_S3_URL)"
                            .to_owned(),
                    },
                )?)
            }
            ProviderKind::Auto => match ci_settings(config, env) {
                Some(ci) if ci.token.is_some() => RemoteSelection::CiArtifacts(ci),
                _ => match object_storage_settings(config, env)? {
                    Some(object) => RemoteSelection::ObjectStorage(object),
                    None => RemoteSelection::Disabled,
                },
            },
        };

        tracing::debug!(target: LOG_TARGET, provider = selection.name(), "selected remote cache provider");
        Ok(selection)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RemoteSelection::Disabled => "none",
            RemoteSelection::CiArtifacts(_) => "ci-artifacts",
            RemoteSelection::ObjectStorage(_) => "object-storage",
        }
    }
}

fn ci_settings(config: &RemoteConfig, env: &EnvSnapshot) -> Option<CiArtifactSettings> {
    let ci = &config.ci_artifacts;
    let repository = ci.repository.clone().or_else(|| env.ci_repository.clone())?;
    let api_url = ci
        .api_url
        .clone()
        .or_else(|| env.ci_api_url.clone())
        .unwrap_or_else(|| DEFAULT_CI_API_URL.to_owned());
    Some(CiArtifactSettings {
        api_url: api_url.trim_end_matches('/').to_owned(),
        repository,
        token: env.ci_token.clone(),
        page_size: ci.page_size.unwrap_or(DEFAULT_CI_PAGE_SIZE).clamp(1, 100),
        max_pages: ci.max_pages.unwrap_or(DEFAULT_CI_MAX_PAGES).max(1),
        upload_url: ci.upload_url.clone(),
    })
}

fn object_storage_settings(
    config: &RemoteConfig,
    env: &EnvSnapshot,
) -> Result<Option<ObjectStorageSettings>, ConfigError> {
    let object = &config.object_storage;
    let Some(url) = object.url.as_deref().or(env.s3_url.as_deref()) else {
        return Ok(None);
    };
    let location = ObjectStorageLocation::parse(url)?;
    let endpoint = object.endpoint.clone().or_else(|| env.s3_endpoint.clone());
    let credentials = match (&env.aws_access_key_id, &env.aws_secret_access_key) {
        (Some(id), Some(secret)) => Some(StaticCredentials {
            access_key_id: id.clone(),
            secret_access_key: secret.clone(),
        }),
        _ => None,
    };
    Ok(Some(ObjectStorageSettings {
        location,
        region: object.region.clone().or_else(|| env.aws_region.clone()),
        force_path_style: object.force_path_style.unwrap_or(endpoint.is_some()),
        endpoint,
        credentials,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ci_env() -> EnvSnapshot {
        EnvSnapshot {
            ci_token: Some(Secret::new("token")),
            ci_repository: Some("acme/app".to_owned()),
            ..EnvSnapshot::default()
        }
    }

    #[test]
    fn auto_without_environment_is_disabled() {
        let selection =
            RemoteSelection::resolve(&RemoteConfig::default(), &EnvSnapshot::default()).unwrap();
        assert_eq!(selection, RemoteSelection::Disabled);
    }

    #[test]
    fn auto_prefers_ci_artifacts_when_a_token_is_present() {
        let mut env = ci_env();
        env.s3_url = Some("s3://bucket/cache".to_owned());
        let selection = RemoteSelection::resolve(&RemoteConfig::default(), &env).unwrap();
        let RemoteSelection::CiArtifacts(ci) = selection else {
            panic!("expected ci artifacts, got {selection:?}");
        };
        assert_eq!(ci.repository, "acme/app");
        assert_eq!(ci.api_url, DEFAULT_CI_API_URL);
        assert_eq!(ci.page_size, DEFAULT_CI_PAGE_SIZE);
    }

    #[test]
    fn auto_falls_back_to_object_storage() {
        let env = EnvSnapshot {
            s3_url: Some("s3://bucket/team/cache/".to_owned()),
            s3_endpoint: Some("http://minio:9000".to_owned()),
            ..EnvSnapshot::default()
        };
        let selection = RemoteSelection::resolve(&RemoteConfig::default(), &env).unwrap();
        let RemoteSelection::ObjectStorage(object) = selection else {
            panic!("expected object storage, got {selection:?}");
        };
        assert_eq!(
            object.location,
            ObjectStorageLocation::S3 {
                bucket: "bucket".to_owned(),
                prefix: "team/cache/".to_owned()
            }
        );
        assert!(object.force_path_style);
        assert!(object.credentials.is_none());
    }

    #[test]
    fn explicit_ci_provider_without_token_is_selected_but_tokenless() {
        let config = RemoteConfig {
            provider: ProviderKind::CiArtifacts,
            ci_artifacts: CiArtifactsConfig {
                repository: Some("acme/app".to_owned()),
                ..CiArtifactsConfig::default()
            },
            ..RemoteConfig::default()
        };
        let selection = RemoteSelection::resolve(&config, &EnvSnapshot::default()).unwrap();
        let RemoteSelection::CiArtifacts(ci) = selection else {
            panic!("expected ci artifacts");
        };
        assert!(ci.token.is_none());
    }

    #[test]
    fn explicit_provider_missing_its_location_is_invalid() {
        let config = RemoteConfig {
            provider: ProviderKind::ObjectStorage,
            ..RemoteConfig::default()
        };
        let err = RemoteSelection::resolve(&config, &EnvSnapshot::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "remote.object_storage.url", .. }));
    }

    #[test]
    fn provider_none_disables_even_with_credentials() {
        let config = RemoteConfig {
            provider: ProviderKind::None,
            ..RemoteConfig::default()
        };
        assert_eq!(
            RemoteSelection::resolve(&config, &ci_env()).unwrap(),
            RemoteSelection::Disabled
        );
    }

    #[test]
    fn parses_locations() {
        assert_eq!(
            ObjectStorageLocation::parse("s3://bucket").unwrap(),
            ObjectStorageLocation::S3 {
                bucket: "bucket".to_owned(),
                prefix: String::new()
            }
        );
        assert!(matches!(
            ObjectStorageLocation::parse("gs://bucket"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn parses_file_locations() {
        assert_eq!(
            ObjectStorageLocation::parse("file:///mnt/cache").unwrap(),
            ObjectStorageLocation::Filesystem {
                root: PathBuf::from("/mnt/cache")
            }
        );
    }
}
