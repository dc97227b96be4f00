use std::fmt;
use std::path::PathBuf;

/// A credential that never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Environment values relevant to prebuilt, read once at process start.
///
/// Empty variables are treated as unset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    /// `PREBUILT_CI_TOKEN`, falling back to `GITHUB_TOKEN`.
    pub ci_token: Option<Secret>,
    /// `GITHUB_REPOSITORY` (`owner/repo`).
    pub ci_repository: Option<String>,
    /// `GITHUB_API_URL`.
    pub ci_api_url: Option<String>,
    /// `AWS_ACCESS_KEY_ID`.
    pub aws_access_key_id: Option<Secret>,
    /// `AWS_SECRET_ACCESS_KEY`.
    pub aws_secret_access_key: Option<Secret>,
    /// `AWS_REGION`.
    pub aws_region: Option<String>,
    /// `PREBUILT_S3_URL`.
    pub s3_url: Option<String>,
    /// `PREBUILT_S3_ENDPOINT`.
    pub s3_endpoint: Option<String>,
    /// `PREBUILT_CACHE_DIR`.
    pub cache_dir: Option<PathBuf>,
    /// `PREBUILT_CONFIG_PATH`.
    pub config_path: Option<PathBuf>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a snapshot from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        Self {
            ci_token: get("PREBUILT_CI_TOKEN")
                .or_else(|| get("GITHUB_TOKEN"))
                .map(Secret::new),
            ci_repository: get("GITHUB_REPOSITORY"),
            ci_api_url: get("GITHUB_API_URL"),
            aws_access_key_id: get("AWS_ACCESS_KEY_ID").map(Secret::new),
            aws_secret_access_key: get("AWS_SECRET_ACCESS_KEY").map(Secret::new),
            aws_region: get("AWS_REGION"),
            s3_url: get("PREBUILT_S3_URL"),
            s3_endpoint: get("PREBUILT_S3_ENDPOINT"),
            cache_dir: get("PREBUILT_CACHE_DIR").map(PathBuf::from),
            config_path: get(crate::CONFIG_PATH_ENV_VAR).map(PathBuf::from),
        }
    }
}
