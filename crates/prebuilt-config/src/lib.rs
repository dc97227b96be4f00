//! `prebuilt.toml` configuration, the process environment snapshot, and
//! tracing setup.
//!
//! Nothing outside this crate reads credentials from the environment. The
//! binary calls [`EnvSnapshot::capture`] once at start-up and derives an
//! immutable [`RemoteSelection`] from it plus the loaded [`PrebuiltConfig`].

mod env;
mod logging;
mod remote;

pub use env::{EnvSnapshot, Secret};
pub use logging::{init_tracing, LoggingConfig};
pub use remote::{
    CiArtifactSettings, ObjectStorageLocation, ObjectStorageSettings, ProviderKind, RemoteConfig,
    RemoteSelection, StaticCredentials, DEFAULT_CI_API_URL, DEFAULT_CI_PAGE_SIZE,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Tracing target for configuration events.
pub const LOG_TARGET: &str = "prebuilt.config";

/// Environment variable overriding config discovery.
pub const CONFIG_PATH_ENV_VAR: &str = "PREBUILT_CONFIG_PATH";

/// Cache directory used when neither the config nor the environment sets one.
pub const DEFAULT_CACHE_DIR: &str = ".prebuilt/builds";

const CONFIG_FILE_CANDIDATES: [&str; 2] = ["prebuilt.toml", ".prebuilt.toml"];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrebuiltConfig {
    /// Readable prefix of every artifact name. Empty means no prefix segment.
    pub tool_prefix: String,
    pub fingerprint: FingerprintConfig,
    pub cache: CacheConfig,
    pub remote: RemoteConfig,
    pub dependencies: DependenciesConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Extra files, directories, or globs hashed into every fingerprint.
    pub extra_sources: Vec<String>,
    /// Globs excluded from hashing (project-relative).
    pub ignore_paths: Vec<String>,
    /// Framework manifest path; `None` keeps the built-in default.
    pub framework_manifest: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Local cache root. Relative paths resolve against the project root.
    pub dir: Option<PathBuf>,
    /// Consult the remote tier on a local miss.
    pub remote_lookup: bool,
    /// Upload freshly built artifacts to the remote tier.
    pub upload: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            remote_lookup: true,
            upload: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependenciesConfig {
    /// Command printing the native dependency graph as `react-native config` JSON.
    ///
    /// An empty command means the project links no native modules.
    pub command: Vec<String>,
    /// Read the graph JSON from this file instead of running `command`.
    pub file: Option<PathBuf>,
}

impl Default for DependenciesConfig {
    fn default() -> Self {
        Self {
            command: ["npx", "react-native", "config"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            file: None,
        }
    }
}

impl PrebuiltConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    /// Parse a config from TOML. Unknown keys are logged and ignored.
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let mut unknown = Vec::<String>::new();
        let deserializer = toml::de::Deserializer::new(text);
        let config: PrebuiltConfig = serde_ignored::deserialize(deserializer, |path| {
            unknown.push(path.to_string().trim_start_matches('.').to_owned());
        })?;
        for key in unknown {
            tracing::warn!(target: LOG_TARGET, %key, "ignoring unknown config key");
        }
        Ok(config)
    }

    /// Effective local cache directory.
    ///
    /// Precedence: `PREBUILT_CACHE_DIR`, then `cache.dir`, then
    /// `<project>/.prebuilt/builds`. Relative values resolve against the project.
    pub fn cache_dir(&self, project_root: &Path, env: &EnvSnapshot) -> PathBuf {
        let configured = env
            .cache_dir
            .clone()
            .or_else(|| self.cache.dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
        if configured.is_absolute() {
            configured
        } else {
            project_root.join(configured)
        }
    }

    /// Remote provider chosen for this process.
    pub fn remote_selection(&self, env: &EnvSnapshot) -> Result<RemoteSelection, ConfigError> {
        RemoteSelection::resolve(&self.remote, env)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config value for `{key}`: {message}")]
    Invalid { key: &'static str, message: String },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` embeds a source snippet, which can carry credentials.
        ConfigError::Toml(sanitize_toml_error_message(err.message()))
    }
}

fn sanitize_toml_error_message(message: &str) -> String {
    static QUOTED: OnceLock<Option<regex::Regex>> = OnceLock::new();
    let re = QUOTED.get_or_init(|| regex::Regex::new(r#""(?:\\.|[^"\\])*""#).ok());
    match re {
        Some(re) => re.replace_all(message, r#""<redacted>""#).into_owned(),
        None => message.to_owned(),
    }
}

/// Locate the config file for a project.
///
/// `PREBUILT_CONFIG_PATH` (as captured in `env`) wins; otherwise the first of
/// `prebuilt.toml` and `.prebuilt.toml` that exists in the project root.
pub fn discover_config_path(project_root: &Path, env: &EnvSnapshot) -> Option<PathBuf> {
    if let Some(candidate) = env.config_path.as_ref() {
        let path = if candidate.is_absolute() {
            candidate.clone()
        } else {
            project_root.join(candidate)
        };
        return Some(path.canonicalize().unwrap_or(path));
    }

    CONFIG_FILE_CANDIDATES
        .into_iter()
        .map(|name| project_root.join(name))
        .find(|path| path.is_file())
        .map(|path| path.canonicalize().unwrap_or(path))
}

/// Load the configuration for a project root.
///
/// If no config is present, returns [`PrebuiltConfig::default`] and `None`.
pub fn load_for_project(
    project_root: &Path,
    env: &EnvSnapshot,
) -> Result<(PrebuiltConfig, Option<PathBuf>), ConfigError> {
    let Some(path) = discover_config_path(project_root, env) else {
        return Ok((PrebuiltConfig::default(), None));
    };
    let config = PrebuiltConfig::load_from_path(&path)?;
    tracing::debug!(target: LOG_TARGET, path = %path.display(), "loaded config");
    Ok((config, Some(path)))
}
