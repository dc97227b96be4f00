use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{FingerprintError, Result};
use crate::platform::Platform;
use crate::source::path_identity;

/// Native modules linked into one platform build: module name → source directory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyGraph {
    modules: BTreeMap<String, PathBuf>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: impl Into<String>, source_dir: impl Into<PathBuf>) {
        self.modules.insert(module.into(), source_dir.into());
    }

    pub fn modules(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.modules
            .iter()
            .map(|(name, dir)| (name.as_str(), dir.as_path()))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Host-independent serialization used as a fingerprint input: module
    /// names mapped to project-relative source directories.
    pub fn to_canonical_value(&self, project_root: &Path) -> serde_json::Value {
        let map = self
            .modules
            .iter()
            .map(|(name, dir)| {
                (
                    name.clone(),
                    serde_json::Value::String(path_identity(project_root, dir)),
                )
            })
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }

    /// Decode the JSON printed by `react-native config`.
    ///
    /// Android modules contribute `platforms.android.sourceDir`; iOS modules
    /// contribute the directory holding `platforms.ios.podspecPath`. A module
    /// whose platform entry is `null` is not linked on that platform. Relative
    /// paths are resolved against `project_root`.
    pub fn from_react_native_config(
        json: &str,
        platform: Platform,
        project_root: &Path,
    ) -> Result<Self> {
        let config: RnConfig =
            serde_json::from_str(json).map_err(|err| FingerprintError::DependencyGraph {
                platform,
                message: format!("malformed dependency config: {err}"),
            })?;

        let mut graph = Self::new();
        for (name, dep) in config.dependencies {
            let source_dir = match platform {
                Platform::Android => dep
                    .platforms
                    .android
                    .and_then(|android| android.source_dir),
                Platform::Ios => dep
                    .platforms
                    .ios
                    .and_then(|ios| ios.podspec_path)
                    .and_then(|podspec| podspec.parent().map(Path::to_path_buf)),
            };
            let Some(source_dir) = source_dir else {
                continue;
            };
            let source_dir = if source_dir.is_absolute() {
                source_dir
            } else {
                project_root.join(source_dir)
            };
            graph.insert(name, source_dir);
        }
        Ok(graph)
    }
}

#[derive(Deserialize)]
struct RnConfig {
    #[serde(default)]
    dependencies: BTreeMap<String, RnDependency>,
}

#[derive(Deserialize)]
struct RnDependency {
    #[serde(default)]
    platforms: RnPlatforms,
}

#[derive(Default, Deserialize)]
struct RnPlatforms {
    #[serde(default)]
    android: Option<RnAndroid>,
    #[serde(default)]
    ios: Option<RnIos>,
}

#[derive(Deserialize)]
struct RnAndroid {
    #[serde(rename = "sourceDir")]
    source_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct RnIos {
    #[serde(rename = "podspecPath")]
    podspec_path: Option<PathBuf>,
}

/// The collaborator that knows which native modules a platform build links.
///
/// Failing to produce a graph is fatal for fingerprinting: without it the
/// platform project cannot be described.
pub trait NativeDependencyResolver {
    fn resolve(&self, project_root: &Path, platform: Platform) -> Result<DependencyGraph>;
}

impl<F> NativeDependencyResolver for F
where
    F: Fn(&Path, Platform) -> Result<DependencyGraph>,
{
    fn resolve(&self, project_root: &Path, platform: Platform) -> Result<DependencyGraph> {
        self(project_root, platform)
    }
}
