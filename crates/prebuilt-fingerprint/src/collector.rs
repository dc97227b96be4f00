use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::dependency::NativeDependencyResolver;
use crate::engine::{FingerprintEngine, FingerprintResult};
use crate::error::{FingerprintError, Result};
use crate::filter::{build_glob, is_glob_pattern, PathFilter};
use crate::source::{path_identity, FingerprintOptions, HashSource};
use crate::LOG_TARGET;

/// Manifest of the native framework package; its version bump must invalidate caches.
pub const DEFAULT_FRAMEWORK_MANIFEST: &str = "node_modules/react-native/package.json";

const REASON_FRAMEWORK: &str = "framework-manifest";
const REASON_PLATFORM_DIR: &str = "bare-native-dir";
const REASON_SCRIPTS: &str = "package-json-scripts";
const REASON_CUSTOM: &str = "custom-user-config";

/// Assembles the [`HashSource`] set describing one platform build.
pub struct SourceCollector<'r, R: ?Sized> {
    project_root: PathBuf,
    resolver: &'r R,
    framework_manifest: PathBuf,
}

impl<'r, R> SourceCollector<'r, R>
where
    R: NativeDependencyResolver + ?Sized,
{
    pub fn new(project_root: impl AsRef<Path>, resolver: &'r R) -> Result<Self> {
        let project_root = project_root.as_ref();
        let project_root =
            std::fs::canonicalize(project_root).map_err(|source| FingerprintError::ProjectRoot {
                path: project_root.to_path_buf(),
                source,
            })?;
        Ok(Self {
            project_root,
            resolver,
            framework_manifest: PathBuf::from(DEFAULT_FRAMEWORK_MANIFEST),
        })
    }

    /// Override the framework manifest (relative to the project root unless absolute).
    pub fn with_framework_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.framework_manifest = path.into();
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Collect sources and reduce them to a fingerprint.
    pub fn fingerprint(&self, options: &FingerprintOptions) -> Result<FingerprintResult> {
        let filter = PathFilter::new(&options.ignore_paths)?;
        let sources = self.collect_with_filter(options, &filter)?;
        let engine = FingerprintEngine::new(&self.project_root, filter)?;
        Ok(engine.hash_sources(sources))
    }

    /// Produce the unordered source set for `options.platform`.
    ///
    /// Only failure to obtain the native dependency graph is fatal.
    pub fn collect(&self, options: &FingerprintOptions) -> Result<Vec<HashSource>> {
        let filter = PathFilter::new(&options.ignore_paths)?;
        self.collect_with_filter(options, &filter)
    }

    fn collect_with_filter(
        &self,
        options: &FingerprintOptions,
        filter: &PathFilter,
    ) -> Result<Vec<HashSource>> {
        let platform = options.platform;
        let mut sources = Vec::new();

        let manifest = self.absolute(&self.framework_manifest);
        if manifest.is_file() {
            sources.push(HashSource::file(manifest, REASON_FRAMEWORK));
        } else {
            tracing::warn!(
                target: LOG_TARGET,
                path = %manifest.display(),
                "native framework manifest not found; framework upgrades will not invalidate the cache"
            );
        }

        let platform_dir = self.project_root.join(platform.project_dir_name());
        if platform_dir.is_dir() {
            sources.push(HashSource::dir(platform_dir, REASON_PLATFORM_DIR));
        }

        let graph = self
            .resolver
            .resolve(&self.project_root, platform)
            .map_err(|err| match err {
                err @ FingerprintError::DependencyGraph { .. } => err,
                other => FingerprintError::DependencyGraph {
                    platform,
                    message: other.to_string(),
                },
            })?;
        tracing::debug!(
            target: LOG_TARGET,
            %platform,
            modules = graph.len(),
            "resolved native dependency graph"
        );
        for (module, dir) in graph.modules() {
            sources.push(HashSource::dir(dir, format!("native-module:{module}")));
        }
        sources.push(HashSource::extra_value(
            format!("autolinking:{platform}"),
            graph.to_canonical_value(&self.project_root),
            format!("{platform} native dependency graph"),
        ));

        if let Some(scripts) = self.package_scripts() {
            sources.push(HashSource::extra_value(
                "packageJson:scripts",
                scripts,
                REASON_SCRIPTS,
            ));
        }

        for entry in &options.extra_sources {
            if is_glob_pattern(entry) {
                sources.extend(self.expand_glob(entry, filter));
                continue;
            }

            let path = self.absolute(Path::new(entry));
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_dir() => sources.push(HashSource::dir(path, REASON_CUSTOM)),
                Ok(_) => sources.push(HashSource::file(path, REASON_CUSTOM)),
                Err(err) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        path = %path.display(),
                        error = %err,
                        "extra fingerprint source does not exist; skipping it"
                    );
                }
            }
        }

        Ok(sources)
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    fn package_scripts(&self) -> Option<serde_json::Value> {
        let path = self.project_root.join("package.json");
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        target: LOG_TARGET,
                        path = %path.display(),
                        error = %err,
                        "failed to read package.json; script declarations are not fingerprinted"
                    );
                }
                return None;
            }
        };
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    path = %path.display(),
                    error = %err,
                    "failed to parse package.json; script declarations are not fingerprinted"
                );
                return None;
            }
        };
        value.get("scripts").filter(|s| s.is_object()).cloned()
    }

    /// Expand a project-relative glob into concrete sources.
    ///
    /// The walk starts at the pattern's literal prefix and never descends into
    /// ignored or default-excluded directories. A matching directory becomes a
    /// single `Dir` source.
    fn expand_glob(&self, pattern: &str, filter: &PathFilter) -> Vec<HashSource> {
        let matcher = match build_glob(pattern) {
            Ok(glob) => glob.compile_matcher(),
            Err(err) => {
                tracing::warn!(target: LOG_TARGET, %pattern, error = %err, "skipping extra source");
                return Vec::new();
            }
        };

        let base_rel: PathBuf = pattern
            .split('/')
            .take_while(|part| !is_glob_pattern(part))
            .collect();
        let base = self.project_root.join(&base_rel);
        if !base.is_dir() {
            tracing::warn!(target: LOG_TARGET, %pattern, "extra source glob matched no files");
            return Vec::new();
        }

        let mut sources = Vec::new();
        let mut walker = WalkDir::new(&base)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(target: LOG_TARGET, %pattern, error = %err, "failed to walk extra source glob");
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }

            let project_relative = path_identity(&self.project_root, entry.path());
            let walk_relative = entry
                .path()
                .strip_prefix(&base)
                .map(|rel| path_identity(Path::new(""), rel))
                .unwrap_or_else(|_| project_relative.clone());

            if entry.file_type().is_dir() {
                if filter.is_dir_excluded(&walk_relative, &project_relative) {
                    walker.skip_current_dir();
                    continue;
                }
                if matcher.is_match(&project_relative) {
                    sources.push(HashSource::dir(entry.path(), REASON_CUSTOM));
                    walker.skip_current_dir();
                }
                continue;
            }

            if matcher.is_match(&project_relative) && !filter.is_ignored(&project_relative) {
                sources.push(HashSource::file(entry.path(), REASON_CUSTOM));
            }
        }

        if sources.is_empty() {
            tracing::warn!(target: LOG_TARGET, %pattern, "extra source glob matched no files");
        }
        sources
    }
}

impl<R: ?Sized> std::fmt::Debug for SourceCollector<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCollector")
            .field("project_root", &self.project_root)
            .field("framework_manifest", &self.framework_manifest)
            .finish_non_exhaustive()
    }
}
