use prebuilt_config::DependenciesConfig;
use prebuilt_fingerprint::{DependencyGraph, FingerprintError, NativeDependencyResolver, Platform};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::process;

/// Obtains the native dependency graph from `react-native config` style
/// output: either a configured command or a pre-generated JSON file.
#[derive(Debug)]
pub struct CommandDependencyResolver {
    command: Vec<String>,
    file: Option<PathBuf>,
    cancel: CancellationToken,
}

impl CommandDependencyResolver {
    pub fn new(config: &DependenciesConfig, cancel: CancellationToken) -> Self {
        Self {
            command: config.command.clone(),
            file: config.file.clone(),
            cancel,
        }
    }

    fn read_output(&self, project_root: &Path, platform: Platform) -> Result<String, FingerprintError> {
        let failed = |message: String| FingerprintError::DependencyGraph { platform, message };

        if let Some(file) = &self.file {
            let path = project_root.join(file);
            return std::fs::read_to_string(&path)
                .map_err(|err| failed(format!("failed to read {}: {err}", path.display())));
        }

        let rendered = self.command.join(" ");
        let output = process::capture(&self.command, project_root, &self.cancel)
            .map_err(|err| failed(format!("failed to run `{rendered}`: {err}")))?;
        if !output.status.success() {
            let stderr = output.stderr.trim();
            let tail = stderr
                .char_indices()
                .rev()
                .nth(2000)
                .map_or(stderr, |(idx, _)| &stderr[idx..]);
            return Err(failed(format!(
                "`{rendered}` exited with {}: {tail}",
                output.status
            )));
        }
        Ok(output.stdout)
    }
}

impl NativeDependencyResolver for CommandDependencyResolver {
    fn resolve(&self, project_root: &Path, platform: Platform) -> Result<DependencyGraph, FingerprintError> {
        if self.file.is_none() && self.command.is_empty() {
            tracing::debug!("no dependency command configured; assuming no linked native modules");
            return Ok(DependencyGraph::new());
        }

        let output = self.read_output(project_root, platform)?;
        let graph = DependencyGraph::from_react_native_config(&output, platform, project_root)?;
        tracing::debug!(%platform, modules = graph.len(), "resolved native dependency graph");
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RN_CONFIG: &str = r#"{
        "dependencies": {
            "camera": {
                "platforms": {
                    "android": { "sourceDir": "node_modules/camera/android" },
                    "ios": { "podspecPath": "node_modules/camera/Camera.podspec" }
                }
            },
            "web-only": { "platforms": { "android": null, "ios": null } }
        }
    }"#;

    #[test]
    fn reads_a_pregenerated_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path();
        std::fs::write(tmp.join("rn-config.json"), RN_CONFIG).unwrap();
        let resolver = CommandDependencyResolver::new(
            &DependenciesConfig {
                command: Vec::new(),
                file: Some(PathBuf::from("rn-config.json")),
            },
            CancellationToken::new(),
        );

        let graph = resolver.resolve(tmp, Platform::Ios).unwrap();
        let camera = tmp.join("node_modules/camera");
        let modules: Vec<_> = graph.modules().collect();
        assert_eq!(modules, [("camera", camera.as_path())]);
    }

    #[test]
    fn empty_command_means_no_modules() {
        let resolver = CommandDependencyResolver::new(
            &DependenciesConfig {
                command: Vec::new(),
                file: None,
            },
            CancellationToken::new(),
        );
        let graph = resolver
            .resolve(&std::env::temp_dir(), Platform::Android)
            .unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn missing_command_is_a_dependency_graph_error() {
        let resolver = CommandDependencyResolver::new(
            &DependenciesConfig {
                command: vec!["prebuilt-test-no-such-binary".to_owned()],
                file: None,
            },
            CancellationToken::new(),
        );
        let err = resolver
            .resolve(&std::env::temp_dir(), Platform::Android)
            .unwrap_err();
        assert!(matches!(err, FingerprintError::DependencyGraph { .. }));
    }
}
