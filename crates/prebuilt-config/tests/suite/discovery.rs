use prebuilt_config::{discover_config_path, load_for_project, EnvSnapshot, PrebuiltConfig};
use std::path::PathBuf;

#[test]
fn discovers_candidates_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let env = EnvSnapshot::default();
    assert_eq!(discover_config_path(root, &env), None);

    std::fs::write(root.join(".prebuilt.toml"), "tool_prefix = \"hidden\"").unwrap();
    let found = discover_config_path(root, &env).unwrap();
    assert!(found.ends_with(".prebuilt.toml"));

    std::fs::write(root.join("prebuilt.toml"), "tool_prefix = \"visible\"").unwrap();
    let (config, path) = load_for_project(root, &env).unwrap();
    assert!(path.unwrap().ends_with("prebuilt.toml"));
    assert_eq!(config.tool_prefix, "visible");
}

#[test]
fn env_override_wins_even_when_relative() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    std::fs::create_dir_all(root.join("ci")).unwrap();
    std::fs::write(root.join("ci/prebuilt.ci.toml"), "tool_prefix = \"ci\"").unwrap();
    std::fs::write(root.join("prebuilt.toml"), "tool_prefix = \"local\"").unwrap();

    let env = EnvSnapshot {
        config_path: Some(PathBuf::from("ci/prebuilt.ci.toml")),
        ..EnvSnapshot::default()
    };
    let (config, _) = load_for_project(root, &env).unwrap();
    assert_eq!(config.tool_prefix, "ci");
}

#[test]
fn missing_override_is_an_io_error() {
    let tmp = tempfile::tempdir().unwrap();
    let env = EnvSnapshot {
        config_path: Some(tmp.path().join("absent.toml")),
        ..EnvSnapshot::default()
    };
    let err = load_for_project(tmp.path(), &env).unwrap_err();
    assert!(err.to_string().contains("absent.toml"), "{err}");
}

#[test]
fn absent_config_yields_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, path) = load_for_project(tmp.path(), &EnvSnapshot::default()).unwrap();
    assert_eq!(config, PrebuiltConfig::default());
    assert!(path.is_none());
}
