use prebuilt_config::{
    EnvSnapshot, ObjectStorageLocation, PrebuiltConfig, ProviderKind, RemoteSelection, Secret,
};
use std::path::PathBuf;

const FULL: &str = r#"
tool_prefix = "app"

[fingerprint]
extra_sources = ["scripts/*.sh", "app.json"]
ignore_paths  = ["**/generated/**"]
framework_manifest = "node_modules/react-native/package.json"

[cache]
dir = ".prebuilt/builds"
remote_lookup = true
upload = false

[remote]
provider = "object-storage"

[remote.ci_artifacts]
api_url = "https://ghe.example.com/api/v3/"
repository = "owner/repo"
page_size = 50

[remote.object_storage]
url = "s3://bucket/prefix"
region = "eu-west-1"
endpoint = "https://minio.internal:9000"

[dependencies]
command = ["yarn", "react-native", "config"]

[logging]
level = "debug"
json = true
"#;

#[test]
fn parses_every_section() {
    let config = PrebuiltConfig::load_from_str(FULL).unwrap();
    assert_eq!(config.tool_prefix, "app");
    assert_eq!(config.fingerprint.extra_sources, ["scripts/*.sh", "app.json"]);
    assert_eq!(config.fingerprint.ignore_paths, ["**/generated/**"]);
    assert_eq!(
        config.fingerprint.framework_manifest,
        Some(PathBuf::from("node_modules/react-native/package.json"))
    );
    assert!(!config.cache.upload);
    assert_eq!(config.remote.provider, ProviderKind::ObjectStorage);
    assert_eq!(config.remote.ci_artifacts.page_size, Some(50));
    assert_eq!(config.dependencies.command, ["yarn", "react-native", "config"]);
    assert!(config.logging.json);
}

#[test]
fn explicit_object_storage_uses_config_and_env_credentials() {
    let config = PrebuiltConfig::load_from_str(FULL).unwrap();
    let env = EnvSnapshot {
        aws_access_key_id: Some(Secret::new("AKIA")),
        aws_secret_access_key: Some(Secret::new("shh")),
        aws_region: Some("us-east-1".to_owned()),
        ..EnvSnapshot::default()
    };
    let RemoteSelection::ObjectStorage(object) = config.remote_selection(&env).unwrap() else {
        panic!("expected object storage");
    };
    assert_eq!(
        object.location,
        ObjectStorageLocation::S3 {
            bucket: "bucket".to_owned(),
            prefix: "prefix/".to_owned(),
        }
    );
    assert_eq!(object.region.as_deref(), Some("eu-west-1"));
    assert_eq!(object.endpoint.as_deref(), Some("https://minio.internal:9000"));
    let credentials = object.credentials.unwrap();
    assert_eq!(credentials.access_key_id.expose(), "AKIA");
}

#[test]
fn ci_api_url_is_normalized() {
    let text = FULL.replace("provider = \"object-storage\"", "provider = \"ci-artifacts\"");
    let config = PrebuiltConfig::load_from_str(&text).unwrap();
    let RemoteSelection::CiArtifacts(ci) =
        config.remote_selection(&EnvSnapshot::default()).unwrap()
    else {
        panic!("expected ci artifacts");
    };
    assert_eq!(ci.api_url, "https://ghe.example.com/api/v3");
    assert_eq!(ci.page_size, 50);
}

#[test]
fn unknown_provider_is_a_parse_error() {
    let err = PrebuiltConfig::load_from_str("[remote]\nprovider = \"ftp\"").unwrap_err();
    assert!(err.to_string().contains("toml"), "{err}");
}
