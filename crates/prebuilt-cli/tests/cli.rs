use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;
use serde_json::Value;

const LOCAL_CONFIG: &str = r#"
[dependencies]
command = []

[remote]
provider = "none"
"#;

fn prebuilt() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("prebuilt"));
    for var in [
        "PREBUILT_CI_TOKEN",
        "GITHUB_TOKEN",
        "GITHUB_REPOSITORY",
        "GITHUB_API_URL",
        "AWS_ACCESS_KEY_ID",
        "AWS_SECRET_ACCESS_KEY",
        "AWS_REGION",
        "PREBUILT_S3_URL",
        "PREBUILT_S3_ENDPOINT",
        "PREBUILT_CONFIG_PATH",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn new_project(config: &str) -> TempDir {
    let temp = TempDir::new().unwrap();
    temp.child("prebuilt.toml").write_str(config).unwrap();
    temp.child("package.json")
        .write_str(r#"{"name":"app","version":"1.0.0"}"#)
        .unwrap();
    temp.child("node_modules/react-native/package.json")
        .write_str(r#"{"name":"react-native","version":"0.74.0"}"#)
        .unwrap();
    temp.child("android/build.gradle")
        .write_str("plugins {}")
        .unwrap();
    temp.child("android/app/src/main/MainActivity.kt")
        .write_str("class MainActivity")
        .unwrap();
    temp
}

fn run_json(cmd: &mut Command) -> Value {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn sh(script: &str) -> [String; 3] {
    ["sh".to_owned(), "-c".to_owned(), script.to_owned()]
}

#[test]
fn help_mentions_core_commands() {
    prebuilt().arg("--help").assert().success().stdout(
        predicate::str::contains("fingerprint")
            .and(predicate::str::contains("resolve"))
            .and(predicate::str::contains("store"))
            .and(predicate::str::contains("build"))
            .and(predicate::str::contains("cache")),
    );
}

#[test]
fn fingerprint_json_is_stable_and_tracks_sources() {
    let project = new_project(LOCAL_CONFIG);
    let fingerprint = || {
        run_json(
            prebuilt()
                .arg("fingerprint")
                .args(["--platform", "android", "--json", "--project"])
                .arg(project.path()),
        )
    };

    let first = fingerprint();
    assert_eq!(first["platform"], "android");
    let hash = first["hash"].as_str().unwrap().to_owned();
    assert_eq!(hash.len(), 64);
    assert!(!first["sources"].as_array().unwrap().is_empty());
    assert_eq!(fingerprint()["hash"], hash.as_str());

    project
        .child("android/app/src/main/MainActivity.kt")
        .write_str("class MainActivity2")
        .unwrap();
    assert_ne!(fingerprint()["hash"], hash.as_str());
}

#[test]
fn fingerprint_debug_prints_the_breakdown() {
    let project = new_project(LOCAL_CONFIG);
    prebuilt()
        .args(["fingerprint", "--platform", "android", "--debug", "--project"])
        .arg(project.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("android"));
}

#[test]
fn unknown_platform_exits_with_status_two() {
    let project = new_project(LOCAL_CONFIG);
    prebuilt()
        .args(["fingerprint", "--platform", "windows", "--project"])
        .arg(project.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown platform `windows`"));
}

#[test]
fn invalid_config_exits_with_status_two() {
    let project = new_project("[cache\nupload = ");
    prebuilt()
        .args(["fingerprint", "--platform", "ios", "--project"])
        .arg(project.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("toml"));
}

#[test]
fn resolve_misses_then_hits_after_store() {
    let project = new_project(LOCAL_CONFIG);
    let cache = TempDir::new().unwrap();
    let built = TempDir::new().unwrap();
    built.child("app-debug.apk").write_str("apk bytes").unwrap();

    let resolve = || {
        let mut cmd = prebuilt();
        cmd.args(["resolve", "--platform", "android", "--trait", "debug", "--json"])
            .arg("--project")
            .arg(project.path())
            .env("PREBUILT_CACHE_DIR", cache.path());
        cmd
    };

    let miss = run_json(&mut resolve());
    assert_eq!(miss["outcome"], "not-found");
    let name = miss["name"].as_str().unwrap().to_owned();
    assert!(name.starts_with("android-debug-"), "{name}");

    resolve().arg("--fail-on-miss").assert().code(1);

    let stored = run_json(
        prebuilt()
            .args(["store", "--platform", "android", "--trait", "debug", "--json"])
            .arg("--project")
            .arg(project.path())
            .arg(built.child("app-debug.apk").path())
            .env("PREBUILT_CACHE_DIR", cache.path()),
    );
    assert_eq!(stored["name"], name.as_str());

    let hit = run_json(&mut resolve());
    assert_eq!(hit["outcome"], "local-hit");
    let path = hit["path"].as_str().unwrap();
    assert_eq!(std::fs::read_to_string(path).unwrap(), "apk bytes");

    resolve().arg("--fail-on-miss").assert().success();
}

#[test]
fn cache_miss_is_silent_unless_verbose() {
    let project = new_project(LOCAL_CONFIG);
    let cache = TempDir::new().unwrap();
    let resolve = || {
        let mut cmd = prebuilt();
        cmd.args(["resolve", "--platform", "android", "--project"])
            .arg(project.path())
            .env("PREBUILT_CACHE_DIR", cache.path());
        cmd
    };

    resolve()
        .assert()
        .success()
        .stdout(predicate::str::starts_with("not-found "))
        .stderr(predicate::str::is_empty());

    resolve()
        .arg("-v")
        .assert()
        .success()
        .stderr(predicate::str::contains("resolved native build"));
}

#[test]
fn build_runs_the_command_once_then_reuses_the_cache() {
    let project = new_project(LOCAL_CONFIG);
    let cache = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let output = scratch.child("out/app.apk");
    let counter = scratch.child("runs.txt");
    let script = format!(
        "echo run >> '{}' && mkdir -p '{}' && echo apk > '{}'",
        counter.path().display(),
        scratch.child("out").path().display(),
        output.path().display(),
    );

    let build = || {
        run_json(
            prebuilt()
                .args(["build", "--platform", "android", "--json", "--output"])
                .arg(output.path())
                .arg("--project")
                .arg(project.path())
                .env("PREBUILT_CACHE_DIR", cache.path())
                .arg("--")
                .args(sh(&script)),
        )
    };

    let first = build();
    assert_eq!(first["outcome"], "built");
    let second = build();
    assert_eq!(second["outcome"], "local-hit");
    assert_eq!(first["name"], second["name"]);

    let runs = std::fs::read_to_string(counter.path()).unwrap();
    assert_eq!(runs.lines().count(), 1);
}

#[test]
fn failed_build_exits_with_status_one_and_caches_nothing() {
    let project = new_project(LOCAL_CONFIG);
    let cache = TempDir::new().unwrap();

    prebuilt()
        .args(["build", "--platform", "android", "--output", "out/app.apk"])
        .arg("--project")
        .arg(project.path())
        .env("PREBUILT_CACHE_DIR", cache.path())
        .arg("--")
        .args(sh("exit 7"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("build failed"));

    let listed = run_json(
        prebuilt()
            .args(["cache", "list", "--json", "--project"])
            .arg(project.path())
            .env("PREBUILT_CACHE_DIR", cache.path()),
    );
    assert!(listed.as_array().unwrap().is_empty());
}

#[test]
fn cache_list_remove_and_clean() {
    let project = new_project(LOCAL_CONFIG);
    let cache = TempDir::new().unwrap();
    let built = TempDir::new().unwrap();
    built.child("App.app/Info.plist").write_str("<plist/>").unwrap();

    for traits in [&["debug"][..], &["release"][..]] {
        let mut cmd = prebuilt();
        cmd.args(["store", "--platform", "ios", "--project"])
            .arg(project.path())
            .env("PREBUILT_CACHE_DIR", cache.path());
        for t in traits {
            cmd.args(["--trait", t]);
        }
        cmd.arg(built.child("App.app").path()).assert().success();
    }

    let list = || {
        run_json(
            prebuilt()
                .args(["cache", "list", "--json", "--project"])
                .arg(project.path())
                .env("PREBUILT_CACHE_DIR", cache.path()),
        )
    };
    let entries = list();
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|entry| entry["isDir"] == true));

    let name = entries[0]["name"].as_str().unwrap().to_owned();
    let removed = run_json(
        prebuilt()
            .args(["cache", "remove", "--json", "--project"])
            .arg(project.path())
            .arg(&name)
            .env("PREBUILT_CACHE_DIR", cache.path()),
    );
    assert_eq!(removed["removedLocal"], true);
    assert_eq!(list().as_array().unwrap().len(), 1);

    prebuilt()
        .args(["cache", "clean", "--project"])
        .arg(project.path())
        .env("PREBUILT_CACHE_DIR", cache.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 1 entries"));
    assert!(list().as_array().unwrap().is_empty());
}

#[test]
fn cache_remove_rejects_invalid_names() {
    let project = new_project(LOCAL_CONFIG);
    prebuilt()
        .args(["cache", "remove", "../escape", "--project"])
        .arg(project.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not a valid artifact name"));
}

#[test]
fn object_storage_shares_builds_between_cache_dirs() {
    let bucket = TempDir::new().unwrap();
    let config = format!(
        r#"
[dependencies]
command = []

[remote]
provider = "object-storage"

[remote.object_storage]
url = "file://{}/builds/"
"#,
        bucket.path().display()
    );
    let project = new_project(&config);
    let built = TempDir::new().unwrap();
    built.child("app.apk").write_str("shared apk").unwrap();

    let first_cache = TempDir::new().unwrap();
    prebuilt()
        .args(["store", "--platform", "android", "--project"])
        .arg(project.path())
        .arg(built.child("app.apk").path())
        .env("PREBUILT_CACHE_DIR", first_cache.path())
        .assert()
        .success();

    let second_cache = TempDir::new().unwrap();
    let resolve = || {
        run_json(
            prebuilt()
                .args(["resolve", "--platform", "android", "--json", "--project"])
                .arg(project.path())
                .env("PREBUILT_CACHE_DIR", second_cache.path()),
        )
    };

    let remote = resolve();
    assert_eq!(remote["outcome"], "remote-hit");
    let path = remote["path"].as_str().unwrap();
    assert_eq!(std::fs::read_to_string(path).unwrap(), "shared apk");

    assert_eq!(resolve()["outcome"], "local-hit");
}

#[test]
fn local_only_skips_the_remote_provider() {
    let server = httpmock::MockServer::start();
    let list = server.mock(|when, then| {
        when.method(httpmock::Method::GET)
            .path("/repos/acme/app/actions/artifacts");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(serde_json::json!({ "total_count": 0, "artifacts": [] }));
    });
    let config = format!(
        r#"
[dependencies]
command = []

[remote]
provider = "ci-artifacts"

[remote.ci_artifacts]
api_url = "{}"
repository = "acme/app"
"#,
        server.base_url()
    );
    let project = new_project(&config);
    let cache = TempDir::new().unwrap();

    let resolve = |local_only: bool| {
        let mut cmd = prebuilt();
        cmd.args(["resolve", "--platform", "android", "--json", "--project"])
            .arg(project.path())
            .env("PREBUILT_CACHE_DIR", cache.path())
            .env("PREBUILT_CI_TOKEN", "test-token");
        if local_only {
            cmd.arg("--local-only");
        }
        run_json(&mut cmd)
    };

    assert_eq!(resolve(true)["outcome"], "not-found");
    list.assert_hits(0);

    assert_eq!(resolve(false)["outcome"], "not-found");
    list.assert_hits(1);
}

#[test]
fn unreachable_remote_degrades_to_a_miss() {
    let config = r#"
[dependencies]
command = []

[remote]
provider = "ci-artifacts"

[remote.ci_artifacts]
api_url = "http://127.0.0.1:9"
repository = "acme/app"
max_pages = 1
"#;
    let project = new_project(config);
    let cache = TempDir::new().unwrap();

    let output = prebuilt()
        .args(["resolve", "--platform", "android", "--json", "--project"])
        .arg(project.path())
        .env("PREBUILT_CACHE_DIR", cache.path())
        .env("PREBUILT_CI_TOKEN", "super-secret-token")
        .output()
        .unwrap();

    assert!(output.status.success());
    let v: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(v["outcome"], "not-found");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("super-secret-token"), "{stderr}");
}
