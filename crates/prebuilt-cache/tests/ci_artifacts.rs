use httpmock::prelude::*;
use prebuilt_cache::{
    write_zip, ArtifactName, CacheError, CancelToken, CiArtifactStore, LocalCacheStore,
    RemoteCacheProvider, RetryPolicy,
};
use prebuilt_config::{CiArtifactSettings, Secret};
use prebuilt_fingerprint::{Fingerprint, Platform};
use serde_json::json;
use std::fs;
use std::io::Cursor;
use std::time::Duration;

const ARTIFACTS_PATH: &str = "/repos/acme/mobile/actions/artifacts";

fn settings(server: &MockServer, token: Option<&str>) -> CiArtifactSettings {
    CiArtifactSettings {
        api_url: server.base_url(),
        repository: "acme/mobile".to_owned(),
        token: token.map(Secret::new),
        page_size: 2,
        max_pages: 10,
        upload_url: None,
    }
}

fn store(server: &MockServer) -> CiArtifactStore {
    CiArtifactStore::new(settings(server, Some("t0k"))).with_retry(RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
    })
}

fn name() -> ArtifactName {
    ArtifactName::new("app", Platform::Ios, &["simulator"], &Fingerprint::from_bytes("ios"))
}

fn entry(server: &MockServer, id: u64, name: &str, expired: bool, created_at: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "expired": expired,
        "created_at": created_at,
        "archive_download_url": server.url(format!("/download/{id}")),
    })
}

#[test]
fn listing_paginates_filters_and_ranks_newest_first() {
    let server = MockServer::start();
    let name = name();
    let page1 = server.mock(|when, then| {
        when.method(GET)
            .path(ARTIFACTS_PATH)
            .query_param("name", name.as_str())
            .query_param("per_page", "2")
            .query_param("page", "1")
            .header("authorization", "Bearer t0k");
        then.status(200).json_body(json!({
            "total_count": 3,
            "artifacts": [
                entry(&server, 1, name.as_str(), false, "2024-01-01T00:00:00Z"),
                entry(&server, 2, name.as_str(), true, "2024-06-01T00:00:00Z"),
            ]
        }));
    });
    let page2 = server.mock(|when, then| {
        when.method(GET).path(ARTIFACTS_PATH).query_param("page", "2");
        then.status(200).json_body(json!({
            "total_count": 3,
            "artifacts": [entry(&server, 3, name.as_str(), false, "2024-03-01T00:00:00Z")]
        }));
    });

    let listed = store(&server).list(&name, &CancelToken::new()).unwrap();
    page1.assert_hits(1);
    page2.assert_hits(1);
    let locators: Vec<_> = listed.iter().map(|a| a.locator.clone()).collect();
    assert_eq!(locators, [server.url("/download/3"), server.url("/download/1")]);
    assert!(listed[0].created_at > listed[1].created_at);
}

#[test]
fn entries_for_other_names_are_dropped() {
    let server = MockServer::start();
    let name = name();
    server.mock(|when, then| {
        when.method(GET).path(ARTIFACTS_PATH);
        then.status(200).json_body(json!({
            "artifacts": [entry(&server, 9, "ios-prefix-match", false, "2024-01-01T00:00:00Z")]
        }));
    });
    assert!(store(&server).list(&name, &CancelToken::new()).unwrap().is_empty());
}

#[test]
fn missing_token_reports_no_results_without_requests() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path(ARTIFACTS_PATH);
        then.status(200).json_body(json!({ "artifacts": [] }));
    });

    let store = CiArtifactStore::new(settings(&server, None));
    assert!(!store.is_enabled());
    assert!(store.list(&name(), &CancelToken::new()).unwrap().is_empty());
    mock.assert_hits(0);
}

#[test]
fn server_errors_are_retried_then_reported() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path(ARTIFACTS_PATH);
        then.status(502);
    });

    let err = store(&server).list(&name(), &CancelToken::new()).unwrap_err();
    assert!(matches!(err, CacheError::Http { status: Some(502), .. }));
    mock.assert_hits(2);
}

#[test]
fn client_errors_are_not_retried() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path(ARTIFACTS_PATH);
        then.status(401);
    });

    let err = store(&server).list(&name(), &CancelToken::new()).unwrap_err();
    assert!(matches!(err, CacheError::Http { status: Some(401), .. }));
    mock.assert_hits(1);
}

#[test]
fn malformed_listing_is_an_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path(ARTIFACTS_PATH);
        then.status(200).body("<html>rate limited</html>");
    });
    let err = store(&server).list(&name(), &CancelToken::new()).unwrap_err();
    assert!(matches!(err, CacheError::MalformedResponse { .. }));
}

#[test]
fn download_unpacks_the_zip_into_the_local_store() {
    let tmp = tempfile::tempdir().unwrap();
    let app = tmp.path().join("Sample.app");
    fs::create_dir_all(&app).unwrap();
    fs::write(app.join("Info.plist"), "plist").unwrap();
    fs::write(app.join("Sample"), "binary").unwrap();
    let mut zip = Cursor::new(Vec::new());
    write_zip(&app, name().as_str(), &mut zip).unwrap();

    let server = MockServer::start();
    let listing = server.mock(|when, then| {
        when.method(GET).path(ARTIFACTS_PATH);
        then.status(200).json_body(json!({
            "artifacts": [entry(&server, 4, name().as_str(), false, "2024-01-01T00:00:00Z")]
        }));
    });
    let download = server.mock(|when, then| {
        when.method(GET).path("/download/4");
        then.status(200).body(zip.into_inner());
    });

    let store = store(&server);
    let local = LocalCacheStore::new(tmp.path().join("cache"));
    let cancel = CancelToken::new();
    let newest = store.list(&name(), &cancel).unwrap().remove(0);
    let artifact = store.download(&newest, &local, &cancel).unwrap();
    listing.assert_hits(1);
    download.assert_hits(1);

    assert_eq!(artifact.path, local.entry_path(&name()));
    assert_eq!(fs::read_to_string(artifact.path.join("Info.plist")).unwrap(), "plist");
    assert_eq!(fs::read_to_string(artifact.path.join("Sample")).unwrap(), "binary");
}

#[test]
fn failed_download_publishes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/download/5");
        then.status(200).body("this is not a zip archive");
    });

    let local = LocalCacheStore::new(tmp.path().join("cache"));
    let artifact = prebuilt_cache::RemoteArtifact {
        name: name(),
        locator: server.url("/download/5"),
        created_at: None,
    };
    assert!(store(&server)
        .download(&artifact, &local, &CancelToken::new())
        .is_err());
    assert_eq!(local.get(&name()), None);
    assert_eq!(fs::read_dir(local.staging_dir()).unwrap().count(), 0);
}

#[test]
fn upload_posts_a_zip_named_after_the_artifact() {
    let tmp = tempfile::tempdir().unwrap();
    let apk = tmp.path().join("app.apk");
    fs::write(&apk, "apk").unwrap();

    let server = MockServer::start();
    let upload = server.mock(|when, then| {
        when.method(POST)
            .path(ARTIFACTS_PATH)
            .query_param("name", name().as_str())
            .header("content-type", "application/zip")
            .header("authorization", "Bearer t0k");
        then.status(201);
    });

    store(&server)
        .upload(&apk, &name(), &CancelToken::new())
        .unwrap();
    upload.assert_hits(1);
}

#[test]
fn upload_is_attempted_once() {
    let tmp = tempfile::tempdir().unwrap();
    let apk = tmp.path().join("app.apk");
    fs::write(&apk, "apk").unwrap();

    let server = MockServer::start();
    let upload = server.mock(|when, then| {
        when.method(POST).path(ARTIFACTS_PATH);
        then.status(503);
    });

    assert!(store(&server)
        .upload(&apk, &name(), &CancelToken::new())
        .is_err());
    upload.assert_hits(1);
}

#[test]
fn delete_removes_every_match() {
    let server = MockServer::start();
    let name = name();
    server.mock(|when, then| {
        when.method(GET).path(ARTIFACTS_PATH);
        then.status(200).json_body(json!({
            "artifacts": [
                entry(&server, 11, name.as_str(), false, "2024-01-01T00:00:00Z"),
            ]
        }));
    });
    let delete = server.mock(|when, then| {
        when.method(DELETE).path(format!("{ARTIFACTS_PATH}/11"));
        then.status(204);
    });

    assert!(store(&server).delete(&name, &CancelToken::new()).unwrap());
    delete.assert_hits(1);
}
