//! Integration tests for the artifact repository.

use depot::{PublishRequest, RepoConfig, Repository, Retrieved};
use serde_json::json;
use tempfile::TempDir;

fn test_repo(dir: &TempDir) -> Repository {
    // Route repository logs through the test harness; ignore repeat installs.
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    Repository::create(RepoConfig {
        blob_cache_size: 16,
        ..RepoConfig::in_dir(dir.path())
    })
    .unwrap()
}

fn contents(retrieved: Retrieved) -> Vec<u8> {
    match retrieved {
        Retrieved::Local(download) => download.contents,
        Retrieved::Redirect(url) => panic!("unexpected redirect to {}", url),
    }
}

// --- Publishing ---

#[test]
fn test_publish_new_artifact() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    repo.publish(PublishRequest::new("colony", "1.0.0").data(b"first build".to_vec()))
        .unwrap();

    assert_eq!(repo.packages().len(), 1);
    assert_eq!(repo.artifacts("colony").len(), 1);

    let on_disk = std::fs::read(dir.path().join("repo/colony/1.0.0")).unwrap();
    assert_eq!(on_disk, b"first build");

    let bytes = contents(repo.retrieve(Some("colony"), Some("1.0.0")).unwrap());
    assert_eq!(bytes, b"first build");
}

#[test]
fn test_replace_overwrites_record_and_file() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    let first = repo
        .publish(
            PublishRequest::new("colony", "1.0.0")
                .data(b"old".to_vec())
                .content_type("text/plain"),
        )
        .unwrap();
    let second = repo
        .publish(
            PublishRequest::new("colony", "1.0.0")
                .data(b"new".to_vec())
                .content_type("application/octet-stream"),
        )
        .unwrap();

    // Same record, updated in place.
    assert_eq!(first.id, second.id);
    assert_eq!(first.key, second.key);
    assert_eq!(repo.artifacts("colony").len(), 1);
    assert_eq!(second.content_type.as_deref(), Some("application/octet-stream"));

    let bytes = contents(repo.retrieve(Some("colony"), Some("1.0.0")).unwrap());
    assert_eq!(bytes, b"new");
}

#[test]
fn test_publish_into_existing_package_keeps_it() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    repo.publish(
        PublishRequest::new("colony", "1.0.0")
            .identifier("colony-id")
            .kind("zip")
            .data(b"a".to_vec()),
    )
    .unwrap();
    repo.publish(
        PublishRequest::new("colony", "2.0.0")
            .identifier("ignored")
            .kind("ignored")
            .data(b"b".to_vec()),
    )
    .unwrap();

    let package = repo.package("colony").unwrap();
    assert_eq!(package.identifier, "colony-id");
    assert_eq!(package.kind.as_deref(), Some("zip"));
    assert_eq!(package.latest.as_deref(), Some("2.0.0"));
    assert_eq!(repo.packages().len(), 1);
}

#[test]
fn test_import_file_and_url_use_artifact_kind() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    repo.import_file("tool", "1.0", b"bin".to_vec(), Some("application/octet-stream"), true)
        .unwrap();
    repo.import_url("docs", "1.0", "https://example.com/docs.tar.gz", true)
        .unwrap();

    assert_eq!(repo.package("tool").unwrap().kind.as_deref(), Some("artifact"));
    assert_eq!(repo.package("docs").unwrap().kind.as_deref(), Some("artifact"));

    match repo.retrieve(Some("tool"), None).unwrap() {
        Retrieved::Local(download) => assert_eq!(download.file_name, "tool-1.0.artifact"),
        other => panic!("expected local payload, got {:?}", other),
    }
}

#[test]
fn test_upload_artifact_records_branch() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    repo.create_package("colony", None, Some("zip")).unwrap();
    let artifact = repo
        .upload_artifact("colony", "nightly", "develop", Some(b"n".to_vec()))
        .unwrap();

    assert_eq!(artifact.branch(), Some("develop"));
    assert!(artifact.timestamp().is_some());
}

// --- Version Resolution ---

#[test]
fn test_latest_uses_string_order() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    for version in ["1.0.0", "2.0.0", "10.0.0"] {
        repo.publish(PublishRequest::new("colony", version).data(version.as_bytes().to_vec()))
            .unwrap();
    }

    // "2.0.0" > "10.0.0" as strings.
    let artifact = repo.artifact(Some("colony"), None).unwrap();
    assert_eq!(artifact.version, "2.0.0");

    let bytes = contents(repo.retrieve(Some("colony"), None).unwrap());
    assert_eq!(bytes, b"2.0.0");

    // Empty filters behave like absent ones.
    let artifact = repo.artifact(Some("colony"), Some("")).unwrap();
    assert_eq!(artifact.version, "2.0.0");
}

#[test]
fn test_retrieve_without_package_spans_all_packages() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    repo.publish(PublishRequest::new("alpha", "1.0").data(b"a".to_vec())).unwrap();
    repo.publish(PublishRequest::new("beta", "3.0").data(b"b".to_vec())).unwrap();

    let bytes = contents(repo.retrieve(None, None).unwrap());
    assert_eq!(bytes, b"b");
}

#[test]
fn test_url_artifact_redirects() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    let artifact = repo
        .publish(PublishRequest::new("colony", "1.0.0").url("https://example.com/colony.zip"))
        .unwrap();
    assert!(!artifact.is_local());

    let retrieved = repo.retrieve(Some("colony"), Some("1.0.0")).unwrap();
    assert_eq!(
        retrieved,
        Retrieved::Redirect("https://example.com/colony.zip".to_string())
    );
}

#[test]
fn test_retrieve_by_key_reaches_one_artifact() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    let one = repo
        .publish(PublishRequest::new("colony", "1.0.0").data(b"one".to_vec()))
        .unwrap();
    repo.publish(PublishRequest::new("colony", "2.0.0").data(b"two".to_vec()))
        .unwrap();

    let bytes = contents(repo.retrieve_by_key(&one.key).unwrap());
    assert_eq!(bytes, b"one");
}

#[test]
fn test_info_lookup() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    let mut info = depot::Info::new();
    info.insert("commit".into(), json!("abc123"));
    repo.publish(PublishRequest::new("colony", "1.0.0").url("https://example.com/a").info(info))
        .unwrap();

    let info = repo.info("colony", None).unwrap().unwrap();
    assert_eq!(info["commit"], "abc123");
    let keys: Vec<&str> = info.keys().map(String::as_str).collect();
    assert_eq!(keys, ["commit", "timestamp"]);
}

// --- Package Bookkeeping ---

#[test]
fn test_set_branches_in_creation_order() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    repo.publish(PublishRequest::new("colony", "1").branch("master").url("u1")).unwrap();
    repo.publish(PublishRequest::new("colony", "2").branch("develop").url("u2")).unwrap();
    repo.publish(PublishRequest::new("colony", "3").branch("master").url("u3")).unwrap();
    repo.publish(PublishRequest::new("colony", "4").url("u4")).unwrap();

    let package = repo.set_branches("colony").unwrap();
    assert_eq!(package.branches, vec!["master".to_string(), "develop".to_string()]);

    // Persisted with the package.
    assert_eq!(repo.package("colony").unwrap().branches, package.branches);
}

#[test]
fn test_artifacts_listed_newest_first() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    for version in ["b", "a", "c"] {
        repo.publish(PublishRequest::new("colony", version).info(depot::Info::new()).url("u"))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    let versions: Vec<String> = repo
        .artifacts("colony")
        .into_iter()
        .map(|artifact| artifact.version)
        .collect();
    assert_eq!(versions, ["c", "a", "b"]);
}

#[test]
fn test_delete_package_cascades() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    repo.publish(PublishRequest::new("colony", "1.0.0").data(b"a".to_vec())).unwrap();
    repo.publish(PublishRequest::new("colony", "2.0.0").url("https://example.com/b")).unwrap();
    repo.publish(PublishRequest::new("other", "1.0.0").data(b"c".to_vec())).unwrap();

    let removed = repo.delete_package("colony").unwrap();
    assert_eq!(removed, 2);

    assert!(repo.artifacts("colony").is_empty());
    assert!(matches!(
        repo.retrieve(Some("colony"), None),
        Err(depot::RepoError::NotFound(_))
    ));
    assert!(!dir.path().join("repo/colony/1.0.0").exists());

    // Unrelated packages untouched.
    assert_eq!(contents(repo.retrieve(Some("other"), None).unwrap()), b"c");
    assert!(repo.check_consistency().unwrap().is_clean());
}

// --- Consistency ---

#[test]
fn test_consistency_reports_missing_and_untracked() {
    let dir = TempDir::new().unwrap();
    let repo = test_repo(&dir);

    repo.publish(PublishRequest::new("colony", "1.0.0").data(b"a".to_vec())).unwrap();
    assert_eq!(contents(repo.retrieve(Some("colony"), Some("1.0.0")).unwrap()), b"a");
    assert!(repo.check_consistency().unwrap().is_clean());

    std::fs::remove_file(dir.path().join("repo/colony/1.0.0")).unwrap();
    std::fs::write(dir.path().join("repo/stray.bin"), b"stray").unwrap();

    // The payload was cached by the earlier retrieve.
    assert!(matches!(
        repo.retrieve(Some("colony"), Some("1.0.0")),
        Err(depot::RepoError::ReferentialInconsistency(_))
    ));

    let report = repo.check_consistency().unwrap();
    assert_eq!(
        report.missing_payloads,
        vec![("colony".to_string(), "1.0.0".to_string())]
    );
    assert_eq!(report.untracked_files, vec!["stray.bin".to_string()]);
    assert!(report.orphan_artifacts.is_empty());
}

// --- Persistence ---

#[test]
fn test_reopen_preserves_everything() {
    let dir = TempDir::new().unwrap();
    let config = RepoConfig::in_dir(dir.path());

    {
        let repo = Repository::create(config.clone()).unwrap();
        repo.publish(PublishRequest::new("colony", "1.0.0").data(b"a".to_vec()).branch("master"))
            .unwrap();
        repo.set_branches("colony").unwrap();
    }

    let repo = Repository::open_or_create(config).unwrap();
    let package = repo.package("colony").unwrap();
    assert_eq!(package.latest.as_deref(), Some("1.0.0"));
    assert_eq!(package.branches, vec!["master".to_string()]);
    assert_eq!(contents(repo.retrieve(Some("colony"), None).unwrap()), b"a");

    // Ids keep counting after reopen.
    let next = repo
        .publish(PublishRequest::new("colony", "2.0.0").data(b"b".to_vec()))
        .unwrap();
    assert!(next.id > repo.artifact(Some("colony"), Some("1.0.0")).unwrap().id);
}
