//! End-to-end tests for the harvest coordinator
//!
//! A wiremock server stands in for both the images API and the asset CDN.
//! These tests cover:
//! - Quality selection, staging paths and checkpoint contents
//! - Idempotent resume and crash recovery from a saved cursor
//! - Per-item failures that never abort the run
//! - Packaging and the archive existence check

use async_trait::async_trait;
use geoharvest_common::Quality;
use geoharvest_ingest::cursor::CursorStore;
use geoharvest_ingest::fetch::BackoffPolicy;
use geoharvest_ingest::layout::CollectionPaths;
use geoharvest_ingest::metadata_log::MetadataLog;
use geoharvest_ingest::oracle::InternetArchiveOracle;
use geoharvest_ingest::transform::{ExifTag, MetadataEmbedder, TransformError};
use geoharvest_ingest::{HarvestConfig, Harvester, IngestError, Record, StagingLayout};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JPEG_BODY: &[u8] = b"\xFF\xD8\xFF\xE0 fake jpeg body";

/// Embedder that remembers every call instead of running exiftool
#[derive(Default)]
struct RecordingEmbedder {
    calls: Mutex<Vec<(PathBuf, Vec<ExifTag>)>>,
}

impl RecordingEmbedder {
    fn tag_value(&self, name: &str) -> Option<String> {
        let calls = self.calls.lock().unwrap();
        calls
            .iter()
            .flat_map(|(_, tags)| tags.iter())
            .find(|tag| tag.name == name)
            .map(|tag| tag.value.clone())
    }
}

#[async_trait]
impl MetadataEmbedder for RecordingEmbedder {
    async fn embed(&self, path: &Path, tags: &[ExifTag]) -> Result<(), TransformError> {
        self.calls
            .lock()
            .unwrap()
            .push((path.to_path_buf(), tags.to_vec()));
        Ok(())
    }
}

fn test_config(server: &MockServer, output: &Path) -> HarvestConfig {
    HarvestConfig {
        api_base_url: server.uri(),
        archive_base_url: server.uri(),
        output_root: output.to_path_buf(),
        quality: Quality::Thumb1024,
        workers: 2,
        flush_interval: 1,
        backoff: BackoffPolicy::new(2, Duration::from_millis(1)),
        inter_page_delay: Duration::ZERO,
        token: Some("test-token".to_string()),
        ..HarvestConfig::default()
    }
}

fn image(server: &MockServer, id: &str, sequence: &str) -> Value {
    json!({
        "id": id,
        "sequence": sequence,
        "captured_at": 1_705_320_000_000_i64,
        "geometry": {"type": "Point", "coordinates": [13.4, 52.5]},
        "thumb_1024_url": format!("{}/assets/{}.jpg", server.uri(), id),
    })
}

async fn mount_asset(server: &MockServer, id: &str, expected: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/assets/{id}.jpg")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(JPEG_BODY))
        .expect(expected)
        .mount(server)
        .await;
}

async fn mount_first_page(server: &MockServer, data: Vec<Value>, next: Option<String>, expected: u64) {
    Mock::given(method("GET"))
        .and(path("/images"))
        .and(query_param("creator_username", "alice"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": data, "paging": {"next": next}})),
        )
        .expect(expected)
        .mount(server)
        .await;
}

async fn mount_page(server: &MockServer, page_path: &str, data: Vec<Value>, expected: u64) {
    Mock::given(method("GET"))
        .and(path(page_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": data})))
        .expect(expected)
        .mount(server)
        .await;
}

fn checkpoint_json(paths: &CollectionPaths) -> Value {
    serde_json::from_slice(&std::fs::read(paths.checkpoint()).unwrap()).unwrap()
}

fn logged_ids(paths: &CollectionPaths) -> Vec<String> {
    MetadataLog::open(paths.metadata_log(false))
        .stream()
        .unwrap()
        .map(|record| record.unwrap().id)
        .collect()
}

// ============================================================================
// Pipeline
// ============================================================================

#[tokio::test]
async fn test_selected_quality_is_staged_tagged_and_checkpointed() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let record = json!({
        "id": "img1",
        "sequence": "seq1",
        "thumb_1024_url": format!("{}/assets/img1.jpg", server.uri()),
        "thumb_2048_url": format!("{}/assets/img1-2048.jpg", server.uri()),
        "thumb_original_url": format!("{}/assets/img1-original.jpg", server.uri()),
        "computed_compass_angle": 180,
        "compass_angle": 90,
    });
    mount_first_page(&server, vec![record], None, 1).await;
    mount_asset(&server, "img1", 1).await;
    mount_asset(&server, "img1-2048", 0).await;
    mount_asset(&server, "img1-original", 0).await;

    let embedder = Arc::new(RecordingEmbedder::default());
    let harvester = Harvester::new(test_config(&server, dir.path()), "alice")
        .unwrap()
        .with_embedder(embedder.clone());
    let paths = harvester.paths();
    let report = harvester.run().await.unwrap();

    assert_eq!(report.downloaded, 1);
    assert_eq!(report.failed, 0);
    assert!(report.crawl_complete);
    assert_eq!(report.bytes_transferred, JPEG_BODY.len() as u64);

    let asset = dir.path().join("mapillary-alice-1024/seq1/img1.jpg");
    assert_eq!(std::fs::read(&asset).unwrap(), JPEG_BODY);
    assert_eq!(checkpoint_json(&paths), json!({"1024": ["img1"]}));
    assert_eq!(embedder.tag_value("GPSImgDirection").as_deref(), Some("180"));

    let log = MetadataLog::open(paths.metadata_log(false));
    assert_eq!(log.all_known_ids().unwrap().len(), 1);
    assert!(log.is_complete());
    assert_eq!(CursorStore::new(paths.cursor()).load().unwrap(), None);
}

#[tokio::test]
async fn test_pages_are_followed_in_cursor_order() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let next = format!("{}/cursor/2", server.uri());
    mount_first_page(&server, vec![image(&server, "a", "s1"), image(&server, "b", "s1")], Some(next), 1)
        .await;
    mount_page(&server, "/cursor/2", vec![image(&server, "c", "s2")], 1).await;
    for id in ["a", "b", "c"] {
        mount_asset(&server, id, 1).await;
    }

    let harvester = Harvester::new(test_config(&server, dir.path()), "alice").unwrap();
    let paths = harvester.paths();
    let report = harvester.run().await.unwrap();

    assert_eq!(report.records_seen, 3);
    assert_eq!(report.records_logged, 3);
    assert_eq!(report.downloaded, 3);
    assert_eq!(logged_ids(&paths), ["a", "b", "c"]);
    assert!(paths.root().join("s2/c.jpg").exists());
}

// ============================================================================
// Resume
// ============================================================================

#[tokio::test]
async fn test_second_run_downloads_nothing() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_first_page(&server, vec![image(&server, "a", "s1"), image(&server, "b", "s1")], None, 1).await;
    mount_asset(&server, "a", 1).await;
    mount_asset(&server, "b", 1).await;

    let first = Harvester::new(test_config(&server, dir.path()), "alice")
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(first.downloaded, 2);

    let second = Harvester::new(test_config(&server, dir.path()), "alice")
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.records_enqueued, 0);
    assert!(second.crawl_complete);
}

#[tokio::test]
async fn test_resume_after_cursor_saved_loses_nothing() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let paths = CollectionPaths::new(config.collection_dir("alice"));

    // State left by a process killed right after the first page's cursor was saved
    let mut log = MetadataLog::open(paths.metadata_log(false));
    for id in ["a", "b"] {
        let record: Record = serde_json::from_value(image(&server, id, "s1")).unwrap();
        log.append(&record).unwrap();
    }
    CursorStore::new(paths.cursor())
        .save(Some(&format!("{}/cursor/2", server.uri())))
        .unwrap();

    mount_first_page(&server, vec![], None, 0).await;
    mount_page(&server, "/cursor/2", vec![image(&server, "c", "s2")], 1).await;
    for id in ["a", "b", "c"] {
        mount_asset(&server, id, 1).await;
    }

    let report = Harvester::new(config, "alice").unwrap().run().await.unwrap();

    assert_eq!(report.downloaded, 3);
    assert_eq!(report.records_logged, 1);
    assert_eq!(logged_ids(&paths), ["a", "b", "c"]);
    assert_eq!(checkpoint_json(&paths), json!({"1024": ["a", "b", "c"]}));
}

#[tokio::test]
async fn test_redelivered_page_is_not_logged_twice() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let paths = CollectionPaths::new(config.collection_dir("alice"));

    // Killed after appending the page but before its cursor was saved
    let mut log = MetadataLog::open(paths.metadata_log(false));
    let record: Record = serde_json::from_value(image(&server, "a", "s1")).unwrap();
    log.append(&record).unwrap();

    mount_first_page(&server, vec![image(&server, "a", "s1"), image(&server, "b", "s1")], None, 1).await;
    mount_asset(&server, "a", 1).await;
    mount_asset(&server, "b", 1).await;

    let report = Harvester::new(config, "alice").unwrap().run().await.unwrap();

    assert_eq!(report.records_seen, 2);
    assert_eq!(report.records_logged, 1);
    assert_eq!(report.downloaded, 2);
    assert_eq!(logged_ids(&paths), ["a", "b"]);
}

#[tokio::test]
async fn test_torn_compressed_log_resumes() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = HarvestConfig {
        compress_metadata: true,
        ..test_config(&server, dir.path())
    };
    let paths = CollectionPaths::new(config.collection_dir("alice"));

    // Killed while appending "b", before the page's cursor was saved
    let log_path = paths.metadata_log(true);
    let mut log = MetadataLog::open(&log_path);
    for id in ["a", "b"] {
        let record: Record = serde_json::from_value(image(&server, id, "s1")).unwrap();
        log.append(&record).unwrap();
    }
    drop(log);
    let raw = std::fs::read(&log_path).unwrap();
    std::fs::write(&log_path, &raw[..raw.len() - 3]).unwrap();

    mount_first_page(&server, vec![image(&server, "a", "s1"), image(&server, "b", "s1")], None, 1).await;
    mount_asset(&server, "a", 1).await;
    mount_asset(&server, "b", 1).await;

    let report = Harvester::new(config, "alice").unwrap().run().await.unwrap();

    assert_eq!(report.records_logged, 1);
    assert_eq!(report.downloaded, 2);
    let reopened = MetadataLog::open(&log_path);
    let ids: Vec<String> = reopened.stream().unwrap().map(|r| r.unwrap().id).collect();
    assert_eq!(ids, ["a", "b"]);
    assert!(reopened.is_complete());
}

#[tokio::test]
async fn test_invalid_saved_cursor_is_fatal() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let paths = CollectionPaths::new(config.collection_dir("alice"));

    std::fs::create_dir_all(paths.meta_dir()).unwrap();
    std::fs::write(paths.cursor(), br#"{"next": "after=abc"}"#).unwrap();

    let err = Harvester::new(config, "alice").unwrap().run().await.unwrap_err();
    assert!(matches!(err, IngestError::InvalidCursor(_)));
    assert!(err.is_fatal());
}

// ============================================================================
// Failures and cancellation
// ============================================================================

#[tokio::test]
async fn test_item_failures_are_tallied_not_fatal() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let no_url = json!({"id": "no-url", "sequence": "s1"});
    mount_first_page(
        &server,
        vec![image(&server, "ok", "s1"), image(&server, "gone", "s1"), no_url],
        None,
        1,
    )
    .await;
    mount_asset(&server, "ok", 1).await;
    Mock::given(method("GET"))
        .and(path("/assets/gone.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&server)
        .await;

    let harvester = Harvester::new(test_config(&server, dir.path()), "alice").unwrap();
    let paths = harvester.paths();
    let report = harvester.run().await.unwrap();

    assert_eq!(report.downloaded, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(report.failure_reasons["Download failed"], 1);
    assert_eq!(report.failure_reasons["No 1024 URL"], 1);
    assert_eq!(checkpoint_json(&paths), json!({"1024": ["ok"]}));
    assert!(!paths.root().join("s1/gone.jpg").exists());
}

#[tokio::test]
async fn test_cancelled_run_still_writes_checkpoint() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let harvester = Harvester::new(test_config(&server, dir.path()), "alice").unwrap();
    let paths = harvester.paths();
    harvester.cancellation_token().cancel();

    let report = harvester.run().await.unwrap();

    assert!(report.cancelled);
    assert!(!report.crawl_complete);
    assert_eq!(report.downloaded, 0);
    assert!(paths.checkpoint().exists());
}

// ============================================================================
// Packaging
// ============================================================================

#[tokio::test]
async fn test_completed_crawl_is_sealed_and_checked() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_first_page(&server, vec![image(&server, "a", "s1"), image(&server, "b", "s2")], None, 1).await;
    mount_asset(&server, "a", 1).await;
    mount_asset(&server, "b", 1).await;
    Mock::given(method("GET"))
        .and(path("/metadata/mapillary-alice-1024"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let config = HarvestConfig {
        layout: StagingLayout::Date,
        package: true,
        ..test_config(&server, dir.path())
    };
    let oracle = Arc::new(InternetArchiveOracle::new(server.uri()).unwrap());
    let harvester = Harvester::new(config, "alice").unwrap().with_oracle(oracle);
    let paths = harvester.paths();
    let report = harvester.run().await.unwrap();

    assert_eq!(report.bundles_created(), 1);
    assert_eq!(report.files_sealed, 2);
    assert_eq!(report.upload_ready, Some(true));
    assert!(paths.root().join("2024-01-15.tar").exists());
    assert!(!paths.root().join("2024-01-15").exists());
    assert!(paths.meta_dir().exists());

    let mut archive = tar::Archive::new(std::fs::File::open(paths.root().join("2024-01-15.tar")).unwrap());
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, ["2024-01-15/s1/a.jpg", "2024-01-15/s2/b.jpg"]);
}
