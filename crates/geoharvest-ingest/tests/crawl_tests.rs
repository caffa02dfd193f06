//! Tests for the paginated crawl against a mock images endpoint

use futures::TryStreamExt;
use geoharvest_common::Quality;
use geoharvest_ingest::crawl::{Crawl, CrawlRequest};
use geoharvest_ingest::fetch::{BackoffPolicy, FetchConfig, HttpFetcher};
use geoharvest_ingest::{BoundingBox, IngestError};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

type Cursors = Arc<Mutex<Vec<Option<String>>>>;

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(&FetchConfig {
        backoff: BackoffPolicy::new(2, Duration::from_millis(1)),
        ..FetchConfig::default()
    })
    .unwrap()
}

fn request(server: &MockServer, bbox: Option<BoundingBox>) -> CrawlRequest {
    CrawlRequest {
        endpoint: format!("{}/images", server.uri()),
        account: "alice".to_string(),
        quality: Quality::Thumb2048,
        bbox,
        page_size: 2,
        resume_from: None,
        inter_page_delay: Duration::ZERO,
    }
}

fn recording_crawl(server: &MockServer, bbox: Option<BoundingBox>) -> (Crawl, Cursors) {
    let cursors: Cursors = Arc::default();
    let sink = Arc::clone(&cursors);
    let crawl = Crawl::new(fetcher(), request(server, bbox))
        .unwrap()
        .with_page_callback(Box::new(move |next: Option<&str>| -> geoharvest_ingest::Result<()> {
            sink.lock().unwrap().push(next.map(str::to_string));
            Ok(())
        }));
    (crawl, cursors)
}

async fn mount_two_pages(server: &MockServer) -> String {
    let next = format!("{}/images/after/xyz", server.uri());
    Mock::given(method("GET"))
        .and(path("/images"))
        .and(query_param("creator_username", "alice"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "1"}, {"id": "2"}],
            "paging": {"next": next},
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/images/after/xyz"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "3"}],
            "paging": {},
        })))
        .expect(1)
        .mount(server)
        .await;
    next
}

#[tokio::test]
async fn test_first_request_carries_fields_and_bbox() {
    let server = MockServer::start().await;
    let fields = geoharvest_ingest::record::requested_fields(Quality::Thumb2048);
    Mock::given(method("GET"))
        .and(path("/images"))
        .and(query_param("bbox", "-1,-2,3,4"))
        .and(query_param("fields", fields.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "1"}]})))
        .expect(1)
        .mount(&server)
        .await;

    let bbox = BoundingBox { west: -1.0, south: -2.0, east: 3.0, north: 4.0 };
    let (crawl, cursors) = recording_crawl(&server, Some(bbox));
    let records: Vec<_> = crawl.into_stream().try_collect().await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(*cursors.lock().unwrap(), [None]);
}

#[tokio::test]
async fn test_cursor_reported_only_after_page_consumed() {
    let server = MockServer::start().await;
    let next = mount_two_pages(&server).await;
    let (mut crawl, cursors) = recording_crawl(&server, None);

    assert_eq!(crawl.next_record().await.unwrap().unwrap().id, "1");
    assert_eq!(crawl.next_record().await.unwrap().unwrap().id, "2");
    assert!(cursors.lock().unwrap().is_empty());

    assert_eq!(crawl.next_record().await.unwrap().unwrap().id, "3");
    assert_eq!(*cursors.lock().unwrap(), [Some(next.clone())]);

    assert!(crawl.next_record().await.unwrap().is_none());
    assert_eq!(*cursors.lock().unwrap(), [Some(next), None]);
    assert_eq!(crawl.pages_fetched(), 2);
    assert_eq!(crawl.records_fetched(), 3);
}

#[tokio::test]
async fn test_resume_starts_at_saved_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/images/after/xyz"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "3"}]})))
        .expect(1)
        .mount(&server)
        .await;

    let resume = CrawlRequest {
        resume_from: Some(format!("{}/images/after/xyz", server.uri())),
        ..request(&server, None)
    };
    let records: Vec<_> = Crawl::new(fetcher(), resume)
        .unwrap()
        .into_stream()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "3");
}

#[tokio::test]
async fn test_failed_page_surfaces_after_cursor_saved() {
    let server = MockServer::start().await;
    let next = format!("{}/images/after/broken", server.uri());
    Mock::given(method("GET"))
        .and(path("/images"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "1"}],
            "paging": {"next": next},
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/images/after/broken"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let (mut crawl, cursors) = recording_crawl(&server, None);

    assert_eq!(crawl.next_record().await.unwrap().unwrap().id, "1");
    let err = crawl.next_record().await.unwrap_err();

    assert!(matches!(err, IngestError::TransientNetwork { attempts: 2, .. }));
    // The next run resumes at the page that failed
    assert_eq!(*cursors.lock().unwrap(), [Some(next)]);
}

#[tokio::test]
async fn test_non_url_next_cursor_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/images"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "1"}],
            "paging": {"next": "after=abc"},
        })))
        .mount(&server)
        .await;

    let (mut crawl, _) = recording_crawl(&server, None);
    let err = crawl.next_record().await.unwrap_err();

    assert!(matches!(err, IngestError::InvalidCursor(_)));
}
