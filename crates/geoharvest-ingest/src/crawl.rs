//! Paginated crawl of an account's images
//!
//! [`Crawl`] turns the cursor-paginated images endpoint into a lazy sequence
//! of [`Record`]s. After the last record of a page has been handed out, and
//! before the next page is requested, the page callback receives the next
//! cursor so the caller can persist it.
//!
//! Because the callback only fires once the consumer has pulled past the
//! page, everything the consumer did with that page's records (logging them)
//! is already durable when the cursor advances. A crash can re-deliver at
//! most one page; it never skips one.

use crate::config::BoundingBox;
use crate::error::{IngestError, Result};
use crate::fetch::HttpFetcher;
use crate::record::{requested_fields, Record};
use futures::Stream;
use geoharvest_common::Quality;
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

/// Called with the next cursor after each page is consumed; `None` means the
/// crawl is exhausted
pub type PageCallback = Box<dyn FnMut(Option<&str>) -> Result<()> + Send>;

/// One page of the images endpoint
#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    data: Vec<Record>,
    #[serde(default)]
    paging: Paging,
}

#[derive(Debug, Default, Deserialize)]
struct Paging {
    next: Option<String>,
}

/// What to crawl
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    /// Full URL of the images endpoint
    pub endpoint: String,
    pub account: String,
    pub quality: Quality,
    pub bbox: Option<BoundingBox>,
    pub page_size: u32,
    /// Continuation URL from a previous run
    pub resume_from: Option<String>,
    pub inter_page_delay: Duration,
}

impl CrawlRequest {
    fn first_page_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("creator_username", self.account.clone()),
            ("limit", self.page_size.to_string()),
            ("fields", requested_fields(self.quality)),
        ];
        if let Some(bbox) = &self.bbox {
            params.push(("bbox", bbox.to_string()));
        }
        params
    }
}

enum State {
    /// First request still to be sent, with query parameters
    Start,
    /// Next page to request, with no parameters
    Next(String),
    Exhausted,
}

/// Lazy, single-use crawl over the images endpoint
pub struct Crawl {
    fetcher: HttpFetcher,
    request: CrawlRequest,
    on_page: Option<PageCallback>,
    state: State,
    buffer: VecDeque<Record>,
    /// Cursor to report once `buffer` drains
    pending_cursor: Option<Option<String>>,
    pages: u64,
    fetched: u64,
}

impl Crawl {
    /// Start a crawl; a resume cursor must be an absolute http(s) URL
    pub fn new(fetcher: HttpFetcher, request: CrawlRequest) -> Result<Self> {
        let state = match &request.resume_from {
            Some(cursor) => {
                validate_cursor(cursor)?;
                info!(account = %request.account, "Resuming crawl from saved cursor");
                State::Next(cursor.clone())
            },
            None => State::Start,
        };

        Ok(Self {
            fetcher,
            request,
            on_page: None,
            state,
            buffer: VecDeque::new(),
            pending_cursor: None,
            pages: 0,
            fetched: 0,
        })
    }

    pub fn with_page_callback(mut self, callback: PageCallback) -> Self {
        self.on_page = Some(callback);
        self
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages
    }

    pub fn records_fetched(&self) -> u64 {
        self.fetched
    }

    /// Next record, or `None` once the last page has been consumed
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }

            if let Some(cursor) = self.pending_cursor.take() {
                if let Some(callback) = self.on_page.as_mut() {
                    callback(cursor.as_deref())?;
                }
                if cursor.is_some() && !self.request.inter_page_delay.is_zero() {
                    tokio::time::sleep(self.request.inter_page_delay).await;
                }
            }

            let page = match std::mem::replace(&mut self.state, State::Exhausted) {
                State::Exhausted => return Ok(None),
                State::Start => {
                    let params = self.request.first_page_params();
                    self.fetcher
                        .get_json::<Page>(&self.request.endpoint, Some(&params))
                        .await?
                },
                State::Next(url) => self.fetcher.get_json::<Page>(&url, None).await?,
            };

            self.pages += 1;
            self.fetched += page.data.len() as u64;
            info!(
                account = %self.request.account,
                page = self.pages,
                records = page.data.len(),
                total = self.fetched,
                "Fetched metadata page"
            );

            let next = page.paging.next.filter(|n| !n.is_empty());
            if let Some(next_url) = &next {
                debug!(next = %next_url, "Next page cursor");
                validate_cursor(next_url)?;
                self.state = State::Next(next_url.clone());
            }
            self.pending_cursor = Some(next);
            self.buffer.extend(page.data);
        }
    }

    /// Adapt the crawl into a `Stream`
    pub fn into_stream(self) -> impl Stream<Item = Result<Record>> + Send {
        futures::stream::try_unfold(self, |mut crawl| async move {
            let next = crawl.next_record().await?;
            Ok::<_, IngestError>(next.map(|record| (record, crawl)))
        })
    }
}

/// Cursors are continuation URLs; anything else cannot be resumed from
pub fn validate_cursor(cursor: &str) -> Result<()> {
    match url::Url::parse(cursor) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(()),
        _ => Err(IngestError::InvalidCursor(cursor.to_string())),
    }
}
