//! Harvest coordinator
//!
//! One [`Harvester::run`] drives a collection from whatever state it was
//! left in towards "complete and ready to upload":
//!
//! 1. Read the metadata log and the checkpoint.
//! 2. Queue every logged record the checkpoint does not cover.
//! 3. Unless the log is complete, crawl from the saved cursor. Each new
//!    record is appended to the log before it is queued, and the cursor is
//!    saved once a page has been fully appended.
//! 4. Meanwhile, collect worker outcomes and flush the checkpoint every
//!    `flush_interval` successes and once more at the end.
//! 5. If the crawl completed, optionally seal the date directories and ask
//!    the archive whether the collection is already published.
//!
//! The coordinator is the only writer of the log, the cursor and the
//! checkpoint.

use crate::checkpoint::ProgressCheckpoint;
use crate::config::HarvestConfig;
use crate::crawl::{Crawl, CrawlRequest, PageCallback};
use crate::cursor::CursorStore;
use crate::error::{IngestError, Result};
use crate::fetch::HttpFetcher;
use crate::layout::CollectionPaths;
use crate::metadata_log::MetadataLog;
use crate::oracle::ArchiveOracle;
use crate::packager::seal_blocking;
use crate::record::Record;
use crate::report::{HarvestReport, Reporter, TracingReporter};
use crate::transform::{FormatConverter, MetadataEmbedder, NoopEmbedder};
use crate::worker::{ItemOutcome, WorkerContext, WorkerPool};
use geoharvest_common::format::format_duration;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the feeding side did during one run
#[derive(Debug, Default)]
struct FeedStats {
    backlog: u64,
    seen: u64,
    logged: u64,
    enqueued: u64,
    crawl_complete: bool,
}

pub struct Harvester {
    config: HarvestConfig,
    account: String,
    embedder: Arc<dyn MetadataEmbedder>,
    converter: Option<Arc<dyn FormatConverter>>,
    oracle: Option<Arc<dyn ArchiveOracle>>,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
}

impl Harvester {
    pub fn new(config: HarvestConfig, account: impl Into<String>) -> Result<Self> {
        config.validate()?;
        let account = account.into();
        if account.trim().is_empty() {
            return Err(IngestError::config("account name must not be empty"));
        }

        Ok(Self {
            config,
            account,
            embedder: Arc::new(NoopEmbedder),
            converter: None,
            oracle: None,
            reporter: Arc::new(TracingReporter),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn MetadataEmbedder>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Required when the configuration asks for WebP output
    pub fn with_converter(mut self, converter: Arc<dyn FormatConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn ArchiveOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run gracefully when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn paths(&self) -> CollectionPaths {
        CollectionPaths::new(self.config.collection_dir(&self.account))
    }

    pub async fn run(self) -> Result<HarvestReport> {
        if self.config.webp && self.converter.is_none() {
            return Err(IngestError::config(
                "WebP output requested but no converter is available",
            ));
        }

        let started = Instant::now();
        let collection = self.config.collection_name(&self.account).to_string();
        let paths = self.paths();
        tokio::fs::create_dir_all(paths.meta_dir()).await?;
        info!(
            collection = %collection,
            dir = %paths.root().display(),
            quality = %self.config.quality,
            workers = self.config.workers,
            "Starting harvest"
        );

        let mut log = MetadataLog::open(metadata_log_path(&paths, self.config.compress_metadata));
        log.repair_tail()?;
        let mut known = log.all_known_ids()?;
        let mut checkpoint = ProgressCheckpoint::load(paths.checkpoint(), self.config.quality)?;
        let completed: Arc<HashSet<String>> =
            Arc::new(checkpoint.completed_ids().map(str::to_string).collect());
        let cursor = CursorStore::new(paths.cursor());
        info!(
            logged = known.len(),
            completed = completed.len(),
            log_complete = log.is_complete(),
            "Loaded collection state"
        );

        let context = WorkerContext {
            paths: paths.clone(),
            layout: self.config.layout,
            quality: self.config.quality,
            fetch: self.config.fetch_config(),
            embedder: Arc::clone(&self.embedder),
            converter: self.converter.clone(),
        };
        let (queue, outcomes, pool) = WorkerPool::spawn(
            context,
            self.config.workers,
            self.config.queue_depth(),
            self.cancel.clone(),
        )?;

        let mut report = HarvestReport::new(collection.clone());
        let (fed, collected) = tokio::join!(
            self.feed(&mut log, &mut known, &completed, &cursor, queue),
            self.collect(outcomes, &mut checkpoint, &mut report),
        );
        pool.join().await;

        // Always persist whatever completed, even when feeding failed
        let flushed = checkpoint.flush();
        let stats = fed?;
        collected?;
        flushed?;

        report.records_seen = stats.seen;
        report.records_logged = stats.logged;
        report.records_enqueued = stats.enqueued;
        report.crawl_complete = stats.crawl_complete;
        report.cancelled = self.cancel.is_cancelled();
        debug!(backlog = stats.backlog, "Feeding finished");

        if report.crawl_complete && !report.cancelled {
            if self.config.package {
                let sealed = seal_blocking(paths.root().to_path_buf()).await?;
                for bundle in &sealed.bundles {
                    self.reporter.bundle_sealed(bundle);
                }
                for (date, reason) in &sealed.failed {
                    warn!(date = %date, reason = %reason, "Date directory not sealed cleanly");
                }
                report.files_sealed = sealed.files_sealed;
                report.bundles = sealed.bundles;
            }
            if let Some(oracle) = &self.oracle {
                let published = oracle.exists(&collection).await;
                report.upload_ready = Some(!published);
                info!(collection = %collection, published, "Checked archive for collection");
            }
        }

        info!(
            collection = %collection,
            downloaded = report.downloaded,
            failed = report.failed,
            elapsed = %format_duration(started.elapsed().as_secs()),
            "Harvest run finished"
        );
        self.reporter.harvest_finished(&report);
        Ok(report)
    }

    /// Replay the backlog, then crawl; owns the queue sender so the workers
    /// see the queue close when this returns
    async fn feed(
        &self,
        log: &mut MetadataLog,
        known: &mut HashSet<String>,
        completed: &Arc<HashSet<String>>,
        cursor: &CursorStore,
        queue: mpsc::Sender<Record>,
    ) -> Result<FeedStats> {
        let mut stats = FeedStats::default();

        let mut enqueued = self.replay_backlog(log, completed, &queue).await?;
        stats.backlog = enqueued.len() as u64;
        stats.enqueued = stats.backlog;
        self.reporter.backlog_replayed(stats.backlog);
        if self.cancel.is_cancelled() {
            return Ok(stats);
        }

        if log.is_complete() {
            info!("Metadata log is complete, skipping crawl");
            stats.crawl_complete = true;
            return Ok(stats);
        }

        let mut crawl = self.start_crawl(cursor)?;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Crawl interrupted");
                    return Ok(stats);
                },
                next = crawl.next_record() => next?,
            };
            let Some(record) = next else {
                break;
            };

            stats.seen += 1;
            if !record.has_id() {
                warn!("Skipping record without id");
                continue;
            }
            if known.contains(&record.id) {
                continue;
            }

            log.append(&record)?;
            known.insert(record.id.clone());
            stats.logged += 1;

            if completed.contains(&record.id) || !enqueued.insert(record.id.clone()) {
                continue;
            }
            if !self.enqueue(&queue, record).await {
                return Ok(stats);
            }
            stats.enqueued += 1;
        }

        log.mark_complete()?;
        stats.crawl_complete = true;
        info!(
            pages = crawl.pages_fetched(),
            records = crawl.records_fetched(),
            new = stats.logged,
            "Crawl complete"
        );
        Ok(stats)
    }

    /// Queue every logged record the checkpoint does not cover
    ///
    /// The scan reads the whole log, so it runs on the blocking pool. Appends
    /// and cursor saves during the crawl stay inline: one line write per
    /// record and one small file replace per page.
    async fn replay_backlog(
        &self,
        log: &MetadataLog,
        completed: &Arc<HashSet<String>>,
        queue: &mpsc::Sender<Record>,
    ) -> Result<HashSet<String>> {
        let stream = log.stream()?;
        let completed = Arc::clone(completed);
        let queue = queue.clone();
        let cancel = self.cancel.clone();
        let reporter = Arc::clone(&self.reporter);

        tokio::task::spawn_blocking(move || -> Result<HashSet<String>> {
            let mut enqueued = HashSet::new();
            for record in stream {
                let record = record?;
                if cancel.is_cancelled() {
                    break;
                }
                let skip = !record.has_id()
                    || completed.contains(&record.id)
                    || enqueued.contains(&record.id);
                if skip {
                    continue;
                }
                let id = record.id.clone();
                // Fails once every worker has stopped
                if queue.blocking_send(record).is_err() {
                    break;
                }
                reporter.record_enqueued(&id);
                enqueued.insert(id);
            }
            Ok(enqueued)
        })
        .await?
    }

    fn start_crawl(&self, cursor: &CursorStore) -> Result<Crawl> {
        let request = CrawlRequest {
            endpoint: self.config.images_endpoint(),
            account: self.account.clone(),
            quality: self.config.quality,
            bbox: self.config.bbox,
            page_size: self.config.page_size,
            resume_from: cursor.load()?,
            inter_page_delay: self.config.inter_page_delay,
        };
        let fetcher = HttpFetcher::new(&self.config.fetch_config())?;

        let store = cursor.clone();
        let reporter = Arc::clone(&self.reporter);
        let mut page = 0u64;
        let on_page: PageCallback = Box::new(move |next: Option<&str>| -> Result<()> {
            page += 1;
            store.save(next)?;
            reporter.page_consumed(page, next.is_some());
            Ok(())
        });

        Ok(Crawl::new(fetcher, request)?.with_page_callback(on_page))
    }

    async fn enqueue(&self, queue: &mpsc::Sender<Record>, record: Record) -> bool {
        let id = record.id.clone();
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = queue.send(record) => sent.is_ok(),
        };
        if sent {
            self.reporter.record_enqueued(&id);
        }
        sent
    }

    async fn collect(
        &self,
        mut outcomes: mpsc::Receiver<ItemOutcome>,
        checkpoint: &mut ProgressCheckpoint,
        report: &mut HarvestReport,
    ) -> Result<()> {
        let mut flush_error = None;

        while let Some(outcome) = outcomes.recv().await {
            self.reporter.item_finished(&outcome);
            report.record_outcome(&outcome);
            if !outcome.success {
                continue;
            }

            checkpoint.record(outcome.id);
            if flush_error.is_none() && checkpoint.unflushed() >= self.config.flush_interval {
                if let Err(e) = checkpoint.flush() {
                    error!(error = %e, "Checkpoint flush failed, stopping harvest");
                    self.cancel.cancel();
                    flush_error = Some(e);
                }
            }
        }

        flush_error.map_or(Ok(()), Err)
    }
}

/// Keep using an existing log even if the compression setting changed
fn metadata_log_path(paths: &CollectionPaths, compressed: bool) -> PathBuf {
    let preferred = paths.metadata_log(compressed);
    let other = paths.metadata_log(!compressed);
    if !preferred.exists() && other.exists() {
        info!(path = %other.display(), "Continuing existing metadata log");
        other
    } else {
        preferred
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::StagingLayout;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = HarvestConfig {
            workers: 0,
            ..HarvestConfig::default()
        };
        assert!(Harvester::new(config, "alice").is_err());
        assert!(Harvester::new(HarvestConfig::default(), "  ").is_err());
    }

    #[test]
    fn test_paths_follow_collection_name() {
        let config = HarvestConfig {
            output_root: PathBuf::from("/data"),
            quality: geoharvest_common::Quality::Thumb1024,
            webp: true,
            ..HarvestConfig::default()
        };
        let harvester = Harvester::new(config, "alice").unwrap();
        assert_eq!(
            harvester.paths().root(),
            PathBuf::from("/data/mapillary-alice-1024-webp")
        );
    }

    #[tokio::test]
    async fn test_webp_without_converter_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarvestConfig {
            output_root: dir.path().to_path_buf(),
            webp: true,
            layout: StagingLayout::Sequence,
            ..HarvestConfig::default()
        };
        let err = Harvester::new(config, "alice").unwrap().run().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_existing_log_is_kept_when_compression_changes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CollectionPaths::new(dir.path());
        std::fs::create_dir_all(paths.meta_dir()).unwrap();
        std::fs::write(paths.metadata_log(false), b"").unwrap();

        assert_eq!(metadata_log_path(&paths, true), paths.metadata_log(false));
        assert_eq!(metadata_log_path(&paths, false), paths.metadata_log(false));
    }
}
