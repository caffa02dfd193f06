//! Fetch/transform worker pool
//!
//! Workers pull records from a shared bounded queue, download the asset,
//! embed metadata, optionally convert it, and send back one [`ItemOutcome`]
//! per record. A worker never writes the checkpoint; the coordinator does
//! that from the outcomes.
//!
//! Each item runs under `catch_unwind`, so a panic while processing one
//! record becomes a failed outcome instead of taking the worker down.

use crate::config::StagingLayout;
use crate::error::Result;
use crate::fetch::{FetchConfig, HttpFetcher};
use crate::layout::CollectionPaths;
use crate::record::Record;
use crate::transform::{exif_tags, panorama_tags, FormatConverter, MetadataEmbedder};
use futures::FutureExt;
use geoharvest_common::Quality;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Terminal result for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub id: String,
    pub bytes_transferred: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn succeeded(id: impl Into<String>, bytes: u64) -> Self {
        Self {
            id: id.into(),
            bytes_transferred: bytes,
            success: true,
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, bytes: u64, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bytes_transferred: bytes,
            success: false,
            error: Some(reason.into()),
        }
    }

    /// Failure reason with ids and URLs stripped, for tallying
    pub fn reason_kind(&self) -> Option<&str> {
        self.error
            .as_deref()
            .map(|e| e.split(':').next().unwrap_or(e).trim())
    }
}

/// Everything a worker needs; shared read-only between workers
pub struct WorkerContext {
    pub paths: CollectionPaths,
    pub layout: StagingLayout,
    pub quality: Quality,
    pub fetch: FetchConfig,
    pub embedder: Arc<dyn MetadataEmbedder>,
    pub converter: Option<Arc<dyn FormatConverter>>,
}

/// Handles of the spawned workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks behind a queue holding at most `queue_depth`
    /// records
    ///
    /// The outcome receiver closes once every worker has exited, which
    /// happens after the returned sender is dropped and the queue drains, or
    /// after `cancel` fires.
    pub fn spawn(
        context: WorkerContext,
        workers: usize,
        queue_depth: usize,
        cancel: CancellationToken,
    ) -> Result<(mpsc::Sender<Record>, mpsc::Receiver<ItemOutcome>, WorkerPool)> {
        let workers = workers.max(1);
        let (queue_tx, queue_rx) = mpsc::channel::<Record>(queue_depth.max(1));
        let (outcome_tx, outcome_rx) = mpsc::channel::<ItemOutcome>(queue_depth.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let context = Arc::new(context);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            // Each worker owns its own client and connection pool
            let fetcher = HttpFetcher::new(&context.fetch)?;
            handles.push(tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&context),
                fetcher,
                Arc::clone(&queue_rx),
                outcome_tx.clone(),
                cancel.clone(),
            )));
        }

        debug!(workers, queue_depth, "Worker pool started");
        Ok((queue_tx, outcome_rx, WorkerPool { handles }))
    }

    /// Wait for every worker to exit
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task aborted");
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    context: Arc<WorkerContext>,
    fetcher: HttpFetcher,
    queue: Arc<Mutex<mpsc::Receiver<Record>>>,
    outcomes: mpsc::Sender<ItemOutcome>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            debug!(worker_id, "Worker stopping on cancellation");
            break;
        }

        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                record = queue.recv() => record,
            }
        };
        let Some(record) = next else {
            break;
        };

        let id = record.id.clone();
        let outcome = AssertUnwindSafe(process_item(&context, &fetcher, record))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!(worker_id, id = %id, panic = %message, "Worker panicked on item");
                ItemOutcome::failed(id, 0, format!("Worker panicked: {message}"))
            });

        if outcomes.send(outcome).await.is_err() {
            break;
        }
    }
}

/// Download, embed and convert one record
pub async fn process_item(
    context: &WorkerContext,
    fetcher: &HttpFetcher,
    record: Record,
) -> ItemOutcome {
    if !record.has_id() {
        return ItemOutcome::failed("", 0, "Missing id");
    }
    let id = record.id.as_str();

    let Some(url) = record.asset_url(context.quality) else {
        debug!(id, quality = %context.quality, "No asset URL for quality");
        return ItemOutcome::failed(id, 0, format!("No {} URL", context.quality));
    };

    let dest = context.paths.asset_path(context.layout, &record);
    if let Some(parent) = dest.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return ItemOutcome::failed(id, 0, format!("Staging directory failed: {e}"));
        }
    }

    let bytes = match fetcher.download_to(url, &dest).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(id, error = %e, "Download failed");
            return ItemOutcome::failed(id, 0, format!("Download failed: {e}"));
        },
    };

    let tags = exif_tags(&record);
    if let Err(e) = context.embedder.embed(&dest, &tags).await {
        warn!(id, error = %e, "Metadata embedding failed");
        return ItemOutcome::failed(id, bytes, format!("Metadata embedding failed: {e}"));
    }

    if let Some(pano_tags) = panorama_tags(&record) {
        if let Err(e) = context.embedder.embed(&dest, &pano_tags).await {
            warn!(id, error = %e, "Panorama metadata failed");
            return ItemOutcome::failed(id, bytes, format!("Panorama metadata failed: {e}"));
        }
    }

    if let Some(converter) = &context.converter {
        if let Err(e) = converter.convert(&dest).await {
            warn!(id, error = %e, "Conversion failed");
            return ItemOutcome::failed(id, bytes, format!("WebP conversion failed: {e}"));
        }
    }

    debug!(id, bytes, path = %dest.display(), "Item complete");
    ItemOutcome::succeeded(id, bytes)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
