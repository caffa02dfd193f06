//! Progress reporting for a harvest run
//!
//! The coordinator pushes events into a [`Reporter`] it was handed at
//! construction; nothing here is global. [`TracingReporter`] turns events
//! into log lines, [`ProgressReporter`] drives a terminal progress bar.

use crate::packager::BundleSummary;
use crate::worker::ItemOutcome;
use geoharvest_common::format::format_size;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Receives harvest events; every hook defaults to doing nothing
pub trait Reporter: Send + Sync {
    /// Records from an earlier run queued for download
    fn backlog_replayed(&self, _records: u64) {}

    /// A metadata page was fully consumed
    fn page_consumed(&self, _page: u64, _has_next: bool) {}

    fn record_enqueued(&self, _id: &str) {}

    fn item_finished(&self, _outcome: &ItemOutcome) {}

    fn bundle_sealed(&self, _bundle: &BundleSummary) {}

    fn harvest_finished(&self, _report: &HarvestReport) {}
}

/// Reporter that only writes tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn backlog_replayed(&self, records: u64) {
        if records > 0 {
            info!(records, "Replaying backlog from metadata log");
        }
    }

    fn page_consumed(&self, page: u64, has_next: bool) {
        debug!(page, has_next, "Page consumed");
    }

    fn item_finished(&self, outcome: &ItemOutcome) {
        if let Some(error) = &outcome.error {
            warn!(id = %outcome.id, error = %error, "Item failed");
        }
    }

    fn bundle_sealed(&self, bundle: &BundleSummary) {
        info!(
            bundle = %bundle.path.display(),
            files = bundle.files,
            size = %format_size(bundle.bytes),
            sha256 = %bundle.sha256,
            "Bundle ready"
        );
    }

    fn harvest_finished(&self, report: &HarvestReport) {
        info!(
            downloaded = report.downloaded,
            failed = report.failed,
            bytes = report.bytes_transferred,
            crawl_complete = report.crawl_complete,
            "Harvest finished"
        );
    }
}

/// Terminal progress bar whose length grows as records are enqueued
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new(label: &str) -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({per_sec})",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(label.to_string());
        Self { bar }
    }

    pub fn bar(&self) -> &ProgressBar {
        &self.bar
    }
}

impl Reporter for ProgressReporter {
    fn backlog_replayed(&self, records: u64) {
        if records > 0 {
            self.bar.println(format!("Resuming {records} pending records"));
        }
    }

    fn record_enqueued(&self, _id: &str) {
        self.bar.inc_length(1);
    }

    fn item_finished(&self, outcome: &ItemOutcome) {
        self.bar.inc(1);
        if let Some(error) = &outcome.error {
            self.bar.println(format!("  {} failed: {}", outcome.id, error));
        }
    }

    fn bundle_sealed(&self, bundle: &BundleSummary) {
        self.bar.println(format!(
            "Sealed {} ({} files, {})",
            bundle.path.display(),
            bundle.files,
            format_size(bundle.bytes)
        ));
    }

    fn harvest_finished(&self, _report: &HarvestReport) {
        self.bar.finish_and_clear();
    }
}

/// Totals for one harvest run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestReport {
    pub collection: String,
    /// Records delivered by the crawl this run
    pub records_seen: u64,
    /// Records newly appended to the metadata log
    pub records_logged: u64,
    /// Records handed to the workers, backlog included
    pub records_enqueued: u64,
    pub downloaded: u64,
    pub failed: u64,
    pub bytes_transferred: u64,
    /// Failure count per reason
    pub failure_reasons: BTreeMap<String, u64>,
    pub bundles: Vec<BundleSummary>,
    pub files_sealed: usize,
    pub crawl_complete: bool,
    pub cancelled: bool,
    /// `Some(true)` when the collection is complete and not yet published
    pub upload_ready: Option<bool>,
}

impl HarvestReport {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    pub fn record_outcome(&mut self, outcome: &ItemOutcome) {
        self.bytes_transferred += outcome.bytes_transferred;
        if outcome.success {
            self.downloaded += 1;
        } else {
            self.failed += 1;
            let reason = outcome.reason_kind().unwrap_or("Unknown").to_string();
            *self.failure_reasons.entry(reason).or_default() += 1;
        }
    }

    pub fn bundles_created(&self) -> usize {
        self.bundles.len()
    }
}

impl fmt::Display for HarvestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Collection:  {}", self.collection)?;
        writeln!(
            f,
            "Records:     {} seen, {} logged, {} enqueued",
            self.records_seen, self.records_logged, self.records_enqueued
        )?;
        writeln!(
            f,
            "Downloads:   {} ok, {} failed, {}",
            self.downloaded,
            self.failed,
            format_size(self.bytes_transferred)
        )?;
        for (reason, count) in &self.failure_reasons {
            writeln!(f, "  {reason}: {count}")?;
        }
        if !self.bundles.is_empty() {
            writeln!(
                f,
                "Bundles:     {} ({} files)",
                self.bundles_created(),
                self.files_sealed
            )?;
        }
        let status = match (self.cancelled, self.crawl_complete) {
            (true, _) => "interrupted",
            (false, true) => "complete",
            (false, false) => "incomplete",
        };
        write!(f, "Crawl:       {status}")?;
        if let Some(ready) = self.upload_ready {
            let upload = if ready { "ready to upload" } else { "already published" };
            write!(f, "\nArchive:     {upload}")?;
        }
        Ok(())
    }
}
