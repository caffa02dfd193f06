//! geoharvest ingest library
//!
//! Resumable harvesting of an account's geotagged photos from the Mapillary
//! API into a local collection directory, ready for archival upload.
//!
//! # Overview
//!
//! - **Crawl**: cursor-paginated metadata listing ([`crawl`])
//! - **State**: append-only metadata log, progress checkpoint and saved
//!   cursor under `<collection>/.meta/`
//! - **Workers**: bounded pool that downloads, tags and converts assets
//!   ([`worker`], [`transform`])
//! - **Packaging**: reproducible per-day tar bundles ([`packager`]) and an
//!   existence check against the archive ([`oracle`])
//! - **Coordination**: [`Harvester`] ties it together and is safe to stop
//!   and restart at any point
//!
//! # Example
//!
//! ```no_run
//! use geoharvest_ingest::{HarvestConfig, Harvester};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HarvestConfig::from_env()?;
//!     let report = Harvester::new(config, "alice")?.run().await?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checkpoint;
pub mod config;
pub mod crawl;
pub mod cursor;
pub mod error;
pub mod fetch;
pub mod harvest;
pub mod layout;
pub mod metadata_log;
pub mod oracle;
pub mod packager;
pub mod record;
pub mod report;
pub mod transform;
pub mod worker;

pub use config::{BoundingBox, HarvestConfig, StagingLayout};
pub use error::{IngestError, Result};
pub use harvest::Harvester;
pub use record::Record;
pub use report::HarvestReport;
