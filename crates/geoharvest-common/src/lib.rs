//! geoharvest common library
//!
//! Shared types, utilities, and error handling for the geoharvest workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: subscriber setup driven by [`logging::LogConfig`]
//! - **Atomic files**: temp-file + fsync + rename replacement in [`atomic`]
//! - **Checksums**: SHA-256 digests for sealed bundles
//! - **Types**: quality labels and collection naming
//!
//! # Example
//!
//! ```no_run
//! use geoharvest_common::atomic::write_atomic;
//! use geoharvest_common::types::{CollectionName, Quality};
//!
//! fn save(root: &std::path::Path) -> geoharvest_common::Result<()> {
//!     let name = CollectionName::new("alice", Quality::Original, true);
//!     write_atomic(root.join("collection.txt"), name.to_string().as_bytes())?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod atomic;
pub mod checksum;
pub mod error;
pub mod format;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{CollectionName, Quality};
