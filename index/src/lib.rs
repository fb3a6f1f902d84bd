//! Page index for pagetrail
//!
//! Persists pages, visits and favicons in a local SQLite database and
//! exposes the pieces needed to move records over from the legacy index:
//! - [`PageVisitStore`] owns the atomic write protocol
//! - [`model`] holds the pure page aggregate and its invariants
//! - [`legacy`] reads the old JSON documents
//! - [`IndexSelector`] tells consumers which index is live

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod errors;
pub mod legacy;
pub mod model;
pub mod page_store;
pub mod pipeline;
pub mod selector;

pub use config::{FavIconConfig, MigrationConfig, PagetrailConfig, VisitConfig};
pub use errors::{ErrorCategory, IndexError, Result};
pub use legacy::{LegacyDocument, LegacyIndex, LegacyRecord, LegacySource, LegacyVisit};
pub use model::{
    FavIconRecord, MigrationCursor, MigrationStatus, Page, PageAddRequest, PageContent,
    VisitInteraction, VisitRecord,
};
pub use page_store::{PageVisitStore, SearchHit, now_ms};
pub use selector::IndexSelector;

/// Index crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
