//! Active index selection
//!
//! Every reader of the search index asks an [`IndexSelector`] which schema
//! to use. The flag only ever moves from legacy to new, and each change
//! bumps a version so holders can tell whether a cached decision is stale.

use crate::model::{MigrationCursor, MigrationStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug)]
struct SelectorState {
    use_legacy: AtomicBool,
    version: AtomicU64,
}

/// Shared handle to the process-wide "use the legacy index" flag
#[derive(Debug, Clone)]
pub struct IndexSelector {
    inner: Arc<SelectorState>,
}

impl IndexSelector {
    pub fn new(use_legacy: bool) -> Self {
        Self {
            inner: Arc::new(SelectorState {
                use_legacy: AtomicBool::new(use_legacy),
                version: AtomicU64::new(0),
            }),
        }
    }

    /// Initial selection for a process start
    ///
    /// The legacy index stays active while one exists and its migration
    /// has not completed.
    pub fn from_cursor(cursor: &MigrationCursor, legacy_available: bool) -> Self {
        Self::new(legacy_available && cursor.status != MigrationStatus::Complete)
    }

    pub fn use_legacy(&self) -> bool {
        self.inner.use_legacy.load(Ordering::Acquire)
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Point every consumer at the new index
    ///
    /// Returns `true` only for the call that actually flipped the flag.
    pub fn switch_to_new(&self) -> bool {
        let flipped = self
            .inner
            .use_legacy
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if flipped {
            self.inner.version.fetch_add(1, Ordering::AcqRel);
            tracing::info!("index selector switched to new index");
        }
        flipped
    }
}
