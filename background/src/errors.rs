//! Handler-level failures
//!
//! None of these ever leave a spawned handler; they are logged where the
//! handler task ends.

use crate::events::TabId;
use pagetrail_index::IndexError;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid tab event: {reason}")]
    InvalidEvent { reason: String },

    #[error("tab {tab_id}: {signal} signal source went away")]
    SignalDropped { tab_id: TabId, signal: &'static str },

    #[error("tab {tab_id}: superseded by a newer navigation")]
    Superseded { tab_id: TabId },

    #[error("content extraction failed for {url}: {reason}")]
    Extraction { url: String, reason: String },

    #[error("favicon fetch failed for {url}: {reason}")]
    FavIconFetch { url: String, reason: String },

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl HandlerError {
    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            reason: reason.into(),
        }
    }

    /// Stale results are expected during fast navigation
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded { .. })
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;
