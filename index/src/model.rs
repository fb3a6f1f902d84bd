//! Pure domain model for the page index
//!
//! A [`Page`] is the aggregate root: visits and the bookmark hang off it and
//! have no independent existence. Nothing here touches the database; the
//! store in [`crate::page_store`] persists whatever these types allow.

use crate::errors::{IndexError, Result};
use crate::pipeline::{self, transform_url};
use serde::{Deserialize, Serialize};

/// Extracted, indexable page content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContent {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl PageContent {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.text.is_none()
    }

    /// Search terms drawn from title and body
    pub fn terms(&self) -> Vec<String> {
        let joined = [self.title.as_deref(), self.text.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        pipeline::extract_terms(&joined)
    }
}

/// Raw write request for a page, before derivation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageAddRequest {
    pub url: String,
    #[serde(default)]
    pub content: PageContent,
    /// Visit times (epoch ms) to associate with the page
    #[serde(default)]
    pub visits: Vec<i64>,
    /// Bookmark time (epoch ms)
    #[serde(default)]
    pub bookmark: Option<i64>,
    /// Favicon as a `data:` URI
    #[serde(default)]
    pub fav_icon_uri: Option<String>,
}

impl PageAddRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Interaction metrics recorded against a visit
///
/// Every field is optional so the same type serves as a partial update:
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitInteraction {
    pub duration_ms: Option<i64>,
    pub scroll_px: Option<i64>,
    pub scroll_perc: Option<f64>,
    pub scroll_max_px: Option<i64>,
    pub scroll_max_perc: Option<f64>,
}

impl VisitInteraction {
    /// Overlay `update` onto `self`, keeping values `update` leaves unset
    pub fn merge(&mut self, update: &VisitInteraction) {
        self.duration_ms = update.duration_ms.or(self.duration_ms);
        self.scroll_px = update.scroll_px.or(self.scroll_px);
        self.scroll_perc = update.scroll_perc.or(self.scroll_perc);
        self.scroll_max_px = update.scroll_max_px.or(self.scroll_max_px);
        self.scroll_max_perc = update.scroll_max_perc.or(self.scroll_max_perc);
    }
}

/// One visit to a page, keyed by `(time, url)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub time: i64,
    pub url: String,
    #[serde(default)]
    pub interaction: VisitInteraction,
}

/// Stored favicon for a hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FavIconRecord {
    pub hostname: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl FavIconRecord {
    /// Decode a `data:` URI into a record for `hostname`
    pub fn from_data_uri(hostname: &str, uri: &str) -> Result<Self> {
        let decoded = pipeline::decode_data_uri(uri)?;
        Ok(Self {
            hostname: hostname.to_string(),
            mime_type: decoded.mime_type,
            data: decoded.data,
        })
    }

    pub fn to_data_uri(&self) -> String {
        pipeline::encode_data_uri(&self.mime_type, &self.data)
    }
}

/// Page aggregate
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub url: String,
    pub hostname: String,
    pub content: PageContent,
    pub terms: Vec<String>,
    pub visits: Vec<VisitRecord>,
    pub bookmark: Option<i64>,
    /// Undecoded favicon; decoding happens at write time so a bad icon
    /// never blocks the page itself
    pub fav_icon_uri: Option<String>,
}

impl Page {
    /// Derive a page from raw data with no visits attached
    pub fn derive(url: &str, content: PageContent) -> Result<Self> {
        let transformed = transform_url(url)?;
        let terms = content.terms();
        Ok(Self {
            url: transformed.normalized,
            hostname: transformed.hostname,
            content,
            terms,
            visits: Vec::new(),
            bookmark: None,
            fav_icon_uri: None,
        })
    }

    /// Build the aggregate for an add-page request
    ///
    /// A request with neither visits nor a bookmark gets a single visit at
    /// `now`, so the result always satisfies [`Page::validate`].
    pub fn from_request(req: PageAddRequest, now: i64) -> Result<Self> {
        let mut page = Self::derive(&req.url, req.content)?;
        page.fav_icon_uri = req.fav_icon_uri;

        let times = if req.visits.is_empty() && req.bookmark.is_none() {
            vec![now]
        } else {
            req.visits
        };
        for time in times {
            page.add_visit(time);
        }
        if let Some(bookmark) = req.bookmark {
            page.set_bookmark(bookmark);
        }
        Ok(page)
    }

    /// Attach a visit; a second visit at the same time is ignored
    pub fn add_visit(&mut self, time: i64) {
        if self.visits.iter().any(|v| v.time == time) {
            return;
        }
        self.visits.push(VisitRecord {
            time,
            url: self.url.clone(),
            interaction: VisitInteraction::default(),
        });
    }

    pub fn set_bookmark(&mut self, time: i64) {
        self.bookmark = Some(time);
    }

    pub fn latest_visit(&self) -> Option<i64> {
        self.visits.iter().map(|v| v.time).max()
    }

    /// A page must carry at least one visit or a bookmark
    pub fn validate(&self) -> Result<()> {
        if self.visits.is_empty() && self.bookmark.is_none() {
            return Err(IndexError::validation(format!(
                "page {} has neither a visit nor a bookmark",
                self.url
            )));
        }
        if let Some(stray) = self.visits.iter().find(|v| v.url != self.url) {
            return Err(IndexError::validation(format!(
                "visit for {} attached to page {}",
                stray.url, self.url
            )));
        }
        Ok(())
    }
}

/// Lifecycle of the legacy-to-new index migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Idle,
    Running,
    Paused,
    Complete,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
        }
    }

    /// Parse from string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Persisted migration progress
///
/// `position` is the last legacy position durably imported; reads resume
/// strictly after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCursor {
    pub position: i64,
    pub status: MigrationStatus,
}

impl Default for MigrationCursor {
    fn default() -> Self {
        Self {
            position: 0,
            status: MigrationStatus::Idle,
        }
    }
}
