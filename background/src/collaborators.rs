//! Seams to the host environment
//!
//! The scheduler and migrator only talk to the browser, the network and
//! the user through these traits. Default implementations cover the
//! standalone driver binary.

use crate::errors::{HandlerError, HandlerResult};
use crate::events::TabId;
use async_trait::async_trait;
use pagetrail_index::pipeline::{encode_data_uri, transform_url, url_scheme};
use pagetrail_index::{FavIconConfig, PageContent, VisitConfig};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Readiness futures provided by the browser layer
#[async_trait]
pub trait TabSignals: Send + Sync {
    /// Resolves once the tab's current document has finished loading
    async fn dom_loaded(&self, tab_id: TabId) -> HandlerResult<()>;

    /// Resolves once the tab is the active tab of its window
    async fn tab_active(&self, tab_id: TabId) -> HandlerResult<()>;
}

/// Decides whether a tab may be logged at all
#[async_trait]
pub trait LogPolicy: Send + Sync {
    async fn should_log(&self, url: &str, incognito: bool) -> bool;
}

/// Pulls indexable content out of a loaded tab
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn extract(&self, tab_id: TabId, url: &str) -> HandlerResult<PageContent>;
}

/// Retrieves a favicon and returns it as a `data:` URI
#[async_trait]
pub trait FavIconFetcher: Send + Sync {
    async fn fetch(&self, fav_icon_url: &str) -> HandlerResult<String>;
}

/// User-facing notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

// ─────────────────────────────────────────────────────────────────────────────
// Default implementations
// ─────────────────────────────────────────────────────────────────────────────

/// Log policy driven by the `[visits]` config section
pub struct ConfigLogPolicy {
    cfg: VisitConfig,
}

impl ConfigLogPolicy {
    pub fn new(cfg: VisitConfig) -> Self {
        Self { cfg }
    }

    fn blacklisted(&self, hostname: &str) -> bool {
        self.cfg.blacklist.iter().any(|entry| {
            let entry = entry.trim().trim_start_matches('.').to_lowercase();
            !entry.is_empty()
                && (hostname == entry || hostname.ends_with(&format!(".{entry}")))
        })
    }
}

#[async_trait]
impl LogPolicy for ConfigLogPolicy {
    async fn should_log(&self, url: &str, incognito: bool) -> bool {
        if incognito && !self.cfg.log_incognito {
            return false;
        }
        let Some(scheme) = url_scheme(url) else {
            return false;
        };
        if !self.cfg.allowed_schemes.iter().any(|s| s == &scheme) {
            return false;
        }
        match transform_url(url) {
            Ok(t) => !self.blacklisted(&t.hostname),
            Err(_) => false,
        }
    }
}

/// Extractor fed by content the browser layer reports on DOM load
#[derive(Default)]
pub struct ReportedPageExtractor {
    reports: Mutex<HashMap<TabId, (String, PageContent)>>,
}

impl ReportedPageExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, tab_id: TabId, url: impl Into<String>, content: PageContent) {
        let mut reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        reports.insert(tab_id, (url.into(), content));
    }

    pub fn forget(&self, tab_id: TabId) {
        let mut reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        reports.remove(&tab_id);
    }
}

#[async_trait]
impl PageExtractor for ReportedPageExtractor {
    async fn extract(&self, tab_id: TabId, url: &str) -> HandlerResult<PageContent> {
        let reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        match reports.get(&tab_id) {
            Some((reported_url, content)) if reported_url == url => Ok(content.clone()),
            Some((reported_url, _)) => Err(HandlerError::Extraction {
                url: url.to_string(),
                reason: format!("tab {tab_id} reported content for {reported_url}"),
            }),
            None => Err(HandlerError::Extraction {
                url: url.to_string(),
                reason: format!("no content reported for tab {tab_id}"),
            }),
        }
    }
}

/// Favicon fetcher over HTTP
pub struct HttpFavIconFetcher {
    client: reqwest::Client,
}

impl HttpFavIconFetcher {
    pub fn new(cfg: &FavIconConfig) -> HandlerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.fetch_timeout_ms))
            .build()
            .map_err(|e| HandlerError::FavIconFetch {
                url: String::new(),
                reason: format!("failed to build http client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FavIconFetcher for HttpFavIconFetcher {
    async fn fetch(&self, fav_icon_url: &str) -> HandlerResult<String> {
        // Browsers already hand over inline icons as data URIs
        if fav_icon_url.starts_with("data:") {
            return Ok(fav_icon_url.to_string());
        }

        let fetch_err = |reason: String| HandlerError::FavIconFetch {
            url: fav_icon_url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(fav_icon_url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(format!("http status {status}")));
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "image/x-icon".to_string());

        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if body.is_empty() {
            return Err(fetch_err("empty body".to_string()));
        }

        Ok(encode_data_uri(&mime_type, &body))
    }
}

/// Notifier that records notifications in the log
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, message: &str) {
        tracing::info!(title, message, "notification");
    }
}
