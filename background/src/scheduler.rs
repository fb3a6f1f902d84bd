//! Visit scheduling
//!
//! Turns tab events into index writes. A navigation ends the tab's current
//! visit and, when the new page may be logged, schedules two stages:
//!
//! 1. once the DOM has loaded, a minimal page + visit record is written so
//!    the page is searchable even if the user leaves right away;
//! 2. once the DOM has loaded *and* the tab is active, content is extracted
//!    and the full record is written.
//!
//! Every handler runs in its own task and its failure is only logged.

use crate::collaborators::{FavIconFetcher, LogPolicy, PageExtractor, TabSignals};
use crate::errors::{HandlerError, HandlerResult};
use crate::events::{TabChangedEvent, TabId, TabSnapshot};
use crate::signals::OrCancelExt;
use crate::tab_state::{TabState, TabStateManager};
use pagetrail_index::{PageAddRequest, PageVisitStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct VisitSchedulingService {
    tabs: Arc<TabStateManager>,
    store: Arc<PageVisitStore>,
    signals: Arc<dyn TabSignals>,
    policy: Arc<dyn LogPolicy>,
    extractor: Arc<dyn PageExtractor>,
    fav_icons: Arc<dyn FavIconFetcher>,
    /// Visits with no more active time than this are load artifacts
    min_active_time: Duration,
}

/// Run a handler in its own task; its error ends there
fn spawn_handler<F>(handler: &'static str, tab_id: TabId, fut: F) -> JoinHandle<()>
where
    F: Future<Output = HandlerResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => {}
            Err(e) if e.is_superseded() => {
                tracing::debug!(tab_id, handler, "stale result discarded");
            }
            Err(e) => {
                tracing::warn!(tab_id, handler, error = %e, "tab handler failed");
            }
        }
    })
}

impl VisitSchedulingService {
    pub fn new(
        tabs: Arc<TabStateManager>,
        store: Arc<PageVisitStore>,
        signals: Arc<dyn TabSignals>,
        policy: Arc<dyn LogPolicy>,
        extractor: Arc<dyn PageExtractor>,
        fav_icons: Arc<dyn FavIconFetcher>,
        min_active_time: Duration,
    ) -> Self {
        Self {
            tabs,
            store,
            signals,
            policy,
            extractor,
            fav_icons,
            min_active_time,
        }
    }

    pub fn tabs(&self) -> &Arc<TabStateManager> {
        &self.tabs
    }

    /// Dispatch one tab-changed event to its independent handlers
    pub fn on_tab_updated(self: &Arc<Self>, event: TabChangedEvent) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);
        handles.extend(self.spawn_url_handler(&event));
        handles.extend(self.spawn_fav_icon_handler(&event));
        handles
    }

    /// Dispatch one tab-changed event and wait for its url handler
    ///
    /// On return the tab state reflects the event's URL, so signals for the
    /// new page can be attributed to it. The favicon handler is left
    /// running. Returns the number of handlers dispatched.
    pub async fn apply_tab_updated(self: &Arc<Self>, event: TabChangedEvent) -> usize {
        let url_handler = self.spawn_url_handler(&event);
        let fav_icon_handler = self.spawn_fav_icon_handler(&event);
        let dispatched = usize::from(url_handler.is_some()) + usize::from(fav_icon_handler.is_some());

        if let Some(handle) = url_handler
            && let Err(e) = handle.await
        {
            tracing::error!(tab_id = event.tab_id(), error = %e, "url handler panicked");
        }
        dispatched
    }

    fn spawn_url_handler(self: &Arc<Self>, event: &TabChangedEvent) -> Option<JoinHandle<()>> {
        let tab_id = event.tab_id();
        let url = event.changed().url.clone()?;
        let this = Arc::clone(self);
        let tab = event.tab().clone();
        Some(spawn_handler("url", tab_id, async move {
            this.handle_url(tab_id, &url, &tab).await
        }))
    }

    fn spawn_fav_icon_handler(self: &Arc<Self>, event: &TabChangedEvent) -> Option<JoinHandle<()>> {
        let tab_id = event.tab_id();
        let fav_icon_url = event.changed().fav_icon_url.clone()?;
        let this = Arc::clone(self);
        let tab = event.tab().clone();
        Some(spawn_handler("fav-icon", tab_id, async move {
            this.handle_fav_icon(&fav_icon_url, &tab).await
        }))
    }

    /// End the tab's previous visit and schedule indexing for the new URL
    pub async fn handle_url(
        self: &Arc<Self>,
        tab_id: TabId,
        url: &str,
        tab: &TabSnapshot,
    ) -> HandlerResult<()> {
        if let Err(e) = self.handle_visit_end(tab_id, url, tab).await {
            tracing::warn!(tab_id, error = %e, "visit end update failed");
        }

        if !self.policy.should_log(url, tab.incognito()).await {
            tracing::debug!(tab_id, url, "tab not eligible for logging");
            return Ok(());
        }

        let visit_time = match self.tabs.get(tab_id).await {
            Some(state) if state.url == url => state.visit_time,
            _ => return Err(HandlerError::Superseded { tab_id }),
        };

        let this = Arc::clone(self);
        let url = url.to_string();
        let scheduled = self
            .tabs
            .schedule_task(tab_id, move |token| async move {
                let (stage1, stage2) = tokio::join!(
                    this.log_init_page_visit(tab_id, &url, visit_time, &token),
                    this.log_page_visit(tab_id, &url, visit_time, &token),
                );
                for (stage, result) in [("stage-1", stage1), ("stage-2", stage2)] {
                    match result {
                        Ok(()) => {}
                        Err(e) if e.is_superseded() => {
                            tracing::debug!(tab_id, stage, "indexing superseded");
                        }
                        Err(e) => {
                            tracing::warn!(tab_id, stage, error = %e, "indexing failed");
                        }
                    }
                }
            })
            .await;

        match scheduled {
            Some(_) => Ok(()),
            None => Err(HandlerError::Superseded { tab_id }),
        }
    }

    /// Record interaction data for the visit that a navigation just ended
    ///
    /// Returns whether an interaction update was written.
    pub async fn handle_visit_end(
        &self,
        tab_id: TabId,
        url: &str,
        tab: &TabSnapshot,
    ) -> HandlerResult<bool> {
        let Some(previous) = self
            .tabs
            .reset_tab(tab_id, tab.active(), tab.incognito(), url)
            .await
        else {
            return Ok(false);
        };

        if previous.url == url {
            return Ok(false);
        }

        self.finish_visit(&previous, tab.incognito()).await
    }

    async fn finish_visit(&self, previous: &TabState, incognito: bool) -> HandlerResult<bool> {
        let active_time = previous.active_time();
        if active_time <= self.min_active_time {
            tracing::debug!(
                tab_id = previous.tab_id,
                url = %previous.url,
                active_ms = u64::try_from(active_time.as_millis()).unwrap_or(u64::MAX),
                "visit too short to count"
            );
            return Ok(false);
        }

        if !self.policy.should_log(&previous.url, incognito).await {
            return Ok(false);
        }

        let updated = self.store.update_visit_interaction(
            &previous.url,
            previous.visit_time,
            &previous.interaction(),
        )?;
        tracing::debug!(
            tab_id = previous.tab_id,
            url = %previous.url,
            updated,
            "visit interaction recorded"
        );
        Ok(updated)
    }

    /// The write is only allowed while the task's token is live and the
    /// tab still shows the same visit
    async fn ensure_current(
        &self,
        tab_id: TabId,
        url: &str,
        visit_time: i64,
        token: &CancellationToken,
    ) -> HandlerResult<()> {
        if token.is_cancelled() || !self.tabs.is_current_visit(tab_id, url, visit_time).await {
            return Err(HandlerError::Superseded { tab_id });
        }
        Ok(())
    }

    /// Stage 1: minimal record as soon as the DOM is ready
    async fn log_init_page_visit(
        &self,
        tab_id: TabId,
        url: &str,
        visit_time: i64,
        token: &CancellationToken,
    ) -> HandlerResult<()> {
        self.signals
            .dom_loaded(tab_id)
            .or_cancel(token)
            .await
            .map_err(|_| HandlerError::Superseded { tab_id })??;

        self.ensure_current(tab_id, url, visit_time, token).await?;

        self.store.add_page(PageAddRequest {
            visits: vec![visit_time],
            ..PageAddRequest::new(url)
        })?;
        tracing::debug!(tab_id, url, "stage 1 indexed");
        Ok(())
    }

    /// Stage 2: full content once the page is loaded and actually viewed
    async fn log_page_visit(
        &self,
        tab_id: TabId,
        url: &str,
        visit_time: i64,
        token: &CancellationToken,
    ) -> HandlerResult<()> {
        let ready = async {
            tokio::try_join!(
                self.signals.dom_loaded(tab_id),
                self.signals.tab_active(tab_id)
            )
        };
        ready
            .or_cancel(token)
            .await
            .map_err(|_| HandlerError::Superseded { tab_id })??;

        if self.tabs.get(tab_id).await.is_some_and(|s| s.logged) {
            return Ok(());
        }

        let content = self.extractor.extract(tab_id, url).await?;

        self.ensure_current(tab_id, url, visit_time, token).await?;

        self.store.add_page(PageAddRequest {
            content,
            visits: vec![visit_time],
            ..PageAddRequest::new(url)
        })?;
        self.tabs.mark_logged(tab_id, visit_time).await;
        tracing::info!(tab_id, url, "page visit indexed");
        Ok(())
    }

    /// Store the favicon for the tab's host unless one is already stored
    pub async fn handle_fav_icon(&self, fav_icon_url: &str, tab: &TabSnapshot) -> HandlerResult<()> {
        if !self.policy.should_log(tab.url(), tab.incognito()).await {
            return Ok(());
        }
        if self.store.domain_has_fav_icon(tab.url())? {
            return Ok(());
        }

        let data_uri = self.fav_icons.fetch(fav_icon_url).await?;
        self.store.add_fav_icon(tab.url(), &data_uri)?;
        tracing::debug!(url = tab.url(), "favicon indexed");
        Ok(())
    }

    pub async fn handle_tab_activated(&self, tab_id: TabId) -> bool {
        self.tabs.activate_tab(tab_id).await
    }

    pub async fn handle_tab_deactivated(&self, tab_id: TabId) -> bool {
        self.tabs.deactivate_tab(tab_id).await
    }

    pub async fn handle_scroll(&self, tab_id: TabId, px: i64, perc: f64) -> bool {
        self.tabs.update_scroll(tab_id, px, perc).await
    }

    /// The tab closed: its current visit ends here
    pub async fn handle_tab_removed(&self, tab_id: TabId) -> HandlerResult<bool> {
        let Some(last) = self.tabs.remove_tab(tab_id).await else {
            return Ok(false);
        };
        self.finish_visit(&last, last.incognito).await
    }
}
