//! Per-tab visit state
//!
//! [`TabStateManager`] is the single owner of what each open tab is
//! currently showing. A URL change replaces the tab's state wholesale, which
//! is how one visit ends and the next begins. It also holds at most one
//! pending indexing task per tab together with the token that marks the
//! task as superseded.

use crate::events::TabId;
use pagetrail_index::{VisitInteraction, now_ms};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Current and deepest scroll position of a visit
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollState {
    pub px: i64,
    pub perc: f64,
    pub max_px: i64,
    pub max_perc: f64,
}

impl ScrollState {
    fn update(&mut self, px: i64, perc: f64) {
        self.px = px;
        self.perc = perc;
        self.max_px = self.max_px.max(px);
        self.max_perc = self.max_perc.max(perc);
    }
}

/// Snapshot of one tab's current visit
#[derive(Debug, Clone, PartialEq)]
pub struct TabState {
    pub tab_id: TabId,
    pub url: String,
    pub active: bool,
    pub incognito: bool,
    /// Wall-clock start of the visit (epoch ms); half of the visit key
    pub visit_time: i64,
    pub scroll: ScrollState,
    pub logged: bool,
    accumulated_active: Duration,
    active_since: Option<Instant>,
}

impl TabState {
    fn new(tab_id: TabId, url: String, active: bool, incognito: bool) -> Self {
        Self {
            tab_id,
            url,
            active,
            incognito,
            visit_time: now_ms(),
            scroll: ScrollState::default(),
            logged: false,
            accumulated_active: Duration::ZERO,
            active_since: active.then(Instant::now),
        }
    }

    /// Time this visit has spent as the active tab
    pub fn active_time(&self) -> Duration {
        match self.active_since {
            Some(since) => self.accumulated_active + since.elapsed(),
            None => self.accumulated_active,
        }
    }

    fn activate(&mut self) {
        if self.active_since.is_none() {
            self.active_since = Some(Instant::now());
        }
        self.active = true;
    }

    fn deactivate(&mut self) {
        if let Some(since) = self.active_since.take() {
            self.accumulated_active += since.elapsed();
        }
        self.active = false;
    }

    /// Freeze the active-time clock, as when the visit has ended
    fn close(mut self) -> Self {
        self.deactivate();
        self
    }

    /// Interaction metrics to record against the visit
    pub fn interaction(&self) -> VisitInteraction {
        VisitInteraction {
            duration_ms: Some(i64::try_from(self.active_time().as_millis()).unwrap_or(i64::MAX)),
            scroll_px: Some(self.scroll.px),
            scroll_perc: Some(self.scroll.perc),
            scroll_max_px: Some(self.scroll.max_px),
            scroll_max_perc: Some(self.scroll.max_perc),
        }
    }
}

struct PendingTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PendingTask {
    fn is_live(&self) -> bool {
        !self.token.is_cancelled() && !self.handle.is_finished()
    }
}

struct TrackedTab {
    state: TabState,
    pending: Option<PendingTask>,
}

impl TrackedTab {
    fn cancel_pending(&mut self) {
        if let Some(task) = self.pending.take() {
            task.token.cancel();
        }
    }
}

/// Owner of all tab states and their pending indexing tasks
#[derive(Default)]
pub struct TabStateManager {
    tabs: Mutex<HashMap<TabId, TrackedTab>>,
}

impl TabStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new visit for `tab_id` showing `new_url`
    ///
    /// Returns the state of the visit that just ended, with its active time
    /// frozen, or `None` for the first navigation seen in this tab. Any task
    /// still pending for the old visit is cancelled.
    pub async fn reset_tab(
        &self,
        tab_id: TabId,
        active: bool,
        incognito: bool,
        new_url: &str,
    ) -> Option<TabState> {
        let fresh = TabState::new(tab_id, new_url.to_string(), active, incognito);
        let mut tabs = self.tabs.lock().await;
        let previous = tabs.insert(
            tab_id,
            TrackedTab {
                state: fresh,
                pending: None,
            },
        );

        previous.map(|mut prev| {
            prev.cancel_pending();
            prev.state.close()
        })
    }

    /// Stop tracking a closed tab, returning its final state
    pub async fn remove_tab(&self, tab_id: TabId) -> Option<TabState> {
        let mut tabs = self.tabs.lock().await;
        tabs.remove(&tab_id).map(|mut tracked| {
            tracked.cancel_pending();
            tracked.state.close()
        })
    }

    pub async fn get(&self, tab_id: TabId) -> Option<TabState> {
        let tabs = self.tabs.lock().await;
        tabs.get(&tab_id).map(|t| t.state.clone())
    }

    pub async fn tab_count(&self) -> usize {
        self.tabs.lock().await.len()
    }

    /// Whether `(url, visit_time)` is still the tab's current visit
    pub async fn is_current_visit(&self, tab_id: TabId, url: &str, visit_time: i64) -> bool {
        let tabs = self.tabs.lock().await;
        tabs.get(&tab_id)
            .is_some_and(|t| t.state.url == url && t.state.visit_time == visit_time)
    }

    pub async fn activate_tab(&self, tab_id: TabId) -> bool {
        let mut tabs = self.tabs.lock().await;
        match tabs.get_mut(&tab_id) {
            Some(tracked) => {
                tracked.state.activate();
                true
            }
            None => false,
        }
    }

    pub async fn deactivate_tab(&self, tab_id: TabId) -> bool {
        let mut tabs = self.tabs.lock().await;
        match tabs.get_mut(&tab_id) {
            Some(tracked) => {
                tracked.state.deactivate();
                true
            }
            None => false,
        }
    }

    pub async fn update_scroll(&self, tab_id: TabId, px: i64, perc: f64) -> bool {
        let mut tabs = self.tabs.lock().await;
        match tabs.get_mut(&tab_id) {
            Some(tracked) => {
                tracked.state.scroll.update(px, perc);
                true
            }
            None => false,
        }
    }

    /// Mark the visit starting at `visit_time` as fully indexed
    ///
    /// Returns `false` if the tab has moved on to another visit.
    pub async fn mark_logged(&self, tab_id: TabId, visit_time: i64) -> bool {
        let mut tabs = self.tabs.lock().await;
        match tabs.get_mut(&tab_id) {
            Some(tracked) if tracked.state.visit_time == visit_time => {
                tracked.state.logged = true;
                true
            }
            _ => false,
        }
    }

    /// Register the deferred indexing task for a tab
    ///
    /// `task` receives the token that is cancelled when the task is
    /// superseded; it must check the token before writing. Any previously
    /// pending task for the tab is cancelled first. Returns `None` without
    /// spawning when the tab is not tracked.
    pub async fn schedule_task<F, Fut>(&self, tab_id: TabId, task: F) -> Option<CancellationToken>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tabs = self.tabs.lock().await;
        let tracked = tabs.get_mut(&tab_id)?;
        tracked.cancel_pending();

        let token = CancellationToken::new();
        let handle = tokio::spawn(task(token.clone()));
        tracked.pending = Some(PendingTask {
            token: token.clone(),
            handle,
        });
        Some(token)
    }

    pub async fn has_pending_task(&self, tab_id: TabId) -> bool {
        let tabs = self.tabs.lock().await;
        tabs.get(&tab_id)
            .and_then(|t| t.pending.as_ref())
            .is_some_and(PendingTask::is_live)
    }

    /// Token of the tab's live pending task
    pub async fn pending_token(&self, tab_id: TabId) -> Option<CancellationToken> {
        let tabs = self.tabs.lock().await;
        tabs.get(&tab_id)
            .and_then(|t| t.pending.as_ref())
            .filter(|p| p.is_live())
            .map(|p| p.token.clone())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn reset_returns_exactly_the_previous_state() {
        let manager = TabStateManager::new();
        assert!(manager.reset_tab(1, true, false, "https://a.test/1").await.is_none());

        let urls = ["https://a.test/2", "https://a.test/3", "https://a.test/4"];
        let mut expected_prev = "https://a.test/1";
        for url in urls {
            let prev = manager
                .reset_tab(1, true, false, url)
                .await
                .expect("previous state");
            assert_eq!(prev.url, expected_prev);
            assert_eq!(prev.tab_id, 1);
            assert_eq!(manager.get(1).await.expect("current").url, url);
            expected_prev = url;
        }
        assert_eq!(manager.tab_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn active_time_only_accumulates_while_active() {
        let manager = TabStateManager::new();
        manager.reset_tab(1, true, false, "https://a.test").await;

        tokio::time::advance(Duration::from_millis(80)).await;
        manager.deactivate_tab(1).await;
        tokio::time::advance(Duration::from_millis(500)).await;
        manager.activate_tab(1).await;
        tokio::time::advance(Duration::from_millis(40)).await;

        let prev = manager
            .reset_tab(1, true, false, "https://a.test/next")
            .await
            .expect("prev");
        assert_eq!(prev.active_time(), Duration::from_millis(120));
        assert!(!prev.active);
    }

    #[tokio::test(start_paused = true)]
    async fn background_tab_has_no_active_time() {
        let manager = TabStateManager::new();
        manager.reset_tab(1, false, false, "https://a.test").await;
        tokio::time::advance(Duration::from_secs(5)).await;
        let state = manager.remove_tab(1).await.expect("state");
        assert_eq!(state.active_time(), Duration::ZERO);
    }

    #[tokio::test]
    async fn scroll_keeps_maximum() {
        let manager = TabStateManager::new();
        manager.reset_tab(1, true, false, "https://a.test").await;
        manager.update_scroll(1, 800, 0.8).await;
        manager.update_scroll(1, 100, 0.1).await;

        let interaction = manager.get(1).await.expect("state").interaction();
        assert_eq!(interaction.scroll_px, Some(100));
        assert_eq!(interaction.scroll_max_px, Some(800));
        assert_eq!(interaction.scroll_max_perc, Some(0.8));
        assert!(!manager.update_scroll(99, 1, 0.1).await);
    }

    #[tokio::test]
    async fn scheduling_replaces_the_pending_task() {
        let manager = TabStateManager::new();
        manager.reset_tab(1, true, false, "https://a.test").await;

        let first = manager
            .schedule_task(1, |token| async move { token.cancelled().await })
            .await
            .expect("scheduled");
        let second = manager
            .schedule_task(1, |token| async move { token.cancelled().await })
            .await
            .expect("scheduled");

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(manager.has_pending_task(1).await);

        let pending = manager.pending_token(1).await.expect("live task");
        pending.cancel();
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn navigation_and_removal_cancel_pending_task() {
        let manager = TabStateManager::new();
        manager.reset_tab(1, true, false, "https://a.test").await;
        let token = manager
            .schedule_task(1, |token| async move { token.cancelled().await })
            .await
            .expect("scheduled");

        manager.reset_tab(1, true, false, "https://a.test/next").await;
        assert!(token.is_cancelled());
        assert!(!manager.has_pending_task(1).await);

        let token = manager
            .schedule_task(1, |token| async move { token.cancelled().await })
            .await
            .expect("scheduled");
        manager.remove_tab(1).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn untracked_tab_gets_no_task() {
        let manager = TabStateManager::new();
        assert!(
            manager
                .schedule_task(5, |_| async {})
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn logged_flag_is_tied_to_the_visit() {
        let manager = TabStateManager::new();
        manager.reset_tab(1, true, false, "https://a.test").await;
        let visit_time = manager.get(1).await.expect("state").visit_time;

        assert!(manager.mark_logged(1, visit_time).await);
        assert!(manager.get(1).await.expect("state").logged);
        assert!(!manager.mark_logged(1, visit_time - 1).await);
        assert!(manager.is_current_visit(1, "https://a.test", visit_time).await);
        assert!(!manager.is_current_visit(1, "https://b.test", visit_time).await);
    }
}
