//! Channel-backed readiness signals
//!
//! The browser layer pushes DOM-loaded, tab-active and idle/active state
//! into `watch` channels; handlers wait on the receiving side.

use crate::collaborators::TabSignals;
use crate::errors::{HandlerError, HandlerResult};
use crate::events::TabId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Error returned when a future is cancelled.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelErr {
    Cancelled,
}

/// Race a future against a `CancellationToken`.
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            _ = token.cancelled() => Err(CancelErr::Cancelled),
            res = self => Ok(res),
        }
    }
}

/// System-wide user presence as reported by the idle detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Active,
    Idle,
}

/// Create the idle/active channel; starts out `Active`
pub fn idle_channel() -> (watch::Sender<IdleState>, watch::Receiver<IdleState>) {
    watch::channel(IdleState::Active)
}

struct TabChannels {
    dom_loaded: watch::Sender<bool>,
    active: watch::Sender<bool>,
}

impl TabChannels {
    fn new() -> Self {
        Self {
            dom_loaded: watch::Sender::new(false),
            active: watch::Sender::new(false),
        }
    }
}

/// [`TabSignals`] backed by one pair of watch channels per tab
///
/// Waiting on a tab that was never seen creates its channels, so a
/// waiter may subscribe before the first browser report arrives.
#[derive(Default)]
pub struct ChannelTabSignals {
    tabs: Mutex<HashMap<TabId, TabChannels>>,
}

impl ChannelTabSignals {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tab<R>(&self, tab_id: TabId, f: impl FnOnce(&TabChannels) -> R) -> R {
        let mut tabs = self.tabs.lock().unwrap_or_else(PoisonError::into_inner);
        f(tabs.entry(tab_id).or_insert_with(TabChannels::new))
    }

    pub fn mark_dom_loaded(&self, tab_id: TabId) {
        self.with_tab(tab_id, |c| c.dom_loaded.send_replace(true));
    }

    /// The tab started loading a new document
    pub fn reset_dom_loaded(&self, tab_id: TabId) {
        self.with_tab(tab_id, |c| c.dom_loaded.send_replace(false));
    }

    pub fn set_active(&self, tab_id: TabId, active: bool) {
        self.with_tab(tab_id, |c| c.active.send_replace(active));
    }

    /// Drop the tab's channels; pending waiters fail with `SignalDropped`
    pub fn remove(&self, tab_id: TabId) {
        let mut tabs = self.tabs.lock().unwrap_or_else(PoisonError::into_inner);
        tabs.remove(&tab_id);
    }

    async fn wait_true(
        mut rx: watch::Receiver<bool>,
        tab_id: TabId,
        signal: &'static str,
    ) -> HandlerResult<()> {
        rx.wait_for(|v| *v)
            .await
            .map(|_| ())
            .map_err(|_| HandlerError::SignalDropped { tab_id, signal })
    }
}

#[async_trait]
impl TabSignals for ChannelTabSignals {
    async fn dom_loaded(&self, tab_id: TabId) -> HandlerResult<()> {
        let rx = self.with_tab(tab_id, |c| c.dom_loaded.subscribe());
        Self::wait_true(rx, tab_id, "dom-loaded").await
    }

    async fn tab_active(&self, tab_id: TabId) -> HandlerResult<()> {
        let rx = self.with_tab(tab_id, |c| c.active.subscribe());
        Self::wait_true(rx, tab_id, "tab-active").await
    }
}
