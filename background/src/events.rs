//! Tab event types
//!
//! Events arrive as loosely shaped JSON from the browser layer
//! ([`RawTabEvent`]) and are validated once into [`TabChangedEvent`], whose
//! fields cannot change after construction.

use crate::errors::{HandlerError, HandlerResult};
use serde::Deserialize;

pub type TabId = i64;

/// Tab fields as reported by the browser
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTabSnapshot {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub incognito: Option<bool>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// Which fields changed in this update
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChangedFields {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "favIconUrl")]
    pub fav_icon_url: Option<String>,
}

impl ChangedFields {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            fav_icon_url: None,
        }
    }

    pub fn fav_icon(fav_icon_url: impl Into<String>) -> Self {
        Self {
            url: None,
            fav_icon_url: Some(fav_icon_url.into()),
        }
    }
}

/// Unvalidated tab-changed event
#[derive(Debug, Clone, Deserialize)]
pub struct RawTabEvent {
    #[serde(alias = "tabId")]
    pub tab_id: Option<TabId>,
    #[serde(default, alias = "changedFields")]
    pub changed: ChangedFields,
    #[serde(default, alias = "tabSnapshot")]
    pub tab: Option<RawTabSnapshot>,
}

/// Validated snapshot of a tab at event time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabSnapshot {
    url: String,
    incognito: bool,
    active: bool,
}

impl TabSnapshot {
    pub fn new(url: impl Into<String>, incognito: bool, active: bool) -> HandlerResult<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(HandlerError::invalid_event("tab snapshot has an empty url"));
        }
        Ok(Self {
            url,
            incognito,
            active,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn incognito(&self) -> bool {
        self.incognito
    }

    pub fn active(&self) -> bool {
        self.active
    }
}

/// Validated tab-changed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabChangedEvent {
    tab_id: TabId,
    changed: ChangedFields,
    tab: TabSnapshot,
}

impl TabChangedEvent {
    pub fn new(tab_id: TabId, changed: ChangedFields, tab: TabSnapshot) -> HandlerResult<Self> {
        if tab_id < 0 {
            return Err(HandlerError::invalid_event(format!(
                "tab id must not be negative, got {tab_id}"
            )));
        }
        if changed.url.as_deref().is_some_and(|u| u.trim().is_empty()) {
            return Err(HandlerError::invalid_event("changed url is empty"));
        }
        if changed
            .fav_icon_url
            .as_deref()
            .is_some_and(|u| u.trim().is_empty())
        {
            return Err(HandlerError::invalid_event("changed favicon url is empty"));
        }
        Ok(Self {
            tab_id,
            changed,
            tab,
        })
    }

    /// Shorthand for a navigation event where the tab now shows `url`
    pub fn navigation(
        tab_id: TabId,
        url: impl Into<String>,
        incognito: bool,
        active: bool,
    ) -> HandlerResult<Self> {
        let url = url.into();
        let tab = TabSnapshot::new(url.clone(), incognito, active)?;
        Self::new(tab_id, ChangedFields::url(url), tab)
    }

    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    pub fn changed(&self) -> &ChangedFields {
        &self.changed
    }

    pub fn tab(&self) -> &TabSnapshot {
        &self.tab
    }
}

impl TryFrom<RawTabEvent> for TabChangedEvent {
    type Error = HandlerError;

    fn try_from(raw: RawTabEvent) -> HandlerResult<Self> {
        let tab_id = raw
            .tab_id
            .ok_or_else(|| HandlerError::invalid_event("missing tab id"))?;
        let tab = raw
            .tab
            .ok_or_else(|| HandlerError::invalid_event("missing tab snapshot"))?;
        let url = tab
            .url
            .ok_or_else(|| HandlerError::invalid_event("tab snapshot has no url"))?;
        let incognito = tab
            .incognito
            .ok_or_else(|| HandlerError::invalid_event("tab snapshot has no incognito flag"))?;
        let active = tab
            .active
            .ok_or_else(|| HandlerError::invalid_event("tab snapshot has no active flag"))?;

        Self::new(tab_id, raw.changed, TabSnapshot::new(url, incognito, active)?)
    }
}
