//! `pagetrail-background` entry point.
//!
//! Drives the background component from newline-delimited JSON commands on
//! stdin, one JSON response per line on stdout. Logs go to stderr.
//!
//! ```text
//! {"cmd":"tab_updated","tab_id":1,"changed":{"url":"https://a.example"},"tab":{"url":"https://a.example","incognito":false,"active":true}}
//! {"cmd":"dom_loaded","tab_id":1,"title":"A","text":"page body"}
//! {"cmd":"search","term":"body"}
//! ```

use std::sync::Arc;

use pagetrail_background::migration::MigrationManager;
use pagetrail_background::{
    ChannelTabSignals, ConfigLogPolicy, FavIconFetcher, HttpFavIconFetcher, IdleState, LogPolicy,
    Notifier, PageExtractor, RawTabEvent, ReportedPageExtractor, TabChangedEvent, TabId,
    TabSignals, TabStateManager, TracingNotifier, VisitSchedulingService, idle_channel,
};
use pagetrail_index::{
    IndexSelector, LegacyIndex, LegacySource, PageContent, PageVisitStore, PagetrailConfig,
};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;

const DEFAULT_SEARCH_LIMIT: usize = 20;

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Command {
    TabUpdated {
        #[serde(flatten)]
        event: RawTabEvent,
    },
    DomLoaded {
        tab_id: TabId,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    TabActivated {
        tab_id: TabId,
    },
    TabDeactivated {
        tab_id: TabId,
    },
    Scroll {
        tab_id: TabId,
        px: i64,
        perc: f64,
    },
    TabRemoved {
        tab_id: TabId,
    },
    Idle,
    Active,
    Search {
        term: String,
        #[serde(default = "default_search_limit")]
        limit: usize,
    },
    Status,
}

struct Driver {
    store: Arc<PageVisitStore>,
    legacy: Option<Arc<LegacyIndex>>,
    selector: IndexSelector,
    signals: Arc<ChannelTabSignals>,
    extractor: Arc<ReportedPageExtractor>,
    scheduler: Arc<VisitSchedulingService>,
    migration: Option<Arc<MigrationManager>>,
    idle_tx: watch::Sender<IdleState>,
}

impl Driver {
    /// Parse and dispatch a single command line.
    async fn dispatch_line(&self, raw: &str) -> serde_json::Value {
        let command: Command = match serde_json::from_str(raw) {
            Ok(cmd) => cmd,
            Err(e) => return json!({ "ok": false, "error": format!("invalid command: {e}") }),
        };

        match self.dispatch(command).await {
            Ok(value) => value,
            Err(message) => json!({ "ok": false, "error": message }),
        }
    }

    async fn dispatch(&self, command: Command) -> Result<serde_json::Value, String> {
        match command {
            Command::TabUpdated { event } => {
                let event = TabChangedEvent::try_from(event).map_err(|e| e.to_string())?;
                let tab_id = event.tab_id();
                if event.changed().url.is_some() {
                    self.signals.reset_dom_loaded(tab_id);
                    self.extractor.forget(tab_id);
                }
                self.signals.set_active(tab_id, event.tab().active());
                // Later commands for this tab must see the new URL
                let handlers = self.scheduler.apply_tab_updated(event).await;
                Ok(json!({ "ok": true, "handlers": handlers }))
            }
            Command::DomLoaded {
                tab_id,
                title,
                text,
            } => {
                if let Some(state) = self.scheduler.tabs().get(tab_id).await {
                    self.extractor
                        .report(tab_id, state.url, PageContent { title, text });
                }
                self.signals.mark_dom_loaded(tab_id);
                Ok(json!({ "ok": true }))
            }
            Command::TabActivated { tab_id } => {
                let known = self.scheduler.handle_tab_activated(tab_id).await;
                self.signals.set_active(tab_id, true);
                Ok(json!({ "ok": true, "known": known }))
            }
            Command::TabDeactivated { tab_id } => {
                let known = self.scheduler.handle_tab_deactivated(tab_id).await;
                self.signals.set_active(tab_id, false);
                Ok(json!({ "ok": true, "known": known }))
            }
            Command::Scroll { tab_id, px, perc } => {
                let known = self.scheduler.handle_scroll(tab_id, px, perc).await;
                Ok(json!({ "ok": true, "known": known }))
            }
            Command::TabRemoved { tab_id } => {
                let updated = self.scheduler.handle_tab_removed(tab_id).await;
                self.signals.remove(tab_id);
                self.extractor.forget(tab_id);
                match updated {
                    Ok(updated) => Ok(json!({ "ok": true, "visit_updated": updated })),
                    Err(e) => {
                        tracing::warn!(tab_id, error = %e, "visit end update failed");
                        Ok(json!({ "ok": true, "visit_updated": false }))
                    }
                }
            }
            Command::Idle => {
                self.idle_tx.send_replace(IdleState::Idle);
                Ok(json!({ "ok": true }))
            }
            Command::Active => {
                self.idle_tx.send_replace(IdleState::Active);
                Ok(json!({ "ok": true }))
            }
            Command::Search { term, limit } => self.search(&term, limit),
            Command::Status => {
                let migration = self
                    .migration
                    .as_ref()
                    .map(|m| m.status().as_str());
                let pages = self.store.page_count().map_err(|e| e.to_string())?;
                Ok(json!({
                    "ok": true,
                    "use_legacy": self.selector.use_legacy(),
                    "migration": migration,
                    "pages": pages,
                    "tabs": self.scheduler.tabs().tab_count().await,
                }))
            }
        }
    }

    fn search(&self, term: &str, limit: usize) -> Result<serde_json::Value, String> {
        if self.selector.use_legacy()
            && let Some(legacy) = &self.legacy
        {
            let docs = legacy.search(term, limit).map_err(|e| e.to_string())?;
            let hits: Vec<_> = docs
                .into_iter()
                .map(|d| json!({ "url": d.url, "title": d.title }))
                .collect();
            return Ok(json!({ "ok": true, "index": "legacy", "hits": hits }));
        }

        let hits = self
            .store
            .find_pages_by_term(term, limit)
            .map_err(|e| e.to_string())?;
        let hits: Vec<_> = hits
            .into_iter()
            .map(|h| {
                json!({
                    "url": h.url,
                    "hostname": h.hostname,
                    "title": h.title,
                    "last_seen": h.last_seen,
                })
            })
            .collect();
        Ok(json!({ "ok": true, "index": "new", "hits": hits }))
    }
}

fn open_legacy(cfg: &PagetrailConfig) -> std::io::Result<Option<Arc<LegacyIndex>>> {
    let Some(path) = cfg.resolved_legacy_db_path() else {
        return Ok(None);
    };
    if !path.exists() {
        tracing::info!(path = %path.display(), "no legacy index found");
        return Ok(None);
    }
    let legacy = LegacyIndex::open(&path).map_err(|e| {
        std::io::Error::other(format!("Failed to open legacy index: {e}"))
    })?;
    Ok(Some(Arc::new(legacy)))
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing (stdout carries the protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("pagetrail-background v{} starting", env!("CARGO_PKG_VERSION"));

    let cfg = PagetrailConfig::load()
        .map_err(|e| std::io::Error::other(format!("Failed to load config: {e}")))?;

    let store = Arc::new(PageVisitStore::connect_and_init(&cfg).map_err(|e| {
        std::io::Error::other(format!("Failed to initialize page index: {e}"))
    })?);
    tracing::info!("Page index at {}", cfg.resolved_db_path().display());

    let legacy = open_legacy(&cfg)?;
    let cursor = store
        .load_cursor()
        .map_err(|e| std::io::Error::other(format!("Failed to read migration cursor: {e}")))?;
    let selector = IndexSelector::from_cursor(&cursor, legacy.is_some());

    let signals = Arc::new(ChannelTabSignals::new());
    let extractor = Arc::new(ReportedPageExtractor::new());
    let fetcher = HttpFavIconFetcher::new(&cfg.fav_icons)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let scheduler = Arc::new(VisitSchedulingService::new(
        Arc::new(TabStateManager::new()),
        Arc::clone(&store),
        Arc::clone(&signals) as Arc<dyn TabSignals>,
        Arc::new(ConfigLogPolicy::new(cfg.visits.clone())) as Arc<dyn LogPolicy>,
        Arc::clone(&extractor) as Arc<dyn PageExtractor>,
        Arc::new(fetcher) as Arc<dyn FavIconFetcher>,
        cfg.visits.min_active_time(),
    ));

    let (idle_tx, idle_rx) = idle_channel();
    let migration = match &legacy {
        Some(legacy) => {
            let manager = MigrationManager::new(
                Arc::clone(&store),
                Arc::clone(legacy) as Arc<dyn LegacySource>,
                selector.clone(),
                Arc::new(TracingNotifier) as Arc<dyn Notifier>,
                cfg.migration.clone(),
            )
            .map_err(|e| std::io::Error::other(format!("Failed to start migration: {e}")))?;
            let manager = Arc::new(manager);
            manager.spawn_idle_watch(idle_rx);
            Some(manager)
        }
        None => None,
    };

    let driver = Driver {
        store,
        legacy,
        selector,
        signals,
        extractor,
        scheduler,
        migration,
        idle_tx,
    };

    let mut reader = BufReader::new(tokio::io::stdin());
    let mut writer = tokio::io::stdout();
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break; // EOF
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = driver.dispatch_line(trimmed).await;
        let mut response_bytes = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
        response_bytes.push(b'\n');
        writer.write_all(&response_bytes).await?;
        writer.flush().await?;
    }

    if let Some(migration) = &driver.migration {
        migration.stop().await;
        migration.join().await;
    }

    tracing::info!("pagetrail-background exiting cleanly");
    Ok(())
}
