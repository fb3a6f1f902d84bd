//! Legacy index migration
//!
//! Moves documents from the legacy index into the page store while the
//! user is idle. State machine:
//!
//! ```text
//! Idle -> Running -> Paused -> Running -> ... -> Complete
//! ```
//!
//! The loop commits one batch at a time and only then advances the
//! persisted cursor, so an interrupted batch is simply replayed. A pause
//! request is honoured at the next batch boundary. `Complete` is terminal.

use crate::collaborators::Notifier;
use crate::signals::IdleState;
use backon::{BackoffBuilder, ExponentialBuilder};
use pagetrail_index::{
    IndexError, IndexSelector, LegacyDocument, LegacySource, MigrationConfig, MigrationStatus, Page,
    PageVisitStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const MIGRATE_NOTIF_TITLE: &str = "Search index upgraded";
pub const MIGRATE_NOTIF_MESSAGE: &str =
    "Your browsing history has been moved to the new search index.";

/// Result of one successfully processed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    Migrated { position: i64, pages: usize },
    EndOfData,
}

/// Why the retry loop for a batch stopped without success
enum BatchFailure {
    Paused,
    GaveUp(IndexError),
}

struct RunHandle {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct MigrationManager {
    store: Arc<PageVisitStore>,
    legacy: Arc<dyn LegacySource>,
    selector: IndexSelector,
    notifier: Arc<dyn Notifier>,
    cfg: MigrationConfig,
    state: watch::Sender<MigrationStatus>,
    /// The single running (or finishing) migration loop
    run: Mutex<Option<RunHandle>>,
}

impl MigrationManager {
    /// Create a manager, restoring terminal state from the persisted cursor
    pub fn new(
        store: Arc<PageVisitStore>,
        legacy: Arc<dyn LegacySource>,
        selector: IndexSelector,
        notifier: Arc<dyn Notifier>,
        cfg: MigrationConfig,
    ) -> pagetrail_index::Result<Self> {
        let cursor = store.load_cursor()?;
        let initial = match cursor.status {
            MigrationStatus::Complete => MigrationStatus::Complete,
            _ => MigrationStatus::Idle,
        };
        tracing::debug!(
            position = cursor.position,
            status = initial.as_str(),
            "migration manager restored"
        );

        Ok(Self {
            store,
            legacy,
            selector,
            notifier,
            cfg,
            state: watch::Sender::new(initial),
            run: Mutex::new(None),
        })
    }

    pub fn status(&self) -> MigrationStatus {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MigrationStatus> {
        self.state.subscribe()
    }

    /// Begin or resume migrating
    ///
    /// No-op while already running, after completion, or once the new
    /// index is live. Returns whether a run was started.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut run = self.run.lock().await;

        match self.status() {
            MigrationStatus::Running | MigrationStatus::Complete => {
                tracing::debug!(status = self.status().as_str(), "migration start ignored");
                return false;
            }
            MigrationStatus::Idle | MigrationStatus::Paused => {}
        }
        if !self.selector.use_legacy() {
            tracing::debug!("legacy index no longer in use; migration start ignored");
            return false;
        }

        // A paused loop may still be finishing its last batch
        if let Some(previous) = run.take()
            && let Err(e) = previous.handle.await
        {
            tracing::error!(error = %e, "previous migration loop panicked");
        }
        if self.status() == MigrationStatus::Complete {
            return false;
        }

        self.set_status(MigrationStatus::Running);
        let stop = CancellationToken::new();
        let this = Arc::clone(self);
        let loop_stop = stop.clone();
        let handle = tokio::spawn(async move { this.run_loop(loop_stop).await });
        *run = Some(RunHandle { stop, handle });

        tracing::info!("migration started");
        true
    }

    /// Pause migrating; the batch in flight is allowed to finish
    pub async fn stop(&self) -> bool {
        let run = self.run.lock().await;
        let paused = self.state.send_if_modified(|s| {
            if *s == MigrationStatus::Running {
                *s = MigrationStatus::Paused;
                true
            } else {
                false
            }
        });
        if let Some(run) = run.as_ref() {
            run.stop.cancel();
        }
        if paused {
            self.persist_status(MigrationStatus::Paused);
            tracing::info!("migration paused");
        }
        paused
    }

    /// Wait for the current loop, if any, to exit
    pub async fn join(&self) {
        let mut run = self.run.lock().await;
        if let Some(current) = run.take()
            && let Err(e) = current.handle.await
        {
            tracing::error!(error = %e, "migration loop panicked");
        }
    }

    /// Follow idle/active signals until migration completes
    ///
    /// Returns `None` when migration is disabled or the legacy index is no
    /// longer in use, in which case nothing is scheduled.
    pub fn spawn_idle_watch(
        self: &Arc<Self>,
        mut idle: watch::Receiver<IdleState>,
    ) -> Option<JoinHandle<()>> {
        if !self.cfg.enabled || !self.selector.use_legacy() {
            tracing::info!(
                enabled = self.cfg.enabled,
                use_legacy = self.selector.use_legacy(),
                "legacy migration not scheduled"
            );
            return None;
        }

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                let presence = *idle.borrow_and_update();
                match presence {
                    IdleState::Idle => {
                        this.start().await;
                    }
                    IdleState::Active => {
                        this.stop().await;
                    }
                }
                if this.status() == MigrationStatus::Complete {
                    break;
                }
                if idle.changed().await.is_err() {
                    break;
                }
            }
        }))
    }

    fn set_status(&self, status: MigrationStatus) {
        self.state.send_replace(status);
        self.persist_status(status);
    }

    fn persist_status(&self, status: MigrationStatus) {
        if let Err(e) = self.store.set_cursor_status(status) {
            tracing::warn!(status = status.as_str(), error = %e, "failed to persist migration status");
        }
    }

    async fn run_loop(self: Arc<Self>, stop: CancellationToken) {
        loop {
            if stop.is_cancelled() {
                tracing::debug!("migration loop paused at batch boundary");
                return;
            }

            match self.run_batch_with_retry(&stop).await {
                Ok(BatchOutcome::Migrated { position, pages }) => {
                    tracing::debug!(position, pages, "migration batch committed");
                    // Let pause requests in between batches
                    tokio::task::yield_now().await;
                }
                Ok(BatchOutcome::EndOfData) => {
                    self.complete();
                    return;
                }
                Err(BatchFailure::Paused) => return,
                Err(BatchFailure::GaveUp(e)) => {
                    tracing::error!(
                        category = e.category().as_str(),
                        error = %e,
                        "migration batch failed; parking until next idle period"
                    );
                    let parked = self.state.send_if_modified(|s| {
                        if *s == MigrationStatus::Running {
                            *s = MigrationStatus::Paused;
                            true
                        } else {
                            false
                        }
                    });
                    if parked {
                        self.persist_status(MigrationStatus::Paused);
                    }
                    return;
                }
            }
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.cfg.initial_backoff_ms))
            .with_max_delay(Duration::from_millis(self.cfg.max_backoff_ms))
            .with_factor(2.0)
            .with_max_times(self.cfg.max_attempts)
    }

    async fn run_batch_with_retry(
        &self,
        stop: &CancellationToken,
    ) -> Result<BatchOutcome, BatchFailure> {
        let mut delays = self.backoff().build();
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            let err = match self.migrate_next_batch() {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };

            if !err.category().is_retryable() {
                return Err(BatchFailure::GaveUp(err));
            }
            let Some(delay) = delays.next() else {
                return Err(BatchFailure::GaveUp(err));
            };

            tracing::warn!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "migration batch failed; retrying"
            );
            if wait_with_cancel(stop, delay).await.is_err() {
                return Err(BatchFailure::Paused);
            }
        }
    }

    /// Read, transform and commit the batch after the persisted cursor
    fn migrate_next_batch(&self) -> pagetrail_index::Result<BatchOutcome> {
        let cursor = self.store.load_cursor()?;
        let records = self
            .legacy
            .read_batch(cursor.position, self.cfg.batch_size)?;
        let Some(last) = records.last().map(|r| r.position) else {
            return Ok(BatchOutcome::EndOfData);
        };

        let pages: Vec<Page> = records
            .iter()
            .filter_map(|record| match record.document().and_then(LegacyDocument::into_page) {
                Ok(page) => Some(page),
                Err(e) => {
                    tracing::warn!(
                        position = record.position,
                        error = %e,
                        "skipping untransformable legacy record"
                    );
                    None
                }
            })
            .collect();

        let imported = self.store.import_batch(&pages)?;
        self.store.advance_cursor(last)?;

        Ok(BatchOutcome::Migrated {
            position: last,
            pages: imported,
        })
    }

    fn complete(&self) {
        let first = self.state.send_if_modified(|s| {
            if *s == MigrationStatus::Complete {
                false
            } else {
                *s = MigrationStatus::Complete;
                true
            }
        });
        if !first {
            return;
        }

        self.persist_status(MigrationStatus::Complete);
        self.notifier.notify(MIGRATE_NOTIF_TITLE, MIGRATE_NOTIF_MESSAGE);
        self.selector.switch_to_new();
        tracing::info!("migration complete");
    }
}

async fn wait_with_cancel(cancel: &CancellationToken, duration: Duration) -> Result<(), ()> {
    if duration.is_zero() {
        return Ok(());
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(()),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pagetrail_index::{LegacyIndex, LegacyVisit};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier {
        sent: AtomicUsize,
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, _title: &str, _message: &str) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn legacy_with(n: i64) -> Arc<LegacyIndex> {
        let legacy = LegacyIndex::connect_in_memory().expect("legacy");
        for i in 1..=n {
            legacy
                .insert_document(&LegacyDocument {
                    url: format!("https://old.test/{i}"),
                    title: Some(format!("Doc {i}")),
                    content: None,
                    visits: vec![LegacyVisit {
                        time: i,
                        duration: None,
                        scroll_max_perc: None,
                    }],
                    bookmarks: Vec::new(),
                })
                .expect("insert");
        }
        Arc::new(legacy)
    }

    fn build_manager(
        legacy: Arc<LegacyIndex>,
        cfg: MigrationConfig,
    ) -> (Arc<MigrationManager>, Arc<PageVisitStore>, Arc<CountingNotifier>, IndexSelector) {
        let store = Arc::new(PageVisitStore::connect_in_memory().expect("store"));
        let notifier = Arc::new(CountingNotifier::default());
        let selector = IndexSelector::new(true);
        let manager = MigrationManager::new(
            Arc::clone(&store),
            legacy,
            selector.clone(),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            cfg,
        )
        .expect("manager");
        (Arc::new(manager), store, notifier, selector)
    }

    #[tokio::test]
    async fn drains_legacy_and_completes_once() {
        let cfg = MigrationConfig {
            batch_size: 2,
            ..MigrationConfig::default()
        };
        let (manager, store, notifier, selector) = build_manager(legacy_with(5), cfg);

        assert!(manager.start().await);
        manager.join().await;

        assert_eq!(manager.status(), MigrationStatus::Complete);
        assert_eq!(store.page_count().expect("count"), 5);
        assert_eq!(store.load_cursor().expect("cursor").position, 5);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
        assert!(!selector.use_legacy());

        assert!(!manager.start().await);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_outside_running_is_noop() {
        let (manager, ..) = build_manager(legacy_with(1), MigrationConfig::default());
        assert!(!manager.stop().await);
        assert_eq!(manager.status(), MigrationStatus::Idle);
    }

    #[tokio::test]
    async fn disabled_migration_is_not_scheduled() {
        let cfg = MigrationConfig {
            enabled: false,
            ..MigrationConfig::default()
        };
        let (manager, ..) = build_manager(legacy_with(1), cfg);
        let (_tx, rx) = crate::signals::idle_channel();
        assert!(manager.spawn_idle_watch(rx).is_none());
    }

    #[tokio::test]
    async fn late_pause_write_cannot_undo_completion() {
        let (manager, store, ..) = build_manager(legacy_with(2), MigrationConfig::default());
        manager.start().await;
        manager.join().await;
        assert_eq!(manager.status(), MigrationStatus::Complete);

        // A pause that flipped state just before completion persists last
        manager.persist_status(MigrationStatus::Paused);

        let cursor = store.load_cursor().expect("cursor");
        assert_eq!(cursor.status, MigrationStatus::Complete);
        assert_eq!(cursor.position, 2);
    }

    #[tokio::test]
    async fn pausing_keeps_the_committed_position() {
        let cfg = MigrationConfig {
            batch_size: 1,
            ..MigrationConfig::default()
        };
        let (manager, store, ..) = build_manager(legacy_with(3), cfg);
        store.advance_cursor(2).expect("advance");

        manager.start().await;
        manager.join().await;
        assert_eq!(store.page_count().expect("count"), 1, "only the record after 2");

        // Status writes leave the position alone
        manager.persist_status(MigrationStatus::Paused);
        assert_eq!(store.load_cursor().expect("cursor").position, 3);
    }

    #[tokio::test]
    async fn untransformable_records_are_skipped() {
        let legacy = legacy_with(1);
        legacy.insert_raw("{broken").expect("insert");
        let (manager, store, ..) = build_manager(Arc::clone(&legacy), MigrationConfig::default());

        manager.start().await;
        manager.join().await;

        assert_eq!(manager.status(), MigrationStatus::Complete);
        assert_eq!(store.page_count().expect("count"), 1);
        assert_eq!(store.load_cursor().expect("cursor").position, 2);
    }
}
