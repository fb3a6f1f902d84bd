#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Legacy migration driven through idle/active transitions.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pagetrail_background::{IdleState, MigrationManager, Notifier, idle_channel};
use pagetrail_index::{
    IndexError, IndexSelector, LegacyDocument, LegacyIndex, LegacyRecord, LegacySource,
    LegacyVisit, MigrationConfig, MigrationStatus, PageVisitStore,
};
use pretty_assertions::assert_eq;
use tokio::sync::watch;

#[derive(Default)]
struct CountingNotifier {
    sent: AtomicUsize,
}

impl Notifier for CountingNotifier {
    fn notify(&self, _title: &str, _message: &str) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }
}

/// Publishes the `after` position of every batch read
struct RecordingSource {
    inner: Arc<LegacyIndex>,
    reads: watch::Sender<Vec<i64>>,
}

impl RecordingSource {
    fn new(inner: Arc<LegacyIndex>) -> Self {
        Self {
            inner,
            reads: watch::Sender::new(Vec::new()),
        }
    }
}

impl LegacySource for RecordingSource {
    fn read_batch(&self, after: i64, limit: usize) -> pagetrail_index::Result<Vec<LegacyRecord>> {
        self.reads.send_modify(|reads| reads.push(after));
        self.inner.read_batch(after, limit)
    }
}

/// Fails a fixed number of reads before delegating
struct FlakySource {
    inner: Arc<LegacyIndex>,
    failures_left: AtomicUsize,
    retryable: bool,
    reads: AtomicUsize,
}

impl FlakySource {
    fn new(inner: Arc<LegacyIndex>, failures: usize, retryable: bool) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
            retryable,
            reads: AtomicUsize::new(0),
        }
    }
}

impl LegacySource for FlakySource {
    fn read_batch(&self, after: i64, limit: usize) -> pagetrail_index::Result<Vec<LegacyRecord>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(if self.retryable {
                IndexError::store("legacy database is locked")
            } else {
                IndexError::validation("legacy database has an unknown layout")
            });
        }
        self.inner.read_batch(after, limit)
    }
}

fn legacy_with(n: i64) -> Arc<LegacyIndex> {
    let legacy = LegacyIndex::connect_in_memory().unwrap();
    for i in 1..=n {
        legacy
            .insert_document(&LegacyDocument {
                url: format!("https://archive.test/doc/{i}"),
                title: Some(format!("Archived {i}")),
                content: Some(format!("archived body number{i}")),
                visits: vec![LegacyVisit {
                    time: 1_000 * i,
                    duration: Some(2_000),
                    scroll_max_perc: Some(0.5),
                }],
                bookmarks: if i % 2 == 0 { vec![5_000 * i] } else { Vec::new() },
            })
            .unwrap();
    }
    Arc::new(legacy)
}

fn small_batches() -> MigrationConfig {
    MigrationConfig {
        batch_size: 1,
        initial_backoff_ms: 100,
        max_backoff_ms: 1_000,
        max_attempts: 3,
        ..MigrationConfig::default()
    }
}

fn manager_over(
    store: &Arc<PageVisitStore>,
    source: Arc<dyn LegacySource>,
    cfg: MigrationConfig,
) -> (Arc<MigrationManager>, Arc<CountingNotifier>, IndexSelector) {
    let cursor = store.load_cursor().unwrap();
    let selector = IndexSelector::from_cursor(&cursor, true);
    let notifier = Arc::new(CountingNotifier::default());
    let manager = MigrationManager::new(
        Arc::clone(store),
        source,
        selector.clone(),
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        cfg,
    )
    .unwrap();
    (Arc::new(manager), notifier, selector)
}

#[tokio::test]
async fn user_activity_pauses_and_idle_resumes_from_cursor() {
    let store = Arc::new(PageVisitStore::connect_in_memory().unwrap());
    let source = Arc::new(RecordingSource::new(legacy_with(6)));
    let mut reads = source.reads.subscribe();
    let (manager, notifier, selector) = manager_over(
        &store,
        Arc::clone(&source) as Arc<dyn LegacySource>,
        small_batches(),
    );
    let mut status = manager.subscribe();

    let (idle_tx, idle_rx) = idle_channel();
    let watcher = manager.spawn_idle_watch(idle_rx).unwrap();

    idle_tx.send_replace(IdleState::Idle);
    reads.wait_for(|r| r.len() >= 2).await.unwrap();
    idle_tx.send_replace(IdleState::Active);
    status
        .wait_for(|s| *s == MigrationStatus::Paused)
        .await
        .unwrap();
    manager.join().await;

    let paused = store.load_cursor().unwrap();
    assert_eq!(paused.status, MigrationStatus::Paused);
    assert!(paused.position >= 2 && paused.position < 6, "{paused:?}");
    assert_eq!(store.page_count().unwrap(), paused.position);
    assert!(selector.use_legacy());

    let reads_before_resume = source.reads.borrow().len();
    idle_tx.send_replace(IdleState::Idle);
    status
        .wait_for(|s| *s == MigrationStatus::Complete)
        .await
        .unwrap();
    manager.join().await;

    assert_eq!(source.reads.borrow()[reads_before_resume], paused.position);
    assert_eq!(store.page_count().unwrap(), 6);
    assert_eq!(store.load_cursor().unwrap().status, MigrationStatus::Complete);
    assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
    assert!(!selector.use_legacy());

    drop(idle_tx);
    watcher.await.unwrap();
}

#[tokio::test]
async fn restart_resumes_from_persisted_position() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("pagetrail.db");
    let source = Arc::new(RecordingSource::new(legacy_with(6)));
    let mut reads = source.reads.subscribe();
    let cfg = MigrationConfig {
        batch_size: 2,
        ..small_batches()
    };

    let paused_at = {
        let store = Arc::new(PageVisitStore::connect_and_init_at_path(&db_path).unwrap());
        let (manager, ..) = manager_over(
            &store,
            Arc::clone(&source) as Arc<dyn LegacySource>,
            cfg.clone(),
        );
        assert!(manager.start().await);
        reads.wait_for(|r| !r.is_empty()).await.unwrap();
        assert!(manager.stop().await);
        manager.join().await;
        store.load_cursor().unwrap().position
    };
    assert!(paused_at > 0 && paused_at < 6, "paused at {paused_at}");

    let store = Arc::new(PageVisitStore::connect_and_init_at_path(&db_path).unwrap());
    let (manager, notifier, _) = manager_over(
        &store,
        Arc::clone(&source) as Arc<dyn LegacySource>,
        cfg,
    );
    assert_eq!(manager.status(), MigrationStatus::Idle);

    let reads_before_restart = source.reads.borrow().len();
    assert!(manager.start().await);
    manager.join().await;

    assert_eq!(source.reads.borrow()[reads_before_restart], paused_at);
    assert_eq!(manager.status(), MigrationStatus::Complete);
    assert_eq!(store.page_count().unwrap(), 6);
    assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn completion_is_terminal_across_managers() {
    let store = Arc::new(PageVisitStore::connect_in_memory().unwrap());
    let legacy = legacy_with(3);
    let (first, first_notifier, _) = manager_over(
        &store,
        Arc::clone(&legacy) as Arc<dyn LegacySource>,
        MigrationConfig::default(),
    );
    assert!(first.start().await);
    first.join().await;
    assert_eq!(first.status(), MigrationStatus::Complete);
    assert!(!first.start().await);
    assert_eq!(first_notifier.sent.load(Ordering::SeqCst), 1);

    let (second, second_notifier, selector) = manager_over(
        &store,
        legacy as Arc<dyn LegacySource>,
        MigrationConfig::default(),
    );
    assert_eq!(second.status(), MigrationStatus::Complete);
    assert!(!selector.use_legacy());
    assert!(!second.start().await);
    let (_idle_tx, idle_rx) = idle_channel();
    assert!(second.spawn_idle_watch(idle_rx).is_none());
    assert_eq!(second_notifier.sent.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn replaying_an_uncursored_batch_changes_nothing() {
    let legacy = legacy_with(4);

    let clean = Arc::new(PageVisitStore::connect_in_memory().unwrap());
    let (manager, ..) = manager_over(
        &clean,
        Arc::clone(&legacy) as Arc<dyn LegacySource>,
        MigrationConfig::default(),
    );
    manager.start().await;
    manager.join().await;

    // A batch that committed but never advanced the cursor
    let replayed = Arc::new(PageVisitStore::connect_in_memory().unwrap());
    let pages: Vec<_> = legacy
        .read_batch(0, 2)
        .unwrap()
        .iter()
        .map(|r| r.document().and_then(LegacyDocument::into_page).unwrap())
        .collect();
    assert_eq!(replayed.import_batch(&pages).unwrap(), 2);
    assert_eq!(replayed.load_cursor().unwrap().position, 0);

    let (manager, ..) = manager_over(
        &replayed,
        Arc::clone(&legacy) as Arc<dyn LegacySource>,
        MigrationConfig::default(),
    );
    manager.start().await;
    manager.join().await;

    assert_eq!(replayed.page_count().unwrap(), clean.page_count().unwrap());
    assert_eq!(replayed.visit_count().unwrap(), clean.visit_count().unwrap());
    for i in 1..=4 {
        let url = format!("https://archive.test/doc/{i}");
        assert_eq!(
            replayed.get_page(&url).unwrap(),
            clean.get_page(&url).unwrap()
        );
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_then_park() {
    let store = Arc::new(PageVisitStore::connect_in_memory().unwrap());
    let source = Arc::new(FlakySource::new(legacy_with(2), 5, true));
    let (manager, notifier, _) = manager_over(
        &store,
        Arc::clone(&source) as Arc<dyn LegacySource>,
        small_batches(),
    );

    assert!(manager.start().await);
    manager.join().await;

    // One attempt plus three retries
    assert_eq!(source.reads.load(Ordering::SeqCst), 4);
    assert_eq!(manager.status(), MigrationStatus::Paused);
    let cursor = store.load_cursor().unwrap();
    assert_eq!(cursor.position, 0);
    assert_eq!(cursor.status, MigrationStatus::Paused);
    assert_eq!(store.page_count().unwrap(), 0);

    // The next idle period picks it up again
    assert!(manager.start().await);
    manager.join().await;
    assert_eq!(manager.status(), MigrationStatus::Complete);
    assert_eq!(store.page_count().unwrap(), 2);
    assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let store = Arc::new(PageVisitStore::connect_in_memory().unwrap());
    let source = Arc::new(FlakySource::new(legacy_with(2), 1, false));
    let (manager, ..) = manager_over(
        &store,
        Arc::clone(&source) as Arc<dyn LegacySource>,
        small_batches(),
    );

    manager.start().await;
    manager.join().await;

    assert_eq!(source.reads.load(Ordering::SeqCst), 1);
    assert_eq!(manager.status(), MigrationStatus::Paused);
    assert_eq!(store.load_cursor().unwrap().position, 0);
}

#[tokio::test(start_paused = true)]
async fn pausing_during_backoff_stops_retrying() {
    let store = Arc::new(PageVisitStore::connect_in_memory().unwrap());
    let source = Arc::new(FlakySource::new(legacy_with(2), 10, true));
    let cfg = MigrationConfig {
        initial_backoff_ms: 60_000,
        max_backoff_ms: 60_000,
        ..small_batches()
    };
    let (manager, ..) = manager_over(&store, Arc::clone(&source) as Arc<dyn LegacySource>, cfg);

    manager.start().await;
    tokio::task::yield_now().await;
    assert!(manager.stop().await);
    manager.join().await;

    assert_eq!(source.reads.load(Ordering::SeqCst), 1);
    assert_eq!(manager.status(), MigrationStatus::Paused);
}
