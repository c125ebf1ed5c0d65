mod support;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pacsvault_core::alerts::{AlertCode, RecordingAlertSink};
use pacsvault_core::config::DispatcherConfig;
use pacsvault_core::database::ports::ServiceLockRepository;
use pacsvault_core::database::{InMemoryStore, StoreOp};
use pacsvault_core::error::{PacsError, Result};
use pacsvault_core::processing::{ItemProcessor, ProcessorRegistry};
use pacsvault_core::service_lock::{ServiceLockProcessor, ServiceLockQueue};
use pacsvault_model::{ServiceLockEntry, ServiceLockType};
use support::PROCESSOR_ID;
use tokio::task::JoinHandle;

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Fail,
    Panic,
}

/// Records concurrency and unlocks its entry far in the future on success.
struct ProbeProcessor {
    store: Arc<InMemoryStore>,
    behaviour: Behaviour,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    max_locked: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

#[async_trait]
impl ItemProcessor<ServiceLockEntry> for ProbeProcessor {
    fn name(&self) -> &str {
        "probe"
    }

    async fn process(&self, entry: &ServiceLockEntry) -> Result<()> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        let locked = self.store.locked_entry_count(PROCESSOR_ID).await;
        self.max_locked.fetch_max(locked, Ordering::SeqCst);

        tokio::time::sleep(StdDuration::from_millis(30)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        match self.behaviour {
            Behaviour::Succeed => {
                self.store
                    .unlock_entry(entry.id, false, Utc::now() + Duration::days(1))
                    .await?;
                self.completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Behaviour::Fail => Err(PacsError::Internal("probe failure".into())),
            Behaviour::Panic => panic!("probe panic"),
        }
    }
}

#[derive(Clone, Default)]
struct Counters {
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    max_locked: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

fn registry(
    store: &Arc<InMemoryStore>,
    behaviour: Behaviour,
    counters: &Counters,
) -> ProcessorRegistry<ServiceLockEntry> {
    let mut registry = ProcessorRegistry::new();
    let store = store.clone();
    let counters = counters.clone();
    registry.register(ServiceLockType::FilesystemReinventory, move || {
        Ok(Arc::new(ProbeProcessor {
            store: store.clone(),
            behaviour,
            running: counters.running.clone(),
            max_running: counters.max_running.clone(),
            max_locked: counters.max_locked.clone(),
            completed: counters.completed.clone(),
        }) as Arc<dyn ItemProcessor<ServiceLockEntry>>)
    });
    registry
}

fn config(concurrency: usize) -> DispatcherConfig {
    DispatcherConfig {
        processor_id: PROCESSOR_ID.to_string(),
        concurrency,
        idle_poll_ms: 10,
        saturated_poll_ms: 5,
        error_retry_ms: 5,
        release_retry_ms: 5,
        drain_timeout_ms: 1_000,
        ..DispatcherConfig::default()
    }
}

fn start(
    store: &Arc<InMemoryStore>,
    registry: ProcessorRegistry<ServiceLockEntry>,
    alerts: &Arc<RecordingAlertSink>,
    config: DispatcherConfig,
) -> (Arc<ServiceLockProcessor>, JoinHandle<()>) {
    let queue = Arc::new(ServiceLockQueue::new(
        store.clone(),
        config.failure_reschedule(),
    ));
    let dispatcher = Arc::new(ServiceLockProcessor::new(
        queue,
        registry,
        alerts.clone(),
        config,
    ));
    let running = dispatcher.clone();
    let handle = tokio::spawn(async move { running.run().await });
    (dispatcher, handle)
}

async fn stop(dispatcher: &ServiceLockProcessor, handle: JoinHandle<()>) {
    dispatcher.request_stop();
    tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("dispatcher stopped")
        .expect("dispatcher task");
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(StdDuration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

async fn seed(store: &InMemoryStore, lock_type: ServiceLockType) -> ServiceLockEntry {
    let entry = ServiceLockEntry::new(lock_type, None, Utc::now() - Duration::seconds(1));
    store.insert_entry(&entry).await.expect("insert entry");
    entry
}

#[tokio::test]
async fn never_holds_more_locks_than_pool_slots() {
    let store = Arc::new(InMemoryStore::new());
    let alerts = Arc::new(RecordingAlertSink::new());
    let counters = Counters::default();
    for _ in 0..6 {
        seed(&store, ServiceLockType::FilesystemReinventory).await;
    }

    let (dispatcher, handle) = start(
        &store,
        registry(&store, Behaviour::Succeed, &counters),
        &alerts,
        config(2),
    );
    eventually(|| async { counters.completed.load(Ordering::SeqCst) == 6 }).await;
    stop(&dispatcher, handle).await;

    assert!(counters.max_running.load(Ordering::SeqCst) <= 2);
    assert!(counters.max_locked.load(Ordering::SeqCst) <= 2);
    assert!(alerts.alerts().is_empty());
}

#[tokio::test]
async fn orphaned_lock_is_cleared_on_startup() {
    let store = Arc::new(InMemoryStore::new());
    let alerts = Arc::new(RecordingAlertSink::new());
    let counters = Counters::default();
    let mut orphan = ServiceLockEntry::new(
        ServiceLockType::FilesystemReinventory,
        None,
        Utc::now() - Duration::minutes(5),
    );
    orphan.locked = true;
    orphan.processor_id = Some(PROCESSOR_ID.to_string());
    store.insert_entry(&orphan).await.unwrap();

    let (dispatcher, handle) = start(
        &store,
        registry(&store, Behaviour::Succeed, &counters),
        &alerts,
        config(1),
    );
    eventually(|| async { counters.completed.load(Ordering::SeqCst) == 1 }).await;
    stop(&dispatcher, handle).await;

    let entry = store.get_entry(orphan.id).await.unwrap().unwrap();
    assert!(!entry.locked);
    assert!(entry.processor_id.is_none());
}

#[tokio::test]
async fn unregistered_type_is_pushed_back_ten_minutes() {
    let store = Arc::new(InMemoryStore::new());
    let alerts = Arc::new(RecordingAlertSink::new());
    let entry = seed(&store, ServiceLockType::PurgeAlerts).await;

    let (dispatcher, handle) = start(&store, ProcessorRegistry::new(), &alerts, config(1));
    eventually(|| async { !alerts.with_code(AlertCode::UnknownProcessor).is_empty() }).await;
    eventually(|| async {
        store
            .get_entry(entry.id)
            .await
            .unwrap()
            .is_some_and(|entry| !entry.locked)
    })
    .await;
    stop(&dispatcher, handle).await;

    let entry = store.get_entry(entry.id).await.unwrap().unwrap();
    assert!(entry.enabled);
    let delay = entry.scheduled_time - Utc::now();
    assert!(delay > Duration::minutes(9) && delay <= Duration::minutes(10));
}

#[tokio::test]
async fn factory_error_releases_entry_and_alerts() {
    let store = Arc::new(InMemoryStore::new());
    let alerts = Arc::new(RecordingAlertSink::new());
    let entry = seed(&store, ServiceLockType::FilesystemReinventory).await;
    let mut registry = ProcessorRegistry::new();
    registry.register(ServiceLockType::FilesystemReinventory, || {
        Err(PacsError::Internal("missing codec".into()))
    });

    let (dispatcher, handle) = start(&store, registry, &alerts, config(1));
    eventually(|| async { !alerts.with_code(AlertCode::ProcessorFailed).is_empty() }).await;
    eventually(|| async {
        store
            .get_entry(entry.id)
            .await
            .unwrap()
            .is_some_and(|entry| !entry.locked && entry.scheduled_time > Utc::now())
    })
    .await;
    stop(&dispatcher, handle).await;
}

#[tokio::test]
async fn failing_processor_is_released_even_when_unlock_retries() {
    let store = Arc::new(InMemoryStore::new());
    let alerts = Arc::new(RecordingAlertSink::new());
    let counters = Counters::default();
    let entry = seed(&store, ServiceLockType::FilesystemReinventory).await;
    store.fail_next(StoreOp::UnlockEntry, 2);

    let (dispatcher, handle) = start(
        &store,
        registry(&store, Behaviour::Fail, &counters),
        &alerts,
        config(1),
    );
    eventually(|| async {
        store
            .get_entry(entry.id)
            .await
            .unwrap()
            .is_some_and(|entry| !entry.locked)
    })
    .await;
    stop(&dispatcher, handle).await;

    let entry = store.get_entry(entry.id).await.unwrap().unwrap();
    assert!(entry.scheduled_time > Utc::now() + Duration::minutes(9));
    let failures = alerts.with_code(AlertCode::ProcessorFailed);
    assert_eq!(failures.len(), 1);
    assert!(failures[0].message.contains("probe failure"));
}

#[tokio::test]
async fn panicking_processor_is_released() {
    let store = Arc::new(InMemoryStore::new());
    let alerts = Arc::new(RecordingAlertSink::new());
    let counters = Counters::default();
    let entry = seed(&store, ServiceLockType::FilesystemReinventory).await;

    let (dispatcher, handle) = start(
        &store,
        registry(&store, Behaviour::Panic, &counters),
        &alerts,
        config(1),
    );
    eventually(|| async {
        store
            .get_entry(entry.id)
            .await
            .unwrap()
            .is_some_and(|entry| !entry.locked)
    })
    .await;
    stop(&dispatcher, handle).await;

    let failures = alerts.with_code(AlertCode::ProcessorFailed);
    assert_eq!(failures.len(), 1);
    assert!(failures[0].message.contains("panic: probe panic"));
    assert_eq!(dispatcher.pool().active_count(), 0);
}

#[tokio::test]
async fn stop_returns_while_idle() {
    let store = Arc::new(InMemoryStore::new());
    let alerts = Arc::new(RecordingAlertSink::new());
    store.fail_next(StoreOp::SelectEntry, 3);

    let (dispatcher, handle) = start(&store, ProcessorRegistry::new(), &alerts, config(1));
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    stop(&dispatcher, handle).await;

    assert!(!dispatcher.pool().can_queue_item());
}
