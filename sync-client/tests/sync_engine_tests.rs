//! End-to-end sync scenarios against the mock feeds.
//!
//! Each test builds a full [`SyncEngine`] with in-memory or file-backed
//! metadata and drives it through the public API only.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use convsync_client::{
    CheckpointStore, EventReceiver, EventReceivers, InMemoryMetadataStore, JsonFileMetadataStore,
    LiveEvent, MockEventSource, SlowSyncRecord, SlowSyncStepExecutor, SyncConfig,
    SyncDependencies, SyncEngine,
};
use convsync_core::{ConnectionPolicy, SlowSyncStatus, SlowSyncStep, SyncState};
use convsync_types::{
    ConversationEvent, ConversationEventKind, ConversationId, CoreFailure, DeliveryInfo, Event,
    EventId, EventPayload, UserId,
};

// ============================================================================
// Fixtures
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> SyncConfig {
    SyncConfig::from_toml_str(
        r#"
        [backoff]
        initial_delay_ms = 10
        max_delay_ms = 50
        "#,
    )
    .unwrap()
}

fn conversation_event(id: u64) -> Event {
    Event::new(
        EventId::new(id),
        EventPayload::Conversation(ConversationEvent {
            conversation_id: ConversationId::default(),
            sender: UserId::default(),
            kind: ConversationEventKind::Renamed {
                name: id.to_string(),
            },
        }),
    )
    .with_timestamp(1_700_000_000_000 + id)
}

fn complete_record() -> SlowSyncRecord {
    SlowSyncRecord {
        status: SlowSyncStatus::Complete,
        last_completed_at: Some(1_700_000_000),
        version: Some(convsync_client::SLOW_SYNC_VERSION),
    }
}

/// Records the id encoded in each conversation event; can fail once per id.
#[derive(Default)]
struct RecordingReceiver {
    seen: Mutex<Vec<u64>>,
    fail_once: Mutex<HashSet<u64>>,
}

impl RecordingReceiver {
    fn seen(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventReceiver<ConversationEvent> for RecordingReceiver {
    async fn on_event(
        &self,
        event: &ConversationEvent,
        _delivery: DeliveryInfo,
    ) -> Result<(), CoreFailure> {
        let ConversationEventKind::Renamed { name } = &event.kind else {
            return Ok(());
        };
        let id: u64 = name.parse().unwrap();
        self.seen.lock().unwrap().push(id);
        if self.fail_once.lock().unwrap().remove(&id) {
            return Err(CoreFailure::Handler(format!("cannot apply {id}")));
        }
        Ok(())
    }
}

/// Slow sync step that counts its runs and fails with queued failures.
struct CountingStep {
    step: SlowSyncStep,
    runs: AtomicUsize,
    failure: Mutex<Option<CoreFailure>>,
    sticky: bool,
}

impl CountingStep {
    fn new(step: SlowSyncStep) -> Arc<Self> {
        Arc::new(Self {
            step,
            runs: AtomicUsize::new(0),
            failure: Mutex::new(None),
            sticky: false,
        })
    }

    fn always_failing(step: SlowSyncStep, failure: CoreFailure) -> Arc<Self> {
        Arc::new(Self {
            step,
            runs: AtomicUsize::new(0),
            failure: Mutex::new(Some(failure)),
            sticky: true,
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SlowSyncStepExecutor for CountingStep {
    fn step(&self) -> SlowSyncStep {
        self.step
    }

    async fn execute(&self) -> Result<(), CoreFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let mut failure = self.failure.lock().unwrap();
        match failure.clone() {
            Some(cause) => {
                if !self.sticky {
                    *failure = None;
                }
                Err(cause)
            }
            None => Ok(()),
        }
    }
}

/// Slow sync step that panics on its first run.
#[derive(Default)]
struct ExplodingStep {
    runs: AtomicUsize,
}

#[async_trait]
impl SlowSyncStepExecutor for ExplodingStep {
    fn step(&self) -> SlowSyncStep {
        SlowSyncStep::SelfUser
    }

    async fn execute(&self) -> Result<(), CoreFailure> {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("step exploded");
        }
        Ok(())
    }
}

fn executors(steps: &[Arc<CountingStep>]) -> Vec<Arc<dyn SlowSyncStepExecutor>> {
    steps
        .iter()
        .map(|step| step.clone() as Arc<dyn SlowSyncStepExecutor>)
        .collect()
}

struct Setup {
    source: MockEventSource,
    metadata: InMemoryMetadataStore,
    receiver: Arc<RecordingReceiver>,
}

impl Setup {
    fn new(metadata: InMemoryMetadataStore) -> Self {
        init_tracing();
        Self {
            source: MockEventSource::new(),
            metadata,
            receiver: Arc::new(RecordingReceiver::default()),
        }
    }

    fn dependencies(&self, steps: Vec<Arc<dyn SlowSyncStepExecutor>>) -> SyncDependencies {
        let receivers = EventReceivers {
            conversation: self.receiver.clone(),
            ..EventReceivers::default()
        };
        SyncDependencies::new(
            Arc::new(self.source.clone()),
            Arc::new(self.source.clone()),
            Arc::new(self.metadata.clone()),
            Arc::new(self.metadata.clone()),
        )
        .with_slow_sync_steps(steps)
        .with_receivers(receivers)
    }

    async fn start(
        &self,
        config: &SyncConfig,
        steps: Vec<Arc<dyn SlowSyncStepExecutor>>,
    ) -> SyncEngine {
        SyncEngine::start(config, self.dependencies(steps), CancellationToken::new())
            .await
            .unwrap()
    }
}

async fn metadata_with(record: SlowSyncRecord, checkpoint: u64) -> InMemoryMetadataStore {
    let metadata = InMemoryMetadataStore::with_slow_sync_record(record);
    metadata
        .set_last_processed_event_id(EventId::new(checkpoint))
        .await
        .unwrap();
    metadata
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Incremental sync
// ============================================================================

/// An event replayed by the live stream after the backlog delivered it is
/// applied once.
#[tokio::test]
async fn replayed_event_is_applied_once() {
    let setup = Setup::new(metadata_with(complete_record(), 0).await);
    setup.source.add_backlog_event(conversation_event(1));
    setup.source.script_next_session(vec![
        LiveEvent::Open,
        LiveEvent::Event(conversation_event(1)),
    ]);
    let engine = setup.start(&fast_config(), vec![]).await;

    let source = &setup.source;
    let receiver = &setup.receiver;
    engine
        .executor()
        .request(|sync| async move {
            sync.wait_until_live_or_failure().await.unwrap();
            eventually(|| source.push_live(LiveEvent::Event(conversation_event(2)))).await;
            eventually(|| receiver.seen().len() == 2).await;
        })
        .await;

    assert_eq!(setup.receiver.seen(), vec![1, 2]);
    assert_eq!(setup.metadata.checkpoint(), Some(EventId::new(2)));
    engine.shutdown().await;
}

/// A receiver failure leaves the checkpoint in place and the event is
/// delivered again by the next session.
#[tokio::test]
async fn failed_event_is_redelivered() {
    let setup = Setup::new(metadata_with(complete_record(), 4).await);
    setup.source.add_backlog_event(conversation_event(5));
    setup.receiver.fail_once.lock().unwrap().insert(5);
    let engine = setup.start(&fast_config(), vec![]).await;

    let _guard = engine.executor().acquire();
    eventually(|| setup.metadata.checkpoint() == Some(EventId::new(5))).await;

    assert_eq!(setup.receiver.seen(), vec![5, 5]);
    assert_eq!(
        setup.metadata.checkpoint_writes(),
        vec![EventId::new(4), EventId::new(5)]
    );
    let fetches = setup.source.fetch_calls();
    assert_eq!(&fetches[..2], &[Some(EventId::new(4)), Some(EventId::new(4))]);
    engine.shutdown().await;
}

/// The checkpoint only moves forward.
#[tokio::test]
async fn checkpoint_is_monotonic() {
    let setup = Setup::new(metadata_with(complete_record(), 0).await);
    for id in 1..=5 {
        setup.source.add_backlog_event(conversation_event(id));
    }
    setup.source.script_next_session(vec![
        LiveEvent::Open,
        LiveEvent::Event(conversation_event(3)),
        LiveEvent::Event(conversation_event(6)),
    ]);
    let engine = setup.start(&fast_config(), vec![]).await;

    let _guard = engine.executor().acquire();
    eventually(|| setup.metadata.checkpoint() == Some(EventId::new(6))).await;

    let writes = setup.metadata.checkpoint_writes();
    assert!(writes.windows(2).all(|pair| pair[0] < pair[1]), "{writes:?}");
    assert_eq!(setup.receiver.seen(), vec![1, 2, 3, 4, 5, 6]);
    engine.shutdown().await;
}

/// A 404 on the backlog forces a new slow sync and a fresh checkpoint.
#[tokio::test]
async fn unknown_checkpoint_forces_slow_sync() {
    let setup = Setup::new(metadata_with(complete_record(), 10).await);
    setup.source.fail_next_fetch(CoreFailure::ServerMiscommunication {
        status: Some(404),
        message: "notification not found".into(),
    });
    setup.source.set_most_recent_event_id(EventId::new(42));
    let step = CountingStep::new(SlowSyncStep::SelfUser);
    let engine = setup.start(&fast_config(), executors(&[step.clone()])).await;

    let _guard = engine.executor().acquire();
    eventually(|| step.runs() == 1).await;
    eventually(|| engine.observer().current_sync_state() == SyncState::Live).await;

    assert_eq!(setup.metadata.checkpoint(), Some(EventId::new(42)));
    assert!(setup.source.open_count() >= 2);
    engine.shutdown().await;
}

/// Under the disconnect policy the live stream closes once the backlog is
/// processed and reopens when keep-alive is requested.
#[tokio::test]
async fn disconnect_policy_closes_after_backlog() {
    let setup = Setup::new(metadata_with(complete_record(), 0).await);
    setup.source.add_backlog_event(conversation_event(1));
    let mut config = fast_config();
    config.incremental.connection_policy = ConnectionPolicy::DisconnectAfterPendingEvents;
    let engine = setup.start(&config, vec![]).await;

    let _guard = engine.executor().acquire();
    eventually(|| setup.metadata.checkpoint() == Some(EventId::new(1))).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(setup.source.open_count(), 1);
    assert_eq!(
        engine.observer().current_sync_state(),
        SyncState::GatheringPendingEvents
    );

    engine.set_connection_policy(ConnectionPolicy::KeepAlive);
    engine.observer().wait_until_live_or_failure().await.unwrap();
    assert_eq!(setup.source.open_count(), 2);
    engine.shutdown().await;
}

/// Once every request has ended the state no longer reads live, and the next
/// request waits for a fresh connection.
#[tokio::test]
async fn ended_requests_do_not_leave_a_stale_live_state() {
    let setup = Setup::new(metadata_with(complete_record(), 0).await);
    let engine = setup.start(&fast_config(), vec![]).await;

    engine
        .executor()
        .request(|sync| async move { sync.wait_until_live_or_failure().await })
        .await
        .unwrap();
    assert_eq!(setup.source.open_count(), 1);

    eventually(|| engine.observer().current_sync_state() != SyncState::Live).await;
    assert_eq!(
        engine.observer().current_sync_state(),
        SyncState::GatheringPendingEvents
    );

    let offline = CoreFailure::NoNetworkConnection("offline".into());
    setup.source.fail_next_open(offline.clone());
    let source = &setup.source;
    let observer = engine.observer();
    let result = engine
        .executor()
        .request(|sync| async move {
            let result = sync.wait_until_live_or_failure().await;
            eventually(|| observer.current_sync_state() == SyncState::Live).await;
            assert_eq!(source.open_count(), 2);
            result
        })
        .await;

    assert_eq!(result, Err(offline));
    engine.shutdown().await;
}

// ============================================================================
// Slow sync and requests
// ============================================================================

/// A panicking slow sync step surfaces as a failure and is retried.
#[tokio::test]
async fn panicking_slow_sync_step_fails_and_retries() {
    let setup = Setup::new(InMemoryMetadataStore::new());
    let step = Arc::new(ExplodingStep::default());
    let engine = setup
        .start(&fast_config(), vec![step.clone() as Arc<dyn SlowSyncStepExecutor>])
        .await;

    let _guard = engine.executor().acquire();
    let first = tokio::time::timeout(
        Duration::from_secs(1),
        engine.observer().wait_until_live_or_failure(),
    )
    .await
    .expect("failure surfaced");
    assert!(
        matches!(&first, Err(CoreFailure::Unknown(message)) if message.contains("step exploded")),
        "{first:?}"
    );

    eventually(|| engine.observer().current_sync_state() == SyncState::Live).await;
    assert_eq!(step.runs.load(Ordering::SeqCst), 2);
    assert!(engine.observer().is_slow_sync_completed());
    engine.shutdown().await;
}

/// A precondition failure of slow sync fails the wait immediately and never
/// starts incremental sync.
#[tokio::test]
async fn slow_sync_precondition_failure_fails_fast() {
    let setup = Setup::new(InMemoryMetadataStore::with_slow_sync_record(SlowSyncRecord {
        status: SlowSyncStatus::Failed {
            cause: CoreFailure::MissingClientRegistration,
            retry_delay: Duration::ZERO,
        },
        ..Default::default()
    }));
    let step = CountingStep::always_failing(
        SlowSyncStep::SelfUser,
        CoreFailure::MissingClientRegistration,
    );
    let engine = setup.start(&fast_config(), executors(&[step])).await;

    let result = engine
        .executor()
        .request(|sync| async move { sync.wait_until_live_or_failure().await })
        .await;

    assert_eq!(result, Err(CoreFailure::MissingClientRegistration));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(setup.source.open_count(), 0);
    engine.shutdown().await;
}

/// Slow sync runs on first request and leads into live incremental sync.
#[tokio::test]
async fn first_request_runs_slow_sync_then_goes_live() {
    let setup = Setup::new(InMemoryMetadataStore::new());
    setup.source.set_most_recent_event_id(EventId::new(100));
    let steps: Vec<Arc<CountingStep>> = SlowSyncStep::ALL
        .iter()
        .map(|step| CountingStep::new(*step))
        .collect();
    let engine = setup.start(&fast_config(), executors(&steps)).await;

    engine
        .executor()
        .request(|sync| async move {
            sync.wait_until_started_or_failure().await.unwrap();
            sync.wait_until_live_or_failure().await.unwrap();
        })
        .await;

    assert!(steps.iter().all(|step| step.runs() == 1));
    assert_eq!(setup.metadata.checkpoint(), Some(EventId::new(100)));
    assert!(engine.observer().is_slow_sync_completed());
    engine.shutdown().await;
}

/// A completed slow sync persisted to disk is not repeated after a restart.
#[tokio::test]
async fn completed_slow_sync_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync-metadata.json");
    let source = MockEventSource::new();
    let step = CountingStep::new(SlowSyncStep::SelfUser);

    for _ in 0..2 {
        let store = Arc::new(JsonFileMetadataStore::new(&path));
        let deps = SyncDependencies::new(
            Arc::new(source.clone()),
            Arc::new(source.clone()),
            store.clone(),
            store,
        )
        .with_slow_sync_steps(executors(&[step.clone()]));
        let engine = SyncEngine::start(&fast_config(), deps, CancellationToken::new())
            .await
            .unwrap();

        engine
            .executor()
            .request(|sync| async move { sync.wait_until_live_or_failure().await })
            .await
            .unwrap();
        engine.shutdown().await;
    }

    assert_eq!(step.runs(), 1);
    assert_eq!(source.open_count(), 2);
}

/// A manual retry wakes a parked slow sync.
#[tokio::test]
async fn retry_now_wakes_parked_slow_sync() {
    let setup = Setup::new(InMemoryMetadataStore::new());
    let step = Arc::new(CountingStep {
        step: SlowSyncStep::SelfUser,
        runs: AtomicUsize::new(0),
        failure: Mutex::new(Some(CoreFailure::SessionExpired)),
        sticky: false,
    });
    let engine = setup.start(&fast_config(), executors(&[step.clone()])).await;

    let _guard = engine.executor().acquire();
    eventually(|| matches!(engine.observer().current_sync_state(), SyncState::Failed { .. })).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(step.runs(), 1);

    engine.retry_now();
    eventually(|| engine.observer().current_sync_state() == SyncState::Live).await;
    assert_eq!(step.runs(), 2);
    engine.shutdown().await;
}

/// Resetting slow sync re-runs it while requested.
#[tokio::test]
async fn reset_slow_sync_reruns_steps() {
    let setup = Setup::new(metadata_with(complete_record(), 0).await);
    let step = CountingStep::new(SlowSyncStep::Contacts);
    let engine = setup.start(&fast_config(), executors(&[step.clone()])).await;

    let _guard = engine.executor().acquire();
    engine.observer().wait_until_live_or_failure().await.unwrap();
    assert_eq!(step.runs(), 0);

    engine.reset_slow_sync().await.unwrap();
    eventually(|| step.runs() == 1).await;
    eventually(|| engine.observer().current_sync_state() == SyncState::Live).await;
    engine.shutdown().await;
}
