
use crate::destination::{Destination, DestinationError, DestinationFactory};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::pipeline::{Pipeline, PipelineError, TickOutcome};
use crate::scheduler::{Scheduler, SchedulerError, Signal};
use crate::source::{QuerySource, SourceError};
use crate::{DedupeCache, MetricsAggregator};
use async_trait::async_trait;
use bytes::Bytes;
use mockall::mock;
use qstreams_store::{
    DedupeConfig, DestinationConfig, MemoryStore, SourceConfig, StateStore, StoreError,
    StreamMetrics, StreamRecord, StreamSpec, StreamState,
};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

mock! {
    pub Source {}
    #[async_trait]
    impl QuerySource for Source {
        async fn fetch(&self, source: &SourceConfig) -> Result<Bytes, SourceError>;
    }
}

fn source_returning(payload: &'static [u8]) -> MockSource {
    let mut source = MockSource::new();
    source
        .expect_fetch()
        .returning(move |_| Ok(Bytes::from_static(payload)));
    source
}

/// Returns a different payload on every call.
fn source_counting() -> MockSource {
    let calls = AtomicUsize::new(0);
    let mut source = MockSource::new();
    source.expect_fetch().returning(move |_| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from(format!(r#"{{"rows":[[{n}]]}}"#)))
    });
    source
}

fn failing_source() -> MockSource {
    let mut source = MockSource::new();
    source
        .expect_fetch()
        .returning(|_| Err(SourceError::Timeout(Duration::from_secs(10))));
    source
}

/// Source whose queries take `delay`, tracking how many run at once.
struct SlowSource {
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl SlowSource {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl QuerySource for SlowSource {
    async fn fetch(&self, _source: &SourceConfig) -> Result<Bytes, SourceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(Bytes::from(format!("[{n}]")))
    }
}

/// Memory store whose metrics writes take `delay`.
struct SlowMetricsStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl StateStore for SlowMetricsStore {
    async fn load_stream(&self, id: &str) -> Result<StreamRecord, StoreError> {
        self.inner.load_stream(id).await
    }

    async fn save_stream(&self, record: &StreamRecord) -> Result<(), StoreError> {
        self.inner.save_stream(record).await
    }

    async fn list_streams(&self) -> Result<Vec<StreamRecord>, StoreError> {
        self.inner.list_streams().await
    }

    async fn delete_stream(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete_stream(id).await
    }

    async fn load_all_metrics(&self) -> Result<HashMap<String, StreamMetrics>, StoreError> {
        self.inner.load_all_metrics().await
    }

    async fn save_all_metrics(
        &self,
        metrics: &HashMap<String, StreamMetrics>,
    ) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.save_all_metrics(metrics).await
    }

    async fn delete_metrics(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete_metrics(id).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Accept,
    Reject,
    Fatal,
}

/// Records every delivery it accepts or rejects.
struct FakeDestination {
    behavior: Behavior,
    delivered: Arc<Mutex<Vec<Bytes>>>,
}

#[async_trait]
impl Destination for FakeDestination {
    fn kind(&self) -> &str {
        "webhook"
    }

    fn validate(&self) -> Result<(), DestinationError> {
        Ok(())
    }

    async fn deliver(
        &self,
        payload: Bytes,
        _headers: &HashMap<String, String>,
    ) -> Result<(), DestinationError> {
        self.delivered.lock().unwrap().push(payload);
        match self.behavior {
            Behavior::Accept => Ok(()),
            Behavior::Reject => Err(DestinationError::Status(StatusCode::SERVICE_UNAVAILABLE)),
            Behavior::Fatal => Err(DestinationError::Invalid("endpoint removed".to_string())),
        }
    }
}

struct FakeDestinations {
    behavior: Behavior,
    delivered: Arc<Mutex<Vec<Bytes>>>,
}

impl FakeDestinations {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            delivered: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn deliveries(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

impl DestinationFactory for FakeDestinations {
    fn build(&self, config: &DestinationConfig) -> Result<Arc<dyn Destination>, DestinationError> {
        if config.kind != "webhook" {
            return Err(DestinationError::Unsupported(config.kind.clone()));
        }
        if config.url.is_empty() {
            return Err(DestinationError::Invalid("empty url".to_string()));
        }
        Ok(Arc::new(FakeDestination {
            behavior: self.behavior,
            delivered: self.delivered.clone(),
        }))
    }
}

fn stream(id: &str, interval_ms: u64, dedupe_window_ms: Option<u64>) -> StreamSpec {
    StreamSpec {
        id: id.to_string(),
        name: format!("stream {id}"),
        source: SourceConfig {
            query: "SELECT count(*) FROM events".to_string(),
            endpoint: "http://broker.local/query/sql".to_string(),
            interval_ms,
            headers: HashMap::new(),
        },
        destination: DestinationConfig {
            kind: "webhook".to_string(),
            url: "http://hooks.local/events".to_string(),
            headers: HashMap::new(),
        },
        dedupe: DedupeConfig {
            enabled: dedupe_window_ms.is_some(),
            window_ms: dedupe_window_ms.unwrap_or(0),
        },
    }
}

fn pipeline(source: MockSource) -> Pipeline {
    Pipeline::new(
        Arc::new(source),
        Arc::new(DedupeCache::new()),
        Arc::new(MetricsAggregator::new()),
    )
}

fn destination(behavior: Behavior) -> (FakeDestination, Arc<Mutex<Vec<Bytes>>>) {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    (
        FakeDestination {
            behavior,
            delivered: delivered.clone(),
        },
        delivered,
    )
}

fn counters(queries_issued: u64, events_sent: u64, events_deduped: u64) -> StreamMetrics {
    StreamMetrics {
        queries_issued,
        events_sent,
        events_deduped,
    }
}

fn scheduler(
    source: MockSource,
    destinations: Arc<FakeDestinations>,
    store: Arc<MemoryStore>,
) -> Scheduler {
    Scheduler::new(Arc::new(pipeline(source)), destinations, store)
}

fn engine(
    source: MockSource,
    destinations: Arc<FakeDestinations>,
    store: Arc<MemoryStore>,
) -> Engine {
    Engine::new(store, Arc::new(source), destinations)
}

// pipeline

#[tokio::test]
async fn test_every_success_is_sent_without_dedupe() {
    let pipeline = pipeline(source_returning(b"[1]"));
    let (dest, delivered) = destination(Behavior::Accept);
    let spec = stream("s1", 1000, None);

    for _ in 0..3 {
        let outcome = pipeline.run_tick(&spec, &dest).await.unwrap();
        assert_eq!(outcome, TickOutcome::Delivered);
    }

    assert_eq!(pipeline.metrics().get("s1").await, Some(counters(3, 3, 0)));
    assert_eq!(delivered.lock().unwrap().len(), 3);
    assert!(!pipeline.dedupe().contains("s1").await);
}

#[tokio::test(start_paused = true)]
async fn test_identical_result_within_window_is_suppressed() {
    let pipeline = pipeline(source_returning(b"[1]"));
    let (dest, delivered) = destination(Behavior::Accept);
    let spec = stream("s1", 1000, Some(2000));

    assert_eq!(pipeline.run_tick(&spec, &dest).await.unwrap(), TickOutcome::Delivered);
    tokio::time::advance(Duration::from_millis(1500)).await;
    assert_eq!(pipeline.run_tick(&spec, &dest).await.unwrap(), TickOutcome::Suppressed);

    assert_eq!(pipeline.metrics().get("s1").await, Some(counters(2, 1, 1)));
    assert_eq!(delivered.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_identical_result_beyond_window_is_sent() {
    let pipeline = pipeline(source_returning(b"[1]"));
    let (dest, delivered) = destination(Behavior::Accept);
    let spec = stream("s1", 1000, Some(1000));

    assert_eq!(pipeline.run_tick(&spec, &dest).await.unwrap(), TickOutcome::Delivered);
    tokio::time::advance(Duration::from_millis(1500)).await;
    assert_eq!(pipeline.run_tick(&spec, &dest).await.unwrap(), TickOutcome::Delivered);

    assert_eq!(pipeline.metrics().get("s1").await, Some(counters(2, 2, 0)));
    assert_eq!(delivered.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_suppression_does_not_extend_window() {
    let pipeline = pipeline(source_returning(b"[1]"));
    let (dest, _) = destination(Behavior::Accept);
    let spec = stream("s1", 1000, Some(2000));

    assert_eq!(pipeline.run_tick(&spec, &dest).await.unwrap(), TickOutcome::Delivered);
    tokio::time::advance(Duration::from_millis(1500)).await;
    assert_eq!(pipeline.run_tick(&spec, &dest).await.unwrap(), TickOutcome::Suppressed);
    tokio::time::advance(Duration::from_millis(1000)).await;
    assert_eq!(pipeline.run_tick(&spec, &dest).await.unwrap(), TickOutcome::Delivered);
}

#[tokio::test]
async fn test_different_results_are_all_sent() {
    let pipeline = pipeline(source_counting());
    let (dest, delivered) = destination(Behavior::Accept);
    let spec = stream("s1", 1000, Some(60_000));

    for _ in 0..3 {
        assert_eq!(pipeline.run_tick(&spec, &dest).await.unwrap(), TickOutcome::Delivered);
    }
    assert_eq!(pipeline.metrics().get("s1").await, Some(counters(3, 3, 0)));
    assert_eq!(delivered.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_failed_fetch_only_counts_the_query() {
    let pipeline = pipeline(failing_source());
    let (dest, delivered) = destination(Behavior::Accept);
    let spec = stream("s1", 1000, Some(5000));

    for _ in 0..4 {
        assert_eq!(pipeline.run_tick(&spec, &dest).await.unwrap(), TickOutcome::FetchFailed);
    }

    assert_eq!(pipeline.metrics().get("s1").await, Some(counters(4, 0, 0)));
    assert!(delivered.lock().unwrap().is_empty());
    assert!(pipeline.dedupe().is_empty().await);
}

#[tokio::test]
async fn test_failed_delivery_keeps_dedupe_decision() {
    let pipeline = pipeline(source_returning(b"[1]"));
    let (dest, _) = destination(Behavior::Reject);
    let spec = stream("s1", 1000, Some(5000));

    assert_eq!(pipeline.run_tick(&spec, &dest).await.unwrap(), TickOutcome::DeliveryFailed);
    assert_eq!(pipeline.run_tick(&spec, &dest).await.unwrap(), TickOutcome::Suppressed);
    assert_eq!(pipeline.metrics().get("s1").await, Some(counters(2, 1, 1)));
}

#[tokio::test]
async fn test_fatal_delivery_error_is_returned() {
    let pipeline = pipeline(source_returning(b"[1]"));
    let (dest, _) = destination(Behavior::Fatal);
    let spec = stream("s1", 1000, None);

    let err = pipeline.run_tick(&spec, &dest).await.unwrap_err();
    let PipelineError::Fatal { stream_id, source } = err;
    assert_eq!(stream_id, "s1");
    assert!(source.is_fatal());
}

#[tokio::test]
async fn test_streams_keep_separate_dedupe_records() {
    let pipeline = pipeline(source_returning(b"[1]"));
    let (dest, _) = destination(Behavior::Accept);

    let a = stream("a", 1000, Some(5000));
    let b = stream("b", 1000, Some(5000));
    assert_eq!(pipeline.run_tick(&a, &dest).await.unwrap(), TickOutcome::Delivered);
    assert_eq!(pipeline.run_tick(&b, &dest).await.unwrap(), TickOutcome::Delivered);
    assert_eq!(pipeline.dedupe().len().await, 2);
}

// scheduler

#[tokio::test(start_paused = true)]
async fn test_running_task_ticks_at_interval() {
    let destinations = FakeDestinations::new(Behavior::Accept);
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(source_counting(), destinations.clone(), store.clone());

    assert_ok!(scheduler.register(stream("s1", 1000, None)).await);
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(destinations.deliveries(), 3);
    assert_eq!(scheduler.state("s1").await, Some(StreamState::Running));
    assert_eq!(
        store.load_stream("s1").await.unwrap().state,
        StreamState::Running
    );
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_register_twice_is_rejected() {
    let scheduler = scheduler(
        source_returning(b"[]"),
        FakeDestinations::new(Behavior::Accept),
        Arc::new(MemoryStore::new()),
    );

    assert_ok!(scheduler.register(stream("s1", 1000, None)).await);
    let err = scheduler.register(stream("s1", 1000, None)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::AlreadyRunning(ref id) if id == "s1"));
    assert_eq!(scheduler.ids().await, vec!["s1".to_string()]);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_signal_without_task_is_not_found() {
    let scheduler = scheduler(
        source_returning(b"[]"),
        FakeDestinations::new(Behavior::Accept),
        Arc::new(MemoryStore::new()),
    );

    let err = scheduler.signal("missing", Signal::Stop).await.unwrap_err();
    assert!(matches!(err, SchedulerError::NotFound(_)));
    assert!(!scheduler.unregister("missing").await);
}

#[tokio::test]
async fn test_invalid_destination_registers_nothing() {
    let scheduler = scheduler(
        source_returning(b"[]"),
        FakeDestinations::new(Behavior::Accept),
        Arc::new(MemoryStore::new()),
    );

    let mut spec = stream("s1", 1000, None);
    spec.destination.kind = "kafka".to_string();
    let err = scheduler.register(spec).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Destination { ref id, .. } if id == "s1"));
    assert!(scheduler.ids().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_and_resume_through_signals() {
    let destinations = FakeDestinations::new(Behavior::Accept);
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(source_counting(), destinations.clone(), store.clone());
    assert_ok!(scheduler.register(stream("s1", 1000, None)).await);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let transition = scheduler.signal("s1", Signal::Stop).await.unwrap();
    assert!(transition.applied);
    assert_eq!(transition.state, StreamState::Stopped);
    assert_eq!(store.load_stream("s1").await.unwrap().state, StreamState::Stopped);

    let again = scheduler.signal("s1", Signal::Stop).await.unwrap();
    assert!(!again.applied);

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(destinations.deliveries(), 1);

    let resumed = scheduler.signal("s1", Signal::Resume).await.unwrap();
    assert!(resumed.applied);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(destinations.deliveries(), 2);
    assert_eq!(store.load_stream("s1").await.unwrap().state, StreamState::Running);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_fatal_delivery_unregisters_task() {
    let destinations = FakeDestinations::new(Behavior::Fatal);
    let scheduler = scheduler(
        source_returning(b"[]"),
        destinations.clone(),
        Arc::new(MemoryStore::new()),
    );
    assert_ok!(scheduler.register(stream("s1", 1000, None)).await);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(destinations.deliveries(), 1);
    assert_eq!(scheduler.state("s1").await, None);
    assert!(scheduler.ids().await.is_empty());

    // the id is free for a new registration
    assert_ok!(scheduler.register(stream("s1", 1000, None)).await);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unregister_waits_for_exit() {
    let destinations = FakeDestinations::new(Behavior::Accept);
    let scheduler = scheduler(
        source_counting(),
        destinations.clone(),
        Arc::new(MemoryStore::new()),
    );
    assert_ok!(scheduler.register(stream("s1", 1000, None)).await);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(scheduler.unregister("s1").await);
    assert!(!scheduler.unregister("s1").await);
    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(destinations.deliveries(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_ticks_never_overlap() {
    let source = SlowSource::new(Duration::from_millis(2500));
    let pipeline = Pipeline::new(
        source.clone(),
        Arc::new(DedupeCache::new()),
        Arc::new(MetricsAggregator::new()),
    );
    let scheduler = Scheduler::new(
        Arc::new(pipeline),
        FakeDestinations::new(Behavior::Accept),
        Arc::new(MemoryStore::new()),
    );
    assert_ok!(scheduler.register(stream("s1", 1000, None)).await);

    tokio::time::sleep(Duration::from_millis(10_000)).await;
    assert_eq!(source.max_active.load(Ordering::SeqCst), 1);
    // ticks at 1000, 3500, 6000 and 8500; missed ticks are not replayed
    let calls = source.calls.load(Ordering::SeqCst);
    assert!((3..=4).contains(&calls), "calls = {calls}");
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_tick() {
    let source = SlowSource::new(Duration::from_millis(2500));
    let destinations = FakeDestinations::new(Behavior::Accept);
    let pipeline = Pipeline::new(
        source.clone(),
        Arc::new(DedupeCache::new()),
        Arc::new(MetricsAggregator::new()),
    );
    let scheduler = Scheduler::new(
        Arc::new(pipeline),
        destinations.clone(),
        Arc::new(MemoryStore::new()),
    );
    assert_ok!(scheduler.register(stream("s1", 1000, None)).await);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(source.active.load(Ordering::SeqCst), 1);

    let transition = scheduler.signal("s1", Signal::Stop).await.unwrap();
    assert!(transition.applied);
    assert_eq!(source.active.load(Ordering::SeqCst), 0);
    let at_stop = destinations.deliveries();
    assert_eq!(at_stop, 1);

    tokio::time::sleep(Duration::from_millis(10_000)).await;
    assert_eq!(destinations.deliveries(), at_stop);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restore_skips_stopped_streams() {
    let records = vec![
        StreamRecord::new(stream("a", 1000, None), StreamState::Running),
        StreamRecord::new(stream("b", 1000, None), StreamState::Creating),
        StreamRecord::new(stream("c", 1000, None), StreamState::Submitted),
        StreamRecord::new(stream("d", 1000, None), StreamState::Stopped),
    ];
    let scheduler = scheduler(
        source_returning(b"[]"),
        FakeDestinations::new(Behavior::Accept),
        Arc::new(MemoryStore::new()),
    );

    assert_eq!(scheduler.restore_all(records).await, 3);
    assert_eq!(scheduler.ids().await, vec!["a", "b", "c"]);
    scheduler.shutdown().await;
    assert!(scheduler.ids().await.is_empty());
}

// engine

#[tokio::test(start_paused = true)]
async fn test_create_and_start_assigns_id_and_runs() {
    let destinations = FakeDestinations::new(Behavior::Accept);
    let store = Arc::new(MemoryStore::new());
    let engine = engine(source_counting(), destinations.clone(), store.clone());

    let id = engine.create_and_start(stream("", 1000, None)).await.unwrap();
    assert!(!id.is_empty());
    assert_eq!(engine.status(&id).await, Some(StreamState::Running));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(destinations.deliveries(), 2);
    assert_eq!(
        engine.metrics_snapshot().await,
        vec![(id.clone(), counters(2, 2, 0))]
    );

    let listed = engine.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].spec.id, id);
    assert_eq!(listed[0].state, StreamState::Running);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_create_rejects_invalid_definitions() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(
        source_returning(b"[]"),
        FakeDestinations::new(Behavior::Accept),
        store.clone(),
    );

    let mut missing_query = stream("", 1000, None);
    missing_query.source.query = String::new();
    assert!(matches!(
        engine.create_and_start(missing_query).await,
        Err(EngineError::Configuration(_))
    ));

    let mut unsupported = stream("", 1000, None);
    unsupported.destination.kind = "smtp".to_string();
    assert!(matches!(
        engine.create_and_start(unsupported).await,
        Err(EngineError::Destination(DestinationError::Unsupported(_)))
    ));

    assert!(store.list_streams().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop_report_state_conflicts() {
    let destinations = FakeDestinations::new(Behavior::Accept);
    let engine = engine(
        source_counting(),
        destinations.clone(),
        Arc::new(MemoryStore::new()),
    );
    let id = engine.create_and_start(stream("", 1000, None)).await.unwrap();

    assert!(matches!(engine.start(&id).await, Err(EngineError::AlreadyRunning(_))));

    assert_ok!(engine.stop(&id).await);
    assert_eq!(engine.status(&id).await, Some(StreamState::Stopped));
    assert!(matches!(engine.stop(&id).await, Err(EngineError::NotRunning(_))));

    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(destinations.deliveries(), 0);

    assert_ok!(engine.start(&id).await);
    assert_eq!(engine.status(&id).await, Some(StreamState::Running));

    assert!(matches!(engine.start("missing").await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.stop("missing").await, Err(EngineError::NotFound(_))));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_registers_stored_stream() {
    let store = Arc::new(MemoryStore::with_streams([StreamRecord::new(
        stream("s1", 1000, None),
        StreamState::Stopped,
    )]));
    let engine = engine(
        source_returning(b"[]"),
        FakeDestinations::new(Behavior::Accept),
        store.clone(),
    );

    assert_eq!(engine.restore().await.unwrap(), 0);
    assert_eq!(engine.status("s1").await, None);
    assert!(matches!(engine.stop("s1").await, Err(EngineError::NotRunning(_))));

    assert_ok!(engine.start("s1").await);
    assert_eq!(engine.status("s1").await, Some(StreamState::Running));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.load_stream("s1").await.unwrap().state, StreamState::Running);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_clears_dedupe_and_metrics() {
    let destinations = FakeDestinations::new(Behavior::Accept);
    let store = Arc::new(MemoryStore::new());
    let engine = engine(source_returning(b"[1]"), destinations.clone(), store.clone());

    let id = engine
        .create_and_start(stream("", 1000, Some(10_000)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(engine.metrics().get(&id).await, Some(counters(2, 1, 1)));
    assert!(engine.dedupe().contains(&id).await);
    engine.shutdown().await;
    assert!(store.load_all_metrics().await.unwrap().contains_key(&id));

    assert_ok!(engine.delete(&id).await);
    assert_eq!(engine.metrics().get(&id).await, None);
    assert!(!engine.dedupe().contains(&id).await);
    assert!(!store.load_all_metrics().await.unwrap().contains_key(&id));
    assert_err!(store.load_stream(&id).await);

    let fresh = engine.create_and_start(stream("", 1000, None)).await.unwrap();
    assert_ne!(fresh, id);
    assert_eq!(engine.metrics().get(&fresh).await, None);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_during_flush_keeps_metrics_deleted() {
    let store = Arc::new(SlowMetricsStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(100),
    });
    let engine = Engine::new(
        store.clone(),
        Arc::new(source_counting()),
        FakeDestinations::new(Behavior::Accept),
    );
    let id = engine.create_and_start(stream("", 1000, None)).await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = engine.spawn_metrics_flusher(Duration::from_millis(2500), shutdown_rx);

    // the flush started at 2500 is still writing
    tokio::time::sleep(Duration::from_millis(2550)).await;
    assert_ok!(engine.delete(&id).await);
    assert!(!store.inner.load_all_metrics().await.unwrap().contains_key(&id));

    shutdown_tx.send(true).unwrap();
    flusher.await.unwrap();
    assert!(!store.inner.load_all_metrics().await.unwrap().contains_key(&id));
}

#[tokio::test(start_paused = true)]
async fn test_update_replaces_definition_and_resets_dedupe() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(
        source_returning(b"[1]"),
        FakeDestinations::new(Behavior::Accept),
        store.clone(),
    );
    let id = engine
        .create_and_start(stream("", 1000, Some(10_000)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(engine.dedupe().contains(&id).await);

    let mut changed = stream("ignored", 2000, Some(10_000));
    changed.name = "renamed".to_string();
    assert_ok!(engine.update(&id, changed).await);

    assert!(!engine.dedupe().contains(&id).await);
    assert_eq!(engine.status(&id).await, Some(StreamState::Running));
    let record = store.load_stream(&id).await.unwrap();
    assert_eq!(record.spec.id, id);
    assert_eq!(record.spec.name, "renamed");
    assert_eq!(record.spec.source.interval_ms, 2000);
    // counters survive the update
    assert_eq!(engine.metrics().get(&id).await, Some(counters(1, 1, 0)));

    assert_ok!(engine.stop(&id).await);
    assert_ok!(engine.update(&id, stream("", 500, None)).await);
    assert_eq!(engine.status(&id).await, None);
    assert_eq!(store.load_stream(&id).await.unwrap().state, StreamState::Stopped);

    assert!(matches!(
        engine.update("missing", stream("", 500, None)).await,
        Err(EngineError::NotFound(_))
    ));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restore_reloads_metrics_for_known_streams() {
    let store = Arc::new(MemoryStore::with_streams([
        StreamRecord::new(stream("a", 1000, None), StreamState::Running),
        StreamRecord::new(stream("b", 1000, None), StreamState::Stopped),
    ]));
    store
        .save_all_metrics(&HashMap::from([
            ("a".to_string(), counters(10, 8, 2)),
            ("gone".to_string(), counters(1, 1, 0)),
        ]))
        .await
        .unwrap();

    let engine = engine(
        source_returning(b"[]"),
        FakeDestinations::new(Behavior::Accept),
        store,
    );
    assert_eq!(engine.restore().await.unwrap(), 1);
    assert_eq!(engine.metrics().get("a").await, Some(counters(10, 8, 2)));
    assert_eq!(engine.metrics().get("gone").await, None);

    let statuses = engine.list().await.unwrap();
    let states: Vec<_> = statuses.iter().map(|s| (s.spec.id.as_str(), s.state)).collect();
    assert_eq!(
        states,
        vec![("a", StreamState::Running), ("b", StreamState::Stopped)]
    );
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_keeps_stored_states() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(
        source_returning(b"[]"),
        FakeDestinations::new(Behavior::Accept),
        store.clone(),
    );
    let running = engine.create_and_start(stream("", 1000, None)).await.unwrap();
    let stopped = engine.create_and_start(stream("", 1000, None)).await.unwrap();
    assert_ok!(engine.stop(&stopped).await);

    engine.shutdown().await;
    assert_eq!(engine.status(&running).await, None);
    assert_eq!(store.load_stream(&running).await.unwrap().state, StreamState::Running);
    assert_eq!(store.load_stream(&stopped).await.unwrap().state, StreamState::Stopped);
}
