// src/event/bus.rs

//! Priority-ordered, concurrency-bounded event dispatcher
//!
//! Producers enqueue with [`EventBus::publish`]; a single dispatcher task
//! takes events off a bounded queue in FIFO order and fans each one out to
//! its matching subscriptions. Handlers are started in descending priority
//! order, each as its own task under the bus-wide semaphore, and all of them
//! are awaited together; completion order is not guaranteed. An event is
//! fully dispatched before the next one is taken.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::handler::{HandleOutcome, Handler};
use super::{Event, EventFilter, EventType};
use crate::config::{BackpressurePolicy, EventBusConfig};
use crate::error::Result;
use crate::manager::{Manager, ManagedState, ManagerState, ManagerStatus};
use crate::types::{Id, SubscriptionId};
use crate::utils::timing::Stopwatch;

/// Binding of a handler to an event type (or to every type)
pub struct EventSubscription {
    id: SubscriptionId,
    event_type: Option<EventType>,
    handler: Arc<Handler>,
    filter: Option<EventFilter>,
    priority: i32,
    enabled: AtomicBool,
    sequence: u64,
    created_at: DateTime<Utc>,
}

impl EventSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// `None` for wildcard subscriptions
    pub fn event_type(&self) -> Option<&EventType> {
        self.event_type.as_ref()
    }

    pub fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn accepts(&self, event: &Event) -> bool {
        self.is_enabled()
            && self
                .filter
                .as_ref()
                .map_or(true, |filter| filter.matches(event))
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("handler", &self.handler.name())
            .field("priority", &self.priority)
            .field("enabled", &self.is_enabled())
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Per-type lists kept in descending priority order, equal priorities in
/// registration order
#[derive(Default)]
struct SubscriptionTable {
    by_type: HashMap<EventType, Vec<Arc<EventSubscription>>>,
    wildcard: Vec<Arc<EventSubscription>>,
    index: HashMap<SubscriptionId, Option<EventType>>,
    next_sequence: u64,
}

impl SubscriptionTable {
    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn insert(&mut self, subscription: Arc<EventSubscription>) {
        self.index
            .insert(subscription.id, subscription.event_type.clone());

        let list = match &subscription.event_type {
            Some(event_type) => self.by_type.entry(event_type.clone()).or_default(),
            None => &mut self.wildcard,
        };
        let position = list.partition_point(|existing| existing.priority >= subscription.priority);
        list.insert(position, subscription);
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let Some(event_type) = self.index.remove(&id) else {
            return false;
        };

        match event_type {
            Some(event_type) => {
                if let Some(list) = self.by_type.get_mut(&event_type) {
                    list.retain(|s| s.id != id);
                    if list.is_empty() {
                        self.by_type.remove(&event_type);
                    }
                }
            }
            None => self.wildcard.retain(|s| s.id != id),
        }
        true
    }

    fn get(&self, id: SubscriptionId) -> Option<Arc<EventSubscription>> {
        let list = match self.index.get(&id)? {
            Some(event_type) => self.by_type.get(event_type)?,
            None => &self.wildcard,
        };
        list.iter().find(|s| s.id == id).cloned()
    }

    /// Type-specific and wildcard subscriptions merged into dispatch order
    fn resolve(&self, event_type: &EventType) -> Vec<Arc<EventSubscription>> {
        let mut candidates: Vec<Arc<EventSubscription>> = self
            .by_type
            .get(event_type)
            .map(|list| list.to_vec())
            .unwrap_or_default();
        candidates.extend(self.wildcard.iter().cloned());
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        candidates
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    handler_invocations: AtomicU64,
    dispatch_nanos: AtomicU64,
}

/// State shared between the bus handle and its dispatcher task
struct BusShared {
    subscriptions: RwLock<SubscriptionTable>,
    semaphore: Arc<Semaphore>,
    counters: BusCounters,
    published_by_type: DashMap<EventType, u64>,
    started_at: Mutex<Option<Instant>>,
}

struct QueuedEvent {
    event: Arc<Event>,
    enqueued_at: Instant,
    completion: Option<oneshot::Sender<DispatchReport>>,
}

/// Summary of one dispatched event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    pub event_id: Id,
    /// Subscriptions that passed the enabled and filter checks
    pub matched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub queued_for: Duration,
    pub duration: Duration,
}

/// Result of [`EventBus::publish_and_wait`]
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Completed(DispatchReport),
    /// The caller gave up; handlers already started keep running
    TimedOut,
    /// The bus was not running, or dropped the event
    Rejected,
}

impl DispatchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn report(&self) -> Option<&DispatchReport> {
        match self {
            Self::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusMetrics {
    pub published: u64,
    pub processed: u64,
    /// Failed handler invocations, one per failing handler
    pub failed: u64,
    pub dropped: u64,
    pub handler_invocations: u64,
    pub subscription_count: usize,
    pub success_rate: f64,
    /// Mean wall time to dispatch one event to all its handlers
    pub avg_handle_time_ms: f64,
    /// Processed events per second since start
    pub throughput: f64,
    pub queue_depth: usize,
    pub uptime_secs: f64,
    pub published_by_type: HashMap<String, u64>,
}

#[derive(Default)]
struct BusRuntime {
    dispatcher: Option<JoinHandle<()>>,
    shutdown: Option<CancellationToken>,
}

pub struct EventBus {
    state: ManagedState,
    config: EventBusConfig,
    shared: Arc<BusShared>,
    runtime: tokio::sync::Mutex<BusRuntime>,
    sender: RwLock<Option<mpsc::Sender<QueuedEvent>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("subscriptions", &self.shared.subscriptions.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let permits = config.max_concurrent_handlers.max(1);
        Self {
            state: ManagedState::new(Uuid::new_v4(), "event_bus"),
            config,
            shared: Arc::new(BusShared {
                subscriptions: RwLock::new(SubscriptionTable::default()),
                semaphore: Arc::new(Semaphore::new(permits)),
                counters: BusCounters::default(),
                published_by_type: DashMap::new(),
                started_at: Mutex::new(None),
            }),
            runtime: tokio::sync::Mutex::new(BusRuntime::default()),
            sender: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.sender.read().is_some()
    }

    /// Spawns the dispatcher; a no-op when already running
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.dispatcher.is_some() {
            return Ok(());
        }

        self.state.set_state(ManagerState::Initializing).await;

        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));
        let shutdown = CancellationToken::new();

        self.shared.started_at.lock().get_or_insert_with(Instant::now);
        *self.sender.write() = Some(sender);
        runtime.dispatcher = Some(tokio::spawn(run_dispatcher(
            Arc::clone(&self.shared),
            receiver,
            shutdown.clone(),
        )));
        runtime.shutdown = Some(shutdown);

        self.state.set_state(ManagerState::Running).await;
        tracing::info!(
            queue_capacity = self.config.queue_capacity,
            max_concurrent_handlers = self.config.max_concurrent_handlers,
            "Event bus started"
        );
        Ok(())
    }

    /// Stops accepting events, lets the event in flight finish, discards the
    /// rest of the queue and waits for the dispatcher to exit
    ///
    /// Must not be awaited from inside a handler of this bus.
    pub async fn stop(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        let Some(dispatcher) = runtime.dispatcher.take() else {
            return Ok(());
        };

        self.state.set_state(ManagerState::ShuttingDown).await;
        self.sender.write().take();
        if let Some(shutdown) = runtime.shutdown.take() {
            shutdown.cancel();
        }

        if let Err(e) = dispatcher.await {
            tracing::error!("Event dispatcher terminated abnormally: {}", e);
        }

        self.state.set_state(ManagerState::Stopped).await;
        tracing::info!("Event bus stopped");
        Ok(())
    }

    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<Handler>,
        filter: Option<EventFilter>,
        priority: i32,
    ) -> SubscriptionId {
        self.add_subscription(Some(event_type), handler, filter, priority)
    }

    /// Subscribes to every event type
    pub fn subscribe_all(
        &self,
        handler: Arc<Handler>,
        filter: Option<EventFilter>,
        priority: i32,
    ) -> SubscriptionId {
        self.add_subscription(None, handler, filter, priority)
    }

    fn add_subscription(
        &self,
        event_type: Option<EventType>,
        handler: Arc<Handler>,
        filter: Option<EventFilter>,
        priority: i32,
    ) -> SubscriptionId {
        let id = Uuid::new_v4();
        let mut table = self.shared.subscriptions.write();
        let subscription = Arc::new(EventSubscription {
            id,
            event_type,
            handler,
            filter,
            priority,
            enabled: AtomicBool::new(true),
            sequence: table.next_sequence(),
            created_at: Utc::now(),
        });

        tracing::debug!(
            subscription_id = %id,
            event_type = subscription
                .event_type
                .as_ref()
                .map_or("*", |event_type| event_type.as_str()),
            handler = subscription.handler.name(),
            priority,
            "Subscription added"
        );
        table.insert(subscription);
        id
    }

    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        let removed = self.shared.subscriptions.write().remove(subscription_id);
        if removed {
            tracing::debug!(subscription_id = %subscription_id, "Subscription removed");
        }
        removed
    }

    /// Soft switch; a disabled subscription stays registered but is skipped
    pub fn set_subscription_enabled(&self, subscription_id: SubscriptionId, enabled: bool) -> bool {
        match self.shared.subscriptions.read().get(subscription_id) {
            Some(subscription) => {
                subscription.enabled.store(enabled, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn subscription(&self, subscription_id: SubscriptionId) -> Option<Arc<EventSubscription>> {
        self.shared.subscriptions.read().get(subscription_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.read().len()
    }

    /// Enqueues the event without waiting for its handlers
    ///
    /// Returns `false`, with a warning, when the bus is not running or the
    /// event was dropped by the backpressure policy.
    pub async fn publish(&self, event: Event) -> bool {
        self.enqueue(Arc::new(event), None).await
    }

    /// Waits until the event has been dispatched to every matching handler
    ///
    /// `None` uses the configured `publish_wait_timeout_ms`. The timeout
    /// covers enqueueing as well as dispatch.
    pub async fn publish_and_wait(&self, event: Event, timeout: Option<Duration>) -> DispatchOutcome {
        let timeout = timeout.unwrap_or_else(|| self.config.publish_wait_timeout());
        let event_id = event.id();
        let (completion, report) = oneshot::channel();

        let wait = async {
            if !self.enqueue(Arc::new(event), Some(completion)).await {
                return DispatchOutcome::Rejected;
            }
            match report.await {
                Ok(report) => DispatchOutcome::Completed(report),
                Err(_) => DispatchOutcome::Rejected,
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::debug!(event_id = %event_id, ?timeout, "Gave up waiting for dispatch");
                DispatchOutcome::TimedOut
            }
        }
    }

    async fn enqueue(
        &self,
        event: Arc<Event>,
        completion: Option<oneshot::Sender<DispatchReport>>,
    ) -> bool {
        let event_type = event.event_type();
        let event_id = event.id();

        let sender = self.sender.read().clone();
        let Some(sender) = sender else {
            tracing::warn!(
                event_id = %event_id,
                event_type = %event_type,
                "Event bus is not running, event dropped"
            );
            return false;
        };

        let queued = QueuedEvent {
            event,
            enqueued_at: Instant::now(),
            completion,
        };

        let accepted = match self.config.backpressure {
            BackpressurePolicy::Block => sender.send(queued).await.is_ok(),
            BackpressurePolicy::DropNewest => match sender.try_send(queued) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event_id = %event_id,
                        event_type = %event_type,
                        "Event queue full, event dropped"
                    );
                    return false;
                }
                Err(TrySendError::Closed(_)) => false,
            },
        };

        if !accepted {
            tracing::warn!(
                event_id = %event_id,
                event_type = %event_type,
                "Event bus stopped while publishing, event dropped"
            );
            return false;
        }

        self.shared.counters.published.fetch_add(1, Ordering::Relaxed);
        *self.shared.published_by_type.entry(event_type).or_insert(0) += 1;
        true
    }

    pub fn get_metrics(&self) -> EventBusMetrics {
        let counters = &self.shared.counters;
        let published = counters.published.load(Ordering::Relaxed);
        let processed = counters.processed.load(Ordering::Relaxed);
        let failed = counters.failed.load(Ordering::Relaxed);
        let dropped = counters.dropped.load(Ordering::Relaxed);
        let handler_invocations = counters.handler_invocations.load(Ordering::Relaxed);
        let dispatch_nanos = counters.dispatch_nanos.load(Ordering::Relaxed);

        let success_rate = if handler_invocations == 0 {
            0.0
        } else {
            handler_invocations.saturating_sub(failed) as f64 / handler_invocations as f64
        };
        let avg_handle_time_ms = if processed == 0 {
            0.0
        } else {
            dispatch_nanos as f64 / processed as f64 / 1_000_000.0
        };

        let uptime_secs = self
            .shared
            .started_at
            .lock()
            .map_or(0.0, |started| started.elapsed().as_secs_f64());
        let throughput = if uptime_secs > 0.0 {
            processed as f64 / uptime_secs
        } else {
            0.0
        };

        let queue_depth = self
            .sender
            .read()
            .as_ref()
            .map_or(0, |sender| sender.max_capacity() - sender.capacity());

        let published_by_type = self
            .shared
            .published_by_type
            .iter()
            .map(|entry| (entry.key().to_string(), *entry.value()))
            .collect();

        EventBusMetrics {
            published,
            processed,
            failed,
            dropped,
            handler_invocations,
            subscription_count: self.subscription_count(),
            success_rate,
            avg_handle_time_ms,
            throughput,
            queue_depth,
            uptime_secs,
            published_by_type,
        }
    }
}

async fn run_dispatcher(
    shared: Arc<BusShared>,
    mut receiver: mpsc::Receiver<QueuedEvent>,
    shutdown: CancellationToken,
) {
    tracing::debug!("Event dispatcher started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            queued = receiver.recv() => match queued {
                Some(queued) => shared.dispatch(queued).await,
                None => break,
            },
        }
    }

    receiver.close();
    let mut discarded = 0usize;
    while receiver.try_recv().is_ok() {
        discarded += 1;
    }

    if discarded > 0 {
        tracing::warn!(discarded, "Discarded queued events on shutdown");
    }
    tracing::debug!("Event dispatcher stopped");
}

impl BusShared {
    async fn dispatch(&self, queued: QueuedEvent) {
        let QueuedEvent {
            event,
            enqueued_at,
            completion,
        } = queued;
        let queued_for = enqueued_at.elapsed();
        let stopwatch = Stopwatch::start();

        let matching: Vec<Arc<EventSubscription>> = self
            .subscriptions
            .read()
            .resolve(&event.event_type())
            .into_iter()
            .filter(|subscription| subscription.accepts(&event))
            .collect();

        let mut succeeded = 0usize;
        let mut failed = 0usize;

        let mut tasks = Vec::with_capacity(matching.len());
        for subscription in &matching {
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                break;
            };
            let handler = Arc::clone(&subscription.handler);
            let event = Arc::clone(&event);
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                handler.invoke(&event).await
            }));
        }

        for outcome in join_all(tasks).await {
            match outcome {
                Ok(HandleOutcome::Succeeded) => succeeded += 1,
                Ok(HandleOutcome::Failed) => failed += 1,
                Ok(HandleOutcome::Skipped) => {}
                Err(e) => {
                    failed += 1;
                    tracing::error!(event_id = %event.id(), "Handler task aborted: {}", e);
                }
            }
        }

        let duration = stopwatch.stop();
        let counters = &self.counters;
        counters.processed.fetch_add(1, Ordering::Relaxed);
        counters
            .failed
            .fetch_add(failed as u64, Ordering::Relaxed);
        counters
            .handler_invocations
            .fetch_add((succeeded + failed) as u64, Ordering::Relaxed);
        counters
            .dispatch_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);

        tracing::trace!(
            event_id = %event.id(),
            event_type = %event.event_type(),
            matched = matching.len(),
            succeeded,
            failed,
            "Processed event in {:?}",
            duration
        );

        if let Some(completion) = completion {
            let _ = completion.send(DispatchReport {
                event_id: event.id(),
                matched: matching.len(),
                succeeded,
                failed,
                queued_for,
                duration,
            });
        }
    }
}

#[async_trait]
impl Manager for EventBus {
    fn name(&self) -> &str {
        self.state.name()
    }

    async fn start(&self) -> Result<()> {
        EventBus::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        EventBus::stop(self).await
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        let metrics = self.get_metrics();

        status.set_health(status.state.health());
        status.add_metadata("published", serde_json::Value::from(metrics.published));
        status.add_metadata("processed", serde_json::Value::from(metrics.processed));
        status.add_metadata("failed", serde_json::Value::from(metrics.failed));
        status.add_metadata("dropped", serde_json::Value::from(metrics.dropped));
        status.add_metadata(
            "subscriptions",
            serde_json::Value::from(metrics.subscription_count),
        );
        status.add_metadata("queue_depth", serde_json::Value::from(metrics.queue_depth));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::event::{EventPayload, EventPriority};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn partial(source: &str) -> Event {
        Event::new(
            source,
            EventPayload::RecognitionPartial {
                engine: "whisper".to_string(),
                text: "hel".to_string(),
            },
        )
    }

    fn recording_handler(name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Handler> {
        Arc::new(Handler::from_sync_fn(name, move |_: &Event| {
            log.lock().push(name);
            Ok(())
        }))
    }

    async fn running_bus(config: EventBusConfig) -> EventBus {
        let bus = EventBus::new(config);
        bus.start().await.unwrap();
        bus
    }

    #[tokio::test]
    async fn test_priority_order() {
        let bus = running_bus(EventBusConfig::default()).await;
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(EventType::RecognitionPartial, recording_handler("low", log.clone()), None, 1);
        bus.subscribe(EventType::RecognitionPartial, recording_handler("high", log.clone()), None, 10);
        bus.subscribe_all(recording_handler("mid", log.clone()), None, 5);

        let outcome = bus.publish_and_wait(partial("asr"), None).await;
        let report = outcome.report().unwrap();
        assert_eq!(report.matched, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(*log.lock(), vec!["high", "mid", "low"]);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_high_priority_handler_does_not_hold_back_lower_ones() {
        let bus = running_bus(EventBusConfig::default()).await;
        let released = Arc::new(Notify::new());

        let waiter = released.clone();
        bus.subscribe(
            EventType::RecognitionPartial,
            Arc::new(Handler::from_fn("waits_for_low", move |_event| {
                let waiter = waiter.clone();
                async move {
                    tokio::time::timeout(Duration::from_secs(1), waiter.notified())
                        .await
                        .map_err(|_| Error::handler("waits_for_low", "never released"))
                }
            })),
            None,
            10,
        );
        let releaser = released.clone();
        bus.subscribe(
            EventType::RecognitionPartial,
            Arc::new(Handler::from_sync_fn("releases", move |_: &Event| {
                releaser.notify_one();
                Ok(())
            })),
            None,
            0,
        );

        let outcome = bus.publish_and_wait(partial("asr"), None).await;
        let report = outcome.report().unwrap();
        assert_eq!(report.matched, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);
        assert!(report.duration < Duration::from_secs(1));

        bus.stop().await.unwrap();
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        let bus = EventBus::new(EventBusConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = bus.subscribe(EventType::Metric, recording_handler("a", log.clone()), None, 0);
        let second = bus.subscribe_all(recording_handler("b", log.clone()), None, 0);
        let third = bus.subscribe(EventType::Metric, recording_handler("c", log.clone()), None, 0);
        let urgent = bus.subscribe(EventType::Metric, recording_handler("d", log), None, 7);

        let order: Vec<SubscriptionId> = bus
            .shared
            .subscriptions
            .read()
            .resolve(&EventType::Metric)
            .iter()
            .map(|s| s.id())
            .collect();
        assert_eq!(order, vec![urgent, first, second, third]);
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let bus = running_bus(EventBusConfig::default()).await;
        let ran = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            EventType::RecognitionPartial,
            Arc::new(Handler::from_sync_fn("failing", |_: &Event| {
                Err(Error::handler("failing", "bad input"))
            })),
            None,
            10,
        );
        bus.subscribe(
            EventType::RecognitionPartial,
            Arc::new(Handler::from_sync_fn("panicking", |_: &Event| -> Result<()> {
                panic!("boom")
            })),
            None,
            10,
        );
        let counter = ran.clone();
        bus.subscribe(
            EventType::RecognitionPartial,
            Arc::new(Handler::from_sync_fn("healthy", move |_: &Event| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            None,
            0,
        );

        let outcome = bus.publish_and_wait(partial("asr"), None).await;
        let report = outcome.report().unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let metrics = bus.get_metrics();
        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.failed, 2);
        assert_eq!(metrics.handler_invocations, 3);

        bus.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bounded_concurrency() {
        let bus = running_bus(EventBusConfig {
            max_concurrent_handlers: 2,
            ..EventBusConfig::default()
        })
        .await;

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let current = current.clone();
            let peak = peak.clone();
            let handler = Handler::from_fn(format!("slow-{}", i), move |_event| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            bus.subscribe(EventType::RecognitionPartial, Arc::new(handler), None, 0);
        }

        let outcome = bus.publish_and_wait(partial("asr"), None).await;
        assert_eq!(outcome.report().unwrap().succeeded, 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_and_wait_timeout() {
        let bus = running_bus(EventBusConfig::default()).await;
        bus.subscribe(
            EventType::RecognitionPartial,
            Arc::new(Handler::from_fn("sleepy", |_event| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })),
            None,
            0,
        );

        let outcome = bus
            .publish_and_wait(partial("asr"), Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(outcome, DispatchOutcome::TimedOut));

        bus.stop().await.unwrap();
        assert_eq!(bus.get_metrics().processed, 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_publish_after_stop_is_noop() {
        let bus = EventBus::new(EventBusConfig::default());
        assert!(!bus.publish(partial("asr")).await);

        bus.start().await.unwrap();
        bus.start().await.unwrap();
        assert!(bus.is_running());

        bus.stop().await.unwrap();
        bus.stop().await.unwrap();
        assert!(!bus.is_running());
        assert_eq!(bus.state.state().await, ManagerState::Stopped);

        assert!(!bus.publish(partial("asr")).await);
        assert!(matches!(
            bus.publish_and_wait(partial("asr"), None).await,
            DispatchOutcome::Rejected
        ));
        assert_eq!(bus.get_metrics().published, 0);
    }

    #[tokio::test]
    async fn test_restart_keeps_first_start_time() {
        let bus = running_bus(EventBusConfig::default()).await;
        bus.publish_and_wait(partial("asr"), None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.stop().await.unwrap();

        let before = bus.get_metrics();
        bus.start().await.unwrap();
        let after = bus.get_metrics();

        assert_eq!(after.processed, 1);
        assert!(after.uptime_secs >= before.uptime_secs);
        assert!(after.uptime_secs >= 0.02);
        assert!(after.throughput <= before.throughput);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wildcard_with_filter() {
        let bus = running_bus(EventBusConfig::default()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        bus.subscribe_all(
            Arc::new(Handler::from_sync_fn("asr-only", move |event: &Event| {
                sink.lock().push(event.source().to_string());
                Ok(())
            })),
            Some(EventFilter::new().with_source_pattern("asr")),
            0,
        );

        bus.publish_and_wait(partial("asr_engine"), None).await;
        bus.publish_and_wait(partial("tts_engine"), None).await;
        bus.publish_and_wait(Event::metric("asr_engine", "latency_ms", 42.0), None)
            .await;

        assert_eq!(*seen.lock(), vec!["asr_engine", "asr_engine"]);
        let metrics = bus.get_metrics();
        assert_eq!(metrics.published, 3);
        assert_eq!(metrics.published_by_type.get("recognition.partial"), Some(&2));

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_and_disable() {
        let bus = running_bus(EventBusConfig::default()).await;
        let log = Arc::new(Mutex::new(Vec::new()));

        let kept = bus.subscribe(EventType::RecognitionPartial, recording_handler("kept", log.clone()), None, 0);
        let removed = bus.subscribe(EventType::RecognitionPartial, recording_handler("removed", log.clone()), None, 0);

        assert!(bus.unsubscribe(removed));
        assert!(!bus.unsubscribe(removed));
        assert_eq!(bus.subscription_count(), 1);

        assert!(bus.set_subscription_enabled(kept, false));
        bus.publish_and_wait(partial("asr"), None).await;
        assert!(log.lock().is_empty());

        assert!(bus.set_subscription_enabled(kept, true));
        bus.publish_and_wait(partial("asr"), None).await;
        assert_eq!(*log.lock(), vec!["kept"]);
        assert!(!bus.set_subscription_enabled(Uuid::new_v4(), true));

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_newest_when_queue_full() {
        let bus = running_bus(EventBusConfig {
            queue_capacity: 1,
            backpressure: BackpressurePolicy::DropNewest,
            ..EventBusConfig::default()
        })
        .await;

        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Semaphore::new(0));
        let (entered_signal, gate_wait) = (entered.clone(), gate.clone());
        bus.subscribe(
            EventType::RecognitionPartial,
            Arc::new(Handler::from_fn("blocking", move |_event| {
                let entered = entered_signal.clone();
                let gate = gate_wait.clone();
                async move {
                    entered.notify_one();
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                    Ok(())
                }
            })),
            None,
            0,
        );

        assert!(bus.publish(partial("asr")).await);
        entered.notified().await;

        assert!(bus.publish(partial("asr")).await);
        assert!(!bus.publish(partial("asr")).await);

        let metrics = bus.get_metrics();
        assert_eq!(metrics.dropped, 1);
        assert_eq!(metrics.published, 2);
        assert_eq!(metrics.queue_depth, 1);

        gate.add_permits(2);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_high_priority_event_passes_min_priority_filter() {
        let bus = running_bus(EventBusConfig::default()).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventType::RecognitionPartial,
            recording_handler("urgent", log.clone()),
            Some(EventFilter::new().with_min_priority(EventPriority::High)),
            0,
        );

        bus.publish_and_wait(partial("asr"), None).await;
        bus.publish_and_wait(partial("asr").with_priority(EventPriority::Critical), None)
            .await;
        assert_eq!(log.lock().len(), 1);

        bus.stop().await.unwrap();
    }
}
