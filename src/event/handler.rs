// src/event/handler.rs

//! Event handlers with failure isolation and statistics
//!
//! Implementers supply [`EventHandler::handle`]. The bus never calls it
//! directly: every handler is wrapped in a [`Handler`], which owns the name,
//! the enabled switch and the counters, and whose `safe_handle` turns errors
//! and panics into a `false` return.
//!
//! Retry, batching and conditional behaviour are composed by wrapping one
//! handler in another (`RetryHandler`, `BatchHandler`, `ConditionalHandler`).

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Event;
use crate::error::Result;
use crate::utils::retry::RetryConfig;
use crate::utils::timing::Stopwatch;

/// A unit of work consuming one event
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Result of one invocation, as seen by the bus metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleOutcome {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Default)]
struct HandlerCounters {
    handle_count: u64,
    error_count: u64,
    total_handle_time: Duration,
    max_handle_time: Duration,
}

/// Snapshot returned by [`Handler::get_statistics`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerStatistics {
    pub name: String,
    pub enabled: bool,
    pub handle_count: u64,
    pub error_count: u64,
    pub success_rate: f64,
    pub avg_handle_time: Duration,
    pub max_handle_time: Duration,
}

/// Named, stateful wrapper the bus dispatches to
///
/// One `Arc<Handler>` may back several subscriptions; its counters then
/// aggregate over all of them.
pub struct Handler {
    name: String,
    inner: Arc<dyn EventHandler>,
    enabled: AtomicBool,
    counters: Mutex<HandlerCounters>,
}

impl Handler {
    pub fn new<H>(name: impl Into<String>, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        Self::from_arc(name, Arc::new(handler))
    }

    pub fn from_arc(name: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            name: name.into(),
            inner: handler,
            enabled: AtomicBool::new(true),
            counters: Mutex::new(HandlerCounters::default()),
        }
    }

    /// Handler backed by an async closure receiving its own copy of the event
    pub fn from_fn<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(name, FnHandler::new(func))
    }

    /// Handler backed by a synchronous closure
    pub fn from_sync_fn<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, SyncFnHandler::new(func))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Runs the handler, absorbing any error or panic it produces
    ///
    /// Returns `false` without touching the counters when disabled.
    pub async fn safe_handle(&self, event: &Event) -> bool {
        self.invoke(event).await == HandleOutcome::Succeeded
    }

    pub(crate) async fn invoke(&self, event: &Event) -> HandleOutcome {
        if !self.is_enabled() {
            return HandleOutcome::Skipped;
        }

        self.counters.lock().handle_count += 1;
        let stopwatch = Stopwatch::start();

        let result = AssertUnwindSafe(self.inner.handle(event))
            .catch_unwind()
            .await;
        let elapsed = stopwatch.stop();

        let succeeded = match result {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::warn!(
                    handler = %self.name,
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    "Handler failed: {}",
                    error
                );
                false
            }
            Err(panic) => {
                tracing::error!(
                    handler = %self.name,
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    "Handler panicked: {}",
                    panic_message(panic.as_ref())
                );
                false
            }
        };

        let mut counters = self.counters.lock();
        if !succeeded {
            counters.error_count += 1;
        }
        counters.total_handle_time += elapsed;
        counters.max_handle_time = counters.max_handle_time.max(elapsed);

        if succeeded {
            HandleOutcome::Succeeded
        } else {
            HandleOutcome::Failed
        }
    }

    pub fn get_statistics(&self) -> HandlerStatistics {
        let counters = self.counters.lock();
        let (success_rate, avg_handle_time) = if counters.handle_count == 0 {
            (0.0, Duration::ZERO)
        } else {
            (
                (counters.handle_count - counters.error_count) as f64
                    / counters.handle_count as f64,
                Duration::from_secs_f64(
                    counters.total_handle_time.as_secs_f64() / counters.handle_count as f64,
                ),
            )
        };

        HandlerStatistics {
            name: self.name.clone(),
            enabled: self.is_enabled(),
            handle_count: counters.handle_count,
            error_count: counters.error_count,
            success_rate,
            avg_handle_time,
            max_handle_time: counters.max_handle_time,
        }
    }

    pub fn reset_statistics(&self) {
        *self.counters.lock() = HandlerCounters::default();
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handler wrapping an async closure
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.func)(event.clone()).await
    }
}

/// Handler wrapping a synchronous closure
pub struct SyncFnHandler<F> {
    func: F,
}

impl<F> SyncFnHandler<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> EventHandler for SyncFnHandler<F>
where
    F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.func)(event)
    }
}

/// Runs the inner handler only for events accepted by the predicate
///
/// Rejected events count as handled successfully.
pub struct ConditionalHandler {
    predicate: Arc<dyn Fn(&Event) -> bool + Send + Sync>,
    inner: Arc<dyn EventHandler>,
}

impl ConditionalHandler {
    pub fn new<P, H>(predicate: P, inner: H) -> Self
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
        H: EventHandler + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            inner: Arc::new(inner),
        }
    }
}

#[async_trait]
impl EventHandler for ConditionalHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        if (self.predicate)(event) {
            self.inner.handle(event).await
        } else {
            Ok(())
        }
    }
}

/// Retries the inner handler with exponential backoff
///
/// `max_retries` counts retries after the first attempt. The last error is
/// returned once they are exhausted.
pub struct RetryHandler {
    inner: Arc<dyn EventHandler>,
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new<H>(inner: H, config: RetryConfig) -> Self
    where
        H: EventHandler + 'static,
    {
        Self {
            inner: Arc::new(inner),
            config,
        }
    }

    /// Doubling backoff starting at `base_delay`
    pub fn with_retries<H>(inner: H, max_retries: u32, base_delay: Duration) -> Self
    where
        H: EventHandler + 'static,
    {
        Self::new(
            inner,
            RetryConfig {
                max_retries,
                initial_delay: base_delay,
                ..RetryConfig::default()
            },
        )
    }
}

#[async_trait]
impl EventHandler for RetryHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        let mut retry = 0;
        loop {
            match self.inner.handle(event).await {
                Ok(()) => return Ok(()),
                Err(error) if retry < self.config.max_retries => {
                    let delay = self.config.delay_for(retry);
                    tracing::debug!(
                        event_id = %event.id(),
                        "Attempt {} failed, retrying in {:?}: {}",
                        retry + 1,
                        delay,
                        error
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(error) => {
                    return Err(error.with_attempts(retry + 1));
                }
            }
        }
    }
}

type BatchProcessor = Arc<dyn Fn(Vec<Event>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Default)]
struct BatchBuffer {
    events: Vec<Event>,
    oldest: Option<Instant>,
}

impl BatchBuffer {
    fn take(&mut self) -> Vec<Event> {
        self.oldest = None;
        std::mem::take(&mut self.events)
    }

    fn is_expired(&self, max_wait: Duration) -> bool {
        self.oldest.is_some_and(|oldest| oldest.elapsed() >= max_wait)
    }
}

/// Buffers events and hands them to a processor in batches
///
/// A batch is flushed when it reaches `batch_size` events or when its oldest
/// event has waited `max_wait`, whichever comes first. The age check runs on
/// every new event; `spawn_flush_timer` adds a background check so a quiet
/// stream still gets flushed.
pub struct BatchHandler {
    batch_size: usize,
    max_wait: Duration,
    buffer: tokio::sync::Mutex<BatchBuffer>,
    processor: BatchProcessor,
}

impl BatchHandler {
    pub fn new<F, Fut>(batch_size: usize, max_wait: Duration, processor: F) -> Self
    where
        F: Fn(Vec<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            batch_size: batch_size.max(1),
            max_wait,
            buffer: tokio::sync::Mutex::new(BatchBuffer::default()),
            processor: Arc::new(move |batch| processor(batch).boxed()),
        }
    }

    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.events.len()
    }

    /// Flushes whatever is buffered, returning the number of events processed
    pub async fn flush(&self) -> Result<usize> {
        let batch = self.buffer.lock().await.take();
        self.process(batch).await
    }

    /// Flushes only if the oldest buffered event has waited `max_wait`
    pub async fn flush_expired(&self) -> Result<usize> {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            if !buffer.is_expired(self.max_wait) {
                return Ok(0);
            }
            buffer.take()
        };
        self.process(batch).await
    }

    /// Periodically flushes expired batches until `shutdown` fires, then flushes the rest
    pub fn spawn_flush_timer(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        let period = self.max_wait.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        if let Err(e) = handler.flush().await {
                            tracing::warn!("Final batch flush failed: {}", e);
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = handler.flush_expired().await {
                            tracing::warn!("Timed batch flush failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    async fn process(&self, batch: Vec<Event>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let size = batch.len();
        (self.processor)(batch).await?;
        tracing::trace!("Flushed batch of {} events", size);
        Ok(size)
    }
}

#[async_trait]
impl EventHandler for BatchHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        let ready = {
            let mut buffer = self.buffer.lock().await;
            buffer.events.push(event.clone());
            buffer.oldest.get_or_insert_with(Instant::now);
            if buffer.events.len() >= self.batch_size || buffer.is_expired(self.max_wait) {
                Some(buffer.take())
            } else {
                None
            }
        };

        if let Some(batch) = ready {
            self.process(batch).await?;
        }
        Ok(())
    }
}
