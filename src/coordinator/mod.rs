// src/coordinator/mod.rs

//! System coordinator
//!
//! Layers component lifecycle over the event bus:
//! - A registry of components and their dependency edges (`graph`)
//! - Cascading `Stopped` transitions from a stopped or failed component to
//!   everything that depends on it
//! - Recursive, fail-closed health evaluation (`health`)
//! - Emergency shutdown when a CRITICAL error event reaches the bus
//!
//! The coordinator listens to component-state-changed and error events
//! through its own subscriptions. Those listeners hold weak references, so
//! dropping the last `SystemCoordinator` handle does not leak through the bus.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::error::{ComponentOperation, CoordinatorOperation, Error, Result};
use crate::event::{
    Event, EventBus, EventFilter, EventHandler, EventPayload, EventPriority, EventType, Handler,
};
use crate::manager::{HealthStatus, ManagedState, Manager, ManagerState, ManagerStatus};
use crate::types::{Metadata, SubscriptionId};

pub mod component;
pub mod graph;
pub mod health;

pub use component::{ComponentInfo, ComponentState};
pub use graph::ComponentGraph;
pub use health::{health_check_fn, health_check_sync, HealthCheck, HealthChecker, SystemHealth};

/// Source name on every event the coordinator publishes
pub const COORDINATOR_SOURCE: &str = "system_coordinator";

/// Internal listeners run ahead of ordinary subscribers
const LISTENER_PRIORITY: i32 = 1_000;

struct StateChange {
    component: String,
    state: ComponentState,
    metadata: Metadata,
    cause: Option<Event>,
    cascaded: bool,
}

struct HealthMonitor {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct CoordinatorInner {
    state: ManagedState,
    bus: Arc<EventBus>,
    config: CoordinatorConfig,
    graph: RwLock<ComponentGraph>,
    health_checkers: DashMap<String, Vec<HealthChecker>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    monitor: Mutex<Option<HealthMonitor>>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// Cheap to clone; all clones share one registry
#[derive(Clone)]
pub struct SystemCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl fmt::Debug for SystemCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemCoordinator")
            .field("components", &self.inner.graph.read().len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl SystemCoordinator {
    pub fn new(bus: Arc<EventBus>, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                state: ManagedState::new(Uuid::new_v4(), COORDINATOR_SOURCE),
                bus,
                config,
                graph: RwLock::new(ComponentGraph::new()),
                health_checkers: DashMap::new(),
                subscriptions: Mutex::new(Vec::new()),
                monitor: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn from_weak(inner: &Weak<CoordinatorInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub async fn state(&self) -> ManagerState {
        self.inner.state.state().await
    }

    /// Starts the bus, installs the internal listeners and announces the system
    ///
    /// A coordinator runs once; starting it again after it stopped fails.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        match self.inner.state.state().await {
            ManagerState::Created => {}
            ManagerState::Running => return Ok(()),
            other => {
                return Err(Error::coordinator(
                    CoordinatorOperation::Start,
                    format!("Coordinator cannot be started from state {}", other),
                ))
            }
        }

        self.inner
            .state
            .transition(ManagerState::Initializing, CoordinatorOperation::Start)
            .await?;

        if let Err(e) = self.inner.bus.start().await {
            self.inner
                .state
                .transition(ManagerState::Error, CoordinatorOperation::Start)
                .await?;
            self.inner
                .state
                .set_message(format!("Event bus failed to start: {}", e))
                .await;
            return Err(Error::coordinator(
                CoordinatorOperation::Start,
                "Event bus failed to start",
            )
            .caused_by(e));
        }

        self.install_listeners();
        self.inner
            .state
            .transition(ManagerState::Running, CoordinatorOperation::Start)
            .await?;

        let components = self.inner.graph.read().len();
        self.publish(Event::new(
            COORDINATOR_SOURCE,
            EventPayload::SystemStarted { components },
        ))
        .await;
        self.spawn_health_monitor();

        tracing::info!(components, "System coordinator started");
        Ok(())
    }

    /// Stops components dependents-first, announces shutdown and stops the bus
    ///
    /// A no-op unless the coordinator is running.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if self.inner.state.state().await != ManagerState::Running {
            return Ok(());
        }
        self.inner
            .state
            .transition(ManagerState::ShuttingDown, CoordinatorOperation::Stop)
            .await?;

        self.stop_health_monitor().await;
        self.stop_components().await;

        let shutdown = Event::new(
            COORDINATOR_SOURCE,
            EventPayload::SystemShutdown {
                reason: "coordinator stop".to_string(),
            },
        )
        .with_priority(EventPriority::High);
        let outcome = self
            .inner
            .bus
            .publish_and_wait(shutdown, Some(self.inner.config.shutdown_timeout()))
            .await;
        if !outcome.is_completed() {
            tracing::warn!(?outcome, "Shutdown event was not fully delivered");
        }

        self.remove_listeners();
        self.inner.bus.stop().await?;
        self.inner
            .state
            .transition(ManagerState::Stopped, CoordinatorOperation::Stop)
            .await?;

        tracing::info!("System coordinator stopped");
        Ok(())
    }

    async fn stop_components(&self) {
        let order = self.inner.graph.read().topological_order();

        for name in order.into_iter().rev() {
            let running = self
                .inner
                .graph
                .read()
                .get(&name)
                .map_or(false, |info| !info.state.is_terminal());
            if !running {
                continue;
            }

            let mut metadata = Metadata::new();
            metadata.insert("reason".to_string(), Value::from("shutdown"));
            self.apply_state_change(&name, ComponentState::Stopped, metadata, None)
                .await;
        }
    }

    /// Force-stops everything without cascading or publishing
    ///
    /// Every component is set to `Stopped`, the coordinator ends in
    /// `EmergencyStopped` and the bus is stopped in the background, so this
    /// is safe to call from inside a bus handler.
    pub async fn emergency_shutdown(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.inner
            .state
            .transition(
                ManagerState::EmergencyStopped,
                CoordinatorOperation::EmergencyShutdown,
            )
            .await?;

        tracing::error!(reason = %reason, "Emergency shutdown");

        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.shutdown.cancel();
        }

        {
            let mut graph = self.inner.graph.write();
            for info in graph.iter_mut() {
                info.state = ComponentState::Stopped;
                info.touch();
            }
        }
        self.inner
            .state
            .set_message(format!("Emergency shutdown: {}", reason))
            .await;

        self.remove_listeners();
        let bus = Arc::clone(&self.inner.bus);
        tokio::spawn(async move {
            if let Err(e) = bus.stop().await {
                tracing::error!("Failed to stop event bus after emergency shutdown: {}", e);
            }
        });

        Ok(())
    }

    fn install_listeners(&self) {
        let weak = Arc::downgrade(&self.inner);
        let bus = &self.inner.bus;

        let state_listener = Arc::new(Handler::new(
            "coordinator.state_listener",
            StateChangeListener {
                coordinator: weak.clone(),
            },
        ));
        let error_listener = Arc::new(Handler::new(
            "coordinator.error_listener",
            ErrorListener { coordinator: weak },
        ));

        let ids = vec![
            bus.subscribe(
                EventType::ComponentStateChanged,
                state_listener,
                Some(EventFilter::predicate(|event| {
                    event.source() != COORDINATOR_SOURCE
                })),
                LISTENER_PRIORITY,
            ),
            bus.subscribe(EventType::Error, error_listener, None, LISTENER_PRIORITY),
        ];
        *self.inner.subscriptions.lock() = ids;
    }

    fn remove_listeners(&self) {
        let ids = std::mem::take(&mut *self.inner.subscriptions.lock());
        for id in ids {
            self.inner.bus.unsubscribe(id);
        }
    }

    fn spawn_health_monitor(&self) {
        let Some(interval) = self.inner.config.health_check_interval() else {
            return;
        };

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(coordinator) = SystemCoordinator::from_weak(&weak) else {
                            break;
                        };
                        coordinator.report_health().await;
                    }
                }
            }
            tracing::debug!("Health monitor stopped");
        });

        *self.inner.monitor.lock() = Some(HealthMonitor { shutdown, handle });
    }

    async fn stop_health_monitor(&self) {
        let monitor = self.inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.shutdown.cancel();
            if let Err(e) = monitor.handle.await {
                tracing::warn!("Health monitor terminated abnormally: {}", e);
            }
        }
    }

    async fn report_health(&self) {
        let health = self.get_system_health().await;
        if health.is_healthy() {
            tracing::debug!(score = health.health_score, "System health check passed");
        } else {
            tracing::warn!(
                score = health.health_score,
                unhealthy = ?health.unhealthy_components,
                "System health degraded"
            );
        }

        let mut tags = HashMap::new();
        tags.insert(
            "unhealthy".to_string(),
            health.unhealthy_components.len().to_string(),
        );
        let metric = Event::new(
            COORDINATOR_SOURCE,
            EventPayload::Metric {
                name: "system.health_score".to_string(),
                value: health.health_score,
                unit: Some("percent".to_string()),
                tags,
            },
        )
        .with_priority(EventPriority::Low);
        self.publish(metric).await;
    }

    /// Publishes through the bus when it is running; returns whether it was accepted
    pub async fn publish(&self, event: Event) -> bool {
        if !self.inner.bus.is_running() {
            tracing::debug!(
                event_type = %event.event_type(),
                "Event bus not running, coordinator event not published"
            );
            return false;
        }
        self.inner.bus.publish(event).await
    }

    /// Adds a component
    ///
    /// Dependencies that are not registered yet are accepted with a warning
    /// and linked once they register. Fails when the name is taken or an
    /// edge would close a cycle.
    pub fn register_component(
        &self,
        name: impl Into<String>,
        component_type: impl Into<String>,
        dependencies: &[&str],
        health_checker: Option<HealthChecker>,
    ) -> Result<()> {
        let name = name.into();
        let dependencies: BTreeSet<String> = dependencies.iter().map(|d| d.to_string()).collect();
        let info = ComponentInfo::new(name.clone(), component_type, dependencies);

        let dangling = self.inner.graph.write().register(info)?;
        for dependency in &dangling {
            tracing::warn!(
                component = %name,
                dependency = %dependency,
                "Dependency is not registered yet"
            );
        }

        if let Some(checker) = health_checker {
            self.inner
                .health_checkers
                .entry(name.clone())
                .or_default()
                .push(checker);
        }

        tracing::info!(component = %name, "Component registered");
        Ok(())
    }

    /// Removes a component nothing depends on
    pub fn unregister_component(&self, name: &str) -> Result<()> {
        self.inner.graph.write().unregister(name)?;
        self.inner.health_checkers.remove(name);
        tracing::info!(component = %name, "Component unregistered");
        Ok(())
    }

    pub fn add_dependency(&self, component: &str, dependency: &str) -> Result<()> {
        let registered = self.inner.graph.write().add_dependency(component, dependency)?;
        if !registered {
            tracing::warn!(
                component = %component,
                dependency = %dependency,
                "Dependency is not registered yet"
            );
        }
        tracing::debug!(component = %component, dependency = %dependency, "Dependency added");
        Ok(())
    }

    pub fn remove_dependency(&self, component: &str, dependency: &str) -> Result<bool> {
        let removed = self
            .inner
            .graph
            .write()
            .remove_dependency(component, dependency)?;
        if removed {
            tracing::debug!(component = %component, dependency = %dependency, "Dependency removed");
        }
        Ok(removed)
    }

    pub fn add_health_checker(&self, name: &str, checker: HealthChecker) -> Result<()> {
        if !self.inner.graph.read().contains(name) {
            return Err(Error::component(
                name,
                ComponentOperation::HealthCheck,
                format!("Component '{}' is not registered", name),
            ));
        }
        self.inner
            .health_checkers
            .entry(name.to_string())
            .or_default()
            .push(checker);
        Ok(())
    }

    /// Records the new state and publishes it
    ///
    /// `Stopped` and `Error` cascade `Stopped` to every transitive dependent
    /// not already stopped or failed; each cascaded event is caused by the
    /// event of the component that triggered it.
    pub async fn update_component_state(
        &self,
        name: &str,
        state: ComponentState,
        metadata: Option<Metadata>,
    ) -> Result<()> {
        if !self.inner.graph.read().contains(name) {
            return Err(Error::component(
                name,
                ComponentOperation::UpdateState,
                format!("Component '{}' is not registered", name),
            ));
        }

        self.apply_state_change(name, state, metadata.unwrap_or_default(), None)
            .await;
        Ok(())
    }

    async fn apply_state_change(
        &self,
        name: &str,
        state: ComponentState,
        metadata: Metadata,
        cause: Option<Event>,
    ) {
        let mut worklist = VecDeque::new();
        worklist.push_back(StateChange {
            component: name.to_string(),
            state,
            metadata,
            cause,
            cascaded: false,
        });

        while let Some(change) = worklist.pop_front() {
            let applied = {
                let mut graph = self.inner.graph.write();
                match graph.get_mut(&change.component) {
                    Some(info) if change.cascaded && info.state.is_terminal() => None,
                    Some(info) => {
                        let old_state = std::mem::replace(&mut info.state, change.state.clone());
                        info.metadata.extend(change.metadata.clone());
                        info.touch();
                        Some((old_state, info.dependents.clone()))
                    }
                    None => None,
                }
            };
            let Some((old_state, dependents)) = applied else {
                continue;
            };

            if change.cascaded {
                tracing::warn!(
                    component = %change.component,
                    from = %old_state,
                    to = %change.state,
                    "Component stopped by cascade"
                );
            } else {
                tracing::info!(
                    component = %change.component,
                    from = %old_state,
                    to = %change.state,
                    "Component state changed"
                );
            }

            let mut event = Event::new(
                COORDINATOR_SOURCE,
                EventPayload::ComponentStateChanged {
                    component: change.component.clone(),
                    old_state: Some(old_state.to_string()),
                    new_state: change.state.to_string(),
                    metadata: change.metadata,
                },
            );
            if let Some(cause) = &change.cause {
                event = event.caused_by(cause);
            }

            if change.state.is_terminal() {
                for dependent in dependents {
                    let mut metadata = Metadata::new();
                    metadata.insert(
                        "cascade_from".to_string(),
                        Value::from(change.component.clone()),
                    );
                    worklist.push_back(StateChange {
                        component: dependent,
                        state: ComponentState::Stopped,
                        metadata,
                        cause: Some(event.clone()),
                        cascaded: true,
                    });
                }
            }

            self.publish(event).await;
        }
    }

    fn record_error(&self, component: &str, message: &str, error_kind: &str) {
        let mut graph = self.inner.graph.write();
        if let Some(info) = graph.get_mut(component) {
            info.metadata.insert(
                "last_error".to_string(),
                serde_json::json!({ "message": message, "kind": error_kind }),
            );
            info.touch();
        }
    }

    /// True when every checker of `name` passes and all its dependencies are
    /// healthy; unknown components and dependencies count as unhealthy
    pub async fn check_component_health(&self, name: &str) -> bool {
        let mut memo = HashMap::new();
        self.evaluate_health(name, &mut memo).await
    }

    async fn evaluate_health(&self, name: &str, memo: &mut HashMap<String, bool>) -> bool {
        let order = self.inner.graph.read().dependency_closure(name);

        for current in order {
            if memo.contains_key(&current) {
                continue;
            }

            let dependencies = self
                .inner
                .graph
                .read()
                .get(&current)
                .map(|info| info.dependencies.clone());

            let healthy = match dependencies {
                None => false,
                Some(dependencies) => {
                    dependencies
                        .iter()
                        .all(|dependency| memo.get(dependency).copied().unwrap_or(false))
                        && self.run_health_checkers(&current).await
                }
            };

            self.record_health(&current, healthy);
            memo.insert(current, healthy);
        }

        memo.get(name).copied().unwrap_or(false)
    }

    async fn run_health_checkers(&self, name: &str) -> bool {
        let checkers = self
            .inner
            .health_checkers
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        for checker in &checkers {
            if !health::run_checker(checker).await {
                return false;
            }
        }
        true
    }

    fn record_health(&self, name: &str, healthy: bool) {
        let status = if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        let mut graph = self.inner.graph.write();
        let Some(info) = graph.get_mut(name) else {
            return;
        };
        if info.health_status == status {
            return;
        }

        let previous = std::mem::replace(&mut info.health_status, status);
        if healthy {
            tracing::info!(component = %name, from = %previous, "Component is healthy");
        } else {
            tracing::warn!(component = %name, from = %previous, "Component is unhealthy");
        }
    }

    pub async fn get_system_health(&self) -> SystemHealth {
        let names: Vec<String> = self
            .inner
            .graph
            .read()
            .iter()
            .map(|info| info.name.clone())
            .collect();

        let mut memo = HashMap::new();
        let mut components = BTreeMap::new();
        let mut unhealthy_components = Vec::new();

        for name in &names {
            let healthy = self.evaluate_health(name, &mut memo).await;
            if healthy {
                components.insert(name.clone(), HealthStatus::Healthy);
            } else {
                components.insert(name.clone(), HealthStatus::Unhealthy);
                unhealthy_components.push(name.clone());
            }
        }

        let total_components = names.len();
        let healthy_components = total_components - unhealthy_components.len();
        let health_score = if total_components == 0 {
            100.0
        } else {
            healthy_components as f64 / total_components as f64 * 100.0
        };

        SystemHealth {
            coordinator_state: self.inner.state.state().await,
            health_score,
            total_components,
            healthy_components,
            unhealthy_components,
            uptime_secs: self.inner.state.uptime().await.as_secs_f64(),
            components,
            checked_at: chrono::Utc::now(),
        }
    }

    pub fn get_dependency_graph(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.inner.graph.read().dependency_graph()
    }

    pub fn get_component_info(&self, name: &str) -> Option<ComponentInfo> {
        self.inner.graph.read().get(name).cloned()
    }

    pub fn list_components(&self) -> Vec<ComponentInfo> {
        self.inner.graph.read().iter().cloned().collect()
    }

    /// Registered components, dependencies first
    pub fn startup_order(&self) -> Vec<String> {
        self.inner.graph.read().topological_order()
    }
}

/// Applies state changes that components announce on the bus themselves
struct StateChangeListener {
    coordinator: Weak<CoordinatorInner>,
}

#[async_trait]
impl EventHandler for StateChangeListener {
    async fn handle(&self, event: &Event) -> Result<()> {
        let EventPayload::ComponentStateChanged {
            component,
            new_state,
            metadata,
            ..
        } = event.payload()
        else {
            return Ok(());
        };
        let Some(coordinator) = SystemCoordinator::from_weak(&self.coordinator) else {
            return Ok(());
        };

        if !coordinator.inner.graph.read().contains(component) {
            tracing::debug!(component = %component, "State change for unknown component ignored");
            return Ok(());
        }

        coordinator
            .apply_state_change(
                component,
                ComponentState::from(new_state.clone()),
                metadata.clone(),
                Some(event.clone()),
            )
            .await;
        Ok(())
    }
}

/// Escalates CRITICAL error events to an emergency shutdown
struct ErrorListener {
    coordinator: Weak<CoordinatorInner>,
}

#[async_trait]
impl EventHandler for ErrorListener {
    async fn handle(&self, event: &Event) -> Result<()> {
        let EventPayload::Error {
            message,
            component,
            error_kind,
            ..
        } = event.payload()
        else {
            return Ok(());
        };
        let Some(coordinator) = SystemCoordinator::from_weak(&self.coordinator) else {
            return Ok(());
        };

        if event.priority() == EventPriority::Critical {
            tracing::error!(
                source = event.source(),
                component = ?component,
                error_kind = %error_kind,
                "Critical error: {}",
                message
            );
            return coordinator.emergency_shutdown(message.clone()).await;
        }

        if let Some(component) = component {
            tracing::warn!(
                component = %component,
                error_kind = %error_kind,
                "Component reported error: {}",
                message
            );
            coordinator.record_error(component, message, error_kind);
        }
        Ok(())
    }
}

#[async_trait]
impl Manager for SystemCoordinator {
    fn name(&self) -> &str {
        self.inner.state.name()
    }

    async fn start(&self) -> Result<()> {
        SystemCoordinator::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        SystemCoordinator::stop(self).await
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.inner.state.status().await;
        status.set_health(self.health_check().await);
        let graph = self.get_dependency_graph();
        status.add_metadata("components", Value::from(graph.len()));
        status.add_metadata(
            "subscriptions",
            Value::from(self.inner.subscriptions.lock().len()),
        );
        status
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state().await {
            ManagerState::Running => {
                if self.get_system_health().await.is_healthy() {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                }
            }
            state => state.health(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventBusConfig;
    use crate::error::{ErrorKind, ErrorSeverity};
    use std::future::Future;
    use std::time::Duration;

    fn coordinator() -> SystemCoordinator {
        coordinator_with(CoordinatorConfig::default())
    }

    fn coordinator_with(config: CoordinatorConfig) -> SystemCoordinator {
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));
        SystemCoordinator::new(bus, config)
    }

    async fn eventually<F, Fut>(condition: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let waited = tokio::time::timeout(Duration::from_secs(2), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "condition not reached in time");
    }

    fn collector(
        bus: &EventBus,
        event_type: EventType,
        filter: Option<EventFilter>,
    ) -> Arc<Mutex<Vec<Event>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe(
            event_type,
            Arc::new(Handler::from_sync_fn("collector", move |event: &Event| {
                sink.lock().push(event.clone());
                Ok(())
            })),
            filter,
            0,
        );
        events
    }

    fn state_of(coordinator: &SystemCoordinator, name: &str) -> ComponentState {
        coordinator.get_component_info(name).unwrap().state
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let coordinator = coordinator();
        coordinator
            .register_component("audio_capture", "audio", &[], None)
            .unwrap();
        assert!(coordinator
            .register_component("audio_capture", "audio", &[], None)
            .is_err());
        assert_eq!(coordinator.list_components().len(), 1);
        assert_eq!(
            state_of(&coordinator, "audio_capture"),
            ComponentState::Registered
        );
    }

    #[tokio::test]
    async fn test_cascading_shutdown() {
        let coordinator = coordinator();
        coordinator.register_component("c", "svc", &[], None).unwrap();
        coordinator.register_component("b", "svc", &["c"], None).unwrap();
        coordinator.register_component("a", "svc", &["b"], None).unwrap();
        for name in ["a", "b", "c"] {
            coordinator
                .update_component_state(name, ComponentState::Running, None)
                .await
                .unwrap();
        }

        coordinator
            .update_component_state("c", ComponentState::Stopped, None)
            .await
            .unwrap();

        assert_eq!(state_of(&coordinator, "c"), ComponentState::Stopped);
        assert_eq!(state_of(&coordinator, "b"), ComponentState::Stopped);
        assert_eq!(state_of(&coordinator, "a"), ComponentState::Stopped);
        assert_eq!(
            coordinator.get_component_info("a").unwrap().metadata.get("cascade_from"),
            Some(&Value::from("b"))
        );
    }

    #[tokio::test]
    async fn test_cascade_leaves_failed_components_alone() {
        let coordinator = coordinator();
        coordinator.register_component("c", "svc", &[], None).unwrap();
        coordinator.register_component("b", "svc", &["c"], None).unwrap();
        coordinator.register_component("a", "svc", &["b"], None).unwrap();
        coordinator
            .update_component_state("a", ComponentState::Error, None)
            .await
            .unwrap();

        coordinator
            .update_component_state("c", ComponentState::Error, None)
            .await
            .unwrap();

        assert_eq!(state_of(&coordinator, "b"), ComponentState::Stopped);
        assert_eq!(state_of(&coordinator, "a"), ComponentState::Error);
        assert!(coordinator
            .update_component_state("missing", ComponentState::Running, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cascade_events_share_causation_chain() {
        let coordinator = coordinator();
        let events = collector(
            coordinator.bus(),
            EventType::ComponentStateChanged,
            Some(EventFilter::new().with_source_pattern(COORDINATOR_SOURCE)),
        );
        coordinator.start().await.unwrap();

        coordinator.register_component("c", "svc", &[], None).unwrap();
        coordinator.register_component("b", "svc", &["c"], None).unwrap();
        coordinator.register_component("a", "svc", &["b"], None).unwrap();
        coordinator
            .update_component_state("c", ComponentState::Stopped, None)
            .await
            .unwrap();

        let probe = events.clone();
        eventually(|| {
            let probe = probe.clone();
            async move { probe.lock().len() == 3 }
        })
        .await;

        let events = events.lock().clone();
        let component = |event: &Event| match event.payload() {
            EventPayload::ComponentStateChanged { component, .. } => component.clone(),
            _ => String::new(),
        };
        assert_eq!(
            events.iter().map(component).collect::<Vec<_>>(),
            vec!["c", "b", "a"]
        );
        assert_eq!(events[1].metadata().causation_id, Some(events[0].id()));
        assert_eq!(events[2].metadata().causation_id, Some(events[1].id()));
        assert_eq!(events[2].correlation_id(), Some(events[0].id()));

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_aggregation() {
        let coordinator = coordinator();
        coordinator
            .register_component("leaf", "svc", &[], Some(health_check_sync(|| false)))
            .unwrap();
        coordinator
            .register_component("parent", "svc", &["leaf"], Some(health_check_sync(|| true)))
            .unwrap();
        coordinator.register_component("x", "svc", &[], None).unwrap();
        coordinator
            .register_component("y", "svc", &["x"], Some(health_check_fn(|| async { true })))
            .unwrap();

        let health = coordinator.get_system_health().await;
        assert_eq!(health.total_components, 4);
        assert_eq!(health.unhealthy_components, vec!["leaf", "parent"]);
        assert_eq!(health.healthy_components, 2);
        assert!((health.health_score - 50.0).abs() < f64::EPSILON);
        assert_eq!(health.components.get("x"), Some(&HealthStatus::Healthy));

        assert!(!coordinator.check_component_health("parent").await);
        assert!(coordinator.check_component_health("y").await);
        assert_eq!(
            coordinator.get_component_info("leaf").unwrap().health_status,
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_unknown_dependency_fails_closed_until_registered() {
        let coordinator = coordinator();
        coordinator
            .register_component("asr_engine", "asr", &["audio_capture"], None)
            .unwrap();
        assert!(!coordinator.check_component_health("asr_engine").await);
        assert!(!coordinator.check_component_health("nobody").await);

        coordinator
            .register_component("audio_capture", "audio", &[], None)
            .unwrap();
        let info = coordinator.get_component_info("audio_capture").unwrap();
        assert!(info.dependents.contains("asr_engine"));
        assert!(coordinator.check_component_health("asr_engine").await);
        assert!(coordinator.inner.graph.read().is_consistent());
    }

    #[tokio::test]
    async fn test_unregister_guard() {
        let coordinator = coordinator();
        coordinator.register_component("config_loader", "config", &[], None).unwrap();
        coordinator
            .register_component("audio_capture", "audio", &["config_loader"], None)
            .unwrap();

        let before = coordinator.get_dependency_graph();
        assert!(coordinator.unregister_component("config_loader").is_err());
        assert_eq!(coordinator.get_dependency_graph(), before);
        assert!(coordinator.get_component_info("config_loader").is_some());

        coordinator.unregister_component("audio_capture").unwrap();
        coordinator.unregister_component("config_loader").unwrap();
        assert!(coordinator.list_components().is_empty());
    }

    #[tokio::test]
    async fn test_dependency_acyclicity() {
        let coordinator = coordinator();
        coordinator.register_component("a", "svc", &[], None).unwrap();
        coordinator.register_component("b", "svc", &[], None).unwrap();

        coordinator.add_dependency("a", "b").unwrap();
        let before = coordinator.get_dependency_graph();
        assert!(coordinator.add_dependency("b", "a").is_err());
        assert_eq!(coordinator.get_dependency_graph(), before);

        assert!(coordinator.remove_dependency("a", "b").unwrap());
        coordinator.add_dependency("b", "a").unwrap();
        assert_eq!(coordinator.startup_order(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_critical_error_triggers_emergency_shutdown() {
        let coordinator = coordinator();
        let bus = Arc::clone(coordinator.bus());
        coordinator.register_component("audio_capture", "audio", &[], None).unwrap();
        coordinator
            .register_component("asr_engine", "asr", &["audio_capture"], None)
            .unwrap();
        coordinator.start().await.unwrap();
        for name in ["audio_capture", "asr_engine"] {
            coordinator
                .update_component_state(name, ComponentState::Running, None)
                .await
                .unwrap();
        }

        let critical = Event::error(
            "audio_capture",
            "input device lost",
            Some("audio_capture".to_string()),
            "DeviceError",
        )
        .with_priority(EventPriority::Critical);
        assert!(bus.publish(critical).await);

        let probe = coordinator.clone();
        eventually(|| {
            let probe = probe.clone();
            async move { probe.state().await == ManagerState::EmergencyStopped }
        })
        .await;
        let probe = Arc::clone(&bus);
        eventually(|| {
            let probe = Arc::clone(&probe);
            async move { !probe.is_running() }
        })
        .await;

        assert!(coordinator
            .list_components()
            .iter()
            .all(|info| info.state == ComponentState::Stopped));
        assert!(coordinator.stop().await.is_ok());
        assert!(coordinator.start().await.is_err());
        assert!(coordinator.emergency_shutdown("again").await.is_err());
    }

    #[tokio::test]
    async fn test_non_critical_error_is_recorded() {
        let coordinator = coordinator();
        let bus = Arc::clone(coordinator.bus());
        coordinator.register_component("tts_engine", "tts", &[], None).unwrap();
        coordinator.start().await.unwrap();

        let error = Event::error(
            "tts_engine",
            "voice not found",
            Some("tts_engine".to_string()),
            "VoiceError",
        );
        bus.publish_and_wait(error, None).await;

        assert_eq!(coordinator.state().await, ManagerState::Running);
        let info = coordinator.get_component_info("tts_engine").unwrap();
        assert_eq!(
            info.metadata.get("last_error").and_then(|e| e.get("kind")),
            Some(&Value::from("VoiceError"))
        );

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_external_state_event_is_applied() {
        let coordinator = coordinator();
        let bus = Arc::clone(coordinator.bus());
        coordinator.register_component("audio_capture", "audio", &[], None).unwrap();
        coordinator.start().await.unwrap();

        let announced = Event::new(
            "audio_capture",
            EventPayload::ComponentStateChanged {
                component: "audio_capture".to_string(),
                old_state: None,
                new_state: "running".to_string(),
                metadata: Metadata::new(),
            },
        );
        bus.publish_and_wait(announced, None).await;

        assert_eq!(state_of(&coordinator, "audio_capture"), ComponentState::Running);
        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_stop_stops_dependents_first() {
        let coordinator = coordinator();
        let bus = Arc::clone(coordinator.bus());
        let stopped = collector(
            &bus,
            EventType::ComponentStateChanged,
            Some(EventFilter::predicate(|event| {
                matches!(
                    event.payload(),
                    EventPayload::ComponentStateChanged { new_state, .. } if new_state == "stopped"
                )
            })),
        );
        let shutdowns = collector(&bus, EventType::SystemShutdown, None);

        coordinator.register_component("audio_capture", "audio", &[], None).unwrap();
        coordinator
            .register_component("asr_engine", "asr", &["audio_capture"], None)
            .unwrap();
        coordinator.start().await.unwrap();
        for name in ["audio_capture", "asr_engine"] {
            coordinator
                .update_component_state(name, ComponentState::Running, None)
                .await
                .unwrap();
        }

        coordinator.stop().await.unwrap();
        coordinator.stop().await.unwrap();

        let order: Vec<String> = stopped
            .lock()
            .iter()
            .filter_map(|event| match event.payload() {
                EventPayload::ComponentStateChanged { component, .. } => Some(component.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["asr_engine", "audio_capture"]);
        assert_eq!(shutdowns.lock().len(), 1);
        assert_eq!(coordinator.state().await, ManagerState::Stopped);
        assert!(!bus.is_running());
        assert!(coordinator.start().await.is_err());
    }

    #[tokio::test]
    async fn test_health_monitor_publishes_score() {
        let coordinator = coordinator_with(CoordinatorConfig {
            health_check_interval_secs: Some(1),
            ..CoordinatorConfig::default()
        });
        let metrics = collector(coordinator.bus(), EventType::Metric, None);
        coordinator
            .register_component("excel_exporter", "export", &[], Some(health_check_sync(|| false)))
            .unwrap();
        coordinator.start().await.unwrap();

        let probe = metrics.clone();
        eventually(|| {
            let probe = probe.clone();
            async move { !probe.lock().is_empty() }
        })
        .await;

        let first = metrics.lock()[0].clone();
        match first.payload() {
            EventPayload::Metric { name, value, .. } => {
                assert_eq!(name, "system.health_score");
                assert_eq!(*value, 0.0);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_lifecycle_calls_report_their_operation() {
        let coordinator = coordinator();

        let error = coordinator.emergency_shutdown("not running").await.unwrap_err();
        assert!(matches!(
            error.kind,
            ErrorKind::Coordinator {
                operation: CoordinatorOperation::EmergencyShutdown
            }
        ));
        assert_eq!(error.severity, ErrorSeverity::High);
        assert_eq!(coordinator.state().await, ManagerState::Created);

        coordinator.start().await.unwrap();
        coordinator.stop().await.unwrap();
        let error = coordinator.start().await.unwrap_err();
        assert!(matches!(
            error.kind,
            ErrorKind::Coordinator {
                operation: CoordinatorOperation::Start
            }
        ));
    }

    #[tokio::test]
    async fn test_manager_health_reflects_components() {
        let coordinator = coordinator();
        assert_eq!(Manager::health_check(&coordinator).await, HealthStatus::Unknown);

        coordinator
            .register_component("asr_engine", "asr", &[], Some(health_check_sync(|| false)))
            .unwrap();
        coordinator.start().await.unwrap();
        assert_eq!(Manager::health_check(&coordinator).await, HealthStatus::Degraded);

        let status = Manager::status(&coordinator).await;
        assert_eq!(status.metadata.get("components"), Some(&Value::from(1)));
        assert_eq!(status.health, HealthStatus::Degraded);

        coordinator.stop().await.unwrap();
        assert_eq!(Manager::status(&coordinator).await.health, HealthStatus::Unknown);
    }
}
