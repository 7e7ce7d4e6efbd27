// src/manager.rs - Lifecycle state shared by the event bus and the coordinator

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoordinatorOperation, Error, Result};
use crate::types::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManagerState {
    Created,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
    Error,
    EmergencyStopped,
}

impl ManagerState {
    /// Whether a lifecycle may move from `self` to `next`.
    ///
    /// Transitions only move forward; `Stopped`, `Error` and
    /// `EmergencyStopped` are terminal.
    pub fn can_transition_to(self, next: ManagerState) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Initializing)
                | (Self::Initializing, Self::Running)
                | (Self::Initializing, Self::Error)
                | (Self::Running, Self::ShuttingDown)
                | (Self::Running, Self::EmergencyStopped)
                | (Self::ShuttingDown, Self::Stopped)
        )
    }

    /// Health implied by the lifecycle state alone
    pub fn health(self) -> HealthStatus {
        match self {
            Self::Running => HealthStatus::Healthy,
            Self::Initializing | Self::ShuttingDown => HealthStatus::Degraded,
            Self::Error | Self::EmergencyStopped => HealthStatus::Unhealthy,
            Self::Created | Self::Stopped => HealthStatus::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error | Self::EmergencyStopped)
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Running => write!(f, "RUNNING"),
            Self::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Error => write!(f, "ERROR"),
            Self::EmergencyStopped => write!(f, "EMERGENCY_STOPPED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Unhealthy => write!(f, "UNHEALTHY"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub id: Uuid,
    pub name: String,
    pub state: ManagerState,
    pub health: HealthStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime: Option<Duration>,
    pub last_updated: DateTime<Utc>,
    pub message: Option<String>,
    pub metadata: Metadata,
}

impl ManagerStatus {
    /// Creates a new manager status
    pub fn new(id: Uuid, name: impl Into<String>, state: ManagerState) -> Self {
        Self {
            id,
            name: name.into(),
            state,
            health: HealthStatus::Unknown,
            created_at: Utc::now(),
            started_at: None,
            uptime: None,
            last_updated: Utc::now(),
            message: None,
            metadata: HashMap::new(),
        }
    }

    /// Updates the state, stamping the start time on the first `Running`
    pub fn update_state(&mut self, state: ManagerState) {
        self.state = state;
        self.last_updated = Utc::now();

        if state == ManagerState::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.refresh_uptime();
    }

    /// Recomputes uptime; it freezes once the manager leaves `Running`
    pub fn refresh_uptime(&mut self) {
        if let Some(started) = self.started_at {
            if self.state == ManagerState::Running {
                self.uptime = Utc::now().signed_duration_since(started).to_std().ok();
            }
        }
    }

    pub fn set_health(&mut self, health: HealthStatus) {
        self.health = health;
        self.last_updated = Utc::now();
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
        self.last_updated = Utc::now();
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
        self.last_updated = Utc::now();
    }
}

/// Common lifecycle surface of the long-lived services in this crate
#[async_trait::async_trait]
pub trait Manager: Send + Sync + fmt::Debug {
    /// Returns the manager name
    fn name(&self) -> &str;

    /// Starts the manager; calling it on a running manager is a no-op
    async fn start(&self) -> Result<()>;

    /// Stops the manager; calling it on a stopped manager is a no-op
    async fn stop(&self) -> Result<()>;

    /// Returns current status
    async fn status(&self) -> ManagerStatus;

    /// Performs health check
    async fn health_check(&self) -> HealthStatus {
        self.status().await.state.health()
    }
}

/// Managed state container for managers
pub struct ManagedState {
    id: Uuid,
    name: String,
    status: Arc<RwLock<ManagerStatus>>,
}

impl ManagedState {
    /// Creates a new managed state
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        let name_str = name.into();
        let status = ManagerStatus::new(id, name_str.clone(), ManagerState::Created);

        Self {
            id,
            name: name_str,
            status: Arc::new(RwLock::new(status)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the state without checking the transition
    pub async fn set_state(&self, state: ManagerState) {
        let mut status = self.status.write().await;
        status.update_state(state);
    }

    /// Moves to `next` if the lifecycle allows it, returning the previous state
    ///
    /// A refused transition is reported against `operation`.
    pub async fn transition(
        &self,
        next: ManagerState,
        operation: CoordinatorOperation,
    ) -> Result<ManagerState> {
        let mut status = self.status.write().await;
        let current = status.state;
        if !current.can_transition_to(next) {
            return Err(Error::coordinator(
                operation,
                format!(
                    "{}: invalid state transition {} -> {}",
                    self.name, current, next
                ),
            ));
        }
        status.update_state(next);
        Ok(current)
    }

    pub async fn set_message(&self, message: impl Into<String>) {
        let mut status = self.status.write().await;
        status.set_message(message);
    }

    /// Returns current status
    pub async fn status(&self) -> ManagerStatus {
        let mut status = self.status.read().await.clone();
        status.refresh_uptime();
        status
    }

    pub async fn state(&self) -> ManagerState {
        self.status.read().await.state
    }

    pub async fn uptime(&self) -> Duration {
        self.status().await.uptime.unwrap_or_default()
    }
}

impl fmt::Debug for ManagedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedState")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
