// src/coordinator/component.rs

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manager::HealthStatus;
use crate::types::Metadata;

/// Lifecycle state a component reports to the coordinator
///
/// Serialized as its lowercase name; names the coordinator does not know are
/// kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ComponentState {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Other(String),
}

impl ComponentState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Registered => "registered",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Other(name) => name,
        }
    }

    /// `Stopped` and `Error` end a component's run and trigger the cascade
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentState {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "registered" => Self::Registered,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "error" => Self::Error,
            _ => Self::Other(s.to_string()),
        })
    }
}

impl From<String> for ComponentState {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(state) => state,
            Err(never) => match never {},
        }
    }
}

impl From<ComponentState> for String {
    fn from(state: ComponentState) -> Self {
        state.as_str().to_string()
    }
}

/// Registry entry for one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub name: String,
    pub component_type: String,
    pub state: ComponentState,
    /// Components this one needs; may name components not registered yet
    pub dependencies: BTreeSet<String>,
    /// Registered components that depend on this one
    pub dependents: BTreeSet<String>,
    pub last_activity: DateTime<Utc>,
    pub health_status: HealthStatus,
    pub metadata: Metadata,
    pub registered_at: DateTime<Utc>,
}

impl ComponentInfo {
    pub fn new(
        name: impl Into<String>,
        component_type: impl Into<String>,
        dependencies: BTreeSet<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            component_type: component_type.into(),
            state: ComponentState::Registered,
            dependencies,
            dependents: BTreeSet::new(),
            last_activity: now,
            health_status: HealthStatus::Unknown,
            metadata: Metadata::new(),
            registered_at: now,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_strings() {
        assert_eq!("running".parse::<ComponentState>(), Ok(ComponentState::Running));
        assert_eq!("STOPPED".parse::<ComponentState>(), Ok(ComponentState::Stopped));
        assert_eq!(
            ComponentState::from("paused".to_string()),
            ComponentState::Other("paused".to_string())
        );
        assert_eq!(
            serde_json::to_value(ComponentState::Error).unwrap(),
            serde_json::json!("error")
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(ComponentState::Stopped.is_terminal());
        assert!(ComponentState::Error.is_terminal());
        assert!(!ComponentState::Stopping.is_terminal());
        assert!(!ComponentState::Other("paused".into()).is_terminal());
    }
}
