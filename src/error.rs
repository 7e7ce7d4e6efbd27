// src/error.rs - Error type shared by the event bus, handlers and coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration {
        key: Option<String>,
        validation_errors: Vec<String>,
    },
    Handler {
        handler_name: String,
        attempts: u32,
    },
    Component {
        component: String,
        operation: ComponentOperation,
    },
    DependencyCycle {
        component: String,
        dependency: String,
    },
    Coordinator {
        operation: CoordinatorOperation,
    },
    Application,
    Io,
    Serialization,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentOperation {
    Register,
    Unregister,
    UpdateState,
    AddDependency,
    RemoveDependency,
    HealthCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorOperation {
    Start,
    Stop,
    EmergencyShutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    pub severity: ErrorSeverity,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: crate::types::Metadata,
    pub causes: Vec<String>,
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            severity: ErrorSeverity::Medium,
            source: "unknown".to_string(),
            timestamp: Utc::now(),
            metadata: std::collections::HashMap::new(),
            causes: Vec::new(),
        }
    }

    /// Sets the error severity
    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the error source
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Adds metadata to the error
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Adds a cause to the error chain
    pub fn caused_by(mut self, cause: impl fmt::Display) -> Self {
        self.causes.push(cause.to_string());
        self
    }

    /// Creates a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Configuration {
                key: None,
                validation_errors: Vec::new(),
            },
            message,
        )
        .severity(ErrorSeverity::High)
    }

    /// Creates a handler failure
    pub fn handler(handler_name: impl Into<String>, message: impl Into<String>) -> Self {
        let handler_name = handler_name.into();
        Self::new(
            ErrorKind::Handler {
                handler_name: handler_name.clone(),
                attempts: 1,
            },
            message,
        )
        .source(handler_name)
    }

    /// Records how many attempts a handler made before giving up
    ///
    /// Failures of any other kind become handler failures named after their
    /// source, keeping the original error as a cause.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        if let ErrorKind::Handler {
            attempts: recorded, ..
        } = &mut self.kind
        {
            *recorded = attempts;
            return self;
        }

        let mut error = Error::handler(self.source.clone(), self.message.clone())
            .severity(self.severity);
        error.metadata = self.metadata.clone();
        error.caused_by(self).with_attempts(attempts)
    }

    /// Creates a component registry error
    pub fn component(
        component: impl Into<String>,
        operation: ComponentOperation,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::Component {
                component: component.into(),
                operation,
            },
            message,
        )
        .source("system_coordinator")
    }

    /// Creates a dependency cycle error
    pub fn dependency_cycle(component: impl Into<String>, dependency: impl Into<String>) -> Self {
        let component = component.into();
        let dependency = dependency.into();
        let message = format!(
            "Adding dependency '{}' -> '{}' would create a cycle",
            component, dependency
        );
        Self::new(
            ErrorKind::DependencyCycle {
                component,
                dependency,
            },
            message,
        )
        .source("system_coordinator")
        .severity(ErrorSeverity::High)
    }

    /// Creates a coordinator lifecycle error
    pub fn coordinator(operation: CoordinatorOperation, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Coordinator { operation }, message)
            .source("system_coordinator")
            .severity(ErrorSeverity::High)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}): {}",
            self.severity, self.source, self.id, self.message
        )
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let mut error = Error::new(ErrorKind::Io, err.to_string());
        error.source = "std::io::Error".to_string();
        error.severity = ErrorSeverity::High;
        error
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Serialization, err.to_string()).source("serde_json")
    }
}

/// Extension trait for Results to add context
pub trait ResultExt<T> {
    /// Adds context to an error
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::new(ErrorKind::Application, f()).caused_by(e))
    }
}
