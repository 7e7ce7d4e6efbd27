// src/lib.rs

//! Dictation Core - event bus and system coordinator for a voice-dictation pipeline
//!
//! Audio capture, recognition, synthesis and export components talk to each
//! other through an in-process [`EventBus`]. The [`SystemCoordinator`] tracks
//! those components, their dependencies, lifecycle and health.
//!
//! Neither is a global: construct them explicitly and share them by `Arc`.

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::result_large_err)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod logging;
pub mod manager;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::{AppConfig, ConfigManager};
pub use coordinator::{ComponentInfo, ComponentState, SystemCoordinator, SystemHealth};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use event::{Event, EventBus, EventPayload, EventPriority, EventType, Handler};
pub use manager::{HealthStatus, Manager, ManagerState, ManagerStatus};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
