// src/coordinator/health.rs

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::manager::{HealthStatus, ManagerState};

/// Liveness probe attached to a component
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> bool;
}

pub type HealthChecker = Arc<dyn HealthCheck>;

struct FnHealthCheck<F>(F);

#[async_trait]
impl<F, Fut> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    async fn check(&self) -> bool {
        (self.0)().await
    }
}

/// Health checker from an async closure
pub fn health_check_fn<F, Fut>(check: F) -> HealthChecker
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(FnHealthCheck(check))
}

/// Health checker from a plain predicate
pub fn health_check_sync<F>(check: F) -> HealthChecker
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let check = Arc::new(check);
    health_check_fn(move || {
        let check = Arc::clone(&check);
        async move { check() }
    })
}

/// Runs one checker; a panicking checker counts as failed
pub(crate) async fn run_checker(checker: &HealthChecker) -> bool {
    AssertUnwindSafe(checker.check())
        .catch_unwind()
        .await
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub coordinator_state: ManagerState,
    /// Percentage of healthy components, 100 when none are registered
    pub health_score: f64,
    pub total_components: usize,
    pub healthy_components: usize,
    pub unhealthy_components: Vec<String>,
    pub uptime_secs: f64,
    pub components: BTreeMap<String, HealthStatus>,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
    pub fn is_healthy(&self) -> bool {
        self.unhealthy_components.is_empty()
    }
}
