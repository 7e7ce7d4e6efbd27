use std::collections::HashMap;
use uuid::Uuid;
use serde_json::Value;

/// Unique identifier for events, subscriptions and errors
pub type Id = Uuid;

/// Generic metadata container
pub type Metadata = HashMap<String, Value>;

/// Correlation ID for tracking related events
pub type CorrelationId = Uuid;

/// Identifier returned by `subscribe`/`subscribe_all`
pub type SubscriptionId = Uuid;
