// src/event/filter.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{Event, EventPriority};

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Narrows delivery of a subscription beyond its event type
///
/// Declarative criteria (source, priority, tags, properties) and an optional
/// arbitrary predicate; an event is delivered only when all of them match.
#[derive(Clone)]
pub struct EventFilter {
    /// Source patterns to match (substring, `*` matches all)
    pub source_patterns: Vec<String>,
    /// Minimum priority level
    pub min_priority: EventPriority,
    /// Tags that must all be present
    pub required_tags: Vec<String>,
    /// Metadata properties that must be present with equal values
    pub property_filters: HashMap<String, serde_json::Value>,
    predicate: Option<Predicate>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self {
            source_patterns: Vec::new(),
            min_priority: EventPriority::Low,
            required_tags: Vec::new(),
            property_filters: HashMap::new(),
            predicate: None,
        }
    }

    /// Filter backed only by a predicate
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Self::new().with_predicate(predicate)
    }

    pub fn with_source_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.source_patterns.push(pattern.into());
        self
    }

    pub fn with_min_priority(mut self, priority: EventPriority) -> Self {
        self.min_priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tags.push(tag.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.property_filters.insert(key.into(), value);
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &Event) -> bool {
        if !self.source_patterns.is_empty() {
            let source = event.source();
            if !self
                .source_patterns
                .iter()
                .any(|pattern| pattern == "*" || source.contains(pattern.as_str()))
            {
                return false;
            }
        }

        if event.priority() < self.min_priority {
            return false;
        }

        let metadata = event.metadata();
        if !self
            .required_tags
            .iter()
            .all(|tag| metadata.tags.contains(tag))
        {
            return false;
        }

        for (key, expected) in &self.property_filters {
            if metadata.properties.get(key) != Some(expected) {
                return false;
            }
        }

        self.predicate.as_ref().map_or(true, |predicate| predicate(event))
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("source_patterns", &self.source_patterns)
            .field("min_priority", &self.min_priority)
            .field("required_tags", &self.required_tags)
            .field("property_filters", &self.property_filters)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
