// src/config/mod.rs

//! Layered configuration for the bus, the coordinator and logging
//!
//! Layers are merged in ascending priority, later layers overriding earlier
//! ones key by key:
//! - Files (YAML, JSON, TOML, chosen by extension)
//! - Environment variables under a prefix, `__` separating nesting levels
//!   (`DICTATION__EVENT_BUS__QUEUE_CAPACITY=512`)
//! - In-memory JSON values
//!
//! Every section carries serde defaults, so an empty configuration is valid.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tokio::sync::RwLock;

use crate::error::{Error, ErrorKind, Result};
use crate::event::{Event, EventBus, EventPayload};

pub const DEFAULT_ENV_PREFIX: &str = "DICTATION";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConfigSource {
    File { path: PathBuf, format: ConfigFormat },
    Environment { prefix: String },
    Memory { data: Value },
}

#[derive(Debug, Clone)]
pub struct ConfigLayer {
    pub name: String,
    pub source: ConfigSource,
    pub priority: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSettings,
    pub logging: LoggingConfig,
    pub event_bus: EventBusConfig,
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub name: String,
    pub environment: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: "dictation".to_string(),
            environment: "development".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub console: ConsoleLogConfig,
    pub file: Option<FileLogConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            console: ConsoleLogConfig::default(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleLogConfig {
    pub enabled: bool,
    pub colored: bool,
}

impl Default for ConsoleLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            colored: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLogConfig {
    pub directory: PathBuf,
    pub file_name: String,
    pub rotation: LogRotation,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            file_name: "dictation.log".to_string(),
            rotation: LogRotation::Daily,
        }
    }
}

/// What `publish` does when the event queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait until the dispatcher frees a slot
    #[default]
    Block,
    /// Reject the new event and count it as dropped
    DropNewest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Handler invocations allowed to run at once across the whole bus
    pub max_concurrent_handlers: usize,
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Default timeout used by callers of `publish_and_wait`
    pub publish_wait_timeout_ms: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 100,
            queue_capacity: 10_000,
            backpressure: BackpressurePolicy::Block,
            publish_wait_timeout_ms: 5_000,
        }
    }
}

impl EventBusConfig {
    pub fn publish_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_wait_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Period of the background health monitor; disabled when unset
    pub health_check_interval_secs: Option<u64>,
    /// Upper bound for delivering the shutdown event during `stop`
    pub shutdown_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: None,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

pub struct ConfigManager {
    layers: Vec<ConfigLayer>,
    merged_config: Arc<RwLock<Value>>,
    event_bus: Option<Arc<EventBus>>,
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigManager")
            .field("layers", &self.layers.len())
            .field("event_bus", &self.event_bus.is_some())
            .finish()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            merged_config: Arc::new(RwLock::new(Value::Object(Map::new()))),
            event_bus: None,
        }
    }

    /// Optional file layer plus the `DICTATION` environment layer on top
    pub fn with_defaults(config_path: Option<&Path>) -> Result<Self> {
        let mut manager = Self::new();
        if let Some(path) = config_path {
            manager.add_file_layer("file", path, 0)?;
        }
        manager.add_env_layer("environment", DEFAULT_ENV_PREFIX, 1000);
        Ok(manager)
    }

    pub fn add_file_layer<P: AsRef<Path>>(
        &mut self,
        name: impl Into<String>,
        path: P,
        priority: u32,
    ) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let format = ConfigFormat::from_extension(&path).ok_or_else(|| {
            Error::config(format!(
                "Unsupported configuration file format: {}",
                path.display()
            ))
        })?;

        self.push_layer(ConfigLayer {
            name: name.into(),
            source: ConfigSource::File { path, format },
            priority,
        });
        Ok(())
    }

    pub fn add_env_layer(&mut self, name: impl Into<String>, prefix: impl Into<String>, priority: u32) {
        self.push_layer(ConfigLayer {
            name: name.into(),
            source: ConfigSource::Environment {
                prefix: prefix.into(),
            },
            priority,
        });
    }

    pub fn add_memory_layer(&mut self, name: impl Into<String>, data: Value, priority: u32) {
        self.push_layer(ConfigLayer {
            name: name.into(),
            source: ConfigSource::Memory { data },
            priority,
        });
    }

    fn push_layer(&mut self, layer: ConfigLayer) {
        self.layers.push(layer);
        self.layers.sort_by_key(|l| l.priority);
    }

    /// Attaches a bus; `set` then publishes a config-changed event
    pub fn set_event_bus(&mut self, event_bus: Arc<EventBus>) {
        self.event_bus = Some(event_bus);
    }

    /// Reads every layer and replaces the merged view
    pub async fn reload(&self) -> Result<()> {
        let mut merged = Value::Object(Map::new());

        for layer in &self.layers {
            let layer_config = self.load_layer_config(layer).await?;
            merge_values(&mut merged, layer_config);
            tracing::debug!(layer = %layer.name, priority = layer.priority, "Merged configuration layer");
        }

        *self.merged_config.write().await = merged;
        Ok(())
    }

    /// Reloads all layers and deserializes the typed configuration
    pub async fn load(&self) -> Result<AppConfig> {
        self.reload().await?;
        self.get_config().await
    }

    pub async fn get_config(&self) -> Result<AppConfig> {
        let config = self.merged_config.read().await;
        serde_json::from_value(config.clone())
            .map_err(|e| Error::config(format!("Invalid configuration: {}", e)))
    }

    pub async fn get<T>(&self, key: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let config = self.merged_config.read().await;
        let value = get_nested_value(&config, key).ok_or_else(|| {
            Error::new(
                ErrorKind::Configuration {
                    key: Some(key.to_string()),
                    validation_errors: vec![format!("Configuration key '{}' not found", key)],
                },
                "Configuration key not found",
            )
        })?;

        serde_json::from_value(value).map_err(|e| {
            Error::new(
                ErrorKind::Configuration {
                    key: Some(key.to_string()),
                    validation_errors: vec![format!("Failed to deserialize config value: {}", e)],
                },
                format!("Failed to deserialize config value: {}", e),
            )
        })
    }

    pub async fn set<T>(&self, key: &str, value: T) -> Result<()>
    where
        T: Serialize,
    {
        let new_value = serde_json::to_value(value).map_err(|e| {
            Error::new(
                ErrorKind::Configuration {
                    key: Some(key.to_string()),
                    validation_errors: vec![format!("Failed to serialize config value: {}", e)],
                },
                format!("Failed to serialize config value: {}", e),
            )
        })?;

        let old_value = {
            let mut config = self.merged_config.write().await;
            let old_value = get_nested_value(&config, key);
            set_nested_value(&mut config, key, new_value.clone());
            old_value
        };

        if let Some(event_bus) = &self.event_bus {
            let event = Event::new(
                "config_manager",
                EventPayload::ConfigChanged {
                    key: key.to_string(),
                    old_value,
                    new_value,
                },
            );
            event_bus.publish(event).await;
        }

        Ok(())
    }

    /// Checks the merged view against the bounds the runtime relies on
    pub async fn validate(&self) -> Result<Vec<String>> {
        let config = self.get_config().await?;
        let mut problems = Vec::new();

        if config.event_bus.max_concurrent_handlers == 0 {
            problems.push("event_bus.max_concurrent_handlers must be at least 1".to_string());
        }
        if config.event_bus.queue_capacity == 0 {
            problems.push("event_bus.queue_capacity must be at least 1".to_string());
        }
        if config.coordinator.health_check_interval_secs == Some(0) {
            problems.push("coordinator.health_check_interval_secs must be positive".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&config.logging.level).is_err() {
            problems.push(format!("logging.level '{}' is not a valid filter", config.logging.level));
        }

        Ok(problems)
    }

    pub async fn debug_config(&self) -> Value {
        self.merged_config.read().await.clone()
    }

    async fn load_layer_config(&self, layer: &ConfigLayer) -> Result<Value> {
        match &layer.source {
            ConfigSource::File { path, format } => {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::config(format!(
                        "Failed to read config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;

                match format {
                    ConfigFormat::Json => serde_json::from_str(&content)
                        .map_err(|e| Error::config(format!("Failed to parse JSON config: {}", e))),
                    ConfigFormat::Yaml => serde_yaml::from_str(&content)
                        .map_err(|e| Error::config(format!("Failed to parse YAML config: {}", e))),
                    ConfigFormat::Toml => toml::from_str(&content)
                        .map_err(|e| Error::config(format!("Failed to parse TOML config: {}", e))),
                }
            }

            ConfigSource::Environment { prefix } => {
                let mut env_config = Map::new();
                let prefix = format!("{}{}", prefix, ENV_SEPARATOR);

                for (key, value) in std::env::vars() {
                    if let Some(stripped) = key.strip_prefix(&prefix) {
                        let config_key = stripped.to_lowercase();
                        let nested_keys: Vec<&str> = config_key.split(ENV_SEPARATOR).collect();
                        set_nested_env_value(&mut env_config, &nested_keys, value);
                    }
                }

                Ok(Value::Object(env_config))
            }

            ConfigSource::Memory { data } => Ok(data.clone()),
        }
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_values(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, source_value) in source_map {
                match target_map.get_mut(&key) {
                    Some(target_value) => merge_values(target_value, source_value),
                    None => {
                        target_map.insert(key, source_value);
                    }
                }
            }
        }
        (target, source) => {
            *target = source;
        }
    }
}

fn get_nested_value(config: &Value, key: &str) -> Option<Value> {
    let mut current = config;
    for k in key.split('.') {
        current = current.get(k)?;
    }
    Some(current.clone())
}

fn set_nested_value(config: &mut Value, key: &str, value: Value) {
    let keys: Vec<&str> = key.split('.').collect();
    let Some((last, parents)) = keys.split_last() else {
        return;
    };

    let mut current = config;
    for k in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(k.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

fn set_nested_env_value(config: &mut Map<String, Value>, keys: &[&str], value: String) {
    let Some((first, rest)) = keys.split_first() else {
        return;
    };

    if rest.is_empty() {
        config.insert(first.to_string(), parse_env_value(value));
        return;
    }

    let entry = config
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(nested_map) = entry {
        set_nested_env_value(nested_map, rest, value);
    }
}

fn parse_env_value(value: String) -> Value {
    if let Ok(bool_val) = value.parse::<bool>() {
        Value::Bool(bool_val)
    } else if let Ok(int_val) = value.parse::<i64>() {
        Value::Number(Number::from(int_val))
    } else if let Some(float_val) = value.parse::<f64>().ok().and_then(Number::from_f64) {
        Value::Number(float_val)
    } else {
        Value::String(value)
    }
}
