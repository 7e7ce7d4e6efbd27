// src/main.rs

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use dictation_core::config::{AppConfig, ConfigManager};
use dictation_core::coordinator::{health_check_sync, ComponentState, SystemCoordinator};
use dictation_core::error::{Error, Result};
use dictation_core::event::{
    BatchHandler, ConditionalHandler, Event, EventBus, EventPayload, EventType, Handler,
    RetryHandler, SyncFnHandler,
};
use dictation_core::logging::init_logging;
use dictation_core::manager::HealthStatus;
use dictation_core::utils::timing::duration_to_human;

#[derive(Parser)]
#[command(
    name = "dictation-core",
    version = dictation_core::VERSION,
    about = "Event bus and system coordinator for the dictation pipeline",
    long_about = None
)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Wire the dictation components and replay a short session
    Run {
        /// Number of simulated recognition results
        #[arg(long, default_value_t = 3)]
        utterances: usize,
        /// Stop the audio capture afterwards to show the shutdown cascade
        #[arg(long)]
        simulate_failure: bool,
    },
    /// Check system health
    Health,
    /// Validate configuration
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli).await?;

    if cli.debug {
        config.logging.level = "debug".to_string();
    } else if cli.verbose {
        config.logging.level = "info".to_string();
    }
    let _logging = init_logging(&config.logging)?;

    match &cli.command {
        Some(Commands::Run {
            utterances,
            simulate_failure,
        }) => run_session(config, *utterances, *simulate_failure).await,
        Some(Commands::Health) => check_health(config).await,
        Some(Commands::ValidateConfig) => validate_config(&cli).await,
        None => run_session(config, 3, false).await,
    }
}

async fn load_config(cli: &Cli) -> Result<AppConfig> {
    ConfigManager::with_defaults(cli.config.as_deref())?
        .load()
        .await
}

/// Registers the dictation pipeline components with their dependencies
fn register_components(coordinator: &SystemCoordinator) -> Result<()> {
    let config_probe = health_check_sync(|| true);
    coordinator.register_component("config_loader", "config", &[], Some(config_probe))?;
    coordinator.register_component("audio_capture", "audio", &["config_loader"], None)?;
    coordinator.register_component("audio_muter", "audio", &["audio_capture"], None)?;
    coordinator.register_component(
        "asr_engine",
        "recognition",
        &["audio_capture", "config_loader"],
        None,
    )?;
    coordinator.register_component("tts_engine", "synthesis", &["config_loader"], None)?;
    coordinator.register_component("excel_exporter", "export", &["asr_engine"], None)?;
    Ok(())
}

async fn build_system(config: &AppConfig) -> Result<(Arc<EventBus>, SystemCoordinator)> {
    let bus = Arc::new(EventBus::new(config.event_bus.clone()));
    let coordinator = SystemCoordinator::new(Arc::clone(&bus), config.coordinator.clone());
    register_components(&coordinator)?;
    coordinator.start().await?;

    for name in coordinator.startup_order() {
        coordinator
            .update_component_state(&name, ComponentState::Running, None)
            .await?;
    }
    Ok((bus, coordinator))
}

async fn run_session(config: AppConfig, utterances: usize, simulate_failure: bool) -> Result<()> {
    tracing::info!("Starting dictation-core v{}", dictation_core::VERSION);

    let (bus, coordinator) = build_system(&config).await?;

    let transcript = Arc::new(Handler::new(
        "transcript_logger",
        ConditionalHandler::new(
            |event: &Event| match event.payload() {
                EventPayload::RecognitionCompleted { confidence, .. } => *confidence >= 0.5,
                _ => false,
            },
            SyncFnHandler::new(|event: &Event| {
                if let EventPayload::RecognitionCompleted { text, .. } = event.payload() {
                    tracing::info!(text = %text, "Recognized");
                }
                Ok(())
            }),
        ),
    ));
    bus.subscribe(EventType::RecognitionCompleted, transcript, None, 10);

    let exporter = Arc::new(BatchHandler::new(
        2,
        Duration::from_millis(250),
        |batch: Vec<Event>| async move {
            tracing::info!(rows = batch.len(), "Exported recognition batch");
            Ok(())
        },
    ));
    let exporter_shutdown = CancellationToken::new();
    let exporter_timer = exporter.spawn_flush_timer(exporter_shutdown.clone());
    bus.subscribe(
        EventType::RecognitionCompleted,
        Arc::new(Handler::from_arc("excel_exporter", exporter.clone())),
        None,
        0,
    );

    let attempts = AtomicU32::new(0);
    let muter = RetryHandler::with_retries(
        SyncFnHandler::new(move |_: &Event| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::handler("audio_muter", "output device busy"));
            }
            Ok(())
        }),
        2,
        Duration::from_millis(20),
    );
    bus.subscribe(EventType::TtsStarted, Arc::new(Handler::new("audio_muter", muter)), None, 0);

    simulate_session(&bus, utterances).await;

    if simulate_failure {
        coordinator
            .update_component_state("audio_capture", ComponentState::Error, None)
            .await?;
    }

    exporter_shutdown.cancel();
    if let Err(e) = exporter_timer.await {
        tracing::warn!("Exporter flush timer failed: {}", e);
    }

    let health = coordinator.get_system_health().await;
    let metrics = bus.get_metrics();
    println!("{}", to_json(&metrics)?);
    println!("{}", to_json(&health)?);
    println!("{}", to_json(&coordinator.list_components())?);

    coordinator.stop().await?;
    tracing::info!(
        uptime = %duration_to_human(Duration::from_secs_f64(health.uptime_secs)),
        "Session finished"
    );
    Ok(())
}

async fn simulate_session(bus: &EventBus, utterances: usize) {
    let stream_id = "mic-0".to_string();
    let started = Event::new(
        "audio_capture",
        EventPayload::AudioStreamStarted {
            stream_id: stream_id.clone(),
            sample_rate: 16_000,
            channels: 1,
        },
    );
    bus.publish(started.clone()).await;

    for index in 0..utterances {
        bus.publish(
            Event::new(
                "audio_capture",
                EventPayload::AudioDataReceived {
                    stream_id: stream_id.clone(),
                    frames: 16_000,
                    duration_ms: 1_000,
                },
            )
            .caused_by(&started),
        )
        .await;
        bus.publish(
            Event::new(
                "asr_engine",
                EventPayload::RecognitionPartial {
                    engine: "whisper".to_string(),
                    text: format!("utterance {}", index),
                },
            )
            .caused_by(&started),
        )
        .await;
        bus.publish(
            Event::new(
                "asr_engine",
                EventPayload::RecognitionCompleted {
                    engine: "whisper".to_string(),
                    text: format!("utterance {} complete", index),
                    confidence: 0.9 - index as f32 * 0.2,
                    duration_ms: 850,
                },
            )
            .caused_by(&started),
        )
        .await;
    }

    bus.publish(Event::new(
        "tts_engine",
        EventPayload::TtsStarted {
            engine: "piper".to_string(),
            text: "Dictation saved".to_string(),
        },
    ))
    .await;
    bus.publish(Event::metric("asr_engine", "recognition.latency_ms", 850.0))
        .await;

    let stopped = Event::new(
        "audio_capture",
        EventPayload::AudioStreamStopped {
            stream_id,
            reason: Some("session finished".to_string()),
        },
    )
    .caused_by(&started);
    bus.publish_and_wait(stopped, None).await;
}

async fn check_health(config: AppConfig) -> Result<()> {
    let (_bus, coordinator) = build_system(&config).await?;
    let health = coordinator.get_system_health().await;

    println!("Dictation Core Health");
    println!("=====================");
    println!("Coordinator: {}", health.coordinator_state);
    println!("Score: {:.0}%", health.health_score);
    for (name, status) in &health.components {
        println!("  [{}] {}", health_icon(*status), name);
    }

    coordinator.stop().await?;

    let exit_code = if health.is_healthy() {
        0
    } else if health.healthy_components > 0 {
        1
    } else {
        2
    };
    if exit_code != 0 {
        process::exit(exit_code);
    }
    Ok(())
}

async fn validate_config(cli: &Cli) -> Result<()> {
    println!("Validating configuration...");

    let manager = ConfigManager::with_defaults(cli.config.as_deref())?;
    manager.reload().await?;
    let problems = manager.validate().await?;

    if problems.is_empty() {
        println!("Configuration is valid");
        println!("{}", to_json(&manager.debug_config().await)?);
        return Ok(());
    }

    for problem in &problems {
        println!("  - {}", problem);
    }
    process::exit(1);
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn health_icon(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Healthy => "ok",
        HealthStatus::Degraded => "degraded",
        HealthStatus::Unhealthy => "unhealthy",
        HealthStatus::Unknown => "unknown",
    }
}
