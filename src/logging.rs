//! # Structured Logging Module
//!
//! Environment-aware structured logging that writes human-readable output to the
//! console and JSON lines to `log/{env}.{pid}.{timestamp}.log`, so every publish
//! attempt and every settled delivery can be traced after the fact.

use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::loader::detect_environment;

static LOGGER_INITIALIZED: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
///
/// Safe to call more than once; only the first call installs anything. An existing
/// global subscriber is left in place.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = detect_environment();
        let log_level = get_log_level(&environment);

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(build_filter(&log_level));

        let log_dir = PathBuf::from("log");
        if let Err(e) = fs::create_dir_all(&log_dir) {
            let _ = tracing_subscriber::registry().with(console_layer).try_init();
            tracing::warn!(
                error = %e,
                "Could not create log directory, logging to console only"
            );
            return None;
        }

        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_filename = format!("{environment}.{pid}.{timestamp}.log");
        let log_path = log_dir.join(&log_filename);

        let file_appender = tracing_appender::rolling::never(&log_dir, &log_filename);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_writer(file_writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(false)
            .json()
            .with_filter(build_filter(&log_level));

        if tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
            return None;
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_file = %log_path.display(),
            "🔧 STRUCTURED LOGGING: Initialized with file output"
        );

        // Held for the life of the process so buffered lines are flushed
        Some(guard)
    });
}

/// `RUST_LOG` wins over the environment default
fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log the outcome of one publish attempt
pub fn log_publish_outcome(
    order_id: &str,
    status: &str,
    exchange: &str,
    routing_key: &str,
    published: bool,
    error: Option<&str>,
) {
    if published {
        tracing::info!(
            order_id = %order_id,
            status = %status,
            exchange = %exchange,
            routing_key = %routing_key,
            published = true,
            timestamp = %Utc::now().to_rfc3339(),
            "📤 STATUS_PUBLISHED"
        );
    } else {
        tracing::error!(
            order_id = %order_id,
            status = %status,
            exchange = %exchange,
            routing_key = %routing_key,
            published = false,
            error = error,
            timestamp = %Utc::now().to_rfc3339(),
            "📤 STATUS_PUBLISH_FAILED"
        );
    }
}

/// Log how a delivery was settled (`acked`, `dead_lettered` or `requeued`)
pub fn log_delivery_outcome(
    queue: &str,
    delivery_tag: u64,
    order_id: Option<&str>,
    outcome: &str,
    error: Option<&str>,
) {
    match error {
        None => tracing::info!(
            queue = %queue,
            delivery_tag = delivery_tag,
            order_id = order_id,
            outcome = %outcome,
            timestamp = %Utc::now().to_rfc3339(),
            "📥 DELIVERY_SETTLED"
        ),
        Some(error) => tracing::warn!(
            queue = %queue,
            delivery_tag = delivery_tag,
            order_id = order_id,
            outcome = %outcome,
            error = %error,
            timestamp = %Utc::now().to_rfc3339(),
            "📥 DELIVERY_SETTLED"
        ),
    }
}
