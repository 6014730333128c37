//! Application entry point for the `bletrace` backend service.
//!
//! This binary orchestrates the full startup sequence for the contact
//! tracking pipeline, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Creating the contact audit log (with header) if it does not exist
//! - Spawning the event-sink writer task and the periodic eviction sweep
//! - Mounting all API routes via the `routes` gateway
//! - Binding the Axum HTTP server and serving upload requests
//!
//! # Environment Variables
//! - `BIND_PORT` (optional) – upload listener port (default: 8081)
//! - `DEVICE_KEY_FIELD` (optional) – identity column (default: `manufacturer_data`)
//! - `CONTINUATION_GAP_SECONDS` / `EXPOSURE_THRESHOLD_SECONDS` /
//!   `EVICTION_WINDOW_SECONDS` / `SWEEP_INTERVAL_SECONDS` – tracking policy
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! Configuration parsing lives in `config`, route registration in `routes`;
//! this file only wires the pieces together.
use std::{env, io::IsTerminal, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::Router;
use chrono::Utc;
use dotenvy::dotenv;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::Result;

use bletrace::upload_store::UploadStore;
use bletrace::{config, routes, sink, ContactTracker};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    // Durable side effects first: the audit trail and the raw archive must
    // exist before the first batch lands.
    let log_path = PathBuf::from(&cfg.contact_log_file);
    sink::init_audit_log(&log_path).await?;
    let (events, _sink_faults, _writer) = sink::spawn_writer(log_path);

    let uploads = UploadStore::init(&cfg.upload_dir).await?;
    let tracker = Arc::new(ContactTracker::new(cfg.tracker_policy(), events));

    // Periodic eviction sweep, independent of ingestion.
    let sweeper = Arc::clone(&tracker);
    let sweep_period = Duration::from_secs(u64::from(cfg.sweep_interval_secs));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_period);
        loop {
            ticker.tick().await;
            let evicted = sweeper.sweep(Utc::now()).await;
            if evicted > 0 {
                tracing::info!("Eviction sweep retired {} inactive contact(s)", evicted);
            }
        }
    });

    // Build app from routes gateway
    let app: Router = routes::router(tracker, uploads, cfg.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.bind_port));
    tracing::info!("BLE contact tracker listening on {}", addr);
    tracing::info!(
        "Exposure threshold: {} seconds, continuation gap: {} seconds",
        cfg.exposure_threshold_secs,
        cfg.continuation_gap_secs
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AXUM_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `AXUM_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to AXUM_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(level.to_string())
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
