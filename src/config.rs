//! Configuration loader for the `bletrace` backend service.
//!
//! This module centralizes all runtime configuration values and their
//! defaults, loading from environment variables (with optional `.env` file
//! support provided by the caller). The tracking policy knobs and the
//! identity-column choice are validated here, once, at startup - a bad
//! value fails the boot instead of silently mis-tracking for days.

use std::env;

use anyhow::{anyhow, Result};

use crate::batch::IDENTITY_COLUMNS;
use crate::tracker::TrackerPolicy;

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Read an optional string environment variable with a default value.
macro_rules! env_or {
    ($var_name:expr, $default:expr) => {
        env::var($var_name).unwrap_or_else(|_| $default.to_string())
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent
/// configuration snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// Port the upload listener binds to.
    pub bind_port: u16,

    /// Directory where raw upload payloads are archived.
    pub upload_dir: String,

    /// Path of the append-only contact audit trail.
    pub contact_log_file: String,

    /// Input column used as the tracked device identity.
    pub device_key_field: String,

    /// Largest gap (seconds) still counted as continuous proximity.
    pub continuation_gap_secs: u32,

    /// Accumulated seconds at which the exposure alert fires.
    pub exposure_threshold_secs: u32,

    /// Seconds of silence after which a contact is retired.
    pub eviction_window_secs: u32,

    /// Period (seconds) of the eviction sweep timer.
    pub sweep_interval_secs: u32,
}

/// Load configuration from environment variables with defaults.
///
/// Optional:
/// - `BIND_PORT` – upload listener port (default: 8081)
/// - `UPLOAD_DIR` – raw upload archive directory (default: `uploads`)
/// - `CONTACT_LOG_FILE` – audit trail path (default: `detected_contacts.csv`)
/// - `DEVICE_KEY_FIELD` – identity column (default: `manufacturer_data`)
/// - `CONTINUATION_GAP_SECONDS` – continuation gap (default: 120)
/// - `EXPOSURE_THRESHOLD_SECONDS` – alert threshold (default: 300)
/// - `EVICTION_WINDOW_SECONDS` – retirement window (default: 600)
/// - `SWEEP_INTERVAL_SECONDS` – sweep timer period (default: 30)
///
/// Returns an error if any variable is invalid, if the identity column is
/// not one the batch processor recognizes, or if the sweep period is zero.
pub fn load_from_env() -> Result<Config> {
    // ---
    let bind_port = u16::try_from(parse_env_u32!("BIND_PORT", 8081))
        .map_err(|_| anyhow!("BIND_PORT out of range"))?;
    let upload_dir = env_or!("UPLOAD_DIR", "uploads");
    let contact_log_file = env_or!("CONTACT_LOG_FILE", "detected_contacts.csv");

    let device_key_field = env_or!("DEVICE_KEY_FIELD", "manufacturer_data").to_ascii_lowercase();
    if !IDENTITY_COLUMNS.contains(&device_key_field.as_str()) {
        return Err(anyhow!(
            "DEVICE_KEY_FIELD '{}' is not an identity column (expected one of: {})",
            device_key_field,
            IDENTITY_COLUMNS.join(", ")
        ));
    }

    let continuation_gap_secs = parse_env_u32!("CONTINUATION_GAP_SECONDS", 120);
    let exposure_threshold_secs = parse_env_u32!("EXPOSURE_THRESHOLD_SECONDS", 300);
    let eviction_window_secs = parse_env_u32!("EVICTION_WINDOW_SECONDS", 600);
    let sweep_interval_secs = parse_env_u32!("SWEEP_INTERVAL_SECONDS", 30);
    if sweep_interval_secs == 0 {
        return Err(anyhow!("SWEEP_INTERVAL_SECONDS must be greater than zero"));
    }

    Ok(Config {
        bind_port,
        upload_dir,
        contact_log_file,
        device_key_field,
        continuation_gap_secs,
        exposure_threshold_secs,
        eviction_window_secs,
        sweep_interval_secs,
    })
}

impl Config {
    // ---
    /// The tracker's view of the policy knobs.
    pub fn tracker_policy(&self) -> TrackerPolicy {
        // ---
        TrackerPolicy {
            continuation_gap_secs: f64::from(self.continuation_gap_secs),
            exposure_threshold_secs: f64::from(self.exposure_threshold_secs),
            eviction_window_secs: f64::from(self.eviction_window_secs),
        }
    }

    /// Log the loaded configuration for debugging purposes.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  BIND_PORT                  : {}", self.bind_port);
        tracing::info!("  UPLOAD_DIR                 : {}", self.upload_dir);
        tracing::info!("  CONTACT_LOG_FILE           : {}", self.contact_log_file);
        tracing::info!("  DEVICE_KEY_FIELD           : {}", self.device_key_field);
        tracing::info!("  CONTINUATION_GAP_SECONDS   : {}", self.continuation_gap_secs);
        tracing::info!("  EXPOSURE_THRESHOLD_SECONDS : {}", self.exposure_threshold_secs);
        tracing::info!("  EVICTION_WINDOW_SECONDS    : {}", self.eviction_window_secs);
        tracing::info!("  SWEEP_INTERVAL_SECONDS     : {}", self.sweep_interval_secs);
    }
}
