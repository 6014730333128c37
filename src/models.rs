//! Data models for the contact tracking pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;

// ---

/// One reported observation of a peer device, as normalized from an
/// uploaded batch row. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Sighting {
    // ---
    /// Identity of the observed peer, taken from the configured key column.
    /// Always non-empty; rows without it never become sightings.
    pub device_key: String,
    /// Device-side observation time. May lag wall clock by upload delay.
    pub observed_at: DateTime<Utc>,
    /// True when `observed_at` was substituted with the batch receipt time
    /// because the row's own timestamp was missing or unparseable.
    pub time_estimated: bool,
    /// Signal strength in dBm. Informational only.
    pub rssi: Option<i16>,
    pub device_name: Option<String>,
    pub sender_id: Option<String>,
    pub manufacturer_data: Option<String>,
}

/// Accumulated proximity bookkeeping for one device identity.
///
/// Owned exclusively by the tracker; all reads and writes happen under the
/// per-key lock. `first_seen <= last_seen` holds throughout the lifetime.
#[derive(Debug, Clone)]
pub struct ContactState {
    // ---
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Running proximity total in seconds. Never negative; only grows,
    /// and only by gaps within the continuation bound.
    pub accumulated_secs: f64,
    /// Latched once the exposure threshold is crossed.
    pub alerted: bool,

    // Latest metadata mirrored from the most recent sighting.
    pub device_name: Option<String>,
    pub sender_id: Option<String>,
    pub rssi: Option<i16>,
}

impl ContactState {
    // ---
    pub fn new(sighting: &Sighting) -> Self {
        // ---
        ContactState {
            first_seen: sighting.observed_at,
            last_seen: sighting.observed_at,
            accumulated_secs: 0.0,
            alerted: false,
            device_name: sighting.device_name.clone(),
            sender_id: sighting.sender_id.clone(),
            rssi: sighting.rssi,
        }
    }

    /// Overwrite metadata with whatever the incoming sighting carries,
    /// keeping the last known value when a field is absent.
    pub fn refresh_metadata(&mut self, sighting: &Sighting) {
        // ---
        if sighting.device_name.is_some() {
            self.device_name = sighting.device_name.clone();
        }
        if sighting.sender_id.is_some() {
            self.sender_id = sighting.sender_id.clone();
        }
        if sighting.rssi.is_some() {
            self.rssi = sighting.rssi;
        }
    }

    /// Seconds since the last accepted sighting.
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_seen).num_milliseconds() as f64 / 1000.0
    }

    /// True once the contact has gone silent longer than the eviction window.
    pub fn is_stale(&self, now: DateTime<Utc>, eviction_window_secs: f64) -> bool {
        self.age_secs(now) > eviction_window_secs
    }
}

// ---

/// Lifecycle transition kinds, serialized as the audit trail's `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    NewContact,
    ContactUpdate,
    ExposureDetected,
    ContactEnded,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            ContactStatus::NewContact => "new_contact",
            ContactStatus::ContactUpdate => "contact_update",
            ContactStatus::ExposureDetected => "exposure_detected",
            ContactStatus::ContactEnded => "contact_ended",
        }
    }
}

/// One tracker lifecycle event, pushed to the event sink per transition.
#[derive(Debug, Clone, Serialize)]
pub struct ContactEvent {
    // ---
    /// Delivery sequence number, stamped by the sink channel. Redelivered
    /// events carry the same value so the sink can consume idempotently.
    pub seq: u64,
    pub status: ContactStatus,
    pub device_key: String,
    /// Device-reported time of the sighting that caused this transition
    /// (for `contact_ended`: the last accepted sighting time).
    pub observed_at: DateTime<Utc>,
    /// Server receipt time of the batch (or sweep time for evictions).
    pub processed_at: DateTime<Utc>,
    pub accumulated_secs: f64,
    pub alerted: bool,
    pub time_estimated: bool,
    pub device_name: Option<String>,
    pub sender_id: Option<String>,
    pub rssi: Option<i16>,
}

/// Header row of the append-only contact audit trail.
pub const AUDIT_HEADER: &str = "server_time,device_time,delay,sender_id,rssi,\
device_key,device_name,accumulated_minutes,status,alert_triggered,time_estimated";

impl ContactEvent {
    // ---
    /// Accumulated proximity in minutes, rounded to two decimals.
    pub fn accumulated_minutes(&self) -> f64 {
        (self.accumulated_secs / 60.0 * 100.0).round() / 100.0
    }

    /// Upload/store delay between device clock and server receipt, in seconds.
    /// Negative when the device clock runs ahead of the server.
    pub fn delay_secs(&self) -> f64 {
        (self.processed_at - self.observed_at).num_milliseconds() as f64 / 1000.0
    }

    /// Render one audit-trail CSV row (without trailing newline), matching
    /// [`AUDIT_HEADER`].
    pub fn to_audit_row(&self) -> String {
        // ---
        format!(
            "{},{},{:.3},{},{},{},{},{:.2},{},{},{}",
            self.processed_at.format("%Y-%m-%d %H:%M:%S"),
            self.observed_at.format("%Y-%m-%d %H:%M:%S"),
            self.delay_secs(),
            csv_field(self.sender_id.as_deref().unwrap_or("")),
            self.rssi.map(|r| r.to_string()).unwrap_or_default(),
            csv_field(&self.device_key),
            csv_field(self.device_name.as_deref().unwrap_or("Unknown")),
            self.accumulated_minutes(),
            self.status.as_str(),
            self.alerted,
            self.time_estimated,
        )
    }
}

/// Quote a CSV field if it contains a delimiter, quote, or newline.
fn csv_field(value: &str) -> String {
    // ---
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
