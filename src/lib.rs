//! Contact-tracking ingestion service for BLE advertisement sightings.
//!
//! Field sensors periodically upload batches of "saw peer device X at time
//! T with signal strength R" rows. This crate normalizes those batches,
//! accumulates per-device proximity time in a concurrent state tracker,
//! raises a one-time exposure alert when a device crosses the configured
//! threshold, retires contacts after an inactivity window, and appends one
//! audit-trail row per lifecycle transition.
//!
//! Module map:
//! - [`batch`]   – delimited-text validation and normalization
//! - [`tracker`] – the per-device contact state machine and eviction sweep
//! - [`sink`]    – asynchronous audit-trail writer (event sink)
//! - [`upload_store`] – raw payload archival
//! - [`routes`]  – HTTP surface (`POST /upload`, `GET /health`)
//! - [`config`]  – environment-driven configuration

pub mod batch;
pub mod config;
pub mod models;
pub mod routes;
pub mod sink;
pub mod tracker;
pub mod upload_store;

pub use config::Config;

// Re-exported so the binary and the integration tests assemble the service
// from the same seams without reaching into module internals.
pub use models::{ContactEvent, ContactState, ContactStatus, Sighting};
pub use tracker::{ContactTracker, TrackerPolicy};
