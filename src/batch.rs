//! Batch validation and normalization for uploaded sighting batches.
//!
//! Sensors upload one delimited-text payload per flush. Column layouts have
//! drifted across firmware revisions, so rows are matched by column *name*
//! whenever a header is present; headerless payloads get the legacy column
//! order. Malformed rows are dropped (no identity) or repaired (bad
//! timestamp falls back to receipt time) and counted either way - a single
//! bad field must not lose the rest of the batch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::models::Sighting;

// ---

/// Column names understood across firmware revisions (name-matched,
/// case-insensitive).
pub const RECOGNIZED_COLUMNS: &[&str] = &[
    "timestamp",
    "device_key",
    "device_address",
    "device_name",
    "rssi",
    "sender_id",
    "manufacturer_data",
];

/// Columns that may serve as the tracked device identity
/// (`DEVICE_KEY_FIELD`).
pub const IDENTITY_COLUMNS: &[&str] =
    &["device_key", "device_address", "sender_id", "manufacturer_data"];

/// Column order assumed when a batch arrives without a header row
/// (the layout of the oldest firmware still in the field).
const LEGACY_COLUMN_ORDER: &[&str] = &[
    "timestamp",
    "device_address",
    "device_name",
    "rssi",
    "sender_id",
    "manufacturer_data",
];

// ---

/// Per-batch row accounting, returned to the uploader.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    // ---
    /// Rows normalized into sightings, in their original order.
    pub accepted: usize,
    /// Rows dropped because the configured identity column was empty.
    pub missing_key: usize,
    /// Accepted rows whose timestamp had to fall back to receipt time.
    pub fallback_timestamps: usize,
}

/// A validated batch: ordered sightings plus the row accounting.
#[derive(Debug)]
pub struct ParsedBatch {
    pub sightings: Vec<Sighting>,
    pub summary: BatchSummary,
}

// ---

/// Normalize one uploaded batch into ordered sightings.
///
/// `key_field` selects which column carries the device identity (validated
/// against [`IDENTITY_COLUMNS`] at startup). `received_at` is the batch
/// receipt time, used as the fallback for rows with a missing or
/// unparseable timestamp; such rows are flagged `time_estimated` so their
/// duration contribution stays distinguishable downstream.
///
/// An empty or header-only payload yields zero sightings and is not an
/// error.
pub fn parse_batch(text: &str, key_field: &str, received_at: DateTime<Utc>) -> ParsedBatch {
    // ---
    let mut sightings = Vec::new();
    let mut summary = BatchSummary::default();

    let mut lines = text.lines().filter(|l| !l.trim().is_empty()).peekable();

    let first_cells = lines.peek().map(|l| split_row(l));
    let columns = match first_cells {
        Some(cells) if looks_like_header(&cells) => {
            lines.next();
            index_columns(&cells)
        }
        _ => legacy_columns(),
    };

    for line in lines {
        let cells = split_row(line);
        let field = |name: &str| -> Option<&str> {
            columns
                .get(name)
                .and_then(|&i| cells.get(i))
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
        };

        let Some(device_key) = field(key_field) else {
            summary.missing_key += 1;
            debug!("Dropping row without '{}' identity: {:?}", key_field, line);
            continue;
        };

        let (observed_at, time_estimated) = parse_timestamp(field("timestamp"), received_at);
        if time_estimated {
            summary.fallback_timestamps += 1;
        }

        sightings.push(Sighting {
            device_key: device_key.to_string(),
            observed_at,
            time_estimated,
            rssi: field("rssi").and_then(|v| v.parse::<i16>().ok()),
            device_name: field("device_name").map(str::to_string),
            sender_id: field("sender_id").map(str::to_string),
            manufacturer_data: field("manufacturer_data").map(str::to_string),
        });
        summary.accepted += 1;
    }

    ParsedBatch { sightings, summary }
}

// ---

/// A first line is a header iff any cell names a recognized column.
fn looks_like_header(cells: &[String]) -> bool {
    // ---
    cells
        .iter()
        .any(|c| RECOGNIZED_COLUMNS.contains(&c.trim().to_ascii_lowercase().as_str()))
}

/// Map recognized header names to their positions. First occurrence wins;
/// unknown columns are ignored.
fn index_columns(header: &[String]) -> HashMap<String, usize> {
    // ---
    let mut columns = HashMap::new();
    for (i, cell) in header.iter().enumerate() {
        let name = cell.trim().to_ascii_lowercase();
        if RECOGNIZED_COLUMNS.contains(&name.as_str()) {
            columns.entry(name).or_insert(i);
        }
    }
    columns
}

fn legacy_columns() -> HashMap<String, usize> {
    // ---
    LEGACY_COLUMN_ORDER
        .iter()
        .enumerate()
        .map(|(i, name)| (name.to_string(), i))
        .collect()
}

/// Parse a device timestamp: epoch milliseconds (what the firmware sends)
/// or RFC 3339. Anything else falls back to the batch receipt time.
fn parse_timestamp(raw: Option<&str>, received_at: DateTime<Utc>) -> (DateTime<Utc>, bool) {
    // ---
    let Some(raw) = raw else {
        return (received_at, true);
    };

    if let Ok(millis) = raw.parse::<i64>() {
        if let Some(ts) = DateTime::from_timestamp_millis(millis) {
            return (ts, false);
        }
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return (ts.with_timezone(&Utc), false);
    }

    (received_at, true)
}

/// Split one delimited line, honoring double-quoted fields (a device name
/// may legitimately contain a comma).
fn split_row(line: &str) -> Vec<String> {
    // ---
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if in_quotes && chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = !in_quotes;
                }
            }
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}
