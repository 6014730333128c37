//! Event sink: durable audit trail for contact lifecycle events.
//!
//! The tracker never touches the filesystem. It pushes [`ContactEvent`]s
//! into an unbounded channel and a dedicated writer task appends one CSV
//! row per event to the contact log, so a slow or failing disk cannot
//! stall batch ingestion. Write failures are logged and counted on a
//! fault counter; they never propagate back into the tracker.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::models::{ContactEvent, AUDIT_HEADER};

// ---

/// Sending half of the event channel, held by the tracker.
///
/// Stamps each event with a monotonically increasing sequence number as it
/// enqueues, so the consuming side can recognize a redelivered event.
/// `send` never blocks and never fails the caller.
#[derive(Clone)]
pub struct EventSender {
    // ---
    tx: mpsc::UnboundedSender<ContactEvent>,
    next_seq: Arc<AtomicU64>,
}

impl EventSender {
    pub fn send(&self, mut event: ContactEvent) {
        // ---
        event.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(event).is_err() {
            warn!("Event sink channel closed; dropping event");
        }
    }
}

/// Create the event channel. The receiving half goes to a writer task
/// (or directly to a test harness).
pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<ContactEvent>) {
    // ---
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = EventSender {
        tx,
        next_seq: Arc::new(AtomicU64::new(1)),
    };
    (sender, rx)
}

// ---

/// Create the audit log with its header row if it does not exist yet.
/// Safe to call on every startup; no-op when the file is already there.
pub async fn init_audit_log(path: &Path) -> Result<()> {
    // ---
    if tokio::fs::metadata(path).await.is_err() {
        tokio::fs::write(path, format!("{AUDIT_HEADER}\n"))
            .await
            .with_context(|| format!("Failed to create contact log '{}'", path.display()))?;
    }
    Ok(())
}

/// Appends audit rows for incoming events; skips redelivered ones.
pub struct AuditWriter {
    // ---
    path: PathBuf,
    faults: Arc<AtomicU64>,
    last_seq: Option<u64>,
}

impl AuditWriter {
    pub fn new(path: PathBuf, faults: Arc<AtomicU64>) -> Self {
        // ---
        AuditWriter {
            path,
            faults,
            last_seq: None,
        }
    }

    /// Consume one event. Returns true when a row was appended; false for
    /// a redelivered event or a write fault (counted, never fatal).
    pub async fn handle(&mut self, event: &ContactEvent) -> bool {
        // ---
        if self.last_seq == Some(event.seq) {
            return false;
        }
        self.last_seq = Some(event.seq);

        if let Err(e) = self.append(event).await {
            self.faults.fetch_add(1, Ordering::Relaxed);
            error!(
                "Failed to append audit row for {} to '{}': {}",
                event.device_key,
                self.path.display(),
                e
            );
            return false;
        }
        true
    }

    async fn append(&self, event: &ContactEvent) -> std::io::Result<()> {
        // ---
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{}\n", event.to_audit_row()).as_bytes())
            .await?;
        file.flush().await
    }

    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}

/// Spawn the writer task draining the event channel into `path`.
///
/// Returns the sender for the tracker, the shared fault counter, and the
/// task handle. The task runs until every sender is dropped.
pub fn spawn_writer(path: PathBuf) -> (EventSender, Arc<AtomicU64>, JoinHandle<()>) {
    // ---
    let (sender, mut rx) = channel();
    let faults = Arc::new(AtomicU64::new(0));

    let writer_faults = Arc::clone(&faults);
    let task = tokio::spawn(async move {
        let mut writer = AuditWriter::new(path, writer_faults);
        while let Some(event) = rx.recv().await {
            writer.handle(&event).await;
        }
    });

    (sender, faults, task)
}
