//! Per-device contact state machine and eviction sweep.
//!
//! Owns the device-key → [`ContactState`] map and converts the noisy
//! sighting stream into duration accrual, one-time exposure alerts, and
//! eviction decisions. Pure accumulation logic - no I/O; every transition
//! is emitted as a [`ContactEvent`] through the sink channel and persisted
//! elsewhere.
//!
//! Locking discipline: the map is behind an `RwLock`; each contact sits in
//! its own `Arc<Mutex<_>>` so different keys proceed in parallel while two
//! sightings for the same key always serialize. The map lock is acquired
//! before the entry lock, everywhere, and entry locks are only ever held
//! together with a map lock. Duration accrual is neither associative nor
//! commutative, so this ordering is load-bearing, not an optimization.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::models::{ContactEvent, ContactState, ContactStatus, Sighting};
use crate::sink::EventSender;

// ---

/// Tracking policy knobs, all in seconds.
#[derive(Debug, Clone, Copy)]
pub struct TrackerPolicy {
    // ---
    /// Largest gap between sightings still counted as one continuous
    /// proximity session (inclusive).
    pub continuation_gap_secs: f64,
    /// Accumulated duration at which the one-time exposure alert fires
    /// (inclusive).
    pub exposure_threshold_secs: f64,
    /// Silence after which a contact is retired and its total discarded
    /// (exclusive).
    pub eviction_window_secs: f64,
}

/// The contact state tracker. One instance per process, shared across all
/// upload handlers and the sweep task via `Arc`.
pub struct ContactTracker {
    // ---
    policy: TrackerPolicy,
    contacts: RwLock<HashMap<String, Arc<Mutex<ContactState>>>>,
    events: EventSender,
}

impl ContactTracker {
    // ---
    pub fn new(policy: TrackerPolicy, events: EventSender) -> Self {
        // ---
        ContactTracker {
            policy,
            contacts: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Apply one accepted sighting. `received_at` is the batch receipt
    /// time, carried into the emitted event as `processed_at`.
    pub async fn observe(&self, sighting: &Sighting, received_at: DateTime<Utc>) {
        // ---
        // Fast path: the contact already exists. The read guard stays held
        // across the entry lock so the sweep cannot evict underneath us.
        {
            let contacts = self.contacts.read().await;
            if let Some(entry) = contacts.get(&sighting.device_key) {
                let mut state = entry.lock().await;
                self.apply_update(&mut state, sighting, received_at);
                return;
            }
        }

        // Slow path: insert under the write lock, re-checking for a racing
        // insert or a concurrent sweep between the two lock acquisitions.
        let mut contacts = self.contacts.write().await;
        match contacts.entry(sighting.device_key.clone()) {
            Entry::Occupied(occupied) => {
                let entry = Arc::clone(occupied.get());
                let mut state = entry.lock().await;
                self.apply_update(&mut state, sighting, received_at);
            }
            Entry::Vacant(vacant) => {
                let state = ContactState::new(sighting);
                info!(
                    "New contact: {} ({})",
                    sighting.device_key,
                    state.device_name.as_deref().unwrap_or("Unknown")
                );
                self.emit(
                    ContactStatus::NewContact,
                    &sighting.device_key,
                    &state,
                    sighting.observed_at,
                    received_at,
                    sighting.time_estimated,
                );
                vacant.insert(Arc::new(Mutex::new(state)));
            }
        }
    }

    /// Retire every contact silent for longer than the eviction window.
    /// Returns the number of contacts removed.
    ///
    /// Acquires, checks, and releases locks per key - a long sweep never
    /// starves concurrent ingestion, and staleness is re-checked under the
    /// write lock so a sighting accepted mid-sweep always wins.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        // ---
        let keys: Vec<String> = self.contacts.read().await.keys().cloned().collect();
        let mut evicted = 0;

        for key in keys {
            let mut contacts = self.contacts.write().await;
            let Some(entry) = contacts.get(&key) else {
                continue;
            };
            let entry = Arc::clone(entry);
            let state = entry.lock().await;

            if !state.is_stale(now, self.policy.eviction_window_secs) {
                continue;
            }

            info!(
                "Removing inactive contact: {} after {:.2} minutes of accumulated proximity",
                key,
                state.accumulated_secs / 60.0
            );
            self.emit(
                ContactStatus::ContactEnded,
                &key,
                &state,
                state.last_seen,
                now,
                false,
            );
            drop(state);
            contacts.remove(&key);
            evicted += 1;
        }

        evicted
    }

    /// Number of currently tracked contacts.
    pub async fn tracked(&self) -> usize {
        self.contacts.read().await.len()
    }

    // ---

    /// The update arm of the state machine: gap-bounded accrual, then the
    /// one-time threshold check.
    fn apply_update(&self, state: &mut ContactState, sighting: &Sighting, received_at: DateTime<Utc>) {
        // ---
        let gap = (sighting.observed_at - state.last_seen).num_milliseconds() as f64 / 1000.0;

        if gap >= 0.0 && gap <= self.policy.continuation_gap_secs {
            state.accumulated_secs += gap;
        }
        // gap above the bound: a new proximity session for the same
        // identity; the running total is kept, only eviction resets it.
        // gap below zero: out-of-order row, contributes nothing.

        if sighting.observed_at > state.last_seen {
            state.last_seen = sighting.observed_at;
        }
        state.refresh_metadata(sighting);

        let status = if !state.alerted
            && state.accumulated_secs >= self.policy.exposure_threshold_secs
        {
            state.alerted = true;
            warn!(
                "EXPOSURE ALERT: {} ({}) - {:.2} minutes of contact",
                sighting.device_key,
                state.device_name.as_deref().unwrap_or("Unknown"),
                state.accumulated_secs / 60.0
            );
            ContactStatus::ExposureDetected
        } else {
            ContactStatus::ContactUpdate
        };

        self.emit(
            status,
            &sighting.device_key,
            state,
            sighting.observed_at,
            received_at,
            sighting.time_estimated,
        );
    }

    fn emit(
        &self,
        status: ContactStatus,
        device_key: &str,
        state: &ContactState,
        observed_at: DateTime<Utc>,
        processed_at: DateTime<Utc>,
        time_estimated: bool,
    ) {
        // ---
        self.events.send(ContactEvent {
            seq: 0, // stamped by the sink channel
            status,
            device_key: device_key.to_string(),
            observed_at,
            processed_at,
            accumulated_secs: state.accumulated_secs,
            alerted: state.alerted,
            time_estimated,
            device_name: state.device_name.clone(),
            sender_id: state.sender_id.clone(),
            rssi: state.rssi,
        });
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::sink;
    use chrono::TimeZone;
    use tokio::sync::mpsc::UnboundedReceiver;

    const BASE: i64 = 1_750_000_000;

    fn policy(gap: f64, threshold: f64, window: f64) -> TrackerPolicy {
        // ---
        TrackerPolicy {
            continuation_gap_secs: gap,
            exposure_threshold_secs: threshold,
            eviction_window_secs: window,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(BASE + secs, 0).unwrap()
    }

    fn sighting(key: &str, t: DateTime<Utc>) -> Sighting {
        // ---
        Sighting {
            device_key: key.to_string(),
            observed_at: t,
            time_estimated: false,
            rssi: Some(-70),
            device_name: Some("test device".to_string()),
            sender_id: Some("sensor-01".to_string()),
            manufacturer_data: None,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ContactEvent>) -> Vec<ContactEvent> {
        // ---
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn feed(tracker: &ContactTracker, key: &str, times: &[i64]) {
        // ---
        for &t in times {
            tracker.observe(&sighting(key, at(t)), at(t)).await;
        }
    }

    #[tokio::test]
    async fn consecutive_gaps_accumulate_exactly() {
        // ---
        let (events, mut rx) = sink::channel();
        let tracker = ContactTracker::new(policy(120.0, 10_000.0, 600.0), events);

        feed(&tracker, "A", &[0, 30, 75, 135]).await;

        let emitted = drain(&mut rx);
        assert_eq!(emitted.len(), 4);
        assert_eq!(emitted[0].status, ContactStatus::NewContact);
        assert_eq!(emitted[0].accumulated_secs, 0.0);

        // 30 + 45 + 60, each gap within the continuation bound
        assert_eq!(emitted[3].accumulated_secs, 135.0);
        assert!(emitted[1..].iter().all(|e| e.status == ContactStatus::ContactUpdate));
    }

    #[tokio::test]
    async fn long_gap_advances_last_seen_without_accrual() {
        // ---
        let (events, mut rx) = sink::channel();
        let tracker = ContactTracker::new(policy(120.0, 10_000.0, 600.0), events);

        feed(&tracker, "A", &[0, 60, 460, 470]).await;

        let emitted = drain(&mut rx);
        // 460 arrives 400s after 60: over the bound, total untouched…
        assert_eq!(emitted[2].accumulated_secs, 60.0);
        // …but last_seen advanced, so 470 accrues only its 10s gap.
        assert_eq!(emitted[3].accumulated_secs, 70.0);
    }

    #[tokio::test]
    async fn alert_fires_exactly_once_at_threshold() {
        // ---
        let (events, mut rx) = sink::channel();
        let tracker = ContactTracker::new(policy(120.0, 100.0, 600.0), events);

        feed(&tracker, "A", &[0, 60, 100, 160]).await;

        let emitted = drain(&mut rx);
        let alerts: Vec<_> = emitted
            .iter()
            .filter(|e| e.status == ContactStatus::ExposureDetected)
            .collect();

        // Crossing happens at t=100 (total exactly 100, inclusive bound).
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].accumulated_secs, 100.0);
        assert!(alerts[0].alerted);

        // Later updates stay alerted but never alert again.
        let last = emitted.last().unwrap();
        assert_eq!(last.status, ContactStatus::ContactUpdate);
        assert!(last.alerted);
    }

    #[tokio::test]
    async fn session_break_then_alert_scenario() {
        // ---
        // t=0 create, t=60 accrue to 60, t=400 gap 340 over the bound
        // (no accrual), t=700 gap exactly 300 counts as continuation:
        // 60 + 300 = 360 >= 300 fires the one alert.
        let (events, mut rx) = sink::channel();
        let tracker = ContactTracker::new(policy(300.0, 300.0, 10_000.0), events);

        feed(&tracker, "A", &[0, 60, 400, 700]).await;

        let emitted = drain(&mut rx);
        assert_eq!(emitted[1].accumulated_secs, 60.0);
        assert_eq!(emitted[2].accumulated_secs, 60.0);
        assert_eq!(emitted[2].status, ContactStatus::ContactUpdate);
        assert_eq!(emitted[3].accumulated_secs, 360.0);
        assert_eq!(emitted[3].status, ContactStatus::ExposureDetected);
    }

    #[tokio::test]
    async fn negative_gap_is_ignored() {
        // ---
        let (events, mut rx) = sink::channel();
        let tracker = ContactTracker::new(policy(120.0, 10_000.0, 600.0), events);

        // Out-of-order delivery: the t=40 row arrives after t=100.
        feed(&tracker, "A", &[100, 40, 160]).await;

        let emitted = drain(&mut rx);
        // The stale row contributes nothing and does not move last_seen…
        assert_eq!(emitted[1].accumulated_secs, 0.0);
        assert_eq!(emitted[1].status, ContactStatus::ContactUpdate);
        // …so the next gap is measured from t=100, not t=40.
        assert_eq!(emitted[2].accumulated_secs, 60.0);
    }

    #[tokio::test]
    async fn replayed_batch_adds_nothing() {
        // ---
        let (events, mut rx) = sink::channel();
        let tracker = ContactTracker::new(policy(120.0, 10_000.0, 600.0), events);

        feed(&tracker, "A", &[0, 60]).await;
        // The transport redelivers the same batch.
        feed(&tracker, "A", &[0, 60]).await;

        let emitted = drain(&mut rx);
        // Replay: gap -60 ignored, gap 0 adds zero.
        assert_eq!(emitted.last().unwrap().accumulated_secs, 60.0);
    }

    #[tokio::test]
    async fn eviction_emits_one_ended_event_and_resets() {
        // ---
        let (events, mut rx) = sink::channel();
        let tracker = ContactTracker::new(policy(120.0, 10_000.0, 600.0), events);

        feed(&tracker, "B", &[0]).await;
        assert_eq!(tracker.tracked().await, 1);

        // Inside the window nothing happens, even at the exact boundary.
        assert_eq!(tracker.sweep(at(600)).await, 0);
        assert_eq!(tracker.tracked().await, 1);

        assert_eq!(tracker.sweep(at(601)).await, 1);
        assert_eq!(tracker.tracked().await, 0);
        // Idempotent: the contact is gone, a second sweep finds nothing.
        assert_eq!(tracker.sweep(at(602)).await, 0);

        let emitted = drain(&mut rx);
        let ended: Vec<_> = emitted
            .iter()
            .filter(|e| e.status == ContactStatus::ContactEnded)
            .collect();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].accumulated_secs, 0.0);
        assert!(!ended[0].alerted);
        assert_eq!(ended[0].observed_at, at(0));
        assert_eq!(ended[0].processed_at, at(601));

        // A device seen again afterwards starts a fresh lifecycle.
        feed(&tracker, "B", &[700]).await;
        let emitted = drain(&mut rx);
        assert_eq!(emitted[0].status, ContactStatus::NewContact);
        assert_eq!(emitted[0].accumulated_secs, 0.0);
    }

    #[tokio::test]
    async fn eviction_preserves_final_totals() {
        // ---
        let (events, mut rx) = sink::channel();
        let tracker = ContactTracker::new(policy(120.0, 100.0, 600.0), events);

        feed(&tracker, "A", &[0, 60, 120]).await;
        assert_eq!(tracker.sweep(at(721)).await, 1);

        let emitted = drain(&mut rx);
        let ended = emitted.last().unwrap();
        assert_eq!(ended.status, ContactStatus::ContactEnded);
        assert_eq!(ended.accumulated_secs, 120.0);
        assert!(ended.alerted);
    }

    #[tokio::test]
    async fn keys_are_tracked_independently() {
        // ---
        let (events, mut rx) = sink::channel();
        let tracker = Arc::new(ContactTracker::new(policy(120.0, 10_000.0, 600.0), events));

        let mut handles = Vec::new();
        for i in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                let key = format!("device-{i}");
                for t in [0, 30, 60] {
                    tracker.observe(&sighting(&key, at(t)), at(t)).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(tracker.tracked().await, 8);

        let emitted = drain(&mut rx);
        assert_eq!(emitted.len(), 8 * 3);
        // Every key accrued its own 60 seconds, uncontaminated.
        for i in 0..8 {
            let key = format!("device-{i}");
            let total = emitted
                .iter()
                .filter(|e| e.device_key == key)
                .map(|e| e.accumulated_secs)
                .fold(0.0_f64, f64::max);
            assert_eq!(total, 60.0, "key {key}");
        }
    }

    #[tokio::test]
    async fn fractional_gaps_accrue_with_millisecond_precision() {
        // ---
        let (events, mut rx) = sink::channel();
        let tracker = ContactTracker::new(policy(120.0, 10_000.0, 600.0), events);

        let t0 = at(0);
        let t1 = t0 + chrono::Duration::milliseconds(1500);
        tracker.observe(&sighting("A", t0), t0).await;
        tracker.observe(&sighting("A", t1), t1).await;

        let emitted = drain(&mut rx);
        assert_eq!(emitted[1].accumulated_secs, 1.5);
    }
}
