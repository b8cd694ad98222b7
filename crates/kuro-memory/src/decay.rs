//! Decay Engine.
//!
//! Periodically attenuates every memory atom toward zero and forgets the ones
//! that are no longer material.
//!
//! ## Model
//!
//! For each atom, from the last time it was observed or decayed:
//!
//! ```text
//! elapsed_hours = (now − last_updated) / 3600
//! magnitude'    = magnitude × e^(−decay_rate × elapsed_hours)
//! ```
//!
//! If `|magnitude'| < 0.01` ([`MATERIALITY_THRESHOLD`]) the atom is deleted,
//! otherwise `magnitude'` is stored and `last_updated` is reset to `now`.
//! Because each sweep starts from the previous sweep's timestamp, sweeps
//! compose: two sweeps over Δt/2 equal one sweep over Δt.
//!
//! ## Lifecycle
//!
//! ```text
//! Stopped ──start()──▶ Running ──stop()──▶ Stopped
//! ```
//!
//! While running, a dedicated thread sweeps once immediately and then once per
//! interval (default one hour). Sweep failures are logged and the loop carries
//! on with the next interval. `stop()` signals the thread through a channel
//! that is checked on every iteration, so it returns without waiting for the
//! interval to elapse.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kuro_types::AtomKey;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use tracing::{error, info};

use crate::db::{MemoryDb, StoreError, format_ts, parse_ts};

/// Magnitude below which a decayed atom is forgotten.
pub const MATERIALITY_THRESHOLD: f64 = 0.01;

/// Default time between two sweeps.
pub const DEFAULT_DECAY_INTERVAL: Duration = Duration::from_secs(3600);

/// `magnitude × e^(−decay_rate × elapsed_hours)`.
pub fn decayed_magnitude(magnitude: f64, decay_rate: f64, elapsed_hours: f64) -> f64 {
    magnitude * (-decay_rate * elapsed_hours).exp()
}

/// Hours from `from` to `to`; zero when `to` precedes `from`.
fn elapsed_hours(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    let micros = delta
        .num_microseconds()
        .unwrap_or_else(|| delta.num_seconds().saturating_mul(1_000_000));
    (micros.max(0) as f64) / 3_600_000_000.0
}

/// Counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Atoms considered by the sweep.
    pub scanned: usize,
    /// Atoms whose attenuated magnitude was written back.
    pub decayed: usize,
    /// Atoms deleted for falling below [`MATERIALITY_THRESHOLD`].
    pub removed: usize,
    /// Atoms left untouched because their row could not be decayed.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecayState {
    Stopped,
    Running,
}

enum RowOutcome {
    Decayed,
    Removed,
    /// Deleted by someone else between the scan and the write.
    Gone,
}

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

// ─────────────────────────────────────────────────────────────────────────────
// DecayEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the background decay thread. Dropping the engine stops it.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use kuro_memory::{DecayEngine, DecayState, MemoryDb};
///
/// let db = Arc::new(MemoryDb::open_in_memory().unwrap());
/// let engine = DecayEngine::new(db).with_interval(Duration::from_secs(60));
///
/// engine.start().unwrap();
/// assert_eq!(engine.state(), DecayState::Running);
/// engine.stop();
/// assert_eq!(engine.state(), DecayState::Stopped);
/// ```
pub struct DecayEngine {
    db: Arc<MemoryDb>,
    interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl DecayEngine {
    pub fn new(db: Arc<MemoryDb>) -> Self {
        Self {
            db,
            interval: DEFAULT_DECAY_INTERVAL,
            worker: Mutex::new(None),
        }
    }

    /// Override the sweep interval (builder-style). Takes effect on the next
    /// [`start`][Self::start].
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> DecayState {
        if self.lock_worker().is_some() {
            DecayState::Running
        } else {
            DecayState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == DecayState::Running
    }

    /// Spawn the decay thread. No-op when already running.
    pub fn start(&self) -> Result<(), StoreError> {
        let mut slot = self.lock_worker();
        if slot.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let db = Arc::clone(&self.db);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("kuro-decay".to_string())
            .spawn(move || run_loop(&db, interval, &stop_rx))?;

        *slot = Some(Worker { stop_tx, handle });
        info!(interval_secs = interval.as_secs(), "decay engine started");
        Ok(())
    }

    /// Signal the decay thread and wait for it to exit. No-op when stopped.
    pub fn stop(&self) {
        let Some(worker) = self.lock_worker().take() else {
            return;
        };
        // A send error only means the thread is already gone.
        let _ = worker.stop_tx.send(());
        if worker.handle.join().is_err() {
            error!("decay thread panicked");
        }
        info!("decay engine stopped");
    }

    /// Run one sweep now.
    pub fn sweep(&self) -> Result<SweepReport, StoreError> {
        sweep(&self.db, Utc::now())
    }

    /// Run one sweep as if the current time were `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        sweep(&self.db, now)
    }

    // The slot only holds a handle and a sender, so a poisoned lock still
    // contains consistent state.
    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for DecayEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker loop & sweep
// ─────────────────────────────────────────────────────────────────────────────

fn run_loop(db: &MemoryDb, interval: Duration, stop_rx: &Receiver<()>) {
    loop {
        match sweep(db, Utc::now()) {
            Ok(report) => info!(
                scanned = report.scanned,
                decayed = report.decayed,
                removed = report.removed,
                failed = report.failed,
                "applied decay to memory atoms"
            ),
            Err(e) => error!(error = %e, "decay sweep failed"),
        }

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn sweep(db: &MemoryDb, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
    let keys = db.read(|conn| {
        let mut stmt =
            conn.prepare("SELECT entity_id, dimension, context_hash FROM memory_atoms")?;
        let rows = stmt.query_map([], |row| {
            Ok(AtomKey {
                entity_id: row.get(0)?,
                dimension: row.get(1)?,
                context_hash: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    })?;

    let mut report = SweepReport {
        scanned: keys.len(),
        ..SweepReport::default()
    };
    // A bad row must not starve the rows after it.
    for key in &keys {
        match decay_row(db, key, now) {
            Ok(RowOutcome::Decayed) => report.decayed += 1,
            Ok(RowOutcome::Removed) => report.removed += 1,
            Ok(RowOutcome::Gone) => {}
            Err(e) => {
                report.failed += 1;
                error!(
                    entity_id = %key.entity_id,
                    dimension = %key.dimension,
                    context_hash = %key.context_hash,
                    error = %e,
                    "failed to decay memory atom"
                );
            }
        }
    }
    Ok(report)
}

/// Decay one atom inside its own write transaction, re-reading the row so an
/// observation committed after the scan is decayed from its current value.
fn decay_row(db: &MemoryDb, key: &AtomKey, now: DateTime<Utc>) -> Result<RowOutcome, StoreError> {
    db.write(|tx| {
        let row = tx
            .query_row(
                "SELECT magnitude, decay_rate, last_updated FROM memory_atoms
                 WHERE entity_id = ?1 AND dimension = ?2 AND context_hash = ?3",
                params![key.entity_id, key.dimension, key.context_hash],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((magnitude, decay_rate, last_updated)) = row else {
            return Ok(RowOutcome::Gone);
        };

        let last = parse_ts(&last_updated)?;
        let next = decayed_magnitude(magnitude, decay_rate, elapsed_hours(last, now));

        if next.abs() < MATERIALITY_THRESHOLD {
            tx.execute(
                "DELETE FROM memory_atoms
                 WHERE entity_id = ?1 AND dimension = ?2 AND context_hash = ?3",
                params![key.entity_id, key.dimension, key.context_hash],
            )?;
            return Ok(RowOutcome::Removed);
        }

        // Never move the clock backwards for atoms stamped ahead of `now`.
        tx.execute(
            "UPDATE memory_atoms SET magnitude = ?1, last_updated = ?2
             WHERE entity_id = ?3 AND dimension = ?4 AND context_hash = ?5",
            params![
                next,
                format_ts(now.max(last)),
                key.entity_id,
                key.dimension,
                key.context_hash
            ],
        )?;
        Ok(RowOutcome::Decayed)
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
