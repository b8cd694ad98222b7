//! Atom Store.
//!
//! Merges signed observations about an entity into **memory atoms** keyed by
//! `(entity, dimension, context)` and keeps every `(entity, dimension)` pair
//! under a fixed cap.
//!
//! ## Merge rule
//!
//! ```text
//! new atom:       magnitude = clamp(-1, 1, delta)
//!                 confidence = sample
//! existing atom:  magnitude' = clamp(-1, 1, magnitude + delta)
//!                 confidence' = 0.7 * confidence + 0.3 * sample
//!                 last_updated' = now
//! ```
//!
//! The merge is a single SQL upsert inside its own write transaction, so
//! concurrent observers of the same atom never lose an update.
//!
//! ## Cap
//!
//! After every merge the store runs [`AtomStore::cap_enforce`], which removes
//! at most **one** atom (the lowest-confidence one) when the pair is over the
//! cap. A burst of writes that bypassed the cap is brought back under it one
//! atom per subsequent call.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use kuro_memory::{AtomStore, MemoryDb};
//!
//! let db = Arc::new(MemoryDb::open_in_memory().unwrap());
//! let store = AtomStore::new(db);
//!
//! store.observe("u1", "trust", "ctxA", 0.6, 0.9).unwrap();
//! store.observe("u1", "trust", "ctxA", 0.6, 0.9).unwrap();
//!
//! let lines = store.summarize(&["u1"]).unwrap();
//! assert_eq!(lines, vec!["u1: trust=1.00".to_string()]);
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kuro_types::{Atom, AtomKey};
use rusqlite::{OptionalExtension, params};
use tracing::debug;

use crate::db::{MemoryDb, StoreError, format_ts, parse_ts};

/// Default maximum number of atoms per `(entity, dimension)` pair.
pub const DEFAULT_MAX_ATOMS_PER_DIMENSION: usize = 50;

/// Default per-atom decay constant (hours⁻¹) assigned at creation.
pub const DEFAULT_DECAY_RATE: f64 = 0.05;

/// Weight kept from the stored confidence on each merge.
const CONFIDENCE_RETENTION: f64 = 0.7;
/// Weight given to the incoming confidence sample on each merge.
const CONFIDENCE_UPTAKE: f64 = 0.3;

const UPSERT_ATOM: &str = "
    INSERT INTO memory_atoms
        (entity_id, dimension, context_hash, magnitude, confidence, decay_rate, last_updated)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT (entity_id, dimension, context_hash) DO UPDATE SET
        magnitude    = MAX(-1.0, MIN(1.0, magnitude + ?8)),
        confidence   = ?9 * confidence + ?10 * excluded.confidence,
        last_updated = excluded.last_updated";

const SELECT_ATOM: &str = "
    SELECT entity_id, dimension, context_hash, magnitude, confidence, decay_rate, last_updated
    FROM memory_atoms";

// ─────────────────────────────────────────────────────────────────────────────
// AtomStore
// ─────────────────────────────────────────────────────────────────────────────

/// The durable table of memory atoms.
///
/// Cheap to clone; all clones share the same [`MemoryDb`].
#[derive(Clone)]
pub struct AtomStore {
    db: Arc<MemoryDb>,
    max_atoms_per_dimension: usize,
    decay_rate: f64,
}

impl AtomStore {
    /// Create a store over `db` with the default cap and decay rate.
    pub fn new(db: Arc<MemoryDb>) -> Self {
        Self {
            db,
            max_atoms_per_dimension: DEFAULT_MAX_ATOMS_PER_DIMENSION,
            decay_rate: DEFAULT_DECAY_RATE,
        }
    }

    /// Override the per-`(entity, dimension)` cap (builder-style).
    pub fn with_max_atoms_per_dimension(mut self, limit: usize) -> Self {
        self.max_atoms_per_dimension = limit;
        self
    }

    /// Override the decay constant given to newly created atoms.
    pub fn with_decay_rate(mut self, decay_rate: f64) -> Self {
        self.decay_rate = decay_rate;
        self
    }

    pub fn db(&self) -> &Arc<MemoryDb> {
        &self.db
    }

    pub fn max_atoms_per_dimension(&self) -> usize {
        self.max_atoms_per_dimension
    }

    /// Merge one signed observation into the addressed atom, then enforce the
    /// cap for its `(entity, dimension)` pair.
    pub fn observe(
        &self,
        entity_id: &str,
        dimension: &str,
        context_hash: &str,
        delta: f64,
        confidence: f64,
    ) -> Result<(), StoreError> {
        self.observe_at(entity_id, dimension, context_hash, delta, confidence, Utc::now())
    }

    /// [`observe`][Self::observe] with an explicit clock.
    pub fn observe_at(
        &self,
        entity_id: &str,
        dimension: &str,
        context_hash: &str,
        delta: f64,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let stamp = format_ts(now);
        self.db.write(|tx| {
            tx.execute(
                UPSERT_ATOM,
                params![
                    entity_id,
                    dimension,
                    context_hash,
                    delta.clamp(-1.0, 1.0),
                    confidence,
                    self.decay_rate,
                    stamp,
                    delta,
                    CONFIDENCE_RETENTION,
                    CONFIDENCE_UPTAKE,
                ],
            )?;
            Ok(())
        })?;
        debug!(entity_id, dimension, context_hash, delta, confidence, "merged observation");

        self.cap_enforce(entity_id, dimension, self.max_atoms_per_dimension)?;
        Ok(())
    }

    /// If `(entity_id, dimension)` holds more than `limit` atoms, delete the
    /// one with the lowest confidence. Removes at most one atom per call.
    ///
    /// Returns `true` when an atom was evicted.
    pub fn cap_enforce(
        &self,
        entity_id: &str,
        dimension: &str,
        limit: usize,
    ) -> Result<bool, StoreError> {
        let evicted = self.db.write(|tx| {
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM memory_atoms WHERE entity_id = ?1 AND dimension = ?2",
                params![entity_id, dimension],
                |row| row.get(0),
            )?;
            if count <= limit as i64 {
                return Ok(false);
            }
            let removed = tx.execute(
                "DELETE FROM memory_atoms WHERE rowid = (
                     SELECT rowid FROM memory_atoms
                     WHERE entity_id = ?1 AND dimension = ?2
                     ORDER BY confidence ASC
                     LIMIT 1
                 )",
                params![entity_id, dimension],
            )?;
            Ok(removed > 0)
        })?;
        if evicted {
            debug!(entity_id, dimension, limit, "evicted lowest-confidence atom over cap");
        }
        Ok(evicted)
    }

    /// One line per entity that has at least one atom, listing every
    /// `dimension=magnitude` pair (two decimals). Entities without atoms are
    /// skipped; repeated entity ids are summarised once.
    pub fn summarize<S: AsRef<str>>(&self, entities: &[S]) -> Result<Vec<String>, StoreError> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT dimension, magnitude FROM memory_atoms
                 WHERE entity_id = ?1
                 ORDER BY dimension ASC, context_hash ASC",
            )?;
            let mut seen = HashSet::new();
            let mut lines = Vec::new();
            for entity in entities {
                let entity = entity.as_ref();
                if !seen.insert(entity) {
                    continue;
                }
                let pairs = stmt
                    .query_map(params![entity], |row| {
                        let dimension: String = row.get(0)?;
                        let magnitude: f64 = row.get(1)?;
                        Ok(format!("{dimension}={magnitude:.2}"))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                if !pairs.is_empty() {
                    lines.push(format!("{entity}: {}", pairs.join(", ")));
                }
            }
            Ok(lines)
        })
    }

    /// Snapshot of every preference value, keyed by preference name.
    pub fn get_preferences(&self) -> Result<BTreeMap<String, f64>, StoreError> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM preferences")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<Result<BTreeMap<String, f64>, _>>()?)
        })
    }

    /// Fetch a single atom by identity.
    pub fn atom(&self, key: &AtomKey) -> Result<Option<Atom>, StoreError> {
        let raw = self.db.read(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "{SELECT_ATOM} WHERE entity_id = ?1 AND dimension = ?2 AND context_hash = ?3"
                    ),
                    params![key.entity_id, key.dimension, key.context_hash],
                    RawAtom::from_row,
                )
                .optional()?)
        })?;
        raw.map(RawAtom::into_atom).transpose()
    }

    /// All atoms for `(entity_id, dimension)`, ordered by context.
    pub fn atoms_for(&self, entity_id: &str, dimension: &str) -> Result<Vec<Atom>, StoreError> {
        let raws = self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_ATOM} WHERE entity_id = ?1 AND dimension = ?2 ORDER BY context_hash ASC"
            ))?;
            let rows = stmt.query_map(params![entity_id, dimension], RawAtom::from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;
        raws.into_iter().map(RawAtom::into_atom).collect()
    }

    /// Number of atoms held for `(entity_id, dimension)`.
    pub fn count(&self, entity_id: &str, dimension: &str) -> Result<usize, StoreError> {
        let n: i64 = self.db.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM memory_atoms WHERE entity_id = ?1 AND dimension = ?2",
                params![entity_id, dimension],
                |row| row.get(0),
            )?)
        })?;
        Ok(n as usize)
    }

    /// Number of live atoms across all entities.
    pub fn total_atoms(&self) -> Result<u64, StoreError> {
        let n: i64 = self.db.read(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM memory_atoms", [], |row| row.get(0))?)
        })?;
        Ok(n as u64)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

/// Column values as stored, before the timestamp is parsed.
struct RawAtom {
    key: AtomKey,
    magnitude: f64,
    confidence: f64,
    decay_rate: f64,
    last_updated: String,
}

impl RawAtom {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: AtomKey {
                entity_id: row.get(0)?,
                dimension: row.get(1)?,
                context_hash: row.get(2)?,
            },
            magnitude: row.get(3)?,
            confidence: row.get(4)?,
            decay_rate: row.get(5)?,
            last_updated: row.get(6)?,
        })
    }

    fn into_atom(self) -> Result<Atom, StoreError> {
        Ok(Atom {
            key: self.key,
            magnitude: self.magnitude,
            confidence: self.confidence,
            decay_rate: self.decay_rate,
            last_updated: parse_ts(&self.last_updated)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn make_store() -> AtomStore {
        AtomStore::new(Arc::new(MemoryDb::open_in_memory().unwrap()))
    }

    fn key(entity: &str, dimension: &str, ctx: &str) -> AtomKey {
        AtomKey::new(entity, dimension, ctx)
    }

    // ── observe ──────────────────────────────────────────────────────────────

    #[test]
    fn first_observation_creates_atom() {
        let store = make_store();
        store.observe("u1", "trust", "ctxA", 0.4, 0.8).unwrap();

        let atom = store.atom(&key("u1", "trust", "ctxA")).unwrap().unwrap();
        assert!((atom.magnitude - 0.4).abs() < 1e-12);
        assert!((atom.confidence - 0.8).abs() < 1e-12);
        assert!((atom.decay_rate - DEFAULT_DECAY_RATE).abs() < 1e-12);
    }

    #[test]
    fn first_observation_clamps_delta() {
        let store = make_store();
        store.observe("u1", "trust", "ctxA", 3.5, 0.5).unwrap();
        store.observe("u1", "trust", "ctxB", -7.0, 0.5).unwrap();

        let a = store.atom(&key("u1", "trust", "ctxA")).unwrap().unwrap();
        let b = store.atom(&key("u1", "trust", "ctxB")).unwrap().unwrap();
        assert_eq!(a.magnitude, 1.0);
        assert_eq!(b.magnitude, -1.0);
    }

    #[test]
    fn repeated_observation_saturates_and_blends_confidence() {
        let store = make_store();
        store.observe("u1", "trust", "ctxA", 0.6, 0.9).unwrap();
        store.observe("u1", "trust", "ctxA", 0.6, 0.9).unwrap();

        assert_eq!(store.count("u1", "trust").unwrap(), 1);
        let atom = store.atom(&key("u1", "trust", "ctxA")).unwrap().unwrap();
        assert_eq!(atom.magnitude, 1.0);
        assert!((atom.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn merge_uses_unclamped_delta_against_stored_magnitude() {
        let store = make_store();
        store.observe("u1", "mood", "c", -0.9, 0.5).unwrap();
        // -0.9 + 1.5 = 0.6, not -0.9 + clamp(1.5) = 0.1
        store.observe("u1", "mood", "c", 1.5, 0.5).unwrap();

        let atom = store.atom(&key("u1", "mood", "c")).unwrap().unwrap();
        assert!((atom.magnitude - 0.6).abs() < 1e-9);
    }

    #[test]
    fn confidence_is_blended_not_summed() {
        let store = make_store();
        store.observe("u1", "trust", "c", 0.1, 0.2).unwrap();
        store.observe("u1", "trust", "c", 0.1, 1.0).unwrap();

        let atom = store.atom(&key("u1", "trust", "c")).unwrap().unwrap();
        assert!((atom.confidence - (0.7 * 0.2 + 0.3 * 1.0)).abs() < 1e-9);
    }

    #[test]
    fn observe_refreshes_last_updated() {
        let store = make_store();
        let t0 = Utc::now() - chrono::Duration::hours(5);
        let t1 = t0 + chrono::Duration::hours(2);
        store.observe_at("u1", "trust", "c", 0.2, 0.5, t0).unwrap();
        store.observe_at("u1", "trust", "c", 0.2, 0.5, t1).unwrap();

        let atom = store.atom(&key("u1", "trust", "c")).unwrap().unwrap();
        assert_eq!(atom.last_updated, t1);
    }

    #[test]
    fn custom_decay_rate_applies_to_new_atoms() {
        let store = make_store().with_decay_rate(0.2);
        store.observe("u1", "trust", "c", 0.5, 0.5).unwrap();
        let atom = store.atom(&key("u1", "trust", "c")).unwrap().unwrap();
        assert!((atom.decay_rate - 0.2).abs() < 1e-12);
    }

    #[test]
    fn concurrent_observers_never_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryDb::open(dir.path().join("kuro.db")).unwrap());
        let store = AtomStore::new(db);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        store.observe("u1", "trust", "shared", 0.01, 0.5).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let atom = store.atom(&key("u1", "trust", "shared")).unwrap().unwrap();
        assert!((atom.magnitude - 0.8).abs() < 1e-9);
    }

    // ── cap_enforce ──────────────────────────────────────────────────────────

    #[test]
    fn fifty_first_atom_evicts_strictly_lowest_confidence() {
        let store = make_store();
        for i in 0..51 {
            let confidence = if i == 17 { 0.1 } else { 0.5 + i as f64 * 0.005 };
            store
                .observe("u1", "trust", &format!("ctx-{i}"), 0.3, confidence)
                .unwrap();
        }

        assert_eq!(store.count("u1", "trust").unwrap(), 50);
        assert!(store.atom(&key("u1", "trust", "ctx-17")).unwrap().is_none());
        assert!(store.atom(&key("u1", "trust", "ctx-50")).unwrap().is_some());
    }

    #[test]
    fn cap_is_scoped_per_entity_and_dimension() {
        let store = make_store().with_max_atoms_per_dimension(2);
        for i in 0..3 {
            store.observe("u1", "trust", &format!("c{i}"), 0.3, 0.5).unwrap();
            store.observe("u1", "humor", &format!("c{i}"), 0.3, 0.5).unwrap();
            store.observe("u2", "trust", &format!("c{i}"), 0.3, 0.5).unwrap();
        }
        assert_eq!(store.count("u1", "trust").unwrap(), 2);
        assert_eq!(store.count("u1", "humor").unwrap(), 2);
        assert_eq!(store.count("u2", "trust").unwrap(), 2);
    }

    #[test]
    fn cap_enforce_removes_one_atom_per_call() {
        let store = make_store();
        // Simulate a burst that bypassed the cap.
        store
            .db()
            .write(|tx| {
                for i in 0..5 {
                    tx.execute(
                        "INSERT INTO memory_atoms
                             (entity_id, dimension, context_hash, magnitude, confidence, decay_rate, last_updated)
                         VALUES ('u1', 'trust', ?1, 0.5, ?2, 0.05, '2026-01-01T00:00:00Z')",
                        params![format!("c{i}"), 0.1 * (i + 1) as f64],
                    )?;
                }
                Ok(())
            })
            .unwrap();

        assert!(store.cap_enforce("u1", "trust", 2).unwrap());
        assert_eq!(store.count("u1", "trust").unwrap(), 4);
        assert!(store.atom(&key("u1", "trust", "c0")).unwrap().is_none());

        assert!(store.cap_enforce("u1", "trust", 2).unwrap());
        assert!(store.cap_enforce("u1", "trust", 2).unwrap());
        assert!(!store.cap_enforce("u1", "trust", 2).unwrap());
        assert_eq!(store.count("u1", "trust").unwrap(), 2);
    }

    #[test]
    fn cap_enforce_under_limit_is_noop() {
        let store = make_store();
        store.observe("u1", "trust", "c", 0.5, 0.5).unwrap();
        assert!(!store.cap_enforce("u1", "trust", 50).unwrap());
        assert_eq!(store.count("u1", "trust").unwrap(), 1);
    }

    // ── summarize ────────────────────────────────────────────────────────────

    #[test]
    fn summarize_lists_every_dimension_pair() {
        let store = make_store();
        store.observe("u1", "trust", "a", 0.456, 0.5).unwrap();
        store.observe("u1", "humor", "a", -0.2, 0.5).unwrap();
        store.observe("u1", "humor", "b", 0.1, 0.5).unwrap();

        let lines = store.summarize(&["u1"]).unwrap();
        assert_eq!(lines, vec!["u1: humor=-0.20, humor=0.10, trust=0.46".to_string()]);
    }

    #[test]
    fn summarize_skips_unknown_entities() {
        let store = make_store();
        store.observe("u1", "trust", "a", 0.5, 0.5).unwrap();

        let lines = store.summarize(&["ghost", "u1", "nobody"]).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("u1: "));
        assert!(store.summarize(&["ghost"]).unwrap().is_empty());
    }

    #[test]
    fn summarize_reports_repeated_entity_once() {
        let store = make_store();
        store.observe("u1", "trust", "a", 0.5, 0.5).unwrap();
        let lines = store.summarize(&["u1", "u1"]).unwrap();
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn summarize_empty_input_is_empty() {
        let store = make_store();
        let none: [&str; 0] = [];
        assert!(store.summarize(&none).unwrap().is_empty());
    }

    // ── preferences ──────────────────────────────────────────────────────────

    #[test]
    fn get_preferences_empty_store_returns_empty_map() {
        let store = make_store();
        assert!(store.get_preferences().unwrap().is_empty());
    }

    #[test]
    fn get_preferences_returns_values_only() {
        let store = make_store();
        store
            .db()
            .write(|tx| {
                tx.execute(
                    "INSERT INTO preferences (key, value, confidence, updated_at)
                     VALUES ('verbosity', -0.3, 0.9, '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let prefs = store.get_preferences().unwrap();
        assert_eq!(prefs.len(), 1);
        assert!((prefs["verbosity"] + 0.3).abs() < 1e-12);
    }

    // ── reads ────────────────────────────────────────────────────────────────

    #[test]
    fn atoms_for_and_total_atoms() {
        let store = make_store();
        store.observe("u1", "trust", "b", 0.5, 0.5).unwrap();
        store.observe("u1", "trust", "a", 0.5, 0.5).unwrap();
        store.observe("u2", "trust", "a", 0.5, 0.5).unwrap();

        let atoms = store.atoms_for("u1", "trust").unwrap();
        let contexts: Vec<_> = atoms.iter().map(|a| a.key.context_hash.as_str()).collect();
        assert_eq!(contexts, vec!["a", "b"]);
        assert_eq!(store.total_atoms().unwrap(), 3);
    }

    #[test]
    fn missing_atom_is_none() {
        let store = make_store();
        assert!(store.atom(&key("u1", "trust", "nope")).unwrap().is_none());
    }

    #[test]
    fn atom_serializes_to_json() {
        let store = make_store();
        store.observe("u1", "trust", "ctxA", 0.5, 0.5).unwrap();
        let atom = store.atom(&key("u1", "trust", "ctxA")).unwrap().unwrap();
        let json = serde_json::to_string(&atom).unwrap();
        assert!(json.contains("ctxA"));
        assert!(json.contains("trust"));
    }
}
