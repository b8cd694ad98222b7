//! Dimension Manager.
//!
//! Housekeeping over the atom table that does not depend on decay timing:
//! pruning atoms that are too weak or too uncertain to matter, and reporting
//! how much weight each dimension carries.

use std::sync::Arc;

use kuro_types::DimensionStat;
use rusqlite::params;
use tracing::info;

use crate::db::{MemoryDb, StoreError};

/// Default floor used by [`DimensionManager::prune_weak_atoms`].
pub const DEFAULT_PRUNING_THRESHOLD: f64 = 0.1;

pub struct DimensionManager {
    db: Arc<MemoryDb>,
    pruning_threshold: f64,
}

impl DimensionManager {
    pub fn new(db: Arc<MemoryDb>) -> Self {
        Self {
            db,
            pruning_threshold: DEFAULT_PRUNING_THRESHOLD,
        }
    }

    /// Override the default pruning floor (builder-style).
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.pruning_threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.pruning_threshold
    }

    /// Prune with the configured floor. See
    /// [`prune_weak_atoms_below`][Self::prune_weak_atoms_below].
    pub fn prune_weak_atoms(&self) -> Result<usize, StoreError> {
        self.prune_weak_atoms_below(self.pruning_threshold)
    }

    /// Delete every atom whose `|magnitude|` **or** confidence is below
    /// `threshold`. Returns the number of atoms removed.
    pub fn prune_weak_atoms_below(&self, threshold: f64) -> Result<usize, StoreError> {
        let removed = self.db.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM memory_atoms WHERE ABS(magnitude) < ?1 OR confidence < ?1",
                params![threshold],
            )?)
        })?;
        info!(removed, threshold, "pruned weak memory atoms");
        Ok(removed)
    }

    /// Atom count and total `|magnitude|` per dimension, ordered by name.
    pub fn dimension_report(&self) -> Result<Vec<DimensionStat>, StoreError> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT dimension, COUNT(*), SUM(ABS(magnitude))
                 FROM memory_atoms
                 GROUP BY dimension
                 ORDER BY dimension ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(DimensionStat {
                    dimension: row.get(0)?,
                    atom_count: row.get::<_, i64>(1)? as u64,
                    total_magnitude: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}
