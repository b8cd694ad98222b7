//! Reinforcement Engine.
//!
//! Applies signed feedback to named preferences. The value is additive and
//! unbounded; confidence rises by a fixed step on every reinforcement,
//! whatever its direction or size, and stops at 1.0.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kuro_types::Preference;
use rusqlite::{OptionalExtension, params};
use tracing::debug;

use crate::db::{MemoryDb, StoreError, format_ts, parse_ts};

/// Step applied by [`ReinforcementEngine::reinforce`].
pub const DEFAULT_REINFORCEMENT_MAGNITUDE: f64 = 0.1;

const INITIAL_CONFIDENCE: f64 = 0.5;
const CONFIDENCE_STEP: f64 = 0.05;

pub struct ReinforcementEngine {
    db: Arc<MemoryDb>,
}

impl ReinforcementEngine {
    pub fn new(db: Arc<MemoryDb>) -> Self {
        Self { db }
    }

    /// Nudge `key` up (`positive`) or down by the default magnitude.
    pub fn reinforce(&self, key: &str, positive: bool) -> Result<(), StoreError> {
        self.reinforce_by(key, positive, DEFAULT_REINFORCEMENT_MAGNITUDE)
    }

    pub fn reinforce_by(&self, key: &str, positive: bool, magnitude: f64) -> Result<(), StoreError> {
        self.reinforce_at(key, positive, magnitude, Utc::now())
    }

    /// [`reinforce_by`][Self::reinforce_by] with an explicit clock.
    pub fn reinforce_at(
        &self,
        key: &str,
        positive: bool,
        magnitude: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let delta = if positive { magnitude } else { -magnitude };
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO preferences (key, value, confidence, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (key) DO UPDATE SET
                     value      = value + excluded.value,
                     confidence = MIN(1.0, confidence + ?5),
                     updated_at = excluded.updated_at",
                params![key, delta, INITIAL_CONFIDENCE, format_ts(now), CONFIDENCE_STEP],
            )?;
            Ok(())
        })?;
        debug!(key, delta, "reinforced preference");
        Ok(())
    }

    pub fn preference(&self, key: &str) -> Result<Option<Preference>, StoreError> {
        let row = self.db.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT key, value, confidence, updated_at FROM preferences WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?)
        })?;
        row.map(|(key, value, confidence, updated_at)| {
            Ok(Preference {
                key,
                value,
                confidence,
                updated_at: parse_ts(&updated_at)?,
            })
        })
        .transpose()
    }
}
