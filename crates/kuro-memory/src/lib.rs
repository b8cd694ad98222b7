//! `kuro-memory` – The Memory Substrate.
//!
//! Persistent, self-decaying associative memory for conversational agents,
//! backed by a local SQLite database in WAL mode.
//!
//! # Modules
//!
//! - [`db`] – [`MemoryDb`]: one serialized writer connection plus a small
//!   pool of read-only connections, schema bootstrap and timestamp encoding.
//! - [`atoms`] – [`AtomStore`]: merges signed observations into memory atoms,
//!   enforces the per-dimension cap and renders context summaries.
//! - [`decay`] – [`DecayEngine`]: background sweep that attenuates every atom
//!   exponentially by elapsed time and deletes immaterial ones.
//! - [`reinforcement`] – [`ReinforcementEngine`]: additive feedback on named
//!   preferences with a bounded confidence.
//! - [`dimensions`] – [`DimensionManager`]: threshold pruning and per-dimension
//!   reporting.

pub mod atoms;
pub mod db;
pub mod decay;
pub mod dimensions;
pub mod reinforcement;

pub use atoms::{AtomStore, DEFAULT_DECAY_RATE, DEFAULT_MAX_ATOMS_PER_DIMENSION};
pub use db::{MemoryDb, StoreError};
pub use decay::{
    DEFAULT_DECAY_INTERVAL, DecayEngine, DecayState, MATERIALITY_THRESHOLD, SweepReport,
    decayed_magnitude,
};
pub use dimensions::{DEFAULT_PRUNING_THRESHOLD, DimensionManager};
pub use reinforcement::{DEFAULT_REINFORCEMENT_MAGNITUDE, ReinforcementEngine};
