//! [`MemoryService`] – the transport-agnostic request surface.
//!
//! Owns every memory component over one shared [`MemoryDb`] and maps the four
//! public operations onto them. Each call is synchronous; the server runs
//! them on tokio's blocking pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kuro_memory::{
    AtomStore, DEFAULT_DECAY_INTERVAL, DEFAULT_DECAY_RATE, DEFAULT_MAX_ATOMS_PER_DIMENSION,
    DEFAULT_PRUNING_THRESHOLD, DecayEngine, DimensionManager, MemoryDb, ReinforcementEngine,
    StoreError,
};
use kuro_types::{
    ContextRequest, ContextResponse, HealthStatus, KuroError, MemoryStatus, ProposeMemoryRequest,
    Request, Response, ServingStatus, UpdatePreferenceRequest,
};
use tracing::{error, info, warn};

/// Entity summarised when a context request names none.
pub const DEFAULT_ENTITY: &str = "user";

/// Service name reported by the health check.
pub const SERVICE_NAME: &str = "Memory";

/// Preference values above this count as positive reinforcement.
const POSITIVE_PREFERENCE_CUTOFF: f64 = 0.5;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables for one [`MemoryService`].
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Database file. `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    pub decay_interval: Duration,
    pub default_decay_rate: f64,
    pub max_atoms_per_dimension: usize,
    pub pruning_threshold: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            decay_interval: DEFAULT_DECAY_INTERVAL,
            default_decay_rate: DEFAULT_DECAY_RATE,
            max_atoms_per_dimension: DEFAULT_MAX_ATOMS_PER_DIMENSION,
            pruning_threshold: DEFAULT_PRUNING_THRESHOLD,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryService
// ─────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```rust
/// use kuro_service::{MemoryService, ServiceConfig};
/// use kuro_types::{ContextRequest, ProposeMemoryRequest};
///
/// let service = MemoryService::start(ServiceConfig::default()).unwrap();
/// service.propose_memory(ProposeMemoryRequest {
///     entity_id: "user".into(),
///     dimension: "trust".into(),
///     delta: 0.4,
///     context_hash: "greeting".into(),
///     confidence: 0.8,
/// });
///
/// let ctx = service.get_context(ContextRequest::default()).unwrap();
/// assert_eq!(ctx.memory_summaries, vec!["user: trust=0.40".to_string()]);
/// service.shutdown();
/// ```
pub struct MemoryService {
    config: ServiceConfig,
    store: AtomStore,
    reinforcement: ReinforcementEngine,
    dimensions: DimensionManager,
    decay: DecayEngine,
}

impl MemoryService {
    /// Open the store, run one pruning pass and start the decay engine.
    ///
    /// # Errors
    ///
    /// Returns [`KuroError::Storage`] when the database cannot be opened, the
    /// initial prune fails or the decay thread cannot be spawned.
    pub fn start(config: ServiceConfig) -> Result<Self, KuroError> {
        let db = match &config.db_path {
            Some(path) => MemoryDb::open(path),
            None => {
                warn!("no database path configured; memory will not survive a restart");
                MemoryDb::open_in_memory()
            }
        }
        .map_err(storage_error)?;
        let db = Arc::new(db);

        let service = Self {
            store: AtomStore::new(Arc::clone(&db))
                .with_max_atoms_per_dimension(config.max_atoms_per_dimension)
                .with_decay_rate(config.default_decay_rate),
            reinforcement: ReinforcementEngine::new(Arc::clone(&db)),
            dimensions: DimensionManager::new(Arc::clone(&db))
                .with_threshold(config.pruning_threshold),
            decay: DecayEngine::new(db).with_interval(config.decay_interval),
            config,
        };

        let pruned = service.dimensions.prune_weak_atoms().map_err(storage_error)?;
        service.decay.start().map_err(storage_error)?;
        info!(
            pruned,
            interval_secs = service.config.decay_interval.as_secs(),
            "memory service started"
        );
        Ok(service)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &AtomStore {
        &self.store
    }

    pub fn reinforcement(&self) -> &ReinforcementEngine {
        &self.reinforcement
    }

    pub fn dimensions(&self) -> &DimensionManager {
        &self.dimensions
    }

    pub fn decay(&self) -> &DecayEngine {
        &self.decay
    }

    /// Summaries for the requested entities plus every preference.
    /// An empty entity list means [`DEFAULT_ENTITY`].
    pub fn get_context(&self, request: ContextRequest) -> Result<ContextResponse, StoreError> {
        let entities = if request.entities.is_empty() {
            vec![DEFAULT_ENTITY.to_string()]
        } else {
            request.entities
        };
        Ok(ContextResponse {
            memory_summaries: self.store.summarize(&entities)?,
            preferences: self.store.get_preferences()?,
        })
    }

    pub fn propose_memory(&self, request: ProposeMemoryRequest) -> MemoryStatus {
        match self.store.observe(
            &request.entity_id,
            &request.dimension,
            &request.context_hash,
            request.delta,
            request.confidence,
        ) {
            Ok(()) => MemoryStatus::ok("Memory atom stored."),
            Err(e) => {
                error!(entity_id = %request.entity_id, error = %e, "failed to store memory atom");
                MemoryStatus::failed(e.to_string())
            }
        }
    }

    /// `value > 0.5` reinforces `key` positively, anything else negatively.
    pub fn update_preference(&self, request: UpdatePreferenceRequest) -> MemoryStatus {
        let positive = request.value > POSITIVE_PREFERENCE_CUTOFF;
        match self.reinforcement.reinforce(&request.key, positive) {
            Ok(()) => MemoryStatus::ok(format!("Preference '{}' reinforced.", request.key)),
            Err(e) => {
                error!(key = %request.key, error = %e, "failed to reinforce preference");
                MemoryStatus::failed(e.to_string())
            }
        }
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            service: SERVICE_NAME.to_string(),
            status: ServingStatus::Serving,
            decay_running: self.decay.is_running(),
        }
    }

    /// Dispatch one wire request.
    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::GetContext(req) => match self.get_context(req) {
                Ok(ctx) => Response::Context(ctx),
                Err(e) => {
                    error!(error = %e, "failed to build context");
                    Response::Error {
                        message: storage_error(e).to_string(),
                    }
                }
            },
            Request::ProposeMemory(req) => Response::Status(self.propose_memory(req)),
            Request::UpdatePreference(req) => Response::Status(self.update_preference(req)),
            Request::Health => Response::Health(self.health()),
        }
    }

    /// Stop the decay engine. Safe to call more than once.
    pub fn shutdown(&self) {
        self.decay.stop();
        info!("memory service stopped");
    }
}

fn storage_error(e: StoreError) -> KuroError {
    KuroError::Storage(e.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
