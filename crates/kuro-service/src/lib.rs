//! `kuro-service` – the memory daemon's service layer.
//!
//! # Modules
//!
//! - [`service`] – [`MemoryService`]: owns the memory components over one
//!   shared store and answers `GetContext`, `ProposeMemory`,
//!   `UpdatePreference` and `Health`.
//! - [`server`] – [`MemoryServer`]: tokio TCP listener speaking
//!   newline-delimited JSON with a bounded worker pool.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: log and span
//!   export set-up.

pub mod server;
pub mod service;
pub mod telemetry;

pub use server::{DEFAULT_MAX_WORKERS, DEFAULT_PORT, MemoryServer};
pub use service::{DEFAULT_ENTITY, MemoryService, ServiceConfig};
