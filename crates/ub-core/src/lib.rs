//! Orchestration core for reproducible benchmarking of AI inference
//! services on an HPC cluster: recipes describe containerized server,
//! client, and monitor workloads; lifecycle managers submit them as Slurm
//! jobs, reconcile scheduler and health-check state into per-entity state
//! machines, and track everything in concurrency-safe registries.

pub mod context;
pub mod error;
pub mod models;
pub mod services;

pub use context::OrchestratorContext;
pub use error::{OrchestratorError, Result};
