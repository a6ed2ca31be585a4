//! Stagehand supervises a small stack of locally-run services: it finds a
//! bindable port for each one (reclaiming ports held by stale processes
//! when it has to), starts the services in dependency order behind health
//! gates, holds the stack while it runs, and tears everything down in
//! reverse order on shutdown or failure.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared timing and naming constants.
pub mod constants;

/// Error handling.
pub mod error;

/// Health gating and readiness probes.
pub mod health;

/// Platform-specific process and port inspection.
pub mod inspect;

/// The orchestration engine.
pub mod orchestrator;

/// Captured child output.
pub mod output;

/// Port probing and ownership classification.
pub mod ports;

/// Port reclamation.
pub mod reaper;

/// State directory layout.
pub mod runtime;

/// Supervised service processes.
pub mod service;

/// Shared helpers for tests.
pub mod test_utils;
