//! Stagegate — a quality-gated workflow orchestration engine.
//!
//! Workflows are YAML templates: an ordered list of steps, each naming an
//! abstract agent role, a task, an artefact destination, and optionally a
//! checklist-backed quality gate. The coordinator drives a run through
//! the step graph with conditional branching, retry-based error recovery,
//! dynamic agent selection, and PASS / CONCERNS / FAIL / WAIVED gate
//! enforcement, persisting every transition so interrupted runs resume
//! from their last committed step boundary.
//!
//! The crate is embedder-facing: register [`registry::StepHandler`]
//! implementations for your roles, hand the coordinator an
//! [`sink::ArtefactSink`], and start runs against loaded templates.

pub mod conditions;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod events;
pub mod gate;
pub mod models;
pub mod recovery;
pub mod registry;
pub mod sink;
pub mod store;
pub mod template;

// Convenience re-exports
pub use config::EngineConfig;
pub use coordinator::WorkflowCoordinator;
pub use db::Database;
pub use error::EngineError;
