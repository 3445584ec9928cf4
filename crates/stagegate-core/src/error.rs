//! Core error type for the stagegate engine.
//!
//! `EngineError` is used throughout the core domain (template loading,
//! stores, coordination). Structural errors (`MalformedTemplate`,
//! `CyclicDependency`) abort a run before any step executes; `UnknownRole`
//! is fatal to the specific step that names it. Per-step execution failures
//! are not represented here — they flow through
//! [`crate::recovery::StepFailure`] so the retry controller can classify
//! them.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Malformed template: {0}")]
    MalformedTemplate(String),

    #[error("Cyclic dependency: {0}")]
    CyclicDependency(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
