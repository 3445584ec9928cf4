//! Workflow templates — declarative, versioned step pipelines.
//!
//! A template YAML names an ordered list of steps; each step binds a role
//! to a task, declares where its artefact goes, and optionally names a
//! quality gate, dependencies, and a branch condition:
//!
//! ```text
//! template.yaml ──► TemplateStore::load ──► WorkflowTemplate
//!                                                │
//!                        checklists/*.yaml ──► GateEngine
//!                                                │
//!                                        WorkflowCoordinator
//! ```
//!
//! Templates are immutable after load; the store hands out read-only
//! snapshots and never rereads the source mid-run.

pub mod schema;
pub mod store;

pub use schema::{StepCondition, StepDefinition, StepSpec, TemplateSource, WorkflowTemplate};
pub use store::{TemplateIssue, TemplateStore};
