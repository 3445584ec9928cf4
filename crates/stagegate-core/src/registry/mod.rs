//! Agent registry — maps abstract roles to executable step handlers.
//!
//! Any type implementing [`StepHandler`] can be registered under one or
//! more roles; the registry owns the handles and their rolling performance
//! stats. When several handlers satisfy a role, selection tie-breaks by
//! (a) fewest failures in the trailing window, (b) lowest average latency,
//! (c) registration order. Stats updates are atomic per handle; handles
//! never observe each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::recovery::StepFailure;

/// Outcomes remembered for the failure tie-break.
const TRAILING_WINDOW: usize = 20;

/// Execution context handed to a step handler.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: String,
    pub step_id: String,
    /// Task identifier from the template step.
    pub task: String,
    pub output_path: String,
    pub round: u32,
    /// 1-based attempt number (retries increment this).
    pub attempt: u32,
    /// Run-level key/value context.
    pub variables: HashMap<String, String>,
    /// Outputs of completed steps, keyed by step id.
    pub prior_outputs: HashMap<String, String>,
}

/// What a handler produced for one step execution.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    /// Artefact body to be published under the step's output path.
    pub content: String,
}

/// The capability contract a role handler implements.
///
/// Handlers report failures through [`StepFailure`] so the recovery
/// controller can tell transient from fatal; they should tolerate
/// re-execution of a step that was in flight when the process died.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, ctx: StepContext) -> Result<HandlerOutput, StepFailure>;
}

#[derive(Debug, Default)]
struct RollingStats {
    success_count: u64,
    failure_count: u64,
    total_latency_ms: u64,
    /// Most recent outcomes, `true` for success. Bounded to
    /// [`TRAILING_WINDOW`] entries.
    window: std::collections::VecDeque<bool>,
}

impl RollingStats {
    fn record(&mut self, success: bool, latency: Duration) {
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.total_latency_ms += latency.as_millis() as u64;
        self.window.push_back(success);
        while self.window.len() > TRAILING_WINDOW {
            self.window.pop_front();
        }
    }

    fn recent_failures(&self) -> usize {
        self.window.iter().filter(|ok| !**ok).count()
    }

    fn average_latency_ms(&self) -> u64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0
        } else {
            self.total_latency_ms / total
        }
    }
}

/// A registered handler plus its rolling performance stats.
pub struct AgentHandle {
    pub id: String,
    pub roles: Vec<String>,
    registration_order: u64,
    handler: Arc<dyn StepHandler>,
    stats: Mutex<RollingStats>,
}

impl AgentHandle {
    pub fn handler(&self) -> Arc<dyn StepHandler> {
        self.handler.clone()
    }

    /// (success count, failure count, average latency ms) snapshot.
    pub fn stats_snapshot(&self) -> (u64, u64, u64) {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        (
            stats.success_count,
            stats.failure_count,
            stats.average_latency_ms(),
        )
    }

    fn selection_key(&self) -> (usize, u64, u64) {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        (
            stats.recent_failures(),
            stats.average_latency_ms(),
            self.registration_order,
        )
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("roles", &self.roles)
            .finish()
    }
}

/// Registration summary (which roles are covered, by how many handlers).
#[derive(Debug, Clone)]
pub struct RegistrationStatus {
    pub total_handles: usize,
    pub handles_per_role: HashMap<String, usize>,
}

/// Role-to-handler registry with rolling per-handle stats.
#[derive(Default)]
pub struct AgentRegistry {
    inner: tokio::sync::RwLock<Vec<Arc<AgentHandle>>>,
    next_order: AtomicU64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the given roles.
    pub async fn register(
        &self,
        id: &str,
        roles: &[&str],
        handler: Arc<dyn StepHandler>,
    ) -> Arc<AgentHandle> {
        let handle = Arc::new(AgentHandle {
            id: id.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            registration_order: self.next_order.fetch_add(1, Ordering::Relaxed),
            handler,
            stats: Mutex::new(RollingStats::default()),
        });
        self.inner.write().await.push(handle.clone());
        tracing::debug!(agent = %id, roles = ?roles, "agent registered");
        handle
    }

    /// Resolve a role to its best handle, applying the selection
    /// tie-break when several handlers satisfy the role.
    pub async fn resolve(&self, role: &str) -> Result<Arc<AgentHandle>, EngineError> {
        let candidates = self.candidates(role).await;
        Self::select(candidates).ok_or_else(|| {
            EngineError::UnknownRole(format!("no handler registered for role '{}'", role))
        })
    }

    /// All handles registered for `role`, in registration order.
    pub async fn candidates(&self, role: &str) -> Vec<Arc<AgentHandle>> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|h| h.roles.iter().any(|r| r == role))
            .cloned()
            .collect()
    }

    /// Deterministic tie-break over a candidate list.
    pub fn select(candidates: Vec<Arc<AgentHandle>>) -> Option<Arc<AgentHandle>> {
        candidates.into_iter().min_by_key(|h| h.selection_key())
    }

    /// Update a handle's rolling stats after a step execution.
    /// The handle's own mutex makes the increment atomic; no other handle
    /// is touched.
    pub fn record_outcome(&self, handle: &AgentHandle, success: bool, latency: Duration) {
        let mut stats = handle.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.record(success, latency);
    }

    pub async fn registration_status(&self) -> RegistrationStatus {
        let handles = self.inner.read().await;
        let mut per_role: HashMap<String, usize> = HashMap::new();
        for handle in handles.iter() {
            for role in &handle.roles {
                *per_role.entry(role.clone()).or_default() += 1;
            }
        }
        RegistrationStatus {
            total_handles: handles.len(),
            handles_per_role: per_role,
        }
    }

    /// Drop every registered handle. Handles are never removed during a
    /// run; this is the only removal point.
    pub async fn reset(&self) {
        self.inner.write().await.clear();
    }
}
