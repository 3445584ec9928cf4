//! Run event bus.
//!
//! The coordinator broadcasts a `RunEvent` at every observable transition
//! (step started/finished, gate evaluated, run terminal). External
//! consumers — reporting, CLIs — subscribe; the core never depends on
//! their format, and a bus with no subscribers drops events silently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunStarted,
    StepStarted,
    StepSucceeded,
    StepFailed,
    StepSkipped,
    GateEvaluated,
    ReworkTriggered,
    RunCompleted,
    RunHalted,
    RunAborted,
    RunResumed,
}

/// One observable transition in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_type: RunEventType,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast bus for run events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: RunEvent) {
        tracing::debug!(
            run = %event.run_id,
            event = ?event.event_type,
            step = event.step_id.as_deref().unwrap_or("-"),
            "run event"
        );
        // A send error only means nobody is listening.
        let _ = self.sender.send(event);
    }

    pub fn emit_now(
        &self,
        event_type: RunEventType,
        run_id: &str,
        step_id: Option<&str>,
        data: serde_json::Value,
    ) {
        self.emit(RunEvent {
            event_type,
            run_id: run_id.to_string(),
            step_id: step_id.map(|s| s.to_string()),
            data,
            timestamp: Utc::now(),
        });
    }
}
