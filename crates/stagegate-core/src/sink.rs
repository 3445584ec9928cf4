//! Artefact sink — where produced documents go.
//!
//! The core emits `(path, content)` pairs and never reads them back; gate
//! evaluation re-presents the in-run [`crate::models::Artefact`] value.
//! Real file-system or remote sinks are the embedder's concern; the
//! in-memory sink here backs tests and embedded use.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::models::Artefact;

/// Path-addressed write target for artefacts.
#[async_trait]
pub trait ArtefactSink: Send + Sync {
    async fn publish(&self, artefact: &Artefact) -> Result<(), EngineError>;
}

/// Collects artefacts in memory, last write per path wins.
#[derive(Default)]
pub struct MemorySink {
    written: Mutex<HashMap<String, String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.written.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtefactSink for MemorySink {
    async fn publish(&self, artefact: &Artefact) -> Result<(), EngineError> {
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(artefact.output_path.clone(), artefact.content.clone());
        Ok(())
    }
}
