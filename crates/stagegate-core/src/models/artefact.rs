//! Artefacts produced by step handlers.
//!
//! An artefact is immutable once created; rework supersedes it with a new
//! artefact under a higher round number. The content hash is what gate
//! idempotence keys off: same content, same checklist, same verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content blob plus provenance metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artefact {
    /// Step that produced this artefact.
    pub step_id: String,
    /// Rework round it was produced in.
    pub round: u32,
    /// Path-addressed destination for the sink.
    pub output_path: String,
    pub content: String,
    /// Hex-encoded SHA-256 of the content.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Artefact {
    pub fn new(step_id: &str, round: u32, output_path: &str, content: String) -> Self {
        let content_hash = hash_content(&content);
        Self {
            step_id: step_id.to_string(),
            round,
            output_path: output_path.to_string(),
            content,
            content_hash,
            created_at: Utc::now(),
        }
    }
}

fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_for_identical_content() {
        let a = Artefact::new("s1", 0, "docs/prd.md", "# PRD".to_string());
        let b = Artefact::new("s1", 1, "docs/prd.md", "# PRD".to_string());
        assert_eq!(a.content_hash, b.content_hash);

        let c = Artefact::new("s1", 0, "docs/prd.md", "# PRD v2".to_string());
        assert_ne!(a.content_hash, c.content_hash);
    }
}
