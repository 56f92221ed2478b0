use serde::{Deserialize, Serialize};

/// Sidecar written next to every stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub content_type: String,
    pub size: usize,
    pub created_at: i64,
}
