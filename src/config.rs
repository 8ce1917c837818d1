//! Engine configuration

use serde::{Deserialize, Serialize};

/// Configuration for the defragmentation policy engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DefragmentationConfig {
    /// Maximum number of streamed actions allowed to be outstanding at once.
    /// When the cap is reached, `next_action` parks its consumer until a
    /// result is acknowledged.
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,

    /// Chunk size target applied to collections whose catalog record does
    /// not carry a per-collection override.
    #[serde(default = "default_max_chunk_size_bytes")]
    pub default_max_chunk_size_bytes: u64,
}

fn default_max_concurrent_operations() -> usize {
    50
}

fn default_max_chunk_size_bytes() -> u64 {
    128 * 1024 * 1024
}

impl Default for DefragmentationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: default_max_concurrent_operations(),
            default_max_chunk_size_bytes: default_max_chunk_size_bytes(),
        }
    }
}
