//! Library configuration.

use serde::{Deserialize, Serialize};

use crate::error_policy::ErrorHandling;

/// Default Box target block size in bytes.
pub const DEFAULT_BOX_BLOCKSIZE: usize = 1 << 20;
/// Default size of the shared staging pool in bytes.
pub const DEFAULT_BUFFER_POOL_BYTES: usize = 64 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PioConfig {
    /// Target bytes per IO task when the Box rearranger splits an array.
    pub box_blocksize: usize,
    /// Error handling given to new IOSystems.
    pub default_error_handling: ErrorHandling,
    /// Bytes reserved for the staging pool while any IOSystem is open.
    pub buffer_pool_bytes: usize,
    /// Write every new decomposition map through the storage backend.
    pub save_decomps: bool,
    /// File-name prefix for saved decomposition maps.
    pub decomp_file_prefix: String,
}

impl Default for PioConfig {
    fn default() -> Self {
        Self {
            box_blocksize: DEFAULT_BOX_BLOCKSIZE,
            default_error_handling: ErrorHandling::Internal,
            buffer_pool_bytes: DEFAULT_BUFFER_POOL_BYTES,
            save_decomps: false,
            decomp_file_prefix: "piodecomp".to_string(),
        }
    }
}

impl PioConfig {
    /// Configuration that reports errors to the caller instead of aborting.
    pub fn returning_errors() -> Self {
        Self {
            default_error_handling: ErrorHandling::Return,
            ..Self::default()
        }
    }
}
