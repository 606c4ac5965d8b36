//! Configuration types and utilities

use bridge_common::constants::{ENGINE_FETCH_TIMEOUT_MS, MAX_BODY_BYTES, PREVIEW_LIMIT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static engine configuration
/// These settings are set at startup and do not change during runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard deadline for a buffered network call
    pub fetch_timeout_ms: u64,
    /// Ceiling for request and response bodies
    pub max_body_bytes: usize,
    /// Body previews in log entries are cut to this many characters
    pub preview_limit: usize,
    /// User agent sent when the request carries none
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: ENGINE_FETCH_TIMEOUT_MS,
            max_body_bytes: MAX_BODY_BYTES,
            preview_limit: PREVIEW_LIMIT,
            user_agent: format!("franzai-bridge/{}", bridge_common::constants::BRIDGE_VERSION),
        }
    }
}

impl EngineConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}
