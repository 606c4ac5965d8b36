//! Page-side configuration

use bridge_common::constants::{
    HOOK_LOCK_INTERVAL_MS, MAX_BODY_BYTES, REQUEST_TIMEOUT_MS, STATUS_CACHE_TTL_MS, STREAM_HEADERS_TIMEOUT_MS,
};
use bridge_common::BridgeMode;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

/// Mutable per-page settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub mode: BridgeMode,
    /// Re-install hooks that page code overwrote
    pub lock_hooks: bool,
}

/// [`BridgeConfig`] shared by the facade and the hook manager
#[derive(Debug, Clone, Default)]
pub struct SharedConfig(Arc<RwLock<BridgeConfig>>);

impl SharedConfig {
    pub fn new(config: BridgeConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    pub fn get(&self) -> BridgeConfig {
        *self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_mode(&self, mode: BridgeMode) {
        self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner()).mode = mode;
    }

    pub fn set_lock_hooks(&self, lock_hooks: bool) {
        self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner()).lock_hooks = lock_hooks;
    }
}

/// Static settings of one page instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageConfig {
    /// Document location; relative URLs resolve against it
    pub location: Url,
    pub request_timeout_ms: u64,
    pub stream_headers_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub status_ttl_ms: u64,
    pub lock_interval_ms: u64,
}

impl PageConfig {
    pub fn new(location: Url) -> Self {
        Self {
            location,
            request_timeout_ms: REQUEST_TIMEOUT_MS,
            stream_headers_timeout_ms: STREAM_HEADERS_TIMEOUT_MS,
            max_body_bytes: MAX_BODY_BYTES,
            status_ttl_ms: STATUS_CACHE_TTL_MS,
            lock_interval_ms: HOOK_LOCK_INTERVAL_MS,
        }
    }

    /// Serialized origin of the document, e.g. `http://localhost:5173`
    pub fn origin(&self) -> String {
        self.location.origin().ascii_serialization()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stream_headers_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_headers_timeout_ms)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_millis(self.status_ttl_ms)
    }

    pub fn lock_interval(&self) -> Duration {
        Duration::from_millis(self.lock_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_config_is_shared() {
        let config = SharedConfig::default();
        let other = config.clone();
        other.set_mode(BridgeMode::Always);
        assert_eq!(config.get().mode, BridgeMode::Always);
        assert!(!config.get().lock_hooks);
    }

    #[test]
    fn test_origin_drops_path() {
        let page = PageConfig::new(Url::parse("http://localhost:5173/app/index.html").unwrap());
        assert_eq!(page.origin(), "http://localhost:5173");
    }
}
