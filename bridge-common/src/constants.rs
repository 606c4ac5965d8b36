//! Numeric constants shared by all tiers

/// Version reported in `BridgeStatus`
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current persisted settings schema version
pub const SETTINGS_VERSION: u32 = 2;

/// Page-side deadline for a non-streaming call
pub const REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Engine-side hard deadline for the real network call.
/// Shorter than the page deadline so the engine reports its own timeout first.
pub const ENGINE_FETCH_TIMEOUT_MS: u64 = 25_000;

/// Page-side deadline for the `headers` event of a streaming call
pub const STREAM_HEADERS_TIMEOUT_MS: u64 = 20_000;

/// Largest request or response body carried across the bridge (5 MiB)
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

pub const MIN_LOGS_LIMIT: usize = 10;
pub const MAX_LOGS_LIMIT: usize = 1000;
pub const DEFAULT_MAX_LOGS: usize = 200;

/// Body previews in log entries are cut to this many characters
pub const PREVIEW_LIMIT: usize = 2048;

/// How long a resolved domain status stays fresh on the page side
pub const STATUS_CACHE_TTL_MS: u64 = 5_000;

/// Buffer size of a port; a full port suspends the producer
pub const PORT_BUFFER: usize = 64;

/// Interval at which locked hooks are re-asserted
pub const HOOK_LOCK_INTERVAL_MS: u64 = 50;
