//! Bridge Engine Library
//!
//! The privileged tier of the bridge: origin and destination policy, secret
//! injection, the real network calls (buffered, streamed and WebSocket) and
//! the session request log.

pub mod aborts;
pub mod engine;
pub mod executor;
pub mod google;
pub mod injection;
pub mod logs;
pub mod socket;
pub mod status;
pub mod stream;

/// Configuration types and utilities
pub mod config;

/// Persisted bridge policy
pub mod settings;

/// Allow-list matching
pub mod policy;

/// Error types for engine administration
pub mod error;

pub use aborts::AbortRegistry;
pub use config::EngineConfig;
pub use engine::{Authorization, Engine, EngineHandle};
pub use error::EngineError;
pub use executor::HttpExecutor;
pub use google::{GoogleAuthProvider, UnconfiguredGoogle};
pub use injection::{apply_injection_rules, expand_template};
pub use logs::{LogBuffer, LogEntry};
pub use policy::{AllowList, RequestPolicy};
pub use settings::{
    normalize_settings, BridgeSettings, DomainPreference, InjectionRule, JsonFileSettingsStore, MemorySettingsStore,
    SettingsError, SettingsStore,
};
pub use status::resolve_status;

/// Result type alias for engine administration
pub type Result<T> = std::result::Result<T, EngineError>;
