//! Error types for engine setup and administration
//!
//! Per-request failures are `BridgeError`s and travel back to the page;
//! `EngineError` covers the operations only the host performs.

use crate::settings::SettingsError;
use bridge_common::BridgeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("invalid domain '{0}'")]
    InvalidDomain(String),
}

impl EngineError {
    /// Errors from storage may clear up on retry; the rest will not
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Settings(SettingsError::Read { .. } | SettingsError::Write { .. }) => true,
            EngineError::Settings(SettingsError::Parse(_)) => false,
            EngineError::Bridge(err) => err.is_retryable(),
            EngineError::InvalidDomain(_) => false,
        }
    }
}
