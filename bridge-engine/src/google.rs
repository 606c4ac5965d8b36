//! Google account access
//!
//! Token storage and the OAuth dance live behind [`GoogleAuthProvider`];
//! the engine only asks for state and access tokens.

use async_trait::async_trait;
use bridge_common::{BridgeError, GoogleState};
use url::Url;

#[async_trait]
pub trait GoogleAuthProvider: Send + Sync {
    /// Sign in (or extend the grant) with the given scopes
    async fn authenticate(&self, scopes: &[String]) -> Result<GoogleState, BridgeError>;

    async fn logout(&self) -> Result<(), BridgeError>;

    async fn state(&self) -> Result<GoogleState, BridgeError>;

    /// Bearer token valid for `scopes`
    async fn access_token(&self, scopes: &[String]) -> Result<String, BridgeError>;
}

/// Provider used when no Google integration is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredGoogle;

#[async_trait]
impl GoogleAuthProvider for UnconfiguredGoogle {
    async fn authenticate(&self, _scopes: &[String]) -> Result<GoogleState, BridgeError> {
        Err(BridgeError::google("not configured"))
    }

    async fn logout(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn state(&self) -> Result<GoogleState, BridgeError> {
        Ok(GoogleState::default())
    }

    async fn access_token(&self, _scopes: &[String]) -> Result<String, BridgeError> {
        Err(BridgeError::google("not configured"))
    }
}

/// Whether every requested scope is granted. Accepts both the short form
/// (`drive.readonly`) and the full `https://www.googleapis.com/auth/...` URL.
pub fn has_scopes(state: &GoogleState, wanted: &[String]) -> bool {
    fn short(scope: &str) -> &str {
        scope.trim().trim_start_matches("https://www.googleapis.com/auth/")
    }
    state.authenticated
        && wanted
            .iter()
            .all(|w| state.scopes.iter().any(|granted| short(granted) == short(w)))
}

/// Google fetch is limited to Google API hosts
pub fn is_google_destination(url: &Url) -> bool {
    url.scheme() == "https"
        && url
            .host_str()
            .map(|h| {
                let h = h.to_ascii_lowercase();
                h == "googleapis.com" || h.ends_with(".googleapis.com") || h == "google.com" || h.ends_with(".google.com")
            })
            .unwrap_or(false)
}
