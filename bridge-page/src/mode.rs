//! Per-call bridge mode resolution

use bridge_common::{BridgeError, BridgeMode};
use url::Url;

/// Explicit override wins, then metadata recorded on the request, then the global mode
pub fn resolve_mode(explicit: Option<BridgeMode>, metadata: Option<BridgeMode>, global: BridgeMode) -> BridgeMode {
    explicit.or(metadata).unwrap_or(global)
}

/// Whether `target` leaves the page's origin
pub fn is_cross_origin(target: &Url, location: &Url) -> bool {
    target.origin() != location.origin()
}

/// Lifecycle of one hooked call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Resolving,
    /// Bridge not used at all
    Direct,
    TryingBridge { may_fall_back: bool },
    Succeeded,
    FallingBack,
    Failed,
}

impl CallState {
    /// Leave `Resolving` once the mode and target are known
    pub fn resolve(mode: BridgeMode, cross_origin: bool) -> Self {
        match mode {
            BridgeMode::Off => CallState::Direct,
            BridgeMode::Always => CallState::TryingBridge { may_fall_back: false },
            BridgeMode::Auto if cross_origin => CallState::TryingBridge { may_fall_back: true },
            BridgeMode::Auto => CallState::Direct,
        }
    }

    /// Next state after the bridge attempt settled
    pub fn on_bridge_result<T>(self, result: &Result<T, BridgeError>) -> Self {
        match (self, result) {
            (CallState::TryingBridge { .. }, Ok(_)) => CallState::Succeeded,
            (CallState::TryingBridge { .. }, Err(e)) if e.is_abort() => CallState::Failed,
            (CallState::TryingBridge { may_fall_back: true }, Err(_)) => CallState::FallingBack,
            (CallState::TryingBridge { may_fall_back: false }, Err(_)) => CallState::Failed,
            (state, _) => state,
        }
    }

    pub fn uses_bridge(&self) -> bool {
        matches!(self, CallState::TryingBridge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_table() {
        use BridgeMode::{Always, Auto, Off};
        let rows = [
            // explicit, metadata, global => expected
            (None, None, Auto, Auto),
            (None, None, Always, Always),
            (None, None, Off, Off),
            (None, Some(Off), Always, Off),
            (None, Some(Always), Off, Always),
            (None, Some(Auto), Off, Auto),
            (Some(Off), Some(Always), Always, Off),
            (Some(Always), None, Off, Always),
            (Some(Auto), Some(Off), Always, Auto),
            (Some(Always), Some(Off), Auto, Always),
            (Some(Off), None, Auto, Off),
        ];
        for (explicit, metadata, global, expected) in rows {
            assert_eq!(
                resolve_mode(explicit, metadata, global),
                expected,
                "explicit={:?} metadata={:?} global={:?}",
                explicit,
                metadata,
                global
            );
        }
    }

    #[test]
    fn test_auto_only_bridges_cross_origin() {
        assert_eq!(CallState::resolve(BridgeMode::Auto, false), CallState::Direct);
        assert_eq!(
            CallState::resolve(BridgeMode::Auto, true),
            CallState::TryingBridge { may_fall_back: true }
        );
        assert_eq!(CallState::resolve(BridgeMode::Off, true), CallState::Direct);
    }

    #[test]
    fn test_always_never_falls_back() {
        let state = CallState::resolve(BridgeMode::Always, false);
        assert!(state.uses_bridge());
        let failed: Result<(), _> = Err(BridgeError::unreachable("gone"));
        assert_eq!(state.on_bridge_result(&failed), CallState::Failed);
    }

    #[test]
    fn test_auto_falls_back_except_on_abort() {
        let state = CallState::resolve(BridgeMode::Auto, true);
        let failed: Result<(), _> = Err(BridgeError::unreachable("gone"));
        let aborted: Result<(), _> = Err(BridgeError::Aborted);
        assert_eq!(state.on_bridge_result(&failed), CallState::FallingBack);
        assert_eq!(state.on_bridge_result(&aborted), CallState::Failed);
        assert_eq!(state.on_bridge_result(&Ok(())), CallState::Succeeded);
    }

    #[test]
    fn test_cross_origin_compares_scheme_host_port() {
        let location = Url::parse("http://localhost:5173/").unwrap();
        assert!(!is_cross_origin(&Url::parse("http://localhost:5173/api").unwrap(), &location));
        assert!(is_cross_origin(&Url::parse("http://localhost:8080/api").unwrap(), &location));
        assert!(is_cross_origin(&Url::parse("https://api.openai.com/").unwrap(), &location));
    }
}
