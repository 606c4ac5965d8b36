//! Per-domain status resolution

use crate::policy::RequestPolicy;
use crate::settings::BridgeSettings;
use bridge_common::constants::BRIDGE_VERSION;
use bridge_common::{BridgeStatus, DomainSource, SenderInfo};

/// Resolve whether the bridge is enabled for `sender`.
///
/// Precedence: stored domain preference, then the page's meta opt-in, then
/// the allowed-origins list. A meta opt-in enables the hooks but does not
/// bypass the origin check applied to each request.
pub fn resolve_status(settings: &BridgeSettings, sender: &SenderInfo, meta_enabled: bool) -> BridgeStatus {
    let policy = RequestPolicy::from_settings(settings);
    let origin_allowed = policy.origin_allowed(&sender.origin);
    let preference = sender
        .hostname()
        .and_then(|host| settings.domain_preferences.get(&host).cloned());

    let (domain_enabled, domain_source) = match preference {
        Some(pref) => (pref.enabled, pref.source),
        None if meta_enabled => (true, DomainSource::Meta),
        None if origin_allowed => (true, DomainSource::Default),
        None => (false, DomainSource::None),
    };

    let has_api_keys = settings.env.values().any(|v| !v.trim().is_empty());
    let ready = domain_enabled && origin_allowed;
    let reason = if !domain_enabled {
        Some(format!("Bridge is disabled for {}", sender.origin))
    } else if !origin_allowed {
        Some(format!("Origin {} is not in the allowed origins", sender.origin))
    } else {
        None
    };

    BridgeStatus {
        installed: true,
        version: BRIDGE_VERSION.to_string(),
        domain_enabled,
        domain_source,
        origin_allowed,
        has_api_keys,
        ready,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::DomainPreference;

    #[test]
    fn test_default_source_from_allowed_origin() {
        let status = resolve_status(&BridgeSettings::default(), &SenderInfo::new("http://localhost:5173"), false);
        assert!(status.installed);
        assert!(status.domain_enabled);
        assert_eq!(status.domain_source, DomainSource::Default);
        assert!(status.ready);
        assert!(!status.has_api_keys);
        assert_eq!(status.reason, None);
    }

    #[test]
    fn test_meta_enables_but_origin_still_checked() {
        let status = resolve_status(&BridgeSettings::default(), &SenderInfo::new("https://site.test"), true);
        assert!(status.domain_enabled);
        assert_eq!(status.domain_source, DomainSource::Meta);
        assert!(!status.origin_allowed);
        assert!(!status.ready);
        assert!(status.reason.is_some());
    }

    #[test]
    fn test_user_preference_wins() {
        let mut settings = BridgeSettings::default();
        settings.domain_preferences.insert(
            "localhost".to_string(),
            DomainPreference {
                enabled: false,
                source: DomainSource::User,
            },
        );
        settings.env.insert("OPENAI_API_KEY".to_string(), "sk".to_string());

        let status = resolve_status(&settings, &SenderInfo::new("http://localhost:5173"), true);
        assert!(!status.domain_enabled);
        assert_eq!(status.domain_source, DomainSource::User);
        assert!(status.has_api_keys);
        assert!(!status.ready);
    }

    #[test]
    fn test_unknown_origin_is_disabled() {
        let status = resolve_status(&BridgeSettings::default(), &SenderInfo::new("https://unknown.test"), false);
        assert!(!status.domain_enabled);
        assert_eq!(status.domain_source, DomainSource::None);
    }
}
