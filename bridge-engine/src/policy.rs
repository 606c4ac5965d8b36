//! Origin and destination allow-lists
//!
//! Patterns are wildcard strings (`*` and `?`), compared case-insensitively.
//! A pattern containing `://` is matched against the full origin (or URL);
//! anything else is matched against the hostname only.

use crate::settings::BridgeSettings;
use bridge_common::{BridgeError, PolicyKind};
use url::Url;
use wildmatch::WildMatch;

/// Compiled wildcard allow-list
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    patterns: Vec<(String, WildMatch)>,
}

impl AllowList {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .map(|p| p.as_ref().trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .map(|p| {
                let matcher = WildMatch::new(&p);
                (p, matcher)
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Check a page origin such as `https://app.example.com:8443`
    pub fn allows_origin(&self, origin: &str) -> bool {
        let origin = origin.trim().trim_end_matches('/').to_ascii_lowercase();
        let host = Url::parse(&origin)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));

        self.patterns.iter().any(|(pattern, matcher)| {
            if pattern.contains("://") {
                matcher.matches(&origin)
            } else {
                host.as_deref().map(|h| matcher.matches(h)).unwrap_or(false)
            }
        })
    }

    /// Check a destination URL
    pub fn allows_url(&self, url: &Url) -> bool {
        let full = url.as_str().to_ascii_lowercase();
        let origin = url.origin().ascii_serialization().to_ascii_lowercase();
        let host = url.host_str().map(str::to_ascii_lowercase);

        self.patterns.iter().any(|(pattern, matcher)| match pattern.split_once("://") {
            // `https://api.example.com/v1/*` names a path; `https://*.example.com` only an origin
            Some((_, rest)) if rest.contains('/') => matcher.matches(&full),
            Some(_) => matcher.matches(&origin) || matcher.matches(&full),
            None => host.as_deref().map(|h| matcher.matches(h)).unwrap_or(false),
        })
    }
}

/// Origin and destination lists taken from one settings snapshot
#[derive(Debug, Clone, Default)]
pub struct RequestPolicy {
    origins: AllowList,
    destinations: AllowList,
}

impl RequestPolicy {
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            origins: AllowList::new(&settings.allowed_origins),
            destinations: AllowList::new(&settings.allowed_destinations),
        }
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.origins.allows_origin(origin)
    }

    pub fn check_origin(&self, origin: &str) -> Result<(), BridgeError> {
        if self.origin_allowed(origin) {
            Ok(())
        } else {
            Err(BridgeError::policy(PolicyKind::Origin, origin))
        }
    }

    /// Parse the destination and check it; only http(s) is fetchable
    pub fn check_destination(&self, raw_url: &str) -> Result<Url, BridgeError> {
        let url = Url::parse(raw_url).map_err(|e| BridgeError::invalid_request(format!("invalid URL '{}': {}", raw_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BridgeError::invalid_request(format!("unsupported scheme '{}'", url.scheme())));
        }
        self.check_destination_url(&url)?;
        Ok(url)
    }

    /// Destination check for an already parsed URL of any scheme
    pub fn check_destination_url(&self, url: &Url) -> Result<(), BridgeError> {
        if self.destinations.allows_url(url) {
            Ok(())
        } else {
            Err(BridgeError::policy(PolicyKind::Destination, url.as_str()))
        }
    }

    /// Origin first, then destination
    pub fn check(&self, origin: &str, raw_url: &str) -> Result<Url, BridgeError> {
        self.check_origin(origin)?;
        self.check_destination(raw_url)
    }
}
