//! Call shapes accepted from page code

use crate::signal::AbortSignal;
use bridge_common::{BodySource, BridgeMode, BridgeOptions, BridgeError, HeaderList};
use url::Url;

/// Case-insensitive header lookup
pub fn header_get<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Replace every header called `name` (any casing) with one value
pub fn header_set(headers: &mut HeaderList, name: &str, value: &str) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value.to_string()));
}

/// `overrides` win over `base`, compared case-insensitively
pub fn merge_headers(base: &HeaderList, overrides: &HeaderList) -> HeaderList {
    let mut merged: HeaderList = base
        .iter()
        .filter(|(k, _)| !overrides.iter().any(|(o, _)| o.eq_ignore_ascii_case(k)))
        .cloned()
        .collect();
    merged.extend(overrides.iter().cloned());
    merged
}

/// A constructed request object
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub url: String,
    pub method: String,
    pub headers: HeaderList,
    pub body: Option<BodySource>,
    pub signal: Option<AbortSignal>,
    /// Mode recorded by the hooked constructor
    pub bridge_mode: Option<BridgeMode>,
}

impl PageRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HeaderList::new(),
            body: None,
            signal: None,
            bridge_mode: None,
        }
    }

    /// Build a request the way a `Request` constructor would
    pub fn construct(input: FetchInput, init: &RequestInit, location: &Url) -> Result<Self, BridgeError> {
        let url = resolve_url(&input, location)?;
        let base = match input {
            FetchInput::Request(request) => request,
            _ => PageRequest::new(url.as_str()),
        };

        Ok(Self {
            url: url.to_string(),
            method: init.method.clone().unwrap_or(base.method).to_ascii_uppercase(),
            headers: match &init.headers {
                Some(headers) => merge_headers(&base.headers, headers),
                None => base.headers,
            },
            body: init.body.clone().or(base.body),
            signal: init.signal.clone().or(base.signal),
            bridge_mode: None,
        })
    }
}

/// Second argument of a fetch call
#[derive(Debug, Clone, Default)]
pub struct RequestInit {
    pub method: Option<String>,
    pub headers: Option<HeaderList>,
    pub body: Option<BodySource>,
    pub signal: Option<AbortSignal>,
    pub bridge_options: Option<BridgeOptions>,
}

impl RequestInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .get_or_insert_with(HeaderList::new)
            .push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<BodySource>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn bridge_options(mut self, options: BridgeOptions) -> Self {
        self.bridge_options = Some(options);
        self
    }

    pub fn mode(mut self, mode: BridgeMode) -> Self {
        self.bridge_options.get_or_insert_with(BridgeOptions::default).mode = Some(mode);
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.bridge_options.get_or_insert_with(BridgeOptions::default).stream = Some(stream);
        self
    }

    pub fn timeout_ms(mut self, timeout: u64) -> Self {
        self.bridge_options.get_or_insert_with(BridgeOptions::default).timeout = Some(timeout);
        self
    }

    /// Explicit per-call mode override
    pub fn explicit_mode(&self) -> Option<BridgeMode> {
        self.bridge_options.as_ref().and_then(|o| o.mode)
    }
}

/// First argument of a fetch call
#[derive(Debug, Clone)]
pub enum FetchInput {
    Url(String),
    Parsed(Url),
    Request(PageRequest),
}

impl FetchInput {
    pub fn raw_url(&self) -> &str {
        match self {
            FetchInput::Url(url) => url,
            FetchInput::Parsed(url) => url.as_str(),
            FetchInput::Request(request) => &request.url,
        }
    }

    /// Mode metadata carried by a constructed request
    pub fn recorded_mode(&self) -> Option<BridgeMode> {
        match self {
            FetchInput::Request(request) => request.bridge_mode,
            _ => None,
        }
    }
}

impl From<&str> for FetchInput {
    fn from(url: &str) -> Self {
        FetchInput::Url(url.to_string())
    }
}

impl From<String> for FetchInput {
    fn from(url: String) -> Self {
        FetchInput::Url(url)
    }
}

impl From<Url> for FetchInput {
    fn from(url: Url) -> Self {
        FetchInput::Parsed(url)
    }
}

impl From<PageRequest> for FetchInput {
    fn from(request: PageRequest) -> Self {
        FetchInput::Request(request)
    }
}

/// Resolve the input URL against the document location
pub fn resolve_url(input: &FetchInput, location: &Url) -> Result<Url, BridgeError> {
    match input {
        FetchInput::Parsed(url) => Ok(url.clone()),
        other => location
            .join(other.raw_url().trim())
            .map_err(|e| BridgeError::invalid_request(format!("invalid URL '{}': {}", other.raw_url(), e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_headers_overrides_case_insensitively() {
        let base = vec![
            ("Content-Type".to_string(), "text/plain".to_string()),
            ("X-Keep".to_string(), "1".to_string()),
        ];
        let overrides = vec![("content-type".to_string(), "application/json".to_string())];
        let merged = merge_headers(&base, &overrides);
        assert_eq!(header_get(&merged, "CONTENT-TYPE"), Some("application/json"));
        assert_eq!(header_get(&merged, "x-keep"), Some("1"));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_construct_resolves_and_merges() {
        let location = Url::parse("https://app.test/dir/page.html").unwrap();
        let base = PageRequest::construct(
            "api/items".into(),
            &RequestInit::new().method("post").header("X-A", "1"),
            &location,
        )
        .unwrap();
        assert_eq!(base.url, "https://app.test/dir/api/items");
        assert_eq!(base.method, "POST");

        let derived = PageRequest::construct(base.into(), &RequestInit::new().header("x-a", "2"), &location).unwrap();
        assert_eq!(derived.method, "POST");
        assert_eq!(derived.headers, vec![("x-a".to_string(), "2".to_string())]);
    }

    #[test]
    fn test_header_set_replaces() {
        let mut headers = vec![("accept".to_string(), "*/*".to_string())];
        header_set(&mut headers, "Accept", "text/event-stream");
        assert_eq!(headers, vec![("Accept".to_string(), "text/event-stream".to_string())]);
    }

    proptest::proptest! {
        #[test]
        fn prop_overrides_always_win(
            base in proptest::collection::vec(("[a-z]{1,6}", "[a-z0-9]{0,8}"), 0..8),
            overrides in proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,8}", 0..8),
        ) {
            let overrides: HeaderList = overrides.into_iter().map(|(k, v)| (k.to_uppercase(), v)).collect();
            let merged = merge_headers(&base, &overrides);
            for (name, value) in &overrides {
                proptest::prop_assert_eq!(header_get(&merged, name), Some(value.as_str()));
            }
            for entry in base.iter().filter(|(k, _)| !overrides.iter().any(|(o, _)| o.eq_ignore_ascii_case(k))) {
                proptest::prop_assert!(merged.contains(entry));
            }
        }
    }
}
