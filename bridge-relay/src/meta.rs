//! Page opt-in signal
//!
//! A document can force-enable the bridge for its domain with
//! `<meta name="bridge" content="enabled">`.

use regex::Regex;
use std::sync::OnceLock;

const META_NAME: &str = "bridge";
const META_ENABLED: &str = "enabled";

fn meta_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<meta\b([^>]*)>").expect("meta tag regex is valid"))
}

fn attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#)
            .expect("attribute regex is valid")
    })
}

fn attribute<'a>(attrs: &'a str, wanted: &str) -> Option<&'a str> {
    attribute_regex().captures_iter(attrs).find_map(|caps| {
        let name = caps.get(1)?.as_str();
        if !name.eq_ignore_ascii_case(wanted) {
            return None;
        }
        caps.get(2).or_else(|| caps.get(3)).or_else(|| caps.get(4)).map(|m| m.as_str())
    })
}

/// Whether `html` carries the opt-in meta tag
pub fn detect_meta_signal(html: &str) -> bool {
    meta_tag_regex().captures_iter(html).any(|caps| {
        let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let named = attribute(attrs, "name")
            .map(|n| n.trim().eq_ignore_ascii_case(META_NAME))
            .unwrap_or(false);
        named
            && attribute(attrs, "content")
                .map(|c| c.trim().eq_ignore_ascii_case(META_ENABLED))
                .unwrap_or(false)
    })
}
