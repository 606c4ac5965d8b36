//! Secret injection
//!
//! Rules add headers and query parameters built from `${NAME}` templates
//! over the settings `env`. A rule never overwrites something the caller
//! already set, and a value that expands to blank is not injected.

use crate::settings::InjectionRule;
use bridge_common::HeaderList;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;
use url::Url;
use wildmatch::WildMatch;

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("template regex is valid"))
}

/// Expand `${NAME}` placeholders; unknown names expand to the empty string
pub fn expand_template(template: &str, env: &BTreeMap<String, String>) -> String {
    template_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            env.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// What a rule pass added, by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Injected {
    pub headers: Vec<String>,
    pub query: Vec<String>,
}

impl Injected {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.query.is_empty()
    }

    /// Whether a header value came from a secret
    pub fn is_injected_header(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.eq_ignore_ascii_case(name))
    }
}

fn rule_matches(rule: &InjectionRule, host: &str) -> bool {
    WildMatch::new(&rule.host_pattern.to_ascii_lowercase()).matches(host)
}

/// Apply every rule whose host pattern matches `url`
pub fn apply_injection_rules(
    rules: &[InjectionRule],
    env: &BTreeMap<String, String>,
    url: &mut Url,
    headers: &mut HeaderList,
) -> Injected {
    let mut injected = Injected::default();
    let host = match url.host_str() {
        Some(host) => host.to_ascii_lowercase(),
        None => return injected,
    };

    for rule in rules.iter().filter(|r| rule_matches(r, &host)) {
        for (name, template) in &rule.inject_headers {
            if headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name)) {
                continue;
            }
            let value = expand_template(template, env);
            if value.trim().is_empty() {
                debug!("Skipping header {} for {}: template expanded to blank", name, host);
                continue;
            }
            headers.push((name.clone(), value));
            injected.headers.push(name.clone());
        }

        for (key, template) in &rule.inject_query {
            if url.query_pairs().any(|(k, _)| k == key.as_str()) {
                continue;
            }
            let value = expand_template(template, env);
            if value.trim().is_empty() {
                continue;
            }
            url.query_pairs_mut().append_pair(key, &value);
            injected.query.push(key.clone());
        }
    }

    if !injected.is_empty() {
        debug!(
            "Injected headers {:?} and query {:?} for {}",
            injected.headers, injected.query, host
        );
    }
    injected
}
