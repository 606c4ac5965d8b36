//! Persisted bridge policy
//!
//! `BridgeSettings` is the only policy source of the engine. It is read
//! through a [`SettingsStore`] and always normalized on load, so a store
//! never hands out an out-of-range or stale-schema value.

use async_trait::async_trait;
use bridge_common::constants::{DEFAULT_MAX_LOGS, MAX_LOGS_LIMIT, MIN_LOGS_LIMIT, SETTINGS_VERSION};
use bridge_common::DomainSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Errors raised while loading or saving settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write settings to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Adds secret-derived headers/query parameters to matching requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionRule {
    /// Hostname wildcard, e.g. `api.openai.com` or `*.example.com`
    pub host_pattern: String,
    /// Header name → template such as `Bearer ${OPENAI_API_KEY}`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inject_headers: BTreeMap<String, String>,
    /// Query key → template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inject_query: BTreeMap<String, String>,
}

impl InjectionRule {
    pub fn header(host_pattern: &str, name: &str, template: &str) -> Self {
        let mut inject_headers = BTreeMap::new();
        inject_headers.insert(name.to_string(), template.to_string());
        Self {
            host_pattern: host_pattern.to_string(),
            inject_headers,
            inject_query: BTreeMap::new(),
        }
    }
}

/// User override of whether a domain uses the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainPreference {
    pub enabled: bool,
    #[serde(default = "default_preference_source")]
    pub source: DomainSource,
}

fn default_preference_source() -> DomainSource {
    DomainSource::User
}

/// Persisted policy object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    /// Missing in documents written before versioning; reads as 0
    #[serde(default)]
    pub settings_version: u32,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_destinations: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub injection_rules: Vec<InjectionRule>,
    #[serde(default = "default_max_logs")]
    pub max_logs: usize,
    #[serde(default)]
    pub domain_preferences: BTreeMap<String, DomainPreference>,
}

fn default_max_logs() -> usize {
    DEFAULT_MAX_LOGS
}

impl Default for BridgeSettings {
    fn default() -> Self {
        let env = ["OPENAI_API_KEY", "ANTHROPIC_API_KEY", "GOOGLE_API_KEY", "MISTRAL_API_KEY"]
            .iter()
            .map(|k| (k.to_string(), String::new()))
            .collect();

        Self {
            settings_version: SETTINGS_VERSION,
            allowed_origins: vec![
                "http://localhost".to_string(),
                "http://localhost:*".to_string(),
                "http://127.0.0.1:*".to_string(),
            ],
            allowed_destinations: vec![
                "api.openai.com".to_string(),
                "api.anthropic.com".to_string(),
                "generativelanguage.googleapis.com".to_string(),
                "api.mistral.ai".to_string(),
            ],
            env,
            injection_rules: default_injection_rules(),
            max_logs: DEFAULT_MAX_LOGS,
            domain_preferences: BTreeMap::new(),
        }
    }
}

/// Rules shipped with the current settings version
pub fn default_injection_rules() -> Vec<InjectionRule> {
    let mut anthropic = InjectionRule::header("api.anthropic.com", "x-api-key", "${ANTHROPIC_API_KEY}");
    anthropic
        .inject_headers
        .insert("anthropic-version".to_string(), "2023-06-01".to_string());

    vec![
        InjectionRule::header("api.openai.com", "Authorization", "Bearer ${OPENAI_API_KEY}"),
        anthropic,
        InjectionRule::header("generativelanguage.googleapis.com", "x-goog-api-key", "${GOOGLE_API_KEY}"),
        InjectionRule::header("api.mistral.ai", "Authorization", "Bearer ${MISTRAL_API_KEY}"),
    ]
}

/// Order-preserving trim + dedupe, dropping empty entries
fn clean_patterns(patterns: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let trimmed = pattern.trim();
        if !trimmed.is_empty() && !out.iter().any(|p| p == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Bring an older document to the current schema.
///
/// Everything resets to defaults except the secrets, user-added injection
/// rules (rules whose host is not covered by a default rule) and domain
/// preferences.
pub fn migrate_settings(old: BridgeSettings) -> BridgeSettings {
    let defaults = BridgeSettings::default();
    info!(
        "Migrating settings from version {} to {}",
        old.settings_version, SETTINGS_VERSION
    );

    let mut env = defaults.env.clone();
    env.extend(old.env);

    let mut injection_rules = defaults.injection_rules.clone();
    let custom = old.injection_rules.into_iter().filter(|rule| {
        !defaults
            .injection_rules
            .iter()
            .any(|d| d.host_pattern.eq_ignore_ascii_case(rule.host_pattern.trim()))
    });
    injection_rules.extend(custom);

    BridgeSettings {
        env,
        injection_rules,
        domain_preferences: old.domain_preferences,
        ..defaults
    }
}

/// Validate and canonicalize a settings document. Idempotent.
pub fn normalize_settings(settings: BridgeSettings) -> BridgeSettings {
    let settings = if settings.settings_version != SETTINGS_VERSION {
        migrate_settings(settings)
    } else {
        settings
    };

    let env = settings
        .env
        .into_iter()
        .filter_map(|(k, v)| {
            let key = k.trim().to_string();
            (!key.is_empty()).then_some((key, v))
        })
        .collect();

    let injection_rules = settings
        .injection_rules
        .into_iter()
        .filter_map(|mut rule| {
            rule.host_pattern = rule.host_pattern.trim().to_string();
            (!rule.host_pattern.is_empty()).then_some(rule)
        })
        .collect();

    let domain_preferences = settings
        .domain_preferences
        .into_iter()
        .filter_map(|(domain, pref)| {
            let domain = domain.trim().to_ascii_lowercase();
            (!domain.is_empty()).then_some((domain, pref))
        })
        .collect();

    BridgeSettings {
        settings_version: SETTINGS_VERSION,
        allowed_origins: clean_patterns(&settings.allowed_origins),
        allowed_destinations: clean_patterns(&settings.allowed_destinations),
        env,
        injection_rules,
        max_logs: settings.max_logs.clamp(MIN_LOGS_LIMIT, MAX_LOGS_LIMIT),
        domain_preferences,
    }
}

/// Storage for the settings document
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Load normalized settings; a missing document yields defaults
    async fn load(&self) -> Result<BridgeSettings, SettingsError>;

    async fn save(&self, settings: &BridgeSettings) -> Result<(), SettingsError>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: RwLock<Option<BridgeSettings>>,
}

impl MemorySettingsStore {
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            settings: RwLock::new(Some(settings)),
        }
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self) -> Result<BridgeSettings, SettingsError> {
        let stored = self.settings.read().await.clone().unwrap_or_default();
        Ok(normalize_settings(stored))
    }

    async fn save(&self, settings: &BridgeSettings) -> Result<(), SettingsError> {
        *self.settings.write().await = Some(normalize_settings(settings.clone()));
        Ok(())
    }
}

/// JSON document on disk
#[derive(Debug, Clone)]
pub struct JsonFileSettingsStore {
    path: PathBuf,
}

impl JsonFileSettingsStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsStore for JsonFileSettingsStore {
    async fn load(&self) -> Result<BridgeSettings, SettingsError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", self.path.display());
                return Ok(BridgeSettings::default());
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let settings: BridgeSettings = serde_json::from_str(&raw)?;
        let normalized = normalize_settings(settings.clone());
        if normalized != settings {
            warn!("Settings at {} were normalized on load", self.path.display());
        }
        Ok(normalized)
    }

    async fn save(&self, settings: &BridgeSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SettingsError::Write {
                    path: self.path.clone(),
                    source,
                })?;
        }

        let json = serde_json::to_string_pretty(&normalize_settings(settings.clone()))?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|source| SettingsError::Write {
                path: self.path.clone(),
                source,
            })
    }
}
