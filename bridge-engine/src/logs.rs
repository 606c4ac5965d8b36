//! Session request log
//!
//! Newest-first ring buffer of [`LogEntry`] records. An entry is pushed when
//! its request starts and updated in place when it completes or fails. Every
//! push and update is also published on a broadcast channel for live viewers,
//! keyed by `request_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use url::Url;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

const BROADCAST_CAPACITY: usize = 256;

/// Replacement for secret-derived header values
pub const REDACTED: &str = "[redacted]";

/// One bridged request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub request_id: String,
    pub ts: DateTime<Utc>,
    pub tab_origin: String,
    pub method: String,
    pub url: String,
    pub request_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogEntry {
    pub fn new(request_id: &str, tab_origin: &str, method: &str, url: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            ts: Utc::now(),
            tab_origin: tab_origin.to_string(),
            method: method.to_string(),
            url: url.to_string(),
            request_headers: BTreeMap::new(),
            request_body_preview: None,
            status: None,
            status_text: None,
            response_headers: None,
            response_body_preview: None,
            elapsed_ms: None,
            error: None,
        }
    }

    /// Record request headers, masking the names in `secret`
    pub fn with_request_headers<'a>(
        mut self,
        headers: impl IntoIterator<Item = &'a (String, String)>,
        is_secret: impl Fn(&str) -> bool,
    ) -> Self {
        self.request_headers = headers
            .into_iter()
            .map(|(k, v)| {
                let value = if is_secret(k) { REDACTED.to_string() } else { v.clone() };
                (k.clone(), value)
            })
            .collect();
        self
    }
}

/// Cut `text` to at most `limit` characters, never splitting a char
pub fn preview(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Preview of raw bytes: text when valid UTF-8, else a size note
pub fn preview_bytes(bytes: &[u8], limit: usize) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => preview(text, limit),
        Err(_) => format!("<{} bytes binary>", bytes.len()),
    }
}

/// `url` with the values of `secret_keys` in its query masked
pub fn redact_query(url: &Url, secret_keys: &[String]) -> String {
    if secret_keys.is_empty() || url.query().is_none() {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let value = if secret_keys.iter().any(|s| s.as_str() == k) {
                REDACTED.to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), value)
        })
        .collect();
    let mut masked = url.clone();
    masked.query_pairs_mut().clear().extend_pairs(pairs);
    masked.to_string()
}

/// Newest-first capped buffer
#[derive(Debug)]
pub struct LogBuffer {
    entries: RwLock<VecDeque<LogEntry>>,
    capacity: RwLock<usize>,
    updates: broadcast::Sender<LogEntry>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: RwLock::new(capacity),
            updates,
        }
    }

    /// Insert an entry at the front, evicting the oldest
    pub async fn push(&self, entry: LogEntry) {
        let capacity = *self.capacity.read().await;
        {
            let mut entries = self.entries.write().await;
            entries.push_front(entry.clone());
            entries.truncate(capacity);
        }
        // No subscribers is fine
        let _ = self.updates.send(entry);
    }

    /// Apply `apply` to the entry of `request_id` and publish the result.
    /// Returns false when the entry is gone (never pushed or evicted).
    pub async fn update(&self, request_id: &str, apply: impl FnOnce(&mut LogEntry)) -> bool {
        let updated = {
            let mut entries = self.entries.write().await;
            match entries.iter_mut().find(|e| e.request_id == request_id) {
                Some(entry) => {
                    apply(entry);
                    entry.clone()
                }
                None => return false,
            }
        };
        let _ = self.updates.send(updated);
        true
    }

    pub async fn set_capacity(&self, capacity: usize) {
        *self.capacity.write().await = capacity;
        self.entries.write().await.truncate(capacity);
    }

    pub async fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.updates.subscribe()
    }
}
