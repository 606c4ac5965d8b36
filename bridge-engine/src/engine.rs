//! The privileged tier
//!
//! [`Engine`] owns settings, the log buffer and the HTTP client. It answers
//! one-shot runtime messages directly; stream and socket ports are served by
//! [`crate::stream`] and [`crate::socket`]. [`EngineHandle`] exposes all of it
//! to a relay as a [`RuntimeChannel`].

use crate::aborts::AbortRegistry;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::{BufferedResponse, HttpExecutor, PreparedRequest};
use crate::google::{has_scopes, is_google_destination, GoogleAuthProvider, UnconfiguredGoogle};
use crate::injection::{apply_injection_rules, Injected};
use crate::logs::{preview, preview_bytes, redact_query, LogBuffer, LogEntry};
use crate::policy::RequestPolicy;
use crate::settings::{normalize_settings, BridgeSettings, DomainPreference, SettingsStore};
use crate::status::resolve_status;
use async_trait::async_trait;
use bridge_common::codec::{decode_body, encode_response_body};
use bridge_common::constants::PORT_BUFFER;
use bridge_common::{
    port_pair, BridgeError, DomainSource, FetchEnvelope, GoogleCall, LiteRequest, Port, PolicyKind, ResponseRecord,
    RuntimeChannel, RuntimeMessage, RuntimeReply, SenderInfo, SocketCommand, SocketEvent, StreamCommand, StreamEvent,
    WireBody,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// How a request is authorized before it is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// Destination allow-list plus injection rules
    Standard,
    /// Google API hosts with the signed-in user's bearer token
    Google,
}

/// A request ready to send plus what was injected into it
#[derive(Debug, Clone)]
pub struct Prepared {
    pub request: PreparedRequest,
    pub injected: Injected,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn SettingsStore>,
    settings: RwLock<BridgeSettings>,
    logs: Arc<LogBuffer>,
    executor: HttpExecutor,
    aborts: AbortRegistry,
    google: Arc<dyn GoogleAuthProvider>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("in_flight", &self.aborts.len())
            .finish()
    }
}

impl Engine {
    /// Load settings from `store` and build the engine
    pub async fn new(config: EngineConfig, store: Arc<dyn SettingsStore>) -> Result<Self, EngineError> {
        let settings = store.load().await?;
        let executor = HttpExecutor::new(config.clone())?;
        info!(
            "Engine ready: {} allowed origins, {} allowed destinations, {} injection rules",
            settings.allowed_origins.len(),
            settings.allowed_destinations.len(),
            settings.injection_rules.len()
        );

        Ok(Self {
            logs: Arc::new(LogBuffer::new(settings.max_logs)),
            settings: RwLock::new(settings),
            config,
            store,
            executor,
            aborts: AbortRegistry::new(),
            google: Arc::new(UnconfiguredGoogle),
        })
    }

    pub fn with_google(mut self, provider: Arc<dyn GoogleAuthProvider>) -> Self {
        self.google = provider;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn logs(&self) -> Arc<LogBuffer> {
        self.logs.clone()
    }

    pub fn aborts(&self) -> &AbortRegistry {
        &self.aborts
    }

    pub fn executor(&self) -> &HttpExecutor {
        &self.executor
    }

    pub async fn settings(&self) -> BridgeSettings {
        self.settings.read().await.clone()
    }

    /// Normalize, persist and apply new settings
    pub async fn update_settings(&self, settings: BridgeSettings) -> Result<BridgeSettings, EngineError> {
        let settings = normalize_settings(settings);
        self.store.save(&settings).await?;
        self.logs.set_capacity(settings.max_logs).await;
        *self.settings.write().await = settings.clone();
        info!("Settings updated");
        Ok(settings)
    }

    /// Re-read settings from the store
    pub async fn reload_settings(&self) -> Result<BridgeSettings, EngineError> {
        let settings = self.store.load().await?;
        self.logs.set_capacity(settings.max_logs).await;
        *self.settings.write().await = settings.clone();
        Ok(settings)
    }

    /// Record a user choice for one hostname; `None` forgets it
    pub async fn set_domain_preference(&self, domain: &str, enabled: Option<bool>) -> Result<(), EngineError> {
        let domain = domain.trim().to_ascii_lowercase();
        if domain.is_empty() || domain.contains('/') {
            return Err(EngineError::InvalidDomain(domain));
        }

        let mut settings = self.settings().await;
        match enabled {
            Some(enabled) => {
                settings.domain_preferences.insert(
                    domain.clone(),
                    DomainPreference {
                        enabled,
                        source: DomainSource::User,
                    },
                );
            }
            None => {
                settings.domain_preferences.remove(&domain);
            }
        }
        self.update_settings(settings).await?;
        info!("Domain preference for {} set to {:?}", domain, enabled);
        Ok(())
    }

    /// Answer a one-shot runtime message
    pub async fn handle_message(&self, sender: &SenderInfo, message: RuntimeMessage) -> RuntimeReply {
        match message {
            RuntimeMessage::GetStatus { meta_enabled } => {
                let settings = self.settings.read().await;
                RuntimeReply::Status(resolve_status(&settings, sender, meta_enabled))
            }
            RuntimeMessage::KeyCheck { key_name } => {
                let settings = self.settings.read().await;
                let is_set = settings
                    .env
                    .get(key_name.trim())
                    .map(|v| !v.trim().is_empty())
                    .unwrap_or(false);
                RuntimeReply::KeyCheck { is_set }
            }
            RuntimeMessage::KeysList => {
                let settings = self.settings.read().await;
                let keys = settings
                    .env
                    .iter()
                    .filter(|(_, v)| !v.trim().is_empty())
                    .map(|(k, _)| k.clone())
                    .collect();
                RuntimeReply::KeysList { keys }
            }
            RuntimeMessage::Fetch { request_id, request } => {
                RuntimeReply::Fetch(self.fetch(sender, &request_id, &request, Authorization::Standard).await)
            }
            RuntimeMessage::FetchAbort { request_id } => {
                if !self.aborts.abort(&request_id) {
                    debug!("Abort for unknown request {}", request_id);
                }
                RuntimeReply::Ack
            }
            RuntimeMessage::Google(call) => self.handle_google(sender, call).await,
        }
    }

    async fn handle_google(&self, sender: &SenderInfo, call: GoogleCall) -> RuntimeReply {
        let result = match call {
            GoogleCall::Auth { scopes } => self.google.authenticate(&scopes).await.map(RuntimeReply::GoogleState),
            GoogleCall::Logout => self.google.logout().await.map(|_| RuntimeReply::Ack),
            GoogleCall::State => self.google.state().await.map(RuntimeReply::GoogleState),
            GoogleCall::HasScopes { scopes } => self
                .google
                .state()
                .await
                .map(|state| RuntimeReply::HasScopes {
                    has: has_scopes(&state, &scopes),
                }),
            GoogleCall::Fetch { request_id, request } => {
                return RuntimeReply::Fetch(self.fetch(sender, &request_id, &request, Authorization::Google).await)
            }
        };
        result.unwrap_or_else(RuntimeReply::Error)
    }

    /// Policy checks, injection and body decoding
    pub async fn prepare(
        &self,
        sender: &SenderInfo,
        request: &LiteRequest,
        authorization: Authorization,
    ) -> Result<Prepared, BridgeError> {
        let settings = self.settings.read().await.clone();
        let policy = RequestPolicy::from_settings(&settings);
        let mut headers = request.headers.clone();

        let (url, injected) = match authorization {
            Authorization::Standard => {
                let mut url = policy.check(&sender.origin, &request.url)?;
                let injected = apply_injection_rules(&settings.injection_rules, &settings.env, &mut url, &mut headers);
                (url, injected)
            }
            Authorization::Google => {
                policy.check_origin(&sender.origin)?;
                let url = Url::parse(&request.url)
                    .map_err(|e| BridgeError::invalid_request(format!("invalid URL '{}': {}", request.url, e)))?;
                if !is_google_destination(&url) {
                    return Err(BridgeError::policy(PolicyKind::Destination, url.as_str()));
                }
                let mut injected = Injected::default();
                if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("authorization")) {
                    let token = self.google.access_token(&[]).await?;
                    headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
                    injected.headers.push("Authorization".to_string());
                }
                (url, injected)
            }
        };

        let body = match &request.body {
            Some(body) => Some(decode_body(body, self.config.max_body_bytes)?),
            None => None,
        };

        Ok(Prepared {
            request: PreparedRequest {
                method: request.method().to_ascii_uppercase(),
                url,
                headers,
                body,
            },
            injected,
        })
    }

    /// Log entry describing a request before it is sent
    pub fn start_entry(&self, sender: &SenderInfo, request_id: &str, request: &LiteRequest, prepared: Option<&Prepared>) -> LogEntry {
        let method = request.method().to_ascii_uppercase();
        match prepared {
            Some(prepared) => {
                let injected = &prepared.injected;
                let url = redact_query(&prepared.request.url, &injected.query);
                let mut entry = LogEntry::new(request_id, &sender.origin, &method, &url)
                    .with_request_headers(&prepared.request.headers, |name| injected.is_injected_header(name));
                entry.request_body_preview = prepared
                    .request
                    .body
                    .as_deref()
                    .map(|b| preview_bytes(b, self.config.preview_limit));
                entry
            }
            None => {
                let mut entry = LogEntry::new(request_id, &sender.origin, &method, &request.url)
                    .with_request_headers(&request.headers, |_| false);
                entry.request_body_preview = request.body.as_ref().map(|b| match b {
                    WireBody::Text(text) => preview(text, self.config.preview_limit),
                    WireBody::Binary(env) => format!("<{} bytes binary>", env.byte_length),
                });
                entry
            }
        }
    }

    /// Buffered fetch: never fails, errors are carried in the envelope
    pub async fn fetch(
        &self,
        sender: &SenderInfo,
        request_id: &str,
        request: &LiteRequest,
        authorization: Authorization,
    ) -> FetchEnvelope {
        let started = Instant::now();
        info!("[{}] {} {} from {}", request_id, request.method(), request.url, sender.origin);

        let prepared = match self.prepare(sender, request, authorization).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("[{}] rejected: {}", request_id, e);
                let mut entry = self.start_entry(sender, request_id, request, None);
                entry.error = Some(e.to_string());
                entry.elapsed_ms = Some(started.elapsed().as_millis() as u64);
                self.logs.push(entry).await;
                return FetchEnvelope::failure(e);
            }
        };

        self.logs
            .push(self.start_entry(sender, request_id, request, Some(&prepared)))
            .await;
        let token = self.aborts.register(request_id);
        let result = self.executor.execute(&prepared.request, &token).await;
        self.aborts.release(request_id);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result.and_then(|response| self.to_record(request_id, response, elapsed_ms)) {
            Ok((record, body_preview)) => {
                info!("[{}] {} in {}ms", request_id, record.status, elapsed_ms);
                self.logs
                    .update(request_id, |entry| {
                        entry.elapsed_ms = Some(elapsed_ms);
                        entry.status = Some(record.status);
                        entry.status_text = Some(record.status_text.clone());
                        entry.response_headers = Some(record.headers.clone());
                        entry.response_body_preview = Some(body_preview);
                        entry.error = record.error.clone();
                    })
                    .await;
                FetchEnvelope::success(record)
            }
            Err(e) => {
                if e.is_abort() {
                    info!("[{}] aborted", request_id);
                } else {
                    warn!("[{}] failed: {}", request_id, e);
                }
                self.logs
                    .update(request_id, |entry| {
                        entry.elapsed_ms = Some(elapsed_ms);
                        entry.error = Some(e.to_string());
                    })
                    .await;
                FetchEnvelope::failure(e)
            }
        }
    }

    fn to_record(
        &self,
        request_id: &str,
        response: BufferedResponse,
        elapsed_ms: u64,
    ) -> Result<(ResponseRecord, String), BridgeError> {
        let body = encode_response_body(&response.body, response.content_type(), self.config.max_body_bytes)?;
        let body_preview = preview_bytes(&response.body, self.config.preview_limit);
        let ok = (200..300).contains(&response.status);
        let error = (!ok).then(|| format!("HTTP {} {}", response.status, response.status_text).trim().to_string());

        Ok((
            ResponseRecord {
                request_id: request_id.to_string(),
                ok,
                status: response.status,
                status_text: response.status_text,
                headers: response.headers,
                body,
                elapsed_ms,
                error,
            },
            body_preview,
        ))
    }
}

/// Cheap clonable handle that serves the runtime channel
#[derive(Debug, Clone)]
pub struct EngineHandle {
    engine: Arc<Engine>,
}

impl EngineHandle {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

impl From<Arc<Engine>> for EngineHandle {
    fn from(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl RuntimeChannel for EngineHandle {
    async fn send_message(&self, sender: &SenderInfo, message: RuntimeMessage) -> Result<RuntimeReply, BridgeError> {
        Ok(self.engine.handle_message(sender, message).await)
    }

    async fn connect_stream(&self, sender: &SenderInfo) -> Result<Port<StreamCommand, StreamEvent>, BridgeError> {
        let (relay_side, engine_side) = port_pair(PORT_BUFFER);
        tokio::spawn(crate::stream::serve_stream_port(
            self.engine.clone(),
            sender.clone(),
            engine_side,
        ));
        Ok(relay_side)
    }

    async fn connect_socket(&self, sender: &SenderInfo) -> Result<Port<SocketCommand, SocketEvent>, BridgeError> {
        let (relay_side, engine_side) = port_pair(PORT_BUFFER);
        tokio::spawn(crate::socket::serve_socket_port(
            self.engine.clone(),
            sender.clone(),
            engine_side,
        ));
        Ok(relay_side)
    }
}
