//! Page-context bridge facade
//!
//! [`Bridge`] is the `franzai` object page code talks to. Correlated calls
//! get a fresh request id and a slot in the pending map; whichever of the
//! reply, the local timer or the abort signal settles first removes the slot,
//! so a late reply finds nothing and is dropped.

use crate::config::{BridgeConfig, PageConfig, SharedConfig};
use crate::hooks::{FetchApi, HookManager, HookSet, NativeCapabilities, PageGlobals, RequestApi, WebSocketApi};
use crate::interceptors::{RequestInterceptor, ResponseHandler};
use crate::mode::{is_cross_origin, resolve_mode, CallState};
use crate::normalize::{normalize_request, NormalizedCall};
use crate::request::{resolve_url, FetchInput, PageRequest, RequestInit};
use crate::response::Response;
use crate::signal::{wait_aborted, AbortSignal};
use crate::socket::{BridgeWebSocket, SocketMux};
use crate::status::DomainStatusCache;
use crate::stream::open_stream;
use async_trait::async_trait;
use bridge_common::constants::BRIDGE_VERSION;
use bridge_common::{
    BridgeError, BridgeMode, BridgeStatus, GoogleCall, GoogleState, PageCall, PageToRelay, RelayToPage, RuntimeReply,
    WindowEndpoint, WindowSender,
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Answer to `ping()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ping {
    pub ok: bool,
    pub version: String,
}

type PendingMap = Arc<DashMap<String, oneshot::Sender<RuntimeReply>>>;

/// Correlates window bus requests with their replies
#[derive(Clone)]
struct Correlator {
    window: WindowSender<PageToRelay>,
    pending: PendingMap,
}

impl Correlator {
    async fn call(
        &self,
        request_id: &str,
        call: PageCall,
        timeout: Duration,
        signal: Option<&AbortSignal>,
    ) -> Result<RuntimeReply, BridgeError> {
        if signal.map(AbortSignal::is_aborted).unwrap_or(false) {
            return Err(BridgeError::Aborted);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.to_string(), tx);
        if let Err(e) = self.window.post(PageToRelay::Request {
            request_id: request_id.to_string(),
            call,
        }) {
            self.pending.remove(request_id);
            return Err(e);
        }

        let outcome = tokio::select! {
            reply = rx => reply.map_err(|_| BridgeError::unreachable("window bus closed")),
            _ = tokio::time::sleep(timeout) => {
                warn!("[{}] no reply after {:?}", request_id, timeout);
                Err(BridgeError::timeout("bridge request", timeout.as_millis() as u64))
            }
            _ = wait_aborted(signal) => {
                debug!("[{}] aborted by caller", request_id);
                let _ = self.window.post(PageToRelay::FetchAbort {
                    request_id: request_id.to_string(),
                });
                Err(BridgeError::Aborted)
            }
        };
        self.pending.remove(request_id);
        outcome
    }

    async fn dispatch(mut incoming: bridge_common::WindowReceiver<RelayToPage>, pending: PendingMap) {
        while let Some(RelayToPage::Reply { request_id, reply }) = incoming.recv().await {
            match pending.remove(&request_id) {
                Some((_, tx)) => {
                    let _ = tx.send(reply);
                }
                None => debug!("[{}] reply for a settled call ignored", request_id),
            }
        }
        // Waiters see their sender dropped
        pending.clear();
        debug!("Window bus closed");
    }
}

struct BridgeInner {
    config: PageConfig,
    shared: SharedConfig,
    correlator: Correlator,
    status: DomainStatusCache,
    hooks: Arc<HookManager>,
    interceptors: RwLock<Vec<Arc<dyn RequestInterceptor>>>,
    response_handlers: RwLock<Vec<Arc<dyn ResponseHandler>>>,
    sockets: Mutex<Option<Arc<SocketMux>>>,
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.hooks.uninstall();
    }
}

/// The page's bridge object
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Capture the natives in `globals` and start listening on the window bus
    pub fn new(config: PageConfig, window: WindowEndpoint<PageToRelay, RelayToPage>, globals: Arc<PageGlobals>) -> Self {
        Self::with_config(config, BridgeConfig::default(), window, globals)
    }

    pub fn with_config(
        config: PageConfig,
        bridge_config: BridgeConfig,
        window: WindowEndpoint<PageToRelay, RelayToPage>,
        globals: Arc<PageGlobals>,
    ) -> Self {
        let (sender, receiver) = window.split();
        let pending: PendingMap = Arc::new(DashMap::new());
        tokio::spawn(Correlator::dispatch(receiver, pending.clone()));

        let shared = SharedConfig::new(bridge_config);
        let natives = NativeCapabilities::capture(&globals);

        let inner = Arc::new_cyclic(|weak: &Weak<BridgeInner>| {
            let hooks = HookSet {
                fetch: Arc::new(HookedFetch { bridge: weak.clone() }),
                request: Arc::new(HookedRequest {
                    native: natives.request.clone(),
                }),
                websocket: Arc::new(HookedWebSocket { bridge: weak.clone() }),
            };
            BridgeInner {
                status: DomainStatusCache::new(config.status_ttl()),
                hooks: Arc::new(HookManager::new(
                    globals,
                    natives,
                    hooks,
                    shared.clone(),
                    config.lock_interval(),
                )),
                config,
                shared,
                correlator: Correlator { window: sender, pending },
                interceptors: RwLock::new(Vec::new()),
                response_handlers: RwLock::new(Vec::new()),
                sockets: Mutex::new(None),
            }
        });
        info!("Bridge facade ready for {}", inner.config.origin());
        Self { inner }
    }

    /// First status lookup; installs the hooks if the domain is enabled
    pub async fn bootstrap(&self) -> BridgeStatus {
        self.get_status(false).await
    }

    pub fn config(&self) -> &PageConfig {
        &self.inner.config
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.inner.hooks
    }

    pub fn ping(&self) -> Ping {
        Ping {
            ok: true,
            version: BRIDGE_VERSION.to_string(),
        }
    }

    pub fn set_mode(&self, mode: BridgeMode) {
        info!("Bridge mode set to {}", mode);
        self.inner.shared.set_mode(mode);
    }

    pub fn get_mode(&self) -> BridgeMode {
        self.inner.shared.get().mode
    }

    pub fn set_lock_hooks(&self, lock_hooks: bool) {
        self.inner.shared.set_lock_hooks(lock_hooks);
        self.inner.hooks.refresh_lock();
    }

    pub fn add_interceptor(&self, interceptor: impl RequestInterceptor + 'static) {
        self.inner
            .interceptors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(interceptor));
    }

    pub fn add_response_handler(&self, handler: impl ResponseHandler + 'static) {
        self.inner
            .response_handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(handler));
    }

    async fn call(&self, call: PageCall) -> Result<RuntimeReply, BridgeError> {
        let request_id = Uuid::new_v4().to_string();
        let reply = self
            .inner
            .correlator
            .call(&request_id, call, self.inner.config.request_timeout(), None)
            .await?;
        match reply {
            RuntimeReply::Error(e) => Err(e),
            reply => Ok(reply),
        }
    }

    /// Whether the named secret has a value; the value never leaves the engine
    pub async fn is_key_set(&self, key_name: &str) -> Result<bool, BridgeError> {
        match self
            .call(PageCall::KeyCheck {
                key_name: key_name.to_string(),
            })
            .await?
        {
            RuntimeReply::KeyCheck { is_set } => Ok(is_set),
            other => Err(unexpected(other)),
        }
    }

    pub async fn has_api_key(&self, key_name: &str) -> Result<bool, BridgeError> {
        self.is_key_set(key_name).await
    }

    /// Names of the secrets that have a value
    pub async fn keys(&self) -> Result<Vec<String>, BridgeError> {
        match self.call(PageCall::KeysList).await? {
            RuntimeReply::KeysList { keys } => Ok(keys),
            other => Err(unexpected(other)),
        }
    }

    /// Domain status, cached; hooks follow the result
    pub async fn get_status(&self, force: bool) -> BridgeStatus {
        let correlator = self.inner.correlator.clone();
        let timeout = self.inner.config.request_timeout();
        let result = self
            .inner
            .status
            .get(force, move || async move {
                let request_id = Uuid::new_v4().to_string();
                match correlator.call(&request_id, PageCall::Status, timeout, None).await? {
                    RuntimeReply::Status(status) => Ok(status),
                    RuntimeReply::Error(e) => Err(e),
                    other => Err(unexpected(other)),
                }
            })
            .await;

        self.inner.hooks.sync(&result);
        result.unwrap_or_else(|e| {
            warn!("Bridge status unavailable: {}", e);
            BridgeStatus::unreachable(e.to_string())
        })
    }

    async fn normalize(&self, input: &FetchInput, init: &RequestInit) -> Result<NormalizedCall, BridgeError> {
        normalize_request(input, init, &self.inner.config.location, self.inner.config.max_body_bytes).await
    }

    async fn intercept(&self, mut input: FetchInput, mut init: RequestInit) -> Result<(FetchInput, RequestInit), BridgeError> {
        let interceptors: Vec<_> = self
            .inner
            .interceptors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for interceptor in interceptors {
            (input, init) = interceptor.intercept(input, init).await?;
        }
        Ok((input, init))
    }

    async fn respond(&self, mut response: Response) -> Result<Response, BridgeError> {
        let handlers: Vec<_> = self
            .inner
            .response_handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for handler in handlers {
            response = handler.handle(response).await?;
        }
        Ok(response)
    }

    fn fetch_response(&self, reply: RuntimeReply, url: String) -> Result<Response, BridgeError> {
        match reply {
            RuntimeReply::Fetch(envelope) => {
                Response::from_record(envelope.into_result()?, url, self.inner.config.max_body_bytes)
            }
            RuntimeReply::Error(e) => Err(e),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch through the bridge, whatever the mode
    pub async fn fetch(&self, input: impl Into<FetchInput>, init: RequestInit) -> Result<Response, BridgeError> {
        let (input, init) = self.intercept(input.into(), init).await?;
        let call = self.normalize(&input, &init).await?;

        let request = call.request;

        let request_id = Uuid::new_v4().to_string();
        let url = request.url.clone();
        debug!("[{}] bridging {} {}", request_id, request.method(), url);

        let response = if request.wants_stream() {
            open_stream(
                &self.inner.correlator.window,
                request_id,
                request,
                call.signal,
                self.inner.config.stream_headers_timeout(),
                url,
            )
            .await?
        } else {
            let timeout = call
                .options
                .timeout
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.inner.config.request_timeout());
            let reply = self
                .inner
                .correlator
                .call(
                    &request_id,
                    PageCall::Fetch {
                        request_id: request_id.clone(),
                        request,
                    },
                    timeout,
                    call.signal.as_ref(),
                )
                .await?;
            self.fetch_response(reply, url)?
        };
        self.respond(response).await
    }

    /// What the hooked global fetch runs: mode resolution, then bridge or native
    pub async fn intercepted_fetch(&self, input: FetchInput, init: RequestInit) -> Result<Response, BridgeError> {
        let mode = resolve_mode(init.explicit_mode(), input.recorded_mode(), self.get_mode());
        let target = resolve_url(&input, &self.inner.config.location)?;
        let state = CallState::resolve(mode, is_cross_origin(&target, &self.inner.config.location));
        let native = self.inner.hooks.natives().fetch.clone();

        if !state.uses_bridge() {
            return native.fetch(input, init).await;
        }

        let result = self.fetch(input.clone(), init.clone()).await;
        match state.on_bridge_result(&result) {
            CallState::FallingBack => {
                if let Err(e) = &result {
                    warn!("Bridge failed for {}, falling back to direct fetch: {}", target, e);
                }
                native.fetch(input, init).await
            }
            _ => result,
        }
    }

    /// WebSocket through the bridge when the domain is enabled, direct otherwise
    pub async fn websocket(&self, url: &str, protocols: Vec<String>) -> Result<BridgeWebSocket, BridgeError> {
        let url = self
            .inner
            .config
            .location
            .join(url)
            .map_err(|e| BridgeError::invalid_request(format!("invalid socket URL '{}': {}", url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(BridgeError::invalid_request(format!("unsupported socket scheme '{}'", url.scheme())));
        }

        if !self.get_status(false).await.domain_enabled {
            return Ok(BridgeWebSocket::native(url.to_string(), protocols));
        }
        let mux = self.socket_mux()?;
        BridgeWebSocket::relayed(&mux, url.to_string(), protocols)
    }

    fn socket_mux(&self) -> Result<Arc<SocketMux>, BridgeError> {
        let mut sockets = self.inner.sockets.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mux) = sockets.as_ref().filter(|mux| mux.is_alive()) {
            return Ok(mux.clone());
        }
        let mux = Arc::new(SocketMux::attach(&self.inner.correlator.window)?);
        *sockets = Some(mux.clone());
        Ok(mux)
    }

    pub fn google(&self) -> GoogleApi<'_> {
        GoogleApi { bridge: self }
    }
}

fn unexpected(reply: RuntimeReply) -> BridgeError {
    BridgeError::protocol(format!("unexpected reply: {:?}", reply))
}

/// `franzai.google`
pub struct GoogleApi<'a> {
    bridge: &'a Bridge,
}

impl GoogleApi<'_> {
    async fn state_call(&self, call: GoogleCall) -> Result<GoogleState, BridgeError> {
        match self.bridge.call(PageCall::Google(call)).await? {
            RuntimeReply::GoogleState(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    pub async fn auth(&self, scopes: Vec<String>) -> Result<GoogleState, BridgeError> {
        self.state_call(GoogleCall::Auth { scopes }).await
    }

    pub async fn logout(&self) -> Result<(), BridgeError> {
        match self.bridge.call(PageCall::Google(GoogleCall::Logout)).await? {
            RuntimeReply::Ack | RuntimeReply::GoogleState(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_state(&self) -> Result<GoogleState, BridgeError> {
        self.state_call(GoogleCall::State).await
    }

    pub async fn has_scopes(&self, scopes: Vec<String>) -> Result<bool, BridgeError> {
        match self.bridge.call(PageCall::Google(GoogleCall::HasScopes { scopes })).await? {
            RuntimeReply::HasScopes { has } => Ok(has),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch a Google API with the account's token attached by the engine
    pub async fn fetch(&self, input: impl Into<FetchInput>, init: RequestInit) -> Result<Response, BridgeError> {
        let input = input.into();
        let call = self.bridge.normalize(&input, &init).await?;
        let request_id = Uuid::new_v4().to_string();
        let url = call.request.url.clone();
        let timeout = call
            .options
            .timeout
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.bridge.inner.config.request_timeout());

        let reply = self
            .bridge
            .inner
            .correlator
            .call(
                &request_id,
                PageCall::Google(GoogleCall::Fetch {
                    request_id: request_id.clone(),
                    request: call.request,
                }),
                timeout,
                call.signal.as_ref(),
            )
            .await?;
        let response = self.bridge.fetch_response(reply, url)?;
        self.bridge.respond(response).await
    }
}

fn upgrade(bridge: &Weak<BridgeInner>) -> Result<Bridge, BridgeError> {
    bridge
        .upgrade()
        .map(|inner| Bridge { inner })
        .ok_or_else(|| BridgeError::invalid_state("bridge has been shut down"))
}

struct HookedFetch {
    bridge: Weak<BridgeInner>,
}

#[async_trait]
impl FetchApi for HookedFetch {
    async fn fetch(&self, input: FetchInput, init: RequestInit) -> Result<Response, BridgeError> {
        upgrade(&self.bridge)?.intercepted_fetch(input, init).await
    }
}

/// Records the call's mode on the constructed request
struct HookedRequest {
    native: Arc<dyn RequestApi>,
}

impl RequestApi for HookedRequest {
    fn construct(&self, input: FetchInput, init: &RequestInit) -> Result<PageRequest, BridgeError> {
        let inherited = input.recorded_mode();
        let mut request = self.native.construct(input, init)?;
        request.bridge_mode = init.explicit_mode().or(inherited);
        Ok(request)
    }
}

struct HookedWebSocket {
    bridge: Weak<BridgeInner>,
}

#[async_trait]
impl WebSocketApi for HookedWebSocket {
    async fn open(&self, url: &str, protocols: Vec<String>) -> Result<BridgeWebSocket, BridgeError> {
        upgrade(&self.bridge)?.websocket(url, protocols).await
    }
}
