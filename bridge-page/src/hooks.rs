//! Hook manager
//!
//! The page's networking entry points live in [`PageGlobals`] slots that
//! page code may read or reassign. The manager captures the natives once,
//! swaps the bridge hooks in as a unit when the domain is enabled and puts
//! the natives back when it is not. With `lock_hooks` a watchdog task
//! reinstalls any hook that page code overwrote.

use crate::config::SharedConfig;
use crate::request::{FetchInput, PageRequest, RequestInit};
use crate::response::Response;
use crate::socket::BridgeWebSocket;
use async_trait::async_trait;
use bridge_common::{BridgeError, BridgeStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// The page's `fetch`
#[async_trait]
pub trait FetchApi: Send + Sync {
    async fn fetch(&self, input: FetchInput, init: RequestInit) -> Result<Response, BridgeError>;
}

/// The page's `Request` constructor
pub trait RequestApi: Send + Sync {
    fn construct(&self, input: FetchInput, init: &RequestInit) -> Result<PageRequest, BridgeError>;
}

/// The page's `WebSocket` constructor
#[async_trait]
pub trait WebSocketApi: Send + Sync {
    async fn open(&self, url: &str, protocols: Vec<String>) -> Result<BridgeWebSocket, BridgeError>;
}

fn read<T: Clone>(slot: &RwLock<T>) -> T {
    slot.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
}

fn write<T>(slot: &RwLock<T>, value: T) {
    *slot.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

/// Same object behind two trait pointers
fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Global slots page code calls through
pub struct PageGlobals {
    fetch: RwLock<Arc<dyn FetchApi>>,
    request: RwLock<Arc<dyn RequestApi>>,
    websocket: RwLock<Arc<dyn WebSocketApi>>,
}

impl PageGlobals {
    pub fn new(fetch: Arc<dyn FetchApi>, request: Arc<dyn RequestApi>, websocket: Arc<dyn WebSocketApi>) -> Self {
        Self {
            fetch: RwLock::new(fetch),
            request: RwLock::new(request),
            websocket: RwLock::new(websocket),
        }
    }

    pub fn fetch(&self) -> Arc<dyn FetchApi> {
        read(&self.fetch)
    }

    pub fn set_fetch(&self, fetch: Arc<dyn FetchApi>) {
        write(&self.fetch, fetch);
    }

    pub fn request(&self) -> Arc<dyn RequestApi> {
        read(&self.request)
    }

    pub fn set_request(&self, request: Arc<dyn RequestApi>) {
        write(&self.request, request);
    }

    pub fn websocket(&self) -> Arc<dyn WebSocketApi> {
        read(&self.websocket)
    }

    pub fn set_websocket(&self, websocket: Arc<dyn WebSocketApi>) {
        write(&self.websocket, websocket);
    }
}

/// Natives captured before any hook was installed
#[derive(Clone)]
pub struct NativeCapabilities {
    pub fetch: Arc<dyn FetchApi>,
    pub request: Arc<dyn RequestApi>,
    pub websocket: Arc<dyn WebSocketApi>,
}

impl NativeCapabilities {
    pub fn capture(globals: &PageGlobals) -> Self {
        Self {
            fetch: globals.fetch(),
            request: globals.request(),
            websocket: globals.websocket(),
        }
    }
}

/// The bridge replacements, installed together
#[derive(Clone)]
pub struct HookSet {
    pub fetch: Arc<dyn FetchApi>,
    pub request: Arc<dyn RequestApi>,
    pub websocket: Arc<dyn WebSocketApi>,
}

pub struct HookManager {
    globals: Arc<PageGlobals>,
    natives: NativeCapabilities,
    hooks: HookSet,
    config: SharedConfig,
    lock_interval: Duration,
    installed: AtomicBool,
    lock_task: Mutex<Option<JoinHandle<()>>>,
}

impl HookManager {
    pub fn new(
        globals: Arc<PageGlobals>,
        natives: NativeCapabilities,
        hooks: HookSet,
        config: SharedConfig,
        lock_interval: Duration,
    ) -> Self {
        Self {
            globals,
            natives,
            hooks,
            config,
            lock_interval,
            installed: AtomicBool::new(false),
            lock_task: Mutex::new(None),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    pub fn natives(&self) -> &NativeCapabilities {
        &self.natives
    }

    /// Returns false if the hooks were already in place
    pub fn install(self: &Arc<Self>) -> bool {
        if self.installed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.globals.set_fetch(self.hooks.fetch.clone());
        self.globals.set_request(self.hooks.request.clone());
        self.globals.set_websocket(self.hooks.websocket.clone());
        info!("Bridge hooks installed");
        self.refresh_lock();
        true
    }

    /// Returns false if nothing was installed
    pub fn uninstall(&self) -> bool {
        if !self.installed.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.stop_lock();
        self.globals.set_fetch(self.natives.fetch.clone());
        self.globals.set_request(self.natives.request.clone());
        self.globals.set_websocket(self.natives.websocket.clone());
        info!("Bridge hooks removed, natives restored");
        true
    }

    /// Follow a status lookup: enabled installs, anything else uninstalls
    pub fn sync(self: &Arc<Self>, status: &Result<BridgeStatus, BridgeError>) {
        match status {
            Ok(status) if status.domain_enabled => {
                self.install();
            }
            _ => {
                self.uninstall();
            }
        }
    }

    /// Start or stop the watchdog to match `lock_hooks`
    pub fn refresh_lock(self: &Arc<Self>) {
        if !(self.config.get().lock_hooks && self.is_installed()) {
            self.stop_lock();
            return;
        }
        let mut task = self.lock_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        *task = Some(tokio::spawn(watch(Arc::downgrade(self), self.lock_interval)));
    }

    fn stop_lock(&self) {
        if let Some(task) = self
            .lock_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }

    /// Put back any hook whose slot no longer points at it
    fn reassert(&self) -> usize {
        let mut restored = 0;
        if !same(&self.globals.fetch(), &self.hooks.fetch) {
            self.globals.set_fetch(self.hooks.fetch.clone());
            restored += 1;
        }
        if !same(&self.globals.request(), &self.hooks.request) {
            self.globals.set_request(self.hooks.request.clone());
            restored += 1;
        }
        if !same(&self.globals.websocket(), &self.hooks.websocket) {
            self.globals.set_websocket(self.hooks.websocket.clone());
            restored += 1;
        }
        restored
    }
}

async fn watch(manager: Weak<HookManager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else { return };
        if !manager.is_installed() || !manager.config.get().lock_hooks {
            return;
        }
        let restored = manager.reassert();
        if restored > 0 {
            debug!("Reinstalled {} overwritten hooks", restored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use bytes::Bytes;
    use std::collections::BTreeMap;

    struct Tagged(&'static str);

    #[async_trait]
    impl FetchApi for Tagged {
        async fn fetch(&self, _input: FetchInput, _init: RequestInit) -> Result<Response, BridgeError> {
            Ok(Response::buffered(200, "OK", BTreeMap::new(), "", Bytes::from(self.0)))
        }
    }

    impl RequestApi for Tagged {
        fn construct(&self, input: FetchInput, _init: &RequestInit) -> Result<PageRequest, BridgeError> {
            Ok(PageRequest::new(input.raw_url()))
        }
    }

    #[async_trait]
    impl WebSocketApi for Tagged {
        async fn open(&self, _url: &str, _protocols: Vec<String>) -> Result<BridgeWebSocket, BridgeError> {
            Err(BridgeError::invalid_state(self.0))
        }
    }

    fn set(tag: &'static str) -> (Arc<Tagged>, Arc<Tagged>, Arc<Tagged>) {
        (Arc::new(Tagged(tag)), Arc::new(Tagged(tag)), Arc::new(Tagged(tag)))
    }

    fn manager(lock_hooks: bool) -> (Arc<PageGlobals>, Arc<HookManager>) {
        let (f, r, w) = set("native");
        let globals = Arc::new(PageGlobals::new(f, r, w));
        let natives = NativeCapabilities::capture(&globals);
        let (f, r, w) = set("hook");
        let hooks = HookSet {
            fetch: f,
            request: r,
            websocket: w,
        };
        let config = SharedConfig::new(BridgeConfig {
            lock_hooks,
            ..Default::default()
        });
        let manager = Arc::new(HookManager::new(globals.clone(), natives, hooks, config, Duration::from_millis(5)));
        (globals, manager)
    }

    async fn current_fetch(globals: &PageGlobals) -> String {
        let response = globals.fetch().fetch("/".into(), RequestInit::new()).await.unwrap();
        response.text().await.unwrap()
    }

    #[tokio::test]
    async fn test_install_and_uninstall_are_idempotent() {
        let (globals, manager) = manager(false);
        assert!(!manager.uninstall());
        assert!(manager.install());
        assert!(!manager.install());
        assert_eq!(current_fetch(&globals).await, "hook");
        assert!(manager.uninstall());
        assert!(!manager.uninstall());
        assert_eq!(current_fetch(&globals).await, "native");
    }

    #[tokio::test]
    async fn test_sync_follows_status() {
        let (globals, manager) = manager(false);
        let enabled = BridgeStatus {
            domain_enabled: true,
            ..BridgeStatus::unreachable("n/a")
        };
        manager.sync(&Ok(enabled));
        assert!(manager.is_installed());
        manager.sync(&Err(BridgeError::unreachable("reloaded")));
        assert!(!manager.is_installed());
        assert_eq!(current_fetch(&globals).await, "native");
    }

    #[tokio::test]
    async fn test_locked_hooks_are_reasserted() {
        let (globals, manager) = manager(true);
        manager.install();
        globals.set_fetch(Arc::new(Tagged("page code")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(current_fetch(&globals).await, "hook");

        manager.uninstall();
        globals.set_fetch(Arc::new(Tagged("page code")));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(current_fetch(&globals).await, "page code");
    }

    #[tokio::test]
    async fn test_unlocked_hooks_can_be_replaced() {
        let (globals, manager) = manager(false);
        manager.install();
        globals.set_fetch(Arc::new(Tagged("page code")));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(current_fetch(&globals).await, "page code");
    }
}
