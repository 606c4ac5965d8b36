//! Page tier of the bridge
//!
//! Everything that runs in the untrusted page context: the `franzai`
//! facade, request normalization, mode resolution, the domain status cache,
//! the hook manager that swaps the page's networking entry points, and the
//! page ends of the streaming and WebSocket relays.

pub mod config;
pub mod facade;
pub mod hooks;
pub mod interceptors;
pub mod mode;
pub mod native;
pub mod normalize;
pub mod request;
pub mod response;
pub mod signal;
pub mod socket;
pub mod status;
pub mod stream;

pub use config::{BridgeConfig, PageConfig, SharedConfig};
pub use facade::{Bridge, GoogleApi, Ping};
pub use hooks::{FetchApi, HookManager, HookSet, NativeCapabilities, PageGlobals, RequestApi, WebSocketApi};
pub use interceptors::{RequestInterceptor, ResponseHandler};
pub use mode::{is_cross_origin, resolve_mode, CallState};
pub use native::{NativeFetch, NativeRequestFactory, NativeWebSocketFactory};
pub use normalize::{normalize_request, NormalizedCall};
pub use request::{merge_headers, FetchInput, PageRequest, RequestInit};
pub use response::{Response, ResponseStream};
pub use signal::{AbortController, AbortSignal};
pub use socket::{BinaryType, BridgeWebSocket, CloseEvent, SocketData};
pub use status::DomainStatusCache;
