use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// In-flight engine requests that can still be cancelled
#[derive(Debug, Clone, Default)]
pub struct AbortRegistry {
    /// Maps Request ID -> token cancelled on abort
    in_flight: Arc<DashMap<String, CancellationToken>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request; the returned token fires when it is aborted.
    /// Re-registering an id replaces (and cancels) the previous token.
    pub fn register(&self, request_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.in_flight.insert(request_id.to_string(), token.clone()) {
            debug!("Request {} registered twice, cancelling the earlier one", request_id);
            previous.cancel();
        }
        token
    }

    /// Abort a request. Unknown or finished ids are ignored.
    pub fn abort(&self, request_id: &str) -> bool {
        if let Some((_, token)) = self.in_flight.remove(request_id) {
            info!("Aborting request {}", request_id);
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Forget a finished request
    pub fn release(&self, request_id: &str) {
        self.in_flight.remove(request_id);
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}
