//! Domain status cache
//!
//! Holds the last [`BridgeStatus`] for this page's origin and at most one
//! lookup in flight. Concurrent callers, forced or not, await the same
//! shared future.

use bridge_common::{BridgeError, BridgeStatus};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

type StatusFuture = Shared<BoxFuture<'static, Result<BridgeStatus, BridgeError>>>;

#[derive(Default)]
struct CacheState {
    status: Option<(BridgeStatus, Instant)>,
    inflight: Option<(u64, StatusFuture)>,
    generation: u64,
}

pub struct DomainStatusCache {
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl DomainStatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Cached status if still fresh, otherwise run (or join) a lookup
    pub async fn get<F, Fut>(&self, force: bool, lookup: F) -> Result<BridgeStatus, BridgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BridgeStatus, BridgeError>> + Send + 'static,
    {
        let (generation, pending) = {
            let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if !force {
                if let Some((status, at)) = &state.status {
                    if at.elapsed() < self.ttl {
                        return Ok(status.clone());
                    }
                }
            }
            match &state.inflight {
                Some((generation, pending)) => {
                    debug!("Joining in-flight status lookup");
                    (*generation, pending.clone())
                }
                None => {
                    state.generation += 1;
                    let pending = lookup().boxed().shared();
                    state.inflight = Some((state.generation, pending.clone()));
                    (state.generation, pending)
                }
            }
        };

        let result = pending.await;

        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(&state.inflight, Some((current, _)) if *current == generation) {
            state.inflight = None;
            if let Ok(status) = &result {
                state.status = Some((status.clone(), Instant::now()));
            }
        }
        result
    }

    /// Last known status regardless of age
    pub fn cached(&self) -> Option<BridgeStatus> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .status
            .as_ref()
            .map(|(status, _)| status.clone())
    }

    pub fn invalidate(&self) {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).status = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn enabled() -> BridgeStatus {
        BridgeStatus {
            domain_enabled: true,
            ready: true,
            ..BridgeStatus::unreachable("n/a")
        }
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_call() {
        let cache = Arc::new(DomainStatusCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get(i % 2 == 0, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(enabled())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().domain_enabled);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_status_is_reused_until_invalidated() {
        let cache = DomainStatusCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let lookup = |calls: Arc<AtomicUsize>| move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(enabled())
        };

        cache.get(false, lookup(calls.clone())).await.unwrap();
        cache.get(false, lookup(calls.clone())).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate();
        assert!(cache.cached().is_none());
        cache.get(false, lookup(calls.clone())).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = DomainStatusCache::new(Duration::from_secs(60));
        let err = cache
            .get(false, || async { Err(BridgeError::unreachable("reloaded")) })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::RelayUnreachable { .. }));
        assert!(cache.cached().is_none());
        assert!(cache.get(false, || async { Ok(enabled()) }).await.is_ok());
    }
}
