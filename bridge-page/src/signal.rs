//! Cooperative cancellation for page calls

use tokio_util::sync::CancellationToken;

/// Owner side: aborts every signal it handed out
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    token: CancellationToken,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            token: self.token.clone(),
        }
    }

    pub fn abort(&self) {
        self.token.cancel();
    }
}

/// Observer side, passed along with a request
#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once aborted
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }
}

/// Resolves when `signal` aborts; never resolves without one
pub async fn wait_aborted(signal: Option<&AbortSignal>) {
    match signal {
        Some(signal) => signal.aborted().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_abort_reaches_every_signal() {
        let controller = AbortController::new();
        let a = controller.signal();
        let b = a.clone();
        assert!(!a.is_aborted());
        controller.abort();
        assert!(b.is_aborted());
        tokio::time::timeout(Duration::from_millis(100), a.aborted()).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_signal_never_fires() {
        let waited = tokio::time::timeout(Duration::from_millis(20), wait_aborted(None)).await;
        assert!(waited.is_err());
    }
}
