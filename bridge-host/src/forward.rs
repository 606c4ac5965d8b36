//! Per-port delivery queues
//!
//! A frame reader serves every port over one connection, so it must never
//! wait on a single slow consumer. Each port gets an unbounded queue drained
//! by its own task into the bounded port.

use bridge_common::PortSender;
use tokio::sync::mpsc;
use tracing::debug;

/// Queue feeding `port`; closed once the port's receiver is gone
pub(crate) fn port_queue<T: Send + 'static>(port_id: u64, port: PortSender<T>) -> mpsc::UnboundedSender<T> {
    let (queue, mut pending) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(message) = pending.recv().await {
            if port.send(message).await.is_err() {
                debug!("Port {} receiver dropped", port_id);
                return;
            }
        }
    });
    queue
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_common::port_pair;

    #[tokio::test]
    async fn test_queue_never_blocks_on_full_port() {
        let (mut remote, local) = port_pair::<(), u32>(1);
        let (events, _commands) = local.split();
        let queue = port_queue(7, events);

        for i in 0..100 {
            queue.send(i).unwrap();
        }
        for i in 0..100 {
            assert_eq!(remote.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_queue_closes_with_port() {
        let (remote, local) = port_pair::<(), u32>(1);
        let (events, _commands) = local.split();
        let queue = port_queue(7, events);
        drop(remote);

        queue.send(1).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), queue.closed())
            .await
            .unwrap();
        assert!(queue.send(2).is_err());
    }
}
