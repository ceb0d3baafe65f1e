//! In-memory registries of open configuration streams.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, RwLock, mpsc};
use tonic::Status;
use tracing::{debug, info};
use uuid::Uuid;

/// A single send may wait this long on a full stream before the push is
/// abandoned for that stream.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a message did not reach a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("stream closed")]
    Closed,
    #[error("stream did not accept the message in time")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0} already has an open stream")]
pub struct AlreadyRegistered(pub String);

/// One open server-streaming call.
pub struct StreamHandle<T> {
    pub key: String,
    /// Distinguishes a reconnect under the same key from the stream it replaced.
    pub conn_id: Uuid,
    tx: mpsc::Sender<Result<T, Status>>,
    send_lock: Mutex<()>,
}

impl<T> StreamHandle<T> {
    /// Serialises compute-then-send for this stream so concurrent pushes
    /// arrive in the order they were computed.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.send_lock.lock().await
    }

    pub async fn send(&self, message: T) -> Result<(), SendError> {
        self.tx
            .send_timeout(Ok(message), SEND_TIMEOUT)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Closed(_) => SendError::Closed,
                mpsc::error::SendTimeoutError::Timeout(_) => SendError::Timeout,
            })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Thread-safe map from key to open stream.
pub struct StreamRegistry<T> {
    kind: &'static str,
    streams: Arc<RwLock<HashMap<String, Arc<StreamHandle<T>>>>>,
}

impl<T> Clone for StreamRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            streams: Arc::clone(&self.streams),
        }
    }
}

impl<T> StreamRegistry<T> {
    /// `kind` names the stream type in logs.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn handle(key: &str, tx: mpsc::Sender<Result<T, Status>>) -> Arc<StreamHandle<T>> {
        Arc::new(StreamHandle {
            key: key.to_string(),
            conn_id: Uuid::new_v4(),
            tx,
            send_lock: Mutex::new(()),
        })
    }

    /// Register a stream, replacing any stream already open under `key`.
    pub async fn register(
        &self,
        key: &str,
        log_key: &str,
        tx: mpsc::Sender<Result<T, Status>>,
    ) -> Arc<StreamHandle<T>> {
        let handle = Self::handle(key, tx);
        let replaced = self
            .streams
            .write()
            .await
            .insert(key.to_string(), Arc::clone(&handle));
        info!(kind = self.kind, key = %log_key, conn_id = %handle.conn_id, replaced = replaced.is_some(), "Stream registered");
        handle
    }

    /// Register a stream only if no live stream holds `key`.
    ///
    /// A registered stream whose receiver is already gone does not count;
    /// its own cleanup will find its entry replaced and leave it alone.
    pub async fn register_exclusive(
        &self,
        key: &str,
        tx: mpsc::Sender<Result<T, Status>>,
    ) -> Result<Arc<StreamHandle<T>>, AlreadyRegistered> {
        let mut streams = self.streams.write().await;
        if streams.get(key).is_some_and(|existing| !existing.is_closed()) {
            debug!(kind = self.kind, key, "Rejected duplicate stream");
            return Err(AlreadyRegistered(key.to_string()));
        }
        let handle = Self::handle(key, tx);
        streams.insert(key.to_string(), Arc::clone(&handle));
        info!(kind = self.kind, key, conn_id = %handle.conn_id, "Stream registered");
        Ok(handle)
    }

    /// Remove `key` if it still belongs to `conn_id`.
    pub async fn unregister(&self, key: &str, conn_id: Uuid) -> bool {
        let mut streams = self.streams.write().await;
        match streams.get(key) {
            Some(handle) if handle.conn_id == conn_id => {
                streams.remove(key);
                info!(kind = self.kind, conn_id = %conn_id, "Stream unregistered");
                true
            }
            _ => {
                debug!(kind = self.kind, conn_id = %conn_id, "Stream already replaced or removed");
                false
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<StreamHandle<T>>> {
        self.streams.read().await.get(key).cloned()
    }

    /// Every open stream at this instant. The lock is released on return, so
    /// callers send without holding it.
    pub async fn snapshot(&self) -> Vec<Arc<StreamHandle<T>>> {
        self.streams.read().await.values().cloned().collect()
    }

    pub async fn is_connected(&self, key: &str) -> bool {
        self.streams.read().await.contains_key(key)
    }

    pub async fn connection_count(&self) -> usize {
        self.streams.read().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exclusive_registration_rejects_second_live_stream() {
        let registry = StreamRegistry::<u32>::new("gateway");
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        registry.register_exclusive("gw", tx1).await.unwrap();
        let err = registry.register_exclusive("gw", tx2).await.err().unwrap();
        assert_eq!(err, AlreadyRegistered("gw".into()));
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn closed_stream_does_not_block_reconnect() {
        let registry = StreamRegistry::<u32>::new("gateway");
        let (tx1, rx1) = mpsc::channel(4);
        let first = registry.register_exclusive("gw", tx1).await.unwrap();
        drop(rx1);

        let (tx2, _rx2) = mpsc::channel(4);
        let second = registry.register_exclusive("gw", tx2).await.unwrap();

        // The stale stream's cleanup must not remove its replacement.
        assert!(!registry.unregister("gw", first.conn_id).await);
        assert!(registry.is_connected("gw").await);
        assert!(registry.unregister("gw", second.conn_id).await);
        assert!(!registry.is_connected("gw").await);
    }

    #[tokio::test]
    async fn register_replaces_and_send_reaches_newest() {
        let registry = StreamRegistry::<u32>::new("device");
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        registry.register("k", "k", tx1).await;
        registry.register("k", "k", tx2).await;

        let handle = registry.get("k").await.unwrap();
        handle.send(7).await.unwrap();
        assert_eq!(rx2.recv().await.unwrap().unwrap(), 7);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_dropped_receiver_is_closed() {
        let registry = StreamRegistry::<u32>::new("device");
        let (tx, rx) = mpsc::channel(1);
        let handle = registry.register("k", "k", tx).await;
        drop(rx);
        assert_eq!(handle.send(1).await, Err(SendError::Closed));
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_registry() {
        let registry = StreamRegistry::<u32>::new("gateway");
        let (tx, _rx) = mpsc::channel(1);
        let handle = registry.register_exclusive("gw", tx).await.unwrap();

        let snapshot = registry.snapshot().await;
        registry.unregister("gw", handle.conn_id).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.connection_count().await, 0);
    }
}
