use super::{StorageBackend, StorageTier};
use crate::core::{IdentityError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const CHANNEL_CAPACITY: usize = 32;

enum WorkerRequest {
    Get {
        key: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Set {
        key: String,
        value: String,
        reply: oneshot::Sender<()>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<()>,
    },
}

/// Tier backed by a background task that owns the data.
///
/// Every call is a request/response round trip bounded by `request_timeout`;
/// a worker that never answers reads as [`IdentityError::BackendTimeout`].
pub struct WorkerChannelBackend {
    tx: mpsc::Sender<WorkerRequest>,
    request_timeout: Duration,
    // Keeps an unanswered channel open for `unresponsive`.
    _parked: Option<mpsc::Receiver<WorkerRequest>>,
}

/// Owner of the spawned worker task.
pub struct WorkerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| IdentityError::storage("background_worker", format!("join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

impl WorkerChannelBackend {
    /// Spawns the worker task on the current runtime.
    pub fn spawn(request_timeout: Duration) -> (Self, WorkerHandle) {
        let (tx, mut rx) = mpsc::channel::<WorkerRequest>(CHANNEL_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            let mut entries: HashMap<String, String> = HashMap::new();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    request = rx.recv() => {
                        let Some(request) = request else { break };
                        match request {
                            WorkerRequest::Get { key, reply } => {
                                let _ = reply.send(entries.get(&key).cloned());
                            }
                            WorkerRequest::Set { key, value, reply } => {
                                entries.insert(key, value);
                                let _ = reply.send(());
                            }
                            WorkerRequest::Remove { key, reply } => {
                                entries.remove(&key);
                                let _ = reply.send(());
                            }
                        }
                    }
                }
            }
        });

        let backend = Self {
            tx,
            request_timeout,
            _parked: None,
        };
        let handle = WorkerHandle {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        };
        (backend, handle)
    }

    /// A backend whose worker accepts requests but never replies.
    pub fn unresponsive(request_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<WorkerRequest>(CHANNEL_CAPACITY);
        Self {
            tx,
            request_timeout,
            _parked: Some(rx),
        }
    }

    async fn round_trip<T: Send>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerRequest + Send,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(build(reply_tx))
                .await
                .map_err(|_| IdentityError::storage("background_worker", "worker channel closed"))?;
            reply_rx
                .await
                .map_err(|_| IdentityError::storage("background_worker", "worker dropped the request"))
        };

        timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| IdentityError::BackendTimeout("background_worker".to_string()))?
    }
}

#[async_trait]
impl StorageBackend for WorkerChannelBackend {
    fn name(&self) -> &str {
        "background_worker"
    }

    fn tier(&self) -> StorageTier {
        StorageTier::BackgroundWorker
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.round_trip(|reply| WorkerRequest::Get { key, reply }).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.round_trip(|reply| WorkerRequest::Set { key, value, reply })
            .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.round_trip(|reply| WorkerRequest::Remove { key, reply })
            .await
    }
}
