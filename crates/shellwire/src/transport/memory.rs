//! In-process transport for tests and embedding.
//!
//! Each successful `connect` hands a [`MemoryPeer`] to the paired
//! [`MemoryServer`], which plays the backend side.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

use super::{Transport, TransportFactory};
use crate::error::{TransportError, TransportResult};

pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    reject_remaining: AtomicUsize,
    attempts: Mutex<Vec<Instant>>,
    attempt_count: watch::Sender<usize>,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, MemoryServer) {
        let (peers, rx) = mpsc::unbounded_channel();
        let (attempt_count, _) = watch::channel(0);
        let transport = Arc::new(Self {
            peers,
            reject_remaining: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
            attempt_count,
        });
        (transport, MemoryServer { peers: rx })
    }

    /// Makes the next `count` connection attempts fail.
    pub fn reject_next(&self, count: usize) {
        self.reject_remaining.store(count, Ordering::SeqCst);
    }

    /// Times of every connection attempt so far, successful or not.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn attempt_count(&self) -> usize {
        *self.attempt_count.borrow()
    }

    /// Waits until at least `count` connection attempts were made.
    pub async fn wait_for_attempts(&self, count: usize) {
        let mut rx = self.attempt_count.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    fn record_attempt(&self) {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        attempts.push(Instant::now());
        self.attempt_count.send_replace(attempts.len());
    }

    fn take_rejection(&self) -> bool {
        self.reject_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TransportFactory for MemoryTransport {
    async fn connect(&self, url: &Url, _shell_config_dir: Option<&Path>) -> TransportResult<Transport> {
        self.record_attempt();
        if self.take_rejection() {
            return Err(TransportError::ConnectFailed {
                url: url.to_string(),
                message: "connection refused".into(),
            });
        }

        let (client_tx, server_rx) = fmpsc::unbounded::<String>();
        let (server_tx, client_rx) = mpsc::unbounded_channel::<TransportResult<String>>();

        let peer = MemoryPeer {
            url: url.clone(),
            incoming: server_rx,
            outgoing: Some(server_tx),
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed {
                url: url.to_string(),
                message: "no server listening".into(),
            })?;

        let sink = client_tx.sink_map_err(|e| TransportError::SendFailed(e.to_string()));
        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(UnboundedReceiverStream::new(client_rx)),
        })
    }
}

/// Backend side: yields one peer per accepted connection.
pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

/// Backend end of one in-memory connection.
pub struct MemoryPeer {
    pub url: Url,
    incoming: fmpsc::UnboundedReceiver<String>,
    outgoing: Option<mpsc::UnboundedSender<TransportResult<String>>>,
}

impl MemoryPeer {
    /// Next frame written by the client, or `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.next().await
    }

    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Sends a text frame to the client. Returns false if the client is gone.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.outgoing
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(text.into())).is_ok())
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send(value.to_string())
    }

    /// Closes the connection from the backend side.
    pub fn close(&mut self) {
        if let Some(tx) = self.outgoing.take() {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }
}
