//! Transport seam between the scheduler and the socket.
//!
//! A factory opens one bidirectional text-frame connection per call. The
//! scheduler owns the returned halves exclusively and asks the factory for a
//! fresh pair on every reconnect.

pub mod memory;

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use log::debug;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::{TransportError, TransportResult};

pub use memory::{MemoryPeer, MemoryServer, MemoryTransport};

/// Outgoing half: accepts serialized frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Incoming half: yields text frames. An `Err` ends the connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = TransportResult<String>> + Send>>;

/// An open connection.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens a connection to `url`.
    ///
    /// `shell_config_dir` is the backend's configuration folder as known to
    /// the host. Implementations may use it to locate certificates.
    async fn connect(&self, url: &Url, shell_config_dir: Option<&Path>) -> TransportResult<Transport>;
}

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketFactory;

#[async_trait]
impl TransportFactory for WebSocketFactory {
    async fn connect(&self, url: &Url, _shell_config_dir: Option<&Path>) -> TransportResult<Transport> {
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| {
            TransportError::ConnectFailed {
                url: url.to_string(),
                message: e.to_string(),
            }
        })?;
        debug!("WebSocket connected to {url}");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|e| TransportError::ReceiveFailed(e.to_string())),
                ),
                Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::ReceiveFailed(e.to_string()))),
            })
        });

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
