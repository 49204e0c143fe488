use std::pin::Pin;

use futures_util::future::{self, BoxFuture};
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::ClientError;

/// Outgoing text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;
/// Incoming text frames. The stream ending means the transport closed.
pub type FrameStream = BoxStream<'static, Result<String, ClientError>>;

/// Opens one transport session. Called again for every reconnect attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<(FrameSink, FrameStream), ClientError>>;
}

/// WebSocket transport to a relay gateway URL (`ws://host/gateway`).
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'_, Result<(FrameSink, FrameStream), ClientError>> {
        Box::pin(async move {
            let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(|e| ClientError::Connect(e.to_string()))?;
            let (write, read) = ws.split();

            let sink = write
                .with(|text: String| {
                    future::ready(Ok::<_, tungstenite::Error>(Message::Text(text.into())))
                })
                .sink_map_err(|e| ClientError::Transport(e.to_string()));
            let stream = read.filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_string())),
                    // Control frames are answered by tungstenite itself.
                    Ok(_) => None,
                    Err(e) => Some(Err(ClientError::Transport(e.to_string()))),
                })
            });

            let sink: FrameSink = Box::pin(sink);
            Ok((sink, stream.boxed()))
        })
    }
}
