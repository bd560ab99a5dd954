use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use iris_types::Result;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::{channel_error, Connector, Link};

const DEFAULT_BUFFER: usize = 16;

/// Text-frame WebSocket client for the inference service.
pub struct WebSocketConnector {
    buffer: usize,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self {
            buffer: DEFAULT_BUFFER,
        }
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|err| channel_error(format!("websocket connect to {url} failed: {err}")))?;
        debug!("WebSocket handshake with {} returned {}", url, response.status());

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(self.buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(self.buffer);

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    warn!("WebSocket write failed: {err}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        debug!("WebSocket closed by peer: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        warn!("WebSocket read failed: {err}");
                        break;
                    }
                };
                if inbound_tx.send(text).await.is_err() {
                    break;
                }
            }
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
