//! Duplex text channel under the event stream

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Opens channels to the node
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Channel>>;
}

/// One open connection. `recv` must be cancel safe.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next text frame; `None` once the peer closed the connection
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn ping(&mut self) -> Result<()>;
}

/// WebSocket transport
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Channel>> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::Config(format!("Invalid WebSocket URL: {}", e)))?;

        let (stream, _) = connect_async(parsed.as_str())
            .await
            .map_err(|e| Error::StreamConnection(format!("WebSocket connect failed: {}", e)))?;

        info!("Connected to {}", parsed);
        Ok(Box::new(WebSocketChannel { stream }))
    }
}

struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WebSocketChannel {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => {
                    info!("WebSocket closed by server");
                    return None;
                }
                Ok(Message::Pong(_)) => debug!("Received pong"),
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.stream.send(Message::Ping(Vec::new())).await?;
        debug!("Sent ping");
        Ok(())
    }
}
