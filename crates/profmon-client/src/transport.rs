//! Transport abstraction and the WebSocket implementation.
//!
//! The session needs very little from a transport: a way to open it
//! ([`Connector::connect`]), a non-blocking [`Transport::send`], a
//! [`Transport::close`], and a stream of [`TransportEvent`]s. Opening
//! successfully is the "open" event; the stream carries inbound frames and
//! the single close/error event that ends the transport.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::EndpointAddress;
use crate::error::TransportError;

/// Something that happened on an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound frame.
    Message(Vec<u8>),
    /// The transport is gone. No further events follow.
    Closed {
        /// Human-readable cause
        reason: String,
        /// True for an orderly close by the peer
        clean: bool,
    },
}

/// Outbound half of an open transport.
pub trait Transport: Send {
    /// Hand a frame to the transport without waiting for it to be written.
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Close the transport. Idempotent.
    fn close(&mut self);
}

/// An open transport and its event stream.
pub struct Connection {
    /// Outbound half
    pub transport: Box<dyn Transport>,
    /// Inbound frames and the final close event
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens transports to an endpoint. Called again for every reconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport instance.
    async fn connect(&self, endpoint: &EndpointAddress) -> Result<Connection, TransportError>;
}

/// Connector for the UI API WebSocket.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a WebSocket connector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &EndpointAddress) -> Result<Connection, TransportError> {
        if endpoint.is_tls() && !cfg!(feature = "tls") {
            return Err(TransportError::Connect(format!(
                "{endpoint} needs TLS, which this build lacks (enable the `tls` feature)"
            )));
        }
        tracing::debug!("Opening WebSocket to {}", endpoint);
        let (socket, _response) = tokio_tungstenite::connect_async(endpoint.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    tracing::debug!("WebSocket write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(Message::Binary(data)) => TransportEvent::Message(data.to_vec()),
                    Ok(Message::Text(text)) => {
                        TransportEvent::Message(text.as_str().as_bytes().to_vec())
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map_or_else(
                            || "socket closed".to_string(),
                            |f| format!("socket closed ({}): {}", f.code, f.reason),
                        );
                        let _ = event_tx.send(TransportEvent::Closed {
                            reason,
                            clean: true,
                        });
                        return;
                    }
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                    Err(e) => {
                        let _ = event_tx.send(TransportEvent::Closed {
                            reason: format!("socket error: {e}"),
                            clean: false,
                        });
                        return;
                    }
                };
                if event_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = event_tx.send(TransportEvent::Closed {
                reason: "socket stream ended".to_string(),
                clean: false,
            });
        });

        Ok(Connection {
            transport: Box::new(WebSocketTransport {
                outbound: Some(out_tx),
                reader: Some(reader),
            }),
            events: event_rx,
        })
    }
}

/// Outbound half of a WebSocket. The writer task ends when `outbound` is dropped.
struct WebSocketTransport {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
}

impl Transport for WebSocketTransport {
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        outbound
            .send(Message::binary(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            // The writer task flushes the close frame and exits on its own.
            let _ = outbound.send(Message::Close(None));
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}
