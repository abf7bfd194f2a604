//! Duplex frame transport.
//!
//! A transport moves [`Frame`]s in both directions: JSON control messages
//! as text frames and raw PCM audio as binary frames. The production
//! transport is a WebSocket ([`WebSocketTransport`]); tests use the
//! in-memory [`PairTransport`] so the agent side can be impersonated
//! without a socket.
//!
//! Senders and receivers are split so the connection can run them on
//! independent tasks: the receiver pushes inbound frames into an mpsc
//! channel handed out as part of [`TransportParts`].

use std::future::Future;
use std::pin::Pin;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{Error, Result};

/// One frame on the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A JSON control message.
    Text(String),
    /// A raw audio payload.
    Binary(Vec<u8>),
}

impl Frame {
    /// Returns the text payload, if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Binary(_) => None,
        }
    }
}

/// Sending half of a transport.
pub trait Transport: Send {
    /// Sends one frame to the peer.
    fn send(&mut self, frame: Frame) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Closes the transport gracefully.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Receiving half of a transport.
///
/// `run` drives the read loop until the peer closes or the transport
/// fails, pushing every inbound frame into the channel created alongside
/// this receiver.
pub trait TransportReceiver: Send {
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// A connected transport, split for independent read/write tasks.
pub struct TransportParts {
    pub sender: Box<dyn Transport>,
    pub receiver: Box<dyn TransportReceiver>,
    /// Inbound frames, fed by the receiver task.
    pub frame_rx: mpsc::UnboundedReceiver<Frame>,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over tokio-tungstenite.
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Connects to the given `ws://` / `wss://` URL.
    pub async fn connect(url: &str) -> Result<TransportParts> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        tracing::debug!(url, "WebSocket connected");

        let (sink, source) = stream.split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        Ok(TransportParts {
            sender: Box::new(WebSocketSender { sink }),
            receiver: Box::new(WebSocketReceiver { source, frame_tx }),
            frame_rx,
        })
    }
}

struct WebSocketSender {
    sink: SplitSink<WsStream, WsMessage>,
}

impl Transport for WebSocketSender {
    fn send(&mut self, frame: Frame) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let message = match frame {
                Frame::Text(text) => WsMessage::Text(text),
                Frame::Binary(bytes) => WsMessage::Binary(bytes),
            };
            self.sink
                .send(message)
                .await
                .map_err(|e| Error::Transport(e.to_string()))
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.sink
                .send(WsMessage::Close(None))
                .await
                .map_err(|e| Error::Transport(e.to_string()))
        })
    }
}

struct WebSocketReceiver {
    source: SplitStream<WsStream>,
    frame_tx: mpsc::UnboundedSender<Frame>,
}

impl TransportReceiver for WebSocketReceiver {
    fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            while let Some(message) = self.source.next().await {
                let message = message.map_err(|e| Error::Transport(e.to_string()))?;
                let frame = match message {
                    WsMessage::Text(text) => Frame::Text(text),
                    WsMessage::Binary(bytes) => Frame::Binary(bytes),
                    WsMessage::Close(_) => break,
                    // Protocol-level ping/pong is handled by tungstenite.
                    _ => continue,
                };
                if self.frame_tx.send(frame).is_err() {
                    // Consumer went away; treat as a local close.
                    break;
                }
            }
            tracing::debug!("WebSocket receive loop ended");
            Ok(())
        })
    }
}

/// In-memory transport pair for tests.
///
/// [`PairTransport::pair`] returns the client-side [`TransportParts`] plus
/// a [`PairPeer`] representing the remote agent: frames the client sends
/// appear on `from_client`, and anything pushed into `to_client` is
/// delivered to the client as an inbound frame.
pub struct PairTransport;

impl PairTransport {
    pub fn pair() -> (TransportParts, PairPeer) {
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, peer_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let parts = TransportParts {
            sender: Box::new(PairSender { tx: client_tx }),
            receiver: Box::new(PairReceiver {
                rx: peer_rx,
                frame_tx,
            }),
            frame_rx,
        };

        (
            parts,
            PairPeer {
                to_client,
                from_client,
            },
        )
    }
}

/// Agent-side handle of a [`PairTransport`].
pub struct PairPeer {
    pub to_client: mpsc::UnboundedSender<Frame>,
    pub from_client: mpsc::UnboundedReceiver<Frame>,
}

impl PairPeer {
    /// Sends a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.to_client.send(Frame::Text(text.into()));
    }

    /// Sends a binary frame to the client.
    pub fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.to_client.send(Frame::Binary(bytes));
    }
}

struct PairSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl Transport for PairSender {
    fn send(&mut self, frame: Frame) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let result = self
            .tx
            .send(frame)
            .map_err(|_| Error::ChannelClosed);
        Box::pin(async move { result })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

struct PairReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
    frame_tx: mpsc::UnboundedSender<Frame>,
}

impl TransportReceiver for PairReceiver {
    fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            while let Some(frame) = self.rx.recv().await {
                if self.frame_tx.send(frame).is_err() {
                    break;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_frames_both_ways() {
        let (mut parts, mut peer) = PairTransport::pair();

        let receiver = parts.receiver;
        let reader = tokio::spawn(async move { receiver.run().await });

        parts
            .sender
            .send(Frame::Text("{\"type\":\"pong\"}".into()))
            .await
            .unwrap();
        parts
            .sender
            .send(Frame::Binary(vec![1, 2, 3]))
            .await
            .unwrap();

        assert_eq!(
            peer.from_client.recv().await.unwrap(),
            Frame::Text("{\"type\":\"pong\"}".into())
        );
        assert_eq!(
            peer.from_client.recv().await.unwrap(),
            Frame::Binary(vec![1, 2, 3])
        );

        peer.send_text("{\"type\":\"ping\"}");
        let inbound = parts.frame_rx.recv().await.unwrap();
        assert_eq!(inbound.as_text(), Some("{\"type\":\"ping\"}"));

        drop(peer);
        reader.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pair_close_ends_inbound_stream() {
        let (mut parts, peer) = PairTransport::pair();

        let receiver = parts.receiver;
        let reader = tokio::spawn(async move { receiver.run().await });

        drop(peer);
        reader.await.unwrap().unwrap();

        // Receiver finished without forwarding anything; the stream ends.
        assert!(parts.frame_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn pair_send_after_peer_drop_errors() {
        let (mut parts, peer) = PairTransport::pair();
        drop(peer);

        let err = parts
            .sender
            .send(Frame::Text("late".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
    }
}
