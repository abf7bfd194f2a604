//! Connection lifecycle around a transport.
//!
//! A [`Connection`] owns the writer and reader tasks for one transport:
//! outbound frames are queued on an mpsc channel and drained by the writer
//! task; inbound frames arrive through [`Connection::next_frame`]. The
//! cloneable [`ConnectionHandle`] is the only thing other components need
//! to send.
//!
//! There is no request/response correlation here: the co-pilot protocol is
//! event-shaped (the agent pushes commands, the client pushes reports), so
//! the connection stays a plain frame pump and ordering is preserved per
//! direction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pilot_protocol::ClientMessage;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::transport::{Frame, TransportParts, WebSocketTransport};

/// A live duplex connection to the agent endpoint.
pub struct Connection {
    handle: ConnectionHandle,
    frame_rx: mpsc::UnboundedReceiver<Frame>,
    close_tx: oneshot::Sender<()>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Wraps connected transport parts, spawning the writer and reader
    /// tasks.
    pub fn new(parts: TransportParts) -> Self {
        let TransportParts {
            mut sender,
            receiver,
            frame_rx,
        } = parts;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = Arc::clone(&open);
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_frame = outbound_rx.recv() => match maybe_frame {
                        Some(frame) => {
                            if let Err(e) = sender.send(frame).await {
                                tracing::error!("Transport write error: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = &mut close_rx => break,
                }
            }
            let _ = sender.close().await;
            writer_open.store(false, Ordering::SeqCst);
        });

        let reader_open = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            if let Err(e) = receiver.run().await {
                tracing::error!("Transport read error: {}", e);
            }
            reader_open.store(false, Ordering::SeqCst);
        });

        Self {
            handle: ConnectionHandle { outbound_tx, open },
            frame_rx,
            close_tx,
            writer,
            reader,
        }
    }

    /// Opens a WebSocket connection to `url`.
    pub async fn open(url: &str) -> Result<Self> {
        let parts = WebSocketTransport::connect(url).await?;
        Ok(Self::new(parts))
    }

    /// Returns a cloneable handle for sending frames.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Receives the next inbound frame.
    ///
    /// Returns `None` once the peer has closed and all buffered frames are
    /// drained - the caller's signal to tear the session down.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frame_rx.recv().await
    }

    /// Closes the connection and stops its tasks.
    ///
    /// Outstanding [`ConnectionHandle`]s start failing immediately; the
    /// writer flushes a close frame before exiting.
    pub async fn shutdown(self) {
        self.handle.open.store(false, Ordering::SeqCst);
        let _ = self.close_tx.send(());
        drop(self.handle);
        drop(self.frame_rx);
        let _ = self.writer.await;
        self.reader.abort();
        let _ = self.reader.await;
    }
}

/// Cloneable sending handle for a [`Connection`].
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound_tx: mpsc::UnboundedSender<Frame>,
    open: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Queues a text frame for sending.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Frame::Text(text.into()))
    }

    /// Queues a binary frame for sending.
    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.send(Frame::Binary(bytes))
    }

    /// Serializes and queues a control message.
    pub fn send_message(&self, message: &ClientMessage) -> Result<()> {
        self.send_text(message.to_json()?)
    }

    /// Queues a frame for sending.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }
        self.outbound_tx
            .send(frame)
            .map_err(|_| Error::ChannelClosed)
    }

    /// Whether the transport is still believed usable.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PairTransport;

    #[tokio::test]
    async fn frames_round_trip_through_connection() {
        let (parts, mut peer) = PairTransport::pair();
        let mut connection = Connection::new(parts);
        let handle = connection.handle();

        handle.send_text("{\"type\":\"pong\"}").unwrap();
        handle.send_binary(vec![9, 9]).unwrap();

        assert_eq!(
            peer.from_client.recv().await.unwrap(),
            Frame::Text("{\"type\":\"pong\"}".into())
        );
        assert_eq!(
            peer.from_client.recv().await.unwrap(),
            Frame::Binary(vec![9, 9])
        );

        peer.send_text("{\"type\":\"ping\"}");
        let frame = connection.next_frame().await.unwrap();
        assert_eq!(frame.as_text(), Some("{\"type\":\"ping\"}"));

        connection.shutdown().await;
    }

    #[tokio::test]
    async fn peer_close_ends_frame_stream() {
        let (parts, peer) = PairTransport::pair();
        let mut connection = Connection::new(parts);

        drop(peer);
        assert!(connection.next_frame().await.is_none());
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn send_fails_once_writer_stopped() {
        let (parts, peer) = PairTransport::pair();
        let connection = Connection::new(parts);
        let handle = connection.handle();

        drop(peer);
        connection.shutdown().await;

        // Writer task has exited; the handle reports the closure.
        let result = handle.send_text("late");
        assert!(result.is_err());
    }
}
