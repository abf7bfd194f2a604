//! Co-pilot runtime - transport and connection plumbing.
//!
//! This crate provides the low-level infrastructure for talking to the
//! remote agent over a persistent duplex channel:
//!
//! - **Transport**: Bidirectional framing over WebSocket, plus an
//!   in-memory pair transport for tests
//! - **Connection**: Writer/reader task lifecycle around a transport,
//!   exposing a cloneable send handle and an inbound frame stream
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │  pilot-rs   │  Session, executor, audio, element index
//! └──────┬──────┘
//!        │ frames in / frames out
//! ┌──────▼──────┐
//! │pilot-runtime│  This crate
//! │  ┌────────┐ │
//! │  │ Conn   │ │  Task lifecycle + frame pump
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Trans  │ │  WebSocket / in-memory pair
//! │  └────────┘ │
//! └─────────────┘
//! ```
//!
//! The runtime is protocol-agnostic: it moves [`Frame`]s. Message shapes
//! live in `pilot-protocol`; the logic that interprets them lives in
//! `pilot-rs`.

pub mod connection;
pub mod error;
pub mod transport;

pub use connection::{Connection, ConnectionHandle};
pub use error::{Error, Result};
pub use transport::{
    Frame, PairPeer, PairTransport, Transport, TransportParts, TransportReceiver,
    WebSocketTransport,
};
