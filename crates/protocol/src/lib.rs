//! Wire types for the co-pilot agent protocol.
//!
//! This crate contains the serde-serializable types exchanged with the
//! remote agent over the persistent duplex channel: JSON control messages
//! in both directions plus metadata describing the binary PCM audio frames
//! that travel alongside them.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization
//! - **1:1 with protocol**: Field names match what appears on the wire
//! - **Stable**: Changes only when the wire protocol changes
//!
//! The session logic that produces and consumes these types lives in
//! `pilot-rs`; the transport that carries them lives in `pilot-runtime`.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
