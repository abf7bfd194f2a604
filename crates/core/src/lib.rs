//! Realtime voice co-pilot client engine.
//!
//! An embedded client that lets a remote agent observe a page, listen to
//! the user's voice, speak back, and drive the page as if a human were
//! operating it. The host constructs a [`Client`] around a [`Document`],
//! a persistence store and an audio sink, then renders session events.
//!
//! # Components
//!
//! - [`audio`] - capture, voice-activity gating, gapless scheduled
//!   playback
//! - [`dom`] - the document model, the blueprint scanner/differ and
//!   settle detection
//! - [`executor`] - symbolic command replay with synthetic input
//! - [`session`] - the protocol session, its state machine and the
//!   owned [`Client`]
//! - [`mission`] - goal persistence across page navigations
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pilot::audio::NullSink;
//! use pilot::dom::Document;
//! use pilot::mission::MissionStore;
//! use pilot::session::{Client, SessionConfig};
//! use pilot_protocol::InteractionMode;
//!
//! # async fn start() -> pilot_runtime::Result<()> {
//! let document = Arc::new(Document::new(
//!     url::Url::parse("https://app.example.com/").unwrap(),
//! ));
//! let (mut client, mut events) = Client::new(
//!     SessionConfig::new("wss://agent.example.com/ws"),
//!     document,
//!     MissionStore::at_default_path(),
//!     Arc::new(NullSink::new()),
//! );
//! if !client.auto_resume().await? {
//!     client.start(InteractionMode::Interactive).await?;
//! }
//! while let Some(event) = events.recv().await {
//!     // render chrome from session events
//!     let _ = event;
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod dom;
pub mod executor;
pub mod mission;
pub mod session;

pub use audio::AudioError;
pub use dom::{Document, ElementIndex, NodeSpec, PageEvent};
pub use executor::{CommandExecutor, ExecutorConfig};
pub use mission::{MissionStore, StateStore};
pub use session::{Client, ResumeSeed, SessionConfig, SessionEvent, SessionState, StopReason};

// The protocol and runtime layers are part of the public surface.
pub use pilot_protocol as protocol;
pub use pilot_runtime as runtime;
pub use pilot_runtime::{Error, Result};
