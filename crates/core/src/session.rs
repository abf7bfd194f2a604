//! Protocol session and client lifecycle.
//!
//! [`Client`] is the explicit owned entry point a host constructs: `start`
//! opens the duplex connection and spawns the session task, `stop` tears
//! it down, and the small host surface (text input, voice mute, mission
//! snapshot, bridged capture frames) goes through a command channel.
//!
//! The session task is the single logical thread of control: one
//! `select!` loop over the control connection, the optional dedicated
//! audio connection, capture frames, playback turn boundaries and host
//! commands. Every inbound control message dispatches through one
//! exhaustive `handle_agent_message` match.

use std::collections::VecDeque;
use std::sync::Arc;

use pilot_protocol::{
    AgentMessage, AgentState, AudioFormat, COPILOT_MODE, ClientMessage, CommandPayload,
    InteractionMode, MissionState, decode_embedded_audio, message_type,
};
use pilot_runtime::{Connection, ConnectionHandle, Error, Frame, TransportParts};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::audio::{
    AudioChunk, AudioPipeline, AudioSink, CaptureConfig, Playback, PlaybackEvent, VadConfig,
    VadEvent,
};
use crate::dom::{Document, ElementIndex};
use crate::executor::{CommandExecutor, ExecutorConfig};
use crate::mission::{MissionStore, unix_millis};

/// Delay between revealed words in the interactive chat stream.
const REVEAL_WORD_DELAY: Duration = Duration::from_millis(25);

/// Session-level configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Control-channel endpoint.
    pub ws_url: String,
    /// Dedicated audio-stream endpoint; `None` keeps audio multiplexed on
    /// the control channel.
    pub audio_stream_url: Option<String>,
    pub vad: VadConfig,
    pub capture: CaptureConfig,
    pub executor: ExecutorConfig,
    /// Chunks held back on the dedicated stream before playback starts.
    pub pre_buffer_chunks: usize,
    /// Cap on unpaired control-channel binary frames.
    pub binary_queue_limit: usize,
    /// Open a real input device for interactive sessions. Hosts that
    /// bridge capture through [`Client::feed_frame`] turn this off.
    pub device_capture: bool,
}

impl SessionConfig {
    /// Builds a config for the given control endpoint, deriving the
    /// dedicated audio endpoint from it (`/ws` -> `/stream`).
    pub fn new(ws_url: impl Into<String>) -> Self {
        let ws_url = ws_url.into();
        let audio_stream_url = ws_url
            .contains("/ws")
            .then(|| ws_url.replace("/ws", "/stream"));
        SessionConfig {
            ws_url,
            audio_stream_url,
            vad: VadConfig::default(),
            capture: CaptureConfig::default(),
            executor: ExecutorConfig::default(),
            pre_buffer_chunks: 3,
            binary_queue_limit: 64,
            device_capture: true,
        }
    }
}

/// Connection lifecycle of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit stop; persisted session state is cleared.
    UserStopped,
    /// The peer closed the connection; persisted state is kept so a
    /// fresh page load can resume.
    ConnectionClosed,
}

/// Notifications for the host chrome.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    AgentStateChanged(AgentState),
    /// Playback turn started/ended (`agent_speaking`).
    AgentSpeaking(bool),
    /// Agent text for the chat surface.
    AgentText { text: String, streaming: bool },
    /// Echo of user text input.
    UserText { text: String },
    /// One-time notice: capture failed, session continues text-only.
    MicUnavailable,
    /// The agent began tracking a multi-step goal.
    MissionTracked { goal: String },
    /// A cacheable asset arrived and was stored.
    AssetDelivered { asset: String },
    Stopped { reason: StopReason },
}

/// Seed for resuming a prior session after a navigation.
#[derive(Debug, Clone)]
pub struct ResumeSeed {
    pub session_id: String,
    pub goal: Option<String>,
}

enum HostCommand {
    SendText(String),
    SetVoiceMuted(bool),
    /// Capture frame bridged by the host (or tests).
    Frame(Vec<f32>),
    SnapshotMission,
    Stop,
}

struct ActiveSession {
    host_tx: mpsc::UnboundedSender<HostCommand>,
    task: JoinHandle<()>,
}

/// Owned co-pilot client. One live session per instance.
pub struct Client {
    config: SessionConfig,
    document: Arc<Document>,
    store: MissionStore,
    sink: Arc<dyn AudioSink>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    active: Option<ActiveSession>,
}

impl Client {
    /// Creates a client and the event stream the host renders from.
    pub fn new(
        config: SessionConfig,
        document: Arc<Document>,
        store: MissionStore,
        sink: Arc<dyn AudioSink>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Client {
                config,
                document,
                store,
                sink,
                events_tx,
                active: None,
            },
            events_rx,
        )
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn store(&self) -> &MissionStore {
        &self.store
    }

    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    /// Connects to the configured endpoint and starts a session.
    pub async fn start(&mut self, mode: InteractionMode) -> pilot_runtime::Result<()> {
        self.connect_and_start(mode, None).await
    }

    /// Auto-resume: if a fresh session id with the co-pilot marker is
    /// persisted, starts a session that hands the recovered goal to the
    /// agent as a resume hint. Returns false when there is nothing to
    /// resume.
    pub async fn auto_resume(&mut self) -> pilot_runtime::Result<bool> {
        let Some(info) = self.store.load_resume() else {
            return Ok(false);
        };
        let goal = self.store.load().map(|mission| mission.goal);
        if let Some(goal) = &goal {
            tracing::info!("Resuming mission across navigation: {}", goal);
        }
        self.connect_and_start(
            info.mode,
            Some(ResumeSeed {
                session_id: info.session_id,
                goal,
            }),
        )
        .await?;
        Ok(true)
    }

    async fn connect_and_start(
        &mut self,
        mode: InteractionMode,
        resume: Option<ResumeSeed>,
    ) -> pilot_runtime::Result<()> {
        if self.is_active() {
            return Err(Error::Protocol("a session is already active".into()));
        }
        let _ = self
            .events_tx
            .send(SessionEvent::StateChanged(SessionState::Connecting));
        let parts = pilot_runtime::WebSocketTransport::connect(&self.config.ws_url).await?;
        self.start_with_parts(mode, parts, resume)
    }

    /// Starts a session over already-connected transport parts.
    ///
    /// Hosts that own the socket (and tests, via the in-memory pair
    /// transport) enter here.
    pub fn start_with_parts(
        &mut self,
        mode: InteractionMode,
        parts: TransportParts,
        resume: Option<ResumeSeed>,
    ) -> pilot_runtime::Result<()> {
        if self.is_active() {
            return Err(Error::Protocol("a session is already active".into()));
        }

        let connection = Connection::new(parts);
        let handle = connection.handle();
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();

        let playback = Playback::new(Arc::clone(&self.sink), playback_tx);
        let pipeline = AudioPipeline::new(self.config.vad.clone(), playback.active_flag());
        let goal = resume.as_ref().and_then(|seed| seed.goal.clone());

        let session = Session {
            config: self.config.clone(),
            mode,
            state: SessionState::Handshaking,
            document: Arc::clone(&self.document),
            store: self.store.clone(),
            index: ElementIndex::new(Arc::clone(&self.document)),
            executor: CommandExecutor::with_config(
                Arc::clone(&self.document),
                self.config.executor.clone(),
            ),
            pipeline,
            playback,
            handle,
            events: self.events_tx.clone(),
            session_id: resume.as_ref().map(|seed| seed.session_id.clone()),
            resume,
            goal,
            waiting_for_execution: false,
            binary_queue: VecDeque::new(),
            audio_active: false,
            pre_buffer: Vec::new(),
            pending_audio_conn: None,
            epoch: Instant::now(),
            chunks_sent: 0,
        };

        let task = tokio::spawn(session.run(connection, host_rx, playback_rx));
        self.active = Some(ActiveSession { host_tx, task });
        Ok(())
    }

    /// Sends user text to the agent (and tracks it as the mission goal).
    pub fn send_text(&self, text: impl Into<String>) {
        self.send_host(HostCommand::SendText(text.into()));
    }

    /// Mutes or unmutes the agent's voice locally.
    pub fn set_voice_muted(&self, muted: bool) {
        self.send_host(HostCommand::SetVoiceMuted(muted));
    }

    /// Bridges one capture frame into the session (hosts without device
    /// audio feed the microphone this way).
    pub fn feed_frame(&self, samples: Vec<f32>) {
        self.send_host(HostCommand::Frame(samples));
    }

    /// Snapshots the in-flight mission; hosts call this just before a
    /// page unload.
    pub fn snapshot_mission(&self) {
        self.send_host(HostCommand::SnapshotMission);
    }

    fn send_host(&self, command: HostCommand) {
        if let Some(active) = &self.active {
            let _ = active.host_tx.send(command);
        }
    }

    /// Stops the session and waits for teardown.
    pub async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.host_tx.send(HostCommand::Stop);
            let _ = active.task.await;
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Session {
    config: SessionConfig,
    mode: InteractionMode,
    state: SessionState,
    document: Arc<Document>,
    store: MissionStore,
    index: ElementIndex,
    executor: CommandExecutor,
    pipeline: AudioPipeline,
    playback: Playback,
    handle: ConnectionHandle,
    events: mpsc::UnboundedSender<SessionEvent>,
    session_id: Option<String>,
    resume: Option<ResumeSeed>,
    /// Current mission goal, tracked for navigation persistence.
    goal: Option<String>,
    /// Set between speech end (or command receipt) and the outcome
    /// report; suppresses unsolicited blueprint sends.
    waiting_for_execution: bool,
    /// Unpaired control-channel binary frames awaiting `audio_chunk`
    /// metadata.
    binary_queue: VecDeque<Vec<u8>>,
    /// Whether the dedicated audio stream is delivering.
    audio_active: bool,
    /// Pre-buffered payloads from the dedicated stream.
    pre_buffer: Vec<Vec<u8>>,
    /// Audio connection opened during message handling, picked up by the
    /// run loop.
    pending_audio_conn: Option<Connection>,
    epoch: Instant,
    chunks_sent: u64,
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_audio_frame(conn: &mut Option<Connection>) -> Option<Frame> {
    match conn {
        Some(conn) => conn.next_frame().await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(
        mut self,
        mut control: Connection,
        mut host_rx: mpsc::UnboundedReceiver<HostCommand>,
        mut playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        self.set_state(SessionState::Handshaking);
        if let Err(e) = self.handshake() {
            tracing::error!("Handshake failed: {}", e);
            self.teardown(StopReason::ConnectionClosed, control, None).await;
            return;
        }
        self.set_state(SessionState::Active);

        // Interactive sessions get a real microphone when available;
        // failure degrades to text-only interaction with a one-time
        // notice. Host-bridged frames arrive via the command channel
        // either way.
        let (_mic_guard, mut mic_rx) =
            if self.mode == InteractionMode::Interactive && self.config.device_capture {
                self.start_capture()
            } else {
                (None, None)
            };

        let mut audio_conn: Option<Connection> = None;
        let reason = loop {
            if let Some(conn) = self.pending_audio_conn.take() {
                audio_conn = Some(conn);
            }

            tokio::select! {
                maybe_frame = control.next_frame() => match maybe_frame {
                    Some(Frame::Text(text)) => self.handle_text_frame(&text).await,
                    Some(Frame::Binary(bytes)) => self.handle_control_binary(bytes),
                    None => {
                        tracing::info!("Control connection closed by peer");
                        break StopReason::ConnectionClosed;
                    }
                },
                maybe_frame = next_audio_frame(&mut audio_conn) => match maybe_frame {
                    Some(frame) => self.handle_audio_stream_frame(frame),
                    None => {
                        tracing::warn!("Audio stream closed, falling back to control channel");
                        self.audio_active = false;
                        self.flush_pre_buffer();
                        audio_conn = None;
                    }
                },
                maybe_samples = recv_opt(&mut mic_rx) => match maybe_samples {
                    Some(samples) => self.handle_capture_frame(samples),
                    None => mic_rx = None,
                },
                Some(event) = playback_rx.recv() => self.handle_playback_event(event),
                maybe_command = host_rx.recv() => match maybe_command {
                    Some(command) => {
                        if matches!(self.handle_host_command(command).await, Flow::Stop) {
                            break StopReason::UserStopped;
                        }
                    }
                    None => break StopReason::UserStopped,
                },
            }
        };

        self.teardown(reason, control, audio_conn).await;
    }

    /// Sends `session_config` followed by a forced full blueprint.
    fn handshake(&mut self) -> pilot_runtime::Result<()> {
        let pending_goal = self.resume.as_ref().and_then(|seed| seed.goal.clone());
        self.handle.send_message(&ClientMessage::SessionConfig {
            mode: COPILOT_MODE.to_string(),
            interaction_mode: self.mode,
            timestamp: unix_millis(),
            session_id: self.resume.as_ref().map(|seed| seed.session_id.clone()),
            current_url: self.document.url_str(),
            pending_goal,
        })?;
        // The hint is one-shot; it was consumed by this handshake.
        self.resume = None;

        if let Some(elements) = self.index.scan(true) {
            self.handle.send_message(&ClientMessage::DomUpdate {
                elements,
                url: self.document.url_str(),
            })?;
        }
        Ok(())
    }

    #[cfg(feature = "device-audio")]
    fn start_capture(
        &self,
    ) -> (
        Option<crate::audio::capture::MicCapture>,
        Option<mpsc::UnboundedReceiver<Vec<f32>>>,
    ) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        match crate::audio::capture::MicCapture::start(self.config.capture, frames_tx) {
            Ok(mic) => (Some(mic), Some(frames_rx)),
            Err(e) => {
                tracing::warn!("Microphone unavailable, continuing text-only: {}", e);
                self.emit(SessionEvent::MicUnavailable);
                (None, None)
            }
        }
    }

    #[cfg(not(feature = "device-audio"))]
    fn start_capture(&self) -> (Option<()>, Option<mpsc::UnboundedReceiver<Vec<f32>>>) {
        tracing::debug!("Device audio disabled; capture must be host-bridged");
        (None, None)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    async fn handle_text_frame(&mut self, text: &str) {
        match AgentMessage::parse(text) {
            Ok(message) => self.handle_agent_message(message).await,
            Err(e) => {
                let tag = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|value| message_type(&value).map(str::to_string));
                tracing::debug!("Ignoring control message (type={:?}): {}", tag, e);
            }
        }
    }

    async fn handle_agent_message(&mut self, message: AgentMessage) {
        match message {
            AgentMessage::SessionCreated { session_id } => {
                tracing::info!(%session_id, "Session established");
                self.store.save_resume(&session_id, self.mode);
                self.session_id = Some(session_id.clone());
                if self.mode == InteractionMode::Interactive {
                    self.open_audio_stream(&session_id).await;
                }
            }
            AgentMessage::MissionStarted { goal } => {
                tracing::info!(%goal, "Mission goal tracked for navigation persistence");
                self.goal = Some(goal.clone());
                self.emit(SessionEvent::MissionTracked { goal });
            }
            AgentMessage::StateUpdate { state } | AgentMessage::SessionReady { state } => {
                if let Some(state) = state {
                    self.apply_agent_state(state);
                }
            }
            AgentMessage::AgentResponse { text, is_streaming } => {
                self.emit(SessionEvent::AgentText {
                    text,
                    streaming: is_streaming,
                });
            }
            AgentMessage::TurboSpeech { text } => self.reveal_text(&text).await,
            AgentMessage::Command { payload } => self.run_command(payload).await,
            AgentMessage::Navigate { url } => {
                self.pipeline.set_locked(true);
                self.executor.navigate(&url).await;
                self.pipeline.set_locked(false);
            }
            AgentMessage::AudioChunk {
                format,
                sample_rate,
                binary_sent,
                data,
            } => self.handle_audio_chunk(format, sample_rate, binary_sent, data),
            AgentMessage::AssetData { asset, data } => {
                self.store.cache_asset(&asset, &data);
                tracing::debug!(%asset, "Cached asset delivered over the channel");
                self.emit(SessionEvent::AssetDelivered { asset });
            }
            AgentMessage::AudioStreamReady => self.audio_active = true,
            AgentMessage::AudioStreamEnd => self.flush_pre_buffer(),
            AgentMessage::SpeakerMuteConfirmed { muted, mode } => {
                tracing::debug!(muted, ?mode, "Speaker mute confirmed");
            }
            AgentMessage::Ping => {
                let _ = self.handle.send_message(&ClientMessage::Pong);
            }
        }
    }

    /// Agent conversational states never lock the mic: listening and
    /// thinking obviously listen, and speech stays open for barge-in.
    /// The lock is held only while a command executes.
    fn apply_agent_state(&mut self, state: AgentState) {
        self.emit(SessionEvent::AgentStateChanged(state));
        self.pipeline.set_locked(false);
    }

    async fn open_audio_stream(&mut self, session_id: &str) {
        let Some(base) = self.config.audio_stream_url.clone() else {
            return;
        };
        let url = format!("{base}?session_id={session_id}");
        match Connection::open(&url).await {
            Ok(connection) => {
                tracing::info!("Dedicated audio stream connected");
                self.audio_active = true;
                self.pending_audio_conn = Some(connection);
            }
            Err(e) => {
                // Fallback: audio stays multiplexed on the control channel.
                tracing::warn!("Audio stream connection failed ({}), using control channel", e);
                self.audio_active = false;
            }
        }
    }

    fn handle_control_binary(&mut self, bytes: Vec<u8>) {
        if self.audio_active {
            // Dedicated stream owns audio; stale control binaries are
            // dropped when their metadata arrives.
            return;
        }
        self.binary_queue.push_back(bytes);
        if self.binary_queue.len() > self.config.binary_queue_limit {
            tracing::debug!("Binary queue overflow, dropping oldest frame");
            self.binary_queue.pop_front();
        }
    }

    fn handle_audio_chunk(
        &mut self,
        format: AudioFormat,
        sample_rate: u32,
        binary_sent: bool,
        data: Option<String>,
    ) {
        if self.mode == InteractionMode::Turbo || self.audio_active {
            // Not played from the control channel; drain the pairing queue.
            if binary_sent {
                self.binary_queue.pop_front();
            }
            return;
        }

        if binary_sent {
            if let Some(payload) = self.binary_queue.pop_front() {
                self.playback.play_chunk(&AudioChunk {
                    format,
                    sample_rate,
                    payload,
                });
            }
        } else if let Some(encoded) = data {
            match decode_embedded_audio(&encoded) {
                Ok(payload) => self.playback.play_chunk(&AudioChunk {
                    format,
                    sample_rate,
                    payload,
                }),
                Err(e) => tracing::warn!("Dropping undecodable embedded audio: {}", e),
            }
        }
    }

    fn handle_audio_stream_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Binary(payload) => {
                if self.mode == InteractionMode::Turbo {
                    return;
                }
                self.pre_buffer.push(payload);
                if self.pre_buffer.len() >= self.config.pre_buffer_chunks {
                    self.flush_pre_buffer();
                }
            }
            Frame::Text(text) => match AgentMessage::parse(&text) {
                Ok(AgentMessage::AudioStreamReady) => self.audio_active = true,
                Ok(AgentMessage::AudioStreamEnd) => self.flush_pre_buffer(),
                Ok(other) => tracing::debug!("Unexpected audio-stream message: {:?}", other),
                Err(e) => tracing::debug!("Malformed audio-stream message: {}", e),
            },
        }
    }

    fn flush_pre_buffer(&mut self) {
        for payload in self.pre_buffer.drain(..) {
            self.playback.play_chunk(&AudioChunk {
                format: AudioFormat::PcmF32le,
                sample_rate: 44_100,
                payload,
            });
        }
    }

    async fn run_command(&mut self, payload: CommandPayload) {
        tracing::info!(kind = ?payload.kind, target = ?payload.target_id, "Executing command");
        self.waiting_for_execution = true;
        self.pipeline.set_locked(true);

        let (outcome, fresh) = self.executor.execute(&payload, &mut self.index).await;
        tracing::info!(
            settle_ms = outcome.settle_time_ms,
            new_elements = outcome.new_elements_count,
            url_changed = outcome.url_changed,
            "Execution complete"
        );

        let report = ClientMessage::ExecutionComplete {
            status: "success".to_string(),
            outcome,
            dom_context: (!fresh.is_empty()).then_some(fresh),
            timestamp: unix_millis(),
        };
        if let Err(e) = self.handle.send_message(&report) {
            tracing::warn!("Failed to report execution outcome: {}", e);
        }

        self.waiting_for_execution = false;
        self.pipeline.set_locked(false);
    }

    fn handle_capture_frame(&mut self, samples: Vec<f32>) {
        if self.mode == InteractionMode::Turbo {
            return;
        }
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let outcome = self.pipeline.on_frame(&samples, now_ms);

        match outcome.vad_event {
            Some(VadEvent::SpeechStart { .. }) => self.on_speech_start(),
            Some(VadEvent::SpeechEnd { .. }) => self.on_speech_end(),
            None => {}
        }

        if let Some(bytes) = outcome.outbound {
            if self.handle.send_binary(bytes).is_ok() {
                self.chunks_sent += 1;
                if self.chunks_sent % 100 == 1 {
                    tracing::debug!("Audio streaming: {} chunks sent", self.chunks_sent);
                }
            }
        }
    }

    /// Speech start triggers an unsolicited differential blueprint unless
    /// a command outcome is still pending.
    fn on_speech_start(&mut self) {
        if self.waiting_for_execution {
            return;
        }
        if let Some(elements) = self.index.scan(false) {
            tracing::debug!("Speech detected with changed page, sending update");
            let _ = self.handle.send_message(&ClientMessage::DomUpdate {
                elements,
                url: self.document.url_str(),
            });
        }
    }

    fn on_speech_end(&mut self) {
        tracing::debug!("Speech ended, awaiting command");
        self.waiting_for_execution = true;
    }

    fn handle_playback_event(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started => self.emit(SessionEvent::AgentSpeaking(true)),
            PlaybackEvent::Ended => self.emit(SessionEvent::AgentSpeaking(false)),
        }
    }

    async fn handle_host_command(&mut self, command: HostCommand) -> Flow {
        match command {
            HostCommand::SendText(text) => {
                self.goal = Some(text.clone());
                self.emit(SessionEvent::UserText { text: text.clone() });
                let _ = self.handle.send_message(&ClientMessage::TextInput {
                    text,
                    mode: self.mode,
                });
            }
            HostCommand::SetVoiceMuted(muted) => {
                self.playback.set_muted(muted);
                let _ = self
                    .handle
                    .send_message(&ClientMessage::SpeakerMute { muted });
            }
            HostCommand::Frame(samples) => self.handle_capture_frame(samples),
            HostCommand::SnapshotMission => self.snapshot_mission(),
            HostCommand::Stop => return Flow::Stop,
        }
        Flow::Continue
    }

    /// Persists the mission just before a navigation so a multi-step task
    /// survives the page transition.
    fn snapshot_mission(&self) {
        let (Some(session_id), Some(goal)) = (&self.session_id, &self.goal) else {
            return;
        };
        self.store.save(&MissionState {
            session_id: session_id.clone(),
            goal: goal.clone(),
            url: self.document.url_str(),
            mode: self.mode,
            saved_at: unix_millis(),
        });
        tracing::debug!("Mission snapshot saved for navigation survival");
    }

    /// Streams agent text to the host: word-at-a-time in interactive
    /// mode, instantly in turbo.
    async fn reveal_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.mode == InteractionMode::Turbo {
            self.emit(SessionEvent::AgentText {
                text: format!("{text} "),
                streaming: true,
            });
            return;
        }
        for word in text.split_whitespace() {
            self.emit(SessionEvent::AgentText {
                text: format!("{word} "),
                streaming: true,
            });
            tokio::time::sleep(REVEAL_WORD_DELAY).await;
        }
    }

    async fn teardown(
        mut self,
        reason: StopReason,
        control: Connection,
        audio_conn: Option<Connection>,
    ) {
        tracing::info!(?reason, "Session ending");
        if reason == StopReason::UserStopped {
            // Explicit stop: the next page load starts fresh.
            self.store.clear();
            self.store.clear_resume();
        }

        self.playback.interrupt();
        self.pipeline.set_locked(true);
        if let Some(conn) = audio_conn {
            conn.shutdown().await;
        }
        control.shutdown().await;

        self.set_state(SessionState::Closed);
        self.emit(SessionEvent::Stopped { reason });
    }
}
