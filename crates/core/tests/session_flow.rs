//! End-to-end session tests over the in-memory pair transport.
//!
//! The test impersonates the remote agent on the peer side of a
//! [`PairTransport`] and drives a full session: handshake, blueprint,
//! commands, audio pairing, mission persistence.

use std::sync::Arc;

use pilot::audio::NullSink;
use pilot::dom::{Document, NodeSpec, PageEvent};
use pilot::mission::MissionStore;
use pilot::session::{Client, ResumeSeed, SessionConfig, SessionEvent, SessionState, StopReason};
use pilot_protocol::{ClientMessage, InteractionMode};
use pilot_runtime::{Frame, PairPeer, PairTransport};
use url::Url;

fn test_config() -> SessionConfig {
    let mut config = SessionConfig::new("ws://agent.test/ws");
    config.audio_stream_url = None;
    config.device_capture = false;
    config
}

fn seeded_document() -> Arc<Document> {
    let doc = Arc::new(Document::new(
        Url::parse("https://app.example.com/jobs").unwrap(),
    ));
    doc.append(
        doc.root(),
        NodeSpec::new("h1").text("Find work").rect(0.0, 10.0, 300.0, 32.0),
    );
    doc.append(
        doc.root(),
        NodeSpec::new("button").text("Apply now").rect(0.0, 60.0, 120.0, 36.0),
    );
    doc
}

struct Harness {
    client: Client,
    events: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
    peer: PairPeer,
    document: Arc<Document>,
    store: MissionStore,
}

fn start(mode: InteractionMode, resume: Option<ResumeSeed>) -> Harness {
    let document = seeded_document();
    let store = MissionStore::in_memory();
    let (mut client, events) = Client::new(
        test_config(),
        Arc::clone(&document),
        store.clone(),
        Arc::new(NullSink::new()),
    );
    let (parts, peer) = PairTransport::pair();
    client
        .start_with_parts(mode, parts, resume)
        .expect("session starts");
    Harness {
        client,
        events,
        peer,
        document,
        store,
    }
}

/// Next JSON control message from the client, skipping binary frames.
async fn next_message(peer: &mut PairPeer) -> ClientMessage {
    loop {
        match peer.from_client.recv().await.expect("client frame") {
            Frame::Text(text) => {
                return serde_json::from_str(&text).expect("well-formed client message");
            }
            Frame::Binary(_) => continue,
        }
    }
}

async fn wait_for_event<F>(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
    mut predicate: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = events.recv().await.expect("session event");
        if predicate(&event) {
            return event;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn handshake_sends_config_then_blueprint() {
    let mut harness = start(InteractionMode::Turbo, None);

    match next_message(&mut harness.peer).await {
        ClientMessage::SessionConfig {
            mode,
            interaction_mode,
            session_id,
            current_url,
            pending_goal,
            ..
        } => {
            assert_eq!(mode, "visual-copilot");
            assert_eq!(interaction_mode, InteractionMode::Turbo);
            assert!(session_id.is_none());
            assert_eq!(current_url, "https://app.example.com/jobs");
            assert!(pending_goal.is_none());
        }
        other => panic!("expected session_config first, got {other:?}"),
    }

    match next_message(&mut harness.peer).await {
        ClientMessage::DomUpdate { elements, url } => {
            assert_eq!(url, "https://app.example.com/jobs");
            assert!(elements.iter().any(|e| e.text == "Apply now" && e.interactive));
            assert!(elements.iter().any(|e| e.tag == "header"));
        }
        other => panic!("expected dom_update second, got {other:?}"),
    }

    wait_for_event(&mut harness.events, |event| {
        matches!(event, SessionEvent::StateChanged(SessionState::Active))
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn keepalive_resume_persistence_and_stop() {
    let mut harness = start(InteractionMode::Turbo, None);
    next_message(&mut harness.peer).await; // session_config
    next_message(&mut harness.peer).await; // dom_update

    harness
        .peer
        .send_text(r#"{"type":"session_created","session_id":"sess-42"}"#);
    harness.peer.send_text(r#"{"type":"ping"}"#);

    match next_message(&mut harness.peer).await {
        ClientMessage::Pong => {}
        other => panic!("expected pong, got {other:?}"),
    }

    // session_created preceded the ping, so the identity is persisted.
    let resume = harness.store.load_resume().expect("resume info saved");
    assert_eq!(resume.session_id, "sess-42");
    assert_eq!(resume.mode, InteractionMode::Turbo);

    harness.client.stop().await;
    wait_for_event(&mut harness.events, |event| {
        matches!(
            event,
            SessionEvent::Stopped {
                reason: StopReason::UserStopped
            }
        )
    })
    .await;

    // Explicit stop clears persisted state.
    assert!(harness.store.load_resume().is_none());
    assert!(!harness.client.is_active());
}

#[tokio::test(start_paused = true)]
async fn command_round_trip_reports_structured_outcome() {
    let mut harness = start(InteractionMode::Turbo, None);
    next_message(&mut harness.peer).await;
    let target_id = match next_message(&mut harness.peer).await {
        ClientMessage::DomUpdate { elements, .. } => elements
            .iter()
            .find(|e| e.text == "Apply now")
            .expect("button in blueprint")
            .id
            .clone(),
        other => panic!("expected dom_update, got {other:?}"),
    };

    // Page logic: the click reveals a confirmation dialog.
    let doc = Arc::clone(&harness.document);
    let mut page_events = harness.document.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = page_events.recv().await {
            if matches!(event, PageEvent::Click(_)) {
                doc.append(
                    doc.root(),
                    NodeSpec::new("div")
                        .attr("role", "dialog")
                        .text("Application sent")
                        .rect(200.0, 200.0, 300.0, 120.0),
                );
                break;
            }
        }
    });

    harness.peer.send_text(format!(
        r#"{{"type":"command","payload":{{"type":"click","target_id":"{target_id}"}}}}"#
    ));

    match next_message(&mut harness.peer).await {
        ClientMessage::ExecutionComplete {
            status,
            outcome,
            dom_context,
            ..
        } => {
            assert_eq!(status, "success");
            assert!(outcome.dom_changed);
            assert!(outcome.has_modal);
            assert!(!outcome.url_changed);
            assert_eq!(outcome.new_elements_count, 1);
            assert_eq!(outcome.current_url, "https://app.example.com/jobs");
            assert!(outcome.settle_time_ms <= 3500);
            let fresh = dom_context.expect("fresh blueprint attached");
            assert!(fresh.iter().any(|e| e.text == "Application sent"));
        }
        other => panic!("expected execution_complete, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn navigate_message_updates_location_in_place() {
    let mut harness = start(InteractionMode::Turbo, None);
    next_message(&mut harness.peer).await;
    next_message(&mut harness.peer).await;

    harness
        .peer
        .send_text(r#"{"type":"navigate","url":"/jobs/42"}"#);
    // Synchronize on the keepalive to know the navigation ran.
    harness.peer.send_text(r#"{"type":"ping"}"#);
    next_message(&mut harness.peer).await;

    assert_eq!(
        harness.document.url_str(),
        "https://app.example.com/jobs/42"
    );
}

#[tokio::test(start_paused = true)]
async fn mission_survives_connection_loss_but_not_stop() {
    let mut harness = start(InteractionMode::Turbo, None);
    next_message(&mut harness.peer).await;
    next_message(&mut harness.peer).await;

    harness
        .peer
        .send_text(r#"{"type":"session_created","session_id":"sess-7"}"#);
    harness.peer.send_text(r#"{"type":"ping"}"#);
    next_message(&mut harness.peer).await; // pong: session_created applied

    harness.client.send_text("apply to the plumber job");
    match next_message(&mut harness.peer).await {
        ClientMessage::TextInput { text, mode } => {
            assert_eq!(text, "apply to the plumber job");
            assert_eq!(mode, InteractionMode::Turbo);
        }
        other => panic!("expected text_input, got {other:?}"),
    }

    harness.client.snapshot_mission();
    // Order host commands behind an observable one before cutting the wire.
    harness.client.set_voice_muted(true);
    match next_message(&mut harness.peer).await {
        ClientMessage::SpeakerMute { muted } => assert!(muted),
        other => panic!("expected speaker_mute, got {other:?}"),
    }

    drop(harness.peer);
    wait_for_event(&mut harness.events, |event| {
        matches!(
            event,
            SessionEvent::Stopped {
                reason: StopReason::ConnectionClosed
            }
        )
    })
    .await;

    // An unexpected close keeps persisted state for the next page load.
    let resume = harness.store.load_resume().expect("resume info kept");
    assert_eq!(resume.session_id, "sess-7");
    let mission = harness.store.load().expect("fresh mission kept");
    assert_eq!(mission.goal, "apply to the plumber job");
    assert_eq!(mission.session_id, "sess-7");
}

#[tokio::test(start_paused = true)]
async fn resume_seed_flows_into_the_handshake() {
    let mut harness = start(
        InteractionMode::Interactive,
        Some(ResumeSeed {
            session_id: "sess-9".into(),
            goal: Some("finish checking out".into()),
        }),
    );

    match next_message(&mut harness.peer).await {
        ClientMessage::SessionConfig {
            session_id,
            pending_goal,
            interaction_mode,
            ..
        } => {
            assert_eq!(session_id.as_deref(), Some("sess-9"));
            assert_eq!(pending_goal.as_deref(), Some("finish checking out"));
            assert_eq!(interaction_mode, InteractionMode::Interactive);
        }
        other => panic!("expected session_config, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn control_channel_audio_pairs_and_gates_the_mic() {
    let mut harness = start(InteractionMode::Interactive, None);
    next_message(&mut harness.peer).await;
    next_message(&mut harness.peer).await;

    // 0.05s of silence, delivered binary-then-metadata on the control
    // channel (no dedicated stream in this config).
    harness.peer.send_binary(vec![0u8; 2205 * 2]);
    harness.peer.send_text(
        r#"{"type":"audio_chunk","format":"pcm_s16le","sample_rate":44100,"binary_sent":true}"#,
    );
    wait_for_event(&mut harness.events, |event| {
        matches!(event, SessionEvent::AgentSpeaking(true))
    })
    .await;

    // Half-duplex: frames fed while the agent speaks are dropped.
    harness.client.feed_frame(vec![0.5; 320]);
    harness.client.send_text("sync");
    loop {
        match harness.peer.from_client.recv().await.expect("frame") {
            Frame::Binary(_) => panic!("capture frame forwarded while agent speaking"),
            Frame::Text(text) if text.contains("text_input") => break,
            Frame::Text(_) => continue,
        }
    }

    // Turn ends after the scheduled end plus debounce.
    wait_for_event(&mut harness.events, |event| {
        matches!(event, SessionEvent::AgentSpeaking(false))
    })
    .await;

    // Now frames flow again, serialized as 16-bit PCM.
    harness.client.feed_frame(vec![0.5; 320]);
    loop {
        match harness.peer.from_client.recv().await.expect("frame") {
            Frame::Binary(bytes) => {
                assert_eq!(bytes.len(), 640);
                break;
            }
            Frame::Text(_) => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn speech_start_sends_differential_blueprint() {
    let mut harness = start(InteractionMode::Interactive, None);
    next_message(&mut harness.peer).await;
    next_message(&mut harness.peer).await;

    // The page changed since the handshake scan.
    harness.document.append(
        harness.document.root(),
        NodeSpec::new("button").text("New offer").rect(0.0, 120.0, 140.0, 36.0),
    );

    // Loud frames cross the VAD threshold: speech start fires once.
    harness.client.feed_frame(vec![0.5; 320]);

    match next_message(&mut harness.peer).await {
        ClientMessage::DomUpdate { elements, .. } => {
            let fresh = elements.iter().find(|e| e.text == "New offer").unwrap();
            assert!(fresh.is_new, "element added after baseline is flagged new");
        }
        other => panic!("expected dom_update on speech start, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn turbo_speech_is_revealed_instantly_in_turbo() {
    let mut harness = start(InteractionMode::Turbo, None);
    next_message(&mut harness.peer).await;
    next_message(&mut harness.peer).await;

    harness
        .peer
        .send_text(r#"{"type":"turbo_speech","text":"Opening the first job now"}"#);

    let event = wait_for_event(&mut harness.events, |event| {
        matches!(event, SessionEvent::AgentText { .. })
    })
    .await;
    match event {
        SessionEvent::AgentText { text, streaming } => {
            assert_eq!(text, "Opening the first job now ");
            assert!(streaming);
        }
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_messages_never_end_the_session() {
    let mut harness = start(InteractionMode::Turbo, None);
    next_message(&mut harness.peer).await;
    next_message(&mut harness.peer).await;

    harness
        .peer
        .send_text(r#"{"type":"quantum_flux","payload":{"x":1}}"#);
    harness.peer.send_text("not even json");
    harness.peer.send_text(r#"{"type":"ping"}"#);

    match next_message(&mut harness.peer).await {
        ClientMessage::Pong => {}
        other => panic!("session should survive unknown messages, got {other:?}"),
    }
}
