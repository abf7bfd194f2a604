//! Gapless scheduled playback of synthesized speech.
//!
//! Chunks arrive from the network with arbitrary jitter. Instead of
//! playing each on arrival, every chunk is scheduled at
//! `max(now, end_of_previous_chunk)` on a single monotonically advancing
//! cursor, so consecutive chunks of one utterance are stitched
//! back-to-back regardless of arrival timing. Out-of-order arrival cannot
//! corrupt output - each start time derives only from the previous
//! computed end time and the current clock.
//!
//! Playback-active state rises on the first chunk of a turn and falls
//! only after the scheduled end has passed plus a short debounce, so the
//! boundary between consecutive chunks never flickers the speaking state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::format::decode_chunk;
use super::AudioChunk;

/// Priming offset before the first chunk of a turn, seconds.
const INITIAL_LEAD: f64 = 0.02;

/// How long after the scheduled end before the turn is declared over.
const END_DEBOUNCE: Duration = Duration::from_millis(500);

/// Playback destination with a shared clock.
///
/// `now`/`play_at` use one timeline in seconds; the sink is free to map it
/// onto a device stream position.
pub trait AudioSink: Send + Sync {
    /// Current position of the playback clock.
    fn now(&self) -> f64;
    /// Schedules samples to begin at `start` on the shared clock.
    fn play_at(&self, samples: Vec<f32>, sample_rate: u32, start: f64);
    /// Stops everything scheduled or playing.
    fn stop_all(&self);
}

/// Sink that discards audio but keeps a real clock.
///
/// Used in turbo mode and headless tests where nothing should be audible.
pub struct NullSink {
    started: std::time::Instant,
}

impl NullSink {
    pub fn new() -> Self {
        NullSink {
            started: std::time::Instant::now(),
        }
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for NullSink {
    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn play_at(&self, _samples: Vec<f32>, _sample_rate: u32, _start: f64) {}

    fn stop_all(&self) {}
}

/// Turn lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started,
    Ended,
}

/// Pure scheduling state: the advancing cursor.
#[derive(Debug, Clone)]
pub struct PlaybackScheduler {
    next_play_time: f64,
    playing: bool,
}

/// Where one chunk landed on the cursor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start: f64,
    pub end: f64,
    /// True when this chunk opened a new turn.
    pub starts_turn: bool,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        PlaybackScheduler {
            next_play_time: 0.0,
            playing: false,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// End of the last scheduled chunk.
    pub fn end_time(&self) -> f64 {
        self.next_play_time
    }

    /// Places a chunk of `duration` seconds on the cursor.
    pub fn schedule(&mut self, duration: f64, now: f64) -> ScheduledChunk {
        let starts_turn = !self.playing;
        if starts_turn {
            self.playing = true;
            self.next_play_time = now + INITIAL_LEAD;
        }
        let start = now.max(self.next_play_time);
        self.next_play_time = start + duration;
        ScheduledChunk {
            start,
            end: self.next_play_time,
            starts_turn,
        }
    }

    /// Closes the turn; the next chunk starts fresh.
    pub fn finish_turn(&mut self) {
        self.playing = false;
    }

    /// Drops the whole schedule (barge-in interrupt).
    pub fn reset(&mut self) {
        self.playing = false;
        self.next_play_time = 0.0;
    }
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

struct PlaybackInner {
    sink: Arc<dyn AudioSink>,
    scheduler: Mutex<PlaybackScheduler>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    /// Raised for the duration of a turn; read by the capture path for
    /// half-duplex gating.
    active: Arc<AtomicBool>,
    muted: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackInner {
    fn end_turn(&self) {
        self.scheduler.lock().finish_turn();
        self.active.store(false, Ordering::SeqCst);
        let _ = self.events.send(PlaybackEvent::Ended);
    }
}

/// Drives decoded chunks into an [`AudioSink`] with gapless scheduling.
pub struct Playback {
    inner: Arc<PlaybackInner>,
}

impl Playback {
    pub fn new(sink: Arc<dyn AudioSink>, events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        Playback {
            inner: Arc::new(PlaybackInner {
                sink,
                scheduler: Mutex::new(PlaybackScheduler::new()),
                events,
                active: Arc::new(AtomicBool::new(false)),
                muted: AtomicBool::new(false),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Shared flag tracking playback-active state (`agent_speaking`).
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.active)
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    /// Decodes and schedules one chunk.
    ///
    /// Decode failures are logged and the chunk dropped; they never end
    /// the session.
    pub fn play_chunk(&self, chunk: &AudioChunk) {
        if self.is_muted() {
            return;
        }
        let samples = match decode_chunk(chunk.format, &chunk.payload) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!("Dropping undecodable audio chunk: {}", e);
                return;
            }
        };
        if samples.is_empty() || chunk.sample_rate == 0 {
            return;
        }

        let duration = samples.len() as f64 / chunk.sample_rate as f64;
        let now = self.inner.sink.now();
        let scheduled = self.inner.scheduler.lock().schedule(duration, now);
        self.inner
            .sink
            .play_at(samples, chunk.sample_rate, scheduled.start);

        if scheduled.starts_turn {
            self.inner.active.store(true, Ordering::SeqCst);
            let _ = self.inner.events.send(PlaybackEvent::Started);
        }

        self.arm_end_watch(scheduled.end, now);
    }

    /// Stops all scheduled and active playback immediately and resets the
    /// cursor (agent barge-in cancellation).
    pub fn interrupt(&self) {
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }
        self.inner.sink.stop_all();
        let was_playing = {
            let mut scheduler = self.inner.scheduler.lock();
            let was = scheduler.is_playing();
            scheduler.reset();
            was
        };
        if was_playing {
            self.inner.active.store(false, Ordering::SeqCst);
            let _ = self.inner.events.send(PlaybackEvent::Ended);
        }
    }

    /// Re-arms the end-of-turn timer for the latest scheduled end.
    fn arm_end_watch(&self, end: f64, now: f64) {
        let delay = Duration::from_secs_f64((end - now).max(0.0)) + END_DEBOUNCE;
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.end_turn();
        });
        if let Some(previous) = self.inner.watcher.lock().replace(task) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_protocol::AudioFormat;

    /// Sink with a hand-driven clock that records every scheduled play.
    struct MockSink {
        now: Mutex<f64>,
        plays: Mutex<Vec<(f64, usize, u32)>>,
    }

    impl MockSink {
        fn new() -> Arc<Self> {
            Arc::new(MockSink {
                now: Mutex::new(0.0),
                plays: Mutex::new(Vec::new()),
            })
        }

        fn advance(&self, by: f64) {
            *self.now.lock() += by;
        }
    }

    impl AudioSink for MockSink {
        fn now(&self) -> f64 {
            *self.now.lock()
        }

        fn play_at(&self, samples: Vec<f32>, sample_rate: u32, start: f64) {
            self.plays.lock().push((start, samples.len(), sample_rate));
        }

        fn stop_all(&self) {
            self.plays.lock().clear();
        }
    }

    fn chunk(samples: usize, rate: u32) -> AudioChunk {
        AudioChunk {
            format: AudioFormat::PcmS16le,
            sample_rate: rate,
            payload: vec![0u8; samples * 2],
        }
    }

    #[test]
    fn scheduler_stitches_chunks_back_to_back() {
        let mut scheduler = PlaybackScheduler::new();
        let first = scheduler.schedule(0.1, 0.0);
        assert!(first.starts_turn);
        assert!((first.start - INITIAL_LEAD).abs() < 1e-9);

        // Arrivals at jittery times, all before the running end.
        let second = scheduler.schedule(0.25, 0.05);
        assert_eq!(second.start, first.end);
        let third = scheduler.schedule(0.08, 0.3);
        assert_eq!(third.start, second.end);
        assert!(!second.starts_turn && !third.starts_turn);
    }

    #[test]
    fn late_arrival_rewrites_schedule_forward_only() {
        let mut scheduler = PlaybackScheduler::new();
        let first = scheduler.schedule(0.1, 0.0);
        // Arrives after the previous chunk finished: starts now, no overlap.
        let second = scheduler.schedule(0.1, first.end + 0.5);
        assert_eq!(second.start, first.end + 0.5);
        assert!(second.start >= first.end);
    }

    #[test]
    fn reset_drops_the_cursor() {
        let mut scheduler = PlaybackScheduler::new();
        scheduler.schedule(1.0, 0.0);
        scheduler.reset();
        assert!(!scheduler.is_playing());
        let fresh = scheduler.schedule(0.1, 5.0);
        assert!(fresh.starts_turn);
        assert!((fresh.start - (5.0 + INITIAL_LEAD)).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn turn_lifecycle_events_with_debounce() {
        let sink = MockSink::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let playback = Playback::new(sink.clone() as Arc<dyn AudioSink>, tx);

        playback.play_chunk(&chunk(4410, 44_100)); // 0.1s
        assert_eq!(rx.recv().await.unwrap(), PlaybackEvent::Started);
        assert!(playback.is_active());

        // Second chunk of the same turn: no extra Started.
        playback.play_chunk(&chunk(4410, 44_100));
        assert!(rx.try_recv().is_err());

        // After the scheduled end plus debounce the turn closes.
        assert_eq!(rx.recv().await.unwrap(), PlaybackEvent::Ended);
        assert!(!playback.is_active());

        // Both chunks were handed to the sink, stitched in order.
        let plays = sink.plays.lock().clone();
        assert_eq!(plays.len(), 2);
        assert!(plays[1].0 >= plays[0].0);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_and_resets() {
        let sink = MockSink::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let playback = Playback::new(sink.clone() as Arc<dyn AudioSink>, tx);

        playback.play_chunk(&chunk(44_100, 44_100)); // 1s of audio
        assert_eq!(rx.recv().await.unwrap(), PlaybackEvent::Started);

        playback.interrupt();
        assert_eq!(rx.recv().await.unwrap(), PlaybackEvent::Ended);
        assert!(!playback.is_active());
        assert!(sink.plays.lock().is_empty(), "scheduled audio was stopped");

        // Cursor restarted: next chunk opens a new turn.
        sink.advance(2.0);
        playback.play_chunk(&chunk(4410, 44_100));
        assert_eq!(rx.recv().await.unwrap(), PlaybackEvent::Started);
        let last = *sink.plays.lock().last().unwrap();
        assert!((last.0 - (2.0 + INITIAL_LEAD)).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn muted_playback_drops_chunks() {
        let sink = MockSink::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let playback = Playback::new(sink.clone() as Arc<dyn AudioSink>, tx);

        playback.set_muted(true);
        playback.play_chunk(&chunk(4410, 44_100));
        assert!(rx.try_recv().is_err());
        assert!(sink.plays.lock().is_empty());
        assert!(!playback.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_chunk_is_dropped_not_fatal() {
        let sink = MockSink::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let playback = Playback::new(sink.clone() as Arc<dyn AudioSink>, tx);

        playback.play_chunk(&AudioChunk {
            format: AudioFormat::PcmS16le,
            sample_rate: 44_100,
            payload: vec![1, 2, 3], // misaligned
        });
        assert!(rx.try_recv().is_err());

        // The pipeline keeps working afterwards.
        playback.play_chunk(&chunk(4410, 44_100));
        assert_eq!(rx.recv().await.unwrap(), PlaybackEvent::Started);
    }
}
