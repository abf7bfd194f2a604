//! Microphone capture and speaker output via cpal.
//!
//! cpal streams are not `Send`, so each device stream lives on its own
//! thread: the capture thread pushes frames into the session's channel,
//! and the output thread mixes scheduled playback buffers into the device
//! callback. Both threads park until told to stop.
//!
//! Capture failure is never fatal - [`MicCapture::start`] reports
//! [`AudioError::MicUnavailable`] and the session degrades to text-only
//! interaction.

use std::sync::Arc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::playback::AudioSink;
use super::{AudioError, CaptureConfig};

/// A running microphone stream.
///
/// Frames (f32 mono at the configured rate) arrive on the channel handed
/// to [`MicCapture::start`]. Dropping the handle stops the stream.
pub struct MicCapture {
    stop_tx: crossbeam_channel::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicCapture {
    /// Opens the default input device at the requested rate and starts
    /// delivering frames.
    pub fn start(
        config: CaptureConfig,
        frames_tx: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let thread = thread::Builder::new()
            .name("pilot-mic".into())
            .spawn(move || {
                let stream = match build_input_stream(config, frames_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::Stream(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Keep the stream alive until stop or handle drop.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::info!("Microphone capture started");
                Ok(MicCapture {
                    stop_tx,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(AudioError::Stream("capture thread died during setup".into())),
        }
    }

    /// Stops the stream and joins the capture thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_input_stream(
    config: CaptureConfig,
    frames_tx: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::MicUnavailable("no default input device".into()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::MicUnavailable(e.to_string()))?;
    let source_rate = supported.sample_rate();
    let source_channels = supported.channels() as usize;
    let target_rate = config.sample_rate;

    device
        .build_input_stream(
            &supported.into(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Convert to mono at the recognizer rate; unbounded send
                // never blocks the realtime callback.
                let frame = super::format::downmix_and_decimate(
                    data,
                    source_channels,
                    source_rate,
                    target_rate,
                );
                if !frame.is_empty() {
                    let _ = frames_tx.send(frame);
                }
            },
            |err| {
                tracing::error!("Input stream error: {}", err);
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                AudioError::MicUnavailable("input device not available".into())
            }
            other => AudioError::MicUnavailable(other.to_string()),
        })
}

struct ScheduledBuffer {
    /// Start position on the device timeline, in device samples.
    start: u64,
    samples: Vec<f32>,
    source_rate: u32,
}

struct SpeakerState {
    /// Device samples rendered so far; the playback clock.
    position: u64,
    queue: Vec<ScheduledBuffer>,
}

/// Speaker output implementing [`AudioSink`] over the default device.
///
/// Scheduled buffers are mixed into the output callback at their start
/// positions; the shared clock is the count of rendered device samples.
pub struct SpeakerSink {
    state: Arc<Mutex<SpeakerState>>,
    device_rate: u32,
    stop_tx: crossbeam_channel::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SpeakerSink {
    /// Opens the default output device.
    pub fn open() -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) =
            crossbeam_channel::bounded::<Result<(u32, Arc<Mutex<SpeakerState>>), AudioError>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let thread = thread::Builder::new()
            .name("pilot-speaker".into())
            .spawn(move || {
                let built = build_output_stream();
                match built {
                    Ok((stream, rate, state)) => {
                        if let Err(e) = stream.play() {
                            let _ = ready_tx.send(Err(AudioError::Stream(e.to_string())));
                            return;
                        }
                        let _ = ready_tx.send(Ok((rate, state)));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok((device_rate, state))) => Ok(SpeakerSink {
                state,
                device_rate,
                stop_tx,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(AudioError::Stream("output thread died during setup".into())),
        }
    }
}

impl AudioSink for SpeakerSink {
    fn now(&self) -> f64 {
        self.state.lock().position as f64 / self.device_rate as f64
    }

    fn play_at(&self, samples: Vec<f32>, sample_rate: u32, start: f64) {
        let start = (start * self.device_rate as f64) as u64;
        self.state.lock().queue.push(ScheduledBuffer {
            start,
            samples,
            source_rate: sample_rate,
        });
    }

    fn stop_all(&self) {
        self.state.lock().queue.clear();
    }
}

impl Drop for SpeakerSink {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

type OutputParts = (cpal::Stream, u32, Arc<Mutex<SpeakerState>>);

fn build_output_stream() -> Result<OutputParts, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Stream("no default output device".into()))?;
    let default_config = device
        .default_output_config()
        .map_err(|e| AudioError::Stream(e.to_string()))?;
    let device_rate = default_config.sample_rate();
    let channels = default_config.channels() as usize;

    let state = Arc::new(Mutex::new(SpeakerState {
        position: 0,
        queue: Vec::new(),
    }));
    let callback_state = Arc::clone(&state);

    let stream = device
        .build_output_stream(
            &default_config.into(),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut state = callback_state.lock();
                let device_rate = device_rate as f64;
                for frame in data.chunks_mut(channels) {
                    let t = state.position;
                    let mut mixed = 0.0f32;
                    for buffer in &state.queue {
                        if t < buffer.start {
                            continue;
                        }
                        // Nearest-sample rate mapping from source to device.
                        let offset = (t - buffer.start) as f64 * buffer.source_rate as f64
                            / device_rate;
                        if let Some(sample) = buffer.samples.get(offset as usize) {
                            mixed += sample;
                        }
                    }
                    for slot in frame {
                        *slot = mixed.clamp(-1.0, 1.0);
                    }
                    state.position += 1;
                }
                // Drop buffers that have fully played out.
                let position = state.position;
                state.queue.retain(|buffer| {
                    let length_device = buffer.samples.len() as f64 * device_rate
                        / buffer.source_rate as f64;
                    position < buffer.start + length_device as u64
                });
            },
            |err| {
                tracing::error!("Output stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))?;

    Ok((stream, device_rate, state))
}
