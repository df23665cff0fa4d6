use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

/// Control surface for the speech-recognition capture session.
///
/// Playback and live microphone capture must never run at the same time, so
/// the playback manager halts whatever implements this before every clip.
/// Implementations clear their listening state even when teardown fails.
pub trait RecognitionControl: Send + Sync {
    fn is_listening(&self) -> bool;

    /// Immediate teardown; any buffered audio is discarded.
    fn abort(&self) -> Result<()>;

    /// Graceful stop; buffered audio stays available for the recognizer.
    fn stop(&self) -> Result<()>;
}

/// Microphone-backed recognition session. Captures mono f32 samples from
/// the default input device until stopped or aborted.
pub struct MicRecognition {
    samples: Arc<Mutex<Vec<f32>>>,
    listening: Arc<AtomicBool>,
    stream: Mutex<Option<cpal::Stream>>,
    device_sample_rate: AtomicU32,
}

// Safety: cpal::Stream wraps a backend voice handle that is thread-safe on
// the supported hosts. The stream is only ever touched behind the Mutex, so
// concurrent access is impossible.
unsafe impl Send for MicRecognition {}
unsafe impl Sync for MicRecognition {}

impl MicRecognition {
    pub fn new() -> Self {
        Self {
            samples: Arc::new(Mutex::new(Vec::new())),
            listening: Arc::new(AtomicBool::new(false)),
            stream: Mutex::new(None),
            device_sample_rate: AtomicU32::new(0),
        }
    }

    /// Begin capturing from the default input device.
    pub fn start(&self) -> Result<()> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .context("no input device available")?;

        let config = device
            .default_input_config()
            .context("failed to get default input config")?;

        self.device_sample_rate
            .store(config.sample_rate().0, Ordering::SeqCst);

        let samples = Arc::clone(&self.samples);
        let listening = Arc::clone(&self.listening);

        samples.lock().unwrap().clear();
        listening.store(true, Ordering::SeqCst);

        let stream_config: cpal::StreamConfig = config.into();
        let channels = stream_config.channels as usize;

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if listening.load(Ordering::SeqCst) {
                        let mono: Vec<f32> = data.iter().step_by(channels).copied().collect();
                        samples.lock().unwrap().extend_from_slice(&mono);
                    }
                },
                |err| {
                    tracing::error!("recognition capture error: {}", err);
                },
                None,
            )
            .context("failed to build input stream")?;

        stream.play().context("failed to start capture stream")?;
        *self.stream.lock().unwrap() = Some(stream);

        tracing::info!(
            "recognition capture started ({}Hz)",
            self.device_sample_rate.load(Ordering::SeqCst)
        );
        Ok(())
    }

    /// Hand the captured audio to the recognizer, emptying the buffer.
    pub fn take_samples(&self) -> (Vec<f32>, u32) {
        let samples = {
            let mut guard = self.samples.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        (samples, self.device_sample_rate.load(Ordering::SeqCst))
    }

    fn teardown(&self) {
        self.listening.store(false, Ordering::SeqCst);
        *self.stream.lock().unwrap() = None;
    }
}

impl Default for MicRecognition {
    fn default() -> Self {
        Self::new()
    }
}

impl RecognitionControl for MicRecognition {
    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    fn abort(&self) -> Result<()> {
        self.teardown();
        self.samples.lock().unwrap().clear();
        tracing::info!("recognition capture aborted");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let samples = self.samples.lock().unwrap().len();
        self.teardown();
        tracing::info!("recognition capture stopped: {} samples buffered", samples);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_sessions_are_not_listening() {
        let session = MicRecognition::new();
        assert!(!session.is_listening());
    }

    #[test]
    fn stop_and_abort_are_noops_when_idle() {
        let session = MicRecognition::new();
        assert!(session.stop().is_ok());
        assert!(session.abort().is_ok());
        assert!(!session.is_listening());
    }

    #[test]
    fn abort_discards_buffered_samples() {
        let session = MicRecognition::new();
        session.samples.lock().unwrap().extend_from_slice(&[0.1, 0.2]);
        session.abort().unwrap();
        let (samples, _) = session.take_samples();
        assert!(samples.is_empty());
    }

    #[test]
    fn take_samples_empties_the_buffer() {
        let session = MicRecognition::new();
        session.samples.lock().unwrap().extend_from_slice(&[0.5; 4]);
        let (first, _) = session.take_samples();
        assert_eq!(first.len(), 4);
        let (second, _) = session.take_samples();
        assert!(second.is_empty());
    }
}
