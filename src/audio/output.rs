// Low-level audio output: a lazily created device stream with a fixed
// volume-boost stage, shared by every graph-playback session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

use super::session::PlaybackSession;
use super::{processing, AudioBuffer};

/// Speech clips come back quiet from the synthesis backend; everything
/// scheduled through the graph is boosted by this factor.
pub const VOLUME_BOOST: f32 = 2.0;
/// Rate the output device is asked for. Falls back to the device default
/// when unsupported.
pub const PREFERRED_SAMPLE_RATE: u32 = 44_100;

const FEED_IDLE: Duration = Duration::from_millis(1);
const DRAIN_POLL: Duration = Duration::from_millis(5);

type RingProducer = ringbuf::HeapProd<f32>;
type RingConsumer = ringbuf::HeapCons<f32>;

/// Fixed amplification between scheduled sources and the device. Created
/// once per context and reused by every session.
#[derive(Debug, Clone, Copy)]
pub struct GainStage {
    boost: f32,
}

impl GainStage {
    pub fn new(boost: f32) -> Self {
        Self { boost }
    }

    /// Boost one sample, clamped to the valid device range.
    pub fn apply(&self, sample: f32) -> f32 {
        (sample * self.boost).clamp(-1.0, 1.0)
    }

    pub fn boost(&self) -> f32 {
        self.boost
    }
}

/// The shared output half of the audio subsystem. One instance lives for
/// the whole process once created; it is never rebuilt per clip.
pub trait AudioContext: Send + Sync {
    /// True until the device stream has been started. Platforms keep fresh
    /// streams silent until playback is requested from a user action.
    fn is_suspended(&self) -> bool;

    /// Start (or restart) the device stream.
    fn resume(&self) -> Result<()>;

    /// Schedule a near-zero-length silent buffer. Some platforms only
    /// unlock audio output after at least one buffer has been played.
    fn prime_silence(&self) -> Result<()>;

    /// Play a decoded clip through the gain stage. Returns the live session
    /// handle; completion fires when the device has consumed every sample.
    fn play(&self, clip: AudioBuffer) -> Result<PlaybackSession>;
}

pub struct CpalContext {
    stream: Stream,
    producer: Arc<Mutex<RingProducer>>,
    gain: GainStage,
    sample_rate: u32,
    channels: u16,
    suspended: AtomicBool,
    clear_flag: Arc<AtomicBool>,
}

// Safety: cpal::Stream wraps a backend voice handle that is only driven from
// the audio thread. The context is shared behind an Arc and the stream is
// never accessed concurrently after construction (resume is the only call,
// and the backends allow it from any thread).
unsafe impl Send for CpalContext {}
unsafe impl Sync for CpalContext {}

impl CpalContext {
    /// Open the default output device, preferring `preferred_rate`.
    pub fn open(gain: GainStage, preferred_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .context("no audio output device available")?;

        let config = preferred_config(&device, preferred_rate)?;
        let sample_rate = config.sample_rate().0;
        let channels = config.channels();
        let sample_format = config.sample_format();

        // ~250ms of interleaved audio between the feeder and the callback
        let rb = HeapRb::<f32>::new((sample_rate as usize * channels as usize) / 4);
        let (producer, consumer) = rb.split();
        let producer = Arc::new(Mutex::new(producer));
        let consumer = Arc::new(Mutex::new(consumer));

        let clear_flag = Arc::new(AtomicBool::new(false));

        let stream_config: StreamConfig = config.into();
        let stream = match sample_format {
            cpal::SampleFormat::F32 => Self::build_stream::<f32>(
                &device,
                &stream_config,
                consumer,
                gain,
                Arc::clone(&clear_flag),
            )?,
            cpal::SampleFormat::I16 => Self::build_stream::<i16>(
                &device,
                &stream_config,
                consumer,
                gain,
                Arc::clone(&clear_flag),
            )?,
            cpal::SampleFormat::U16 => Self::build_stream::<u16>(
                &device,
                &stream_config,
                consumer,
                gain,
                Arc::clone(&clear_flag),
            )?,
            format => anyhow::bail!("unsupported sample format: {:?}", format),
        };

        tracing::info!(
            "audio output opened: {}Hz, {} channel(s), boost {:.1}x",
            sample_rate,
            channels,
            gain.boost()
        );

        Ok(Self {
            stream,
            producer,
            gain,
            sample_rate,
            channels,
            suspended: AtomicBool::new(true),
            clear_flag,
        })
    }

    fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
        device: &cpal::Device,
        config: &StreamConfig,
        consumer: Arc<Mutex<RingConsumer>>,
        gain: GainStage,
        clear_flag: Arc<AtomicBool>,
    ) -> Result<Stream> {
        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let mut consumer = consumer.lock();

                    // A stopped session leaves its tail in the buffer; drain
                    // it so the next clip starts clean.
                    if clear_flag.swap(false, Ordering::SeqCst) {
                        while consumer.try_pop().is_some() {}
                    }

                    for sample in data.iter_mut() {
                        let value = gain.apply(consumer.try_pop().unwrap_or(0.0));
                        *sample = T::from_sample(value);
                    }
                },
                move |err| {
                    tracing::error!("audio output error: {}", err);
                },
                None,
            )
            .context("failed to build output stream")?;

        Ok(stream)
    }

    pub fn gain(&self) -> GainStage {
        self.gain
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

impl AudioContext for CpalContext {
    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn resume(&self) -> Result<()> {
        self.stream
            .play()
            .context("failed to resume output stream")?;
        self.suspended.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn prime_silence(&self) -> Result<()> {
        {
            let mut producer = self.producer.lock();
            let _ = producer.try_push(0.0);
        }
        self.resume()
    }

    fn play(&self, clip: AudioBuffer) -> Result<PlaybackSession> {
        let samples = processing::adapt_to_device(&clip, self.sample_rate, self.channels)?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let (session, completion) = PlaybackSession::new({
            let stop_flag = Arc::clone(&stop_flag);
            let clear_flag = Arc::clone(&self.clear_flag);
            move || {
                stop_flag.store(true, Ordering::SeqCst);
                clear_flag.store(true, Ordering::SeqCst);
            }
        });

        let producer = Arc::clone(&self.producer);
        std::thread::Builder::new()
            .name("graph-playback".into())
            .spawn(move || {
                feed_samples(&producer, &samples, &stop_flag);
                drop(completion);
            })
            .context("failed to spawn playback feeder thread")?;

        Ok(session)
    }
}

/// Push the clip into the ring buffer, then wait for the callback to drain
/// what was queued. Returns early when the session is stopped.
fn feed_samples(producer: &Mutex<RingProducer>, samples: &[f32], stop: &AtomicBool) {
    let mut offset = 0;
    while offset < samples.len() {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let written = {
            let mut producer = producer.lock();
            let mut written = 0;
            for &sample in &samples[offset..] {
                if producer.try_push(sample).is_ok() {
                    written += 1;
                } else {
                    break; // buffer full
                }
            }
            written
        };
        if written == 0 {
            std::thread::sleep(FEED_IDLE);
        } else {
            offset += written;
        }
    }

    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        if producer.lock().occupied_len() == 0 {
            return;
        }
        std::thread::sleep(DRAIN_POLL);
    }
}

fn preferred_config(
    device: &cpal::Device,
    preferred_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    if let Ok(mut ranges) = device.supported_output_configs() {
        if let Some(range) = ranges.find(|r| {
            r.min_sample_rate().0 <= preferred_rate && preferred_rate <= r.max_sample_rate().0
        }) {
            return Ok(range.with_sample_rate(SampleRate(preferred_rate)));
        }
    }
    device
        .default_output_config()
        .context("failed to get default output config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_boosts_samples() {
        let gain = GainStage::new(2.0);
        assert_eq!(gain.apply(0.25), 0.5);
        assert_eq!(gain.apply(-0.25), -0.5);
    }

    #[test]
    fn gain_clamps_to_device_range() {
        let gain = GainStage::new(2.0);
        assert_eq!(gain.apply(0.8), 1.0);
        assert_eq!(gain.apply(-0.8), -1.0);
    }

    #[test]
    fn unity_gain_is_transparent() {
        let gain = GainStage::new(1.0);
        assert_eq!(gain.apply(0.33), 0.33);
    }

    #[test]
    fn feeder_respects_the_stop_flag() {
        let rb = HeapRb::<f32>::new(8);
        let (producer, _consumer) = rb.split();
        let producer = Mutex::new(producer);
        let stop = AtomicBool::new(true);

        // More samples than the ring holds: without the stop flag this
        // would spin forever because nothing consumes.
        let samples = vec![0.0f32; 64];
        feed_samples(&producer, &samples, &stop);
    }

    #[test]
    fn feeder_finishes_when_everything_is_consumed() {
        let rb = HeapRb::<f32>::new(64);
        let (producer, mut consumer) = rb.split();
        let producer = Arc::new(Mutex::new(producer));
        let stop = Arc::new(AtomicBool::new(false));

        let feeder = {
            let producer = Arc::clone(&producer);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || feed_samples(&producer, &[0.5f32; 32], &stop))
        };

        // Emulate the device callback.
        let mut popped = 0;
        while popped < 32 {
            if consumer.try_pop().is_some() {
                popped += 1;
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        feeder.join().unwrap();
    }
}
