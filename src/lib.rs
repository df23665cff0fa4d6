//! Voice playback for the avatar chat client.
//!
//! Mobile devices are unreliable about synthesized-speech playback: output
//! stays locked until a user gesture, devices are sometimes still held by
//! the microphone, and volume gets silently ducked. This crate wraps all of
//! that behind one manager that plays a base64 speech payload through a
//! chain of increasingly modest strategies and guarantees the caller never
//! sees a failure, only (at worst) silence.

pub mod audio;
pub mod gesture;
pub mod manager;

pub use audio::capture::{MicRecognition, RecognitionControl};
pub use audio::session::PlaybackSession;
pub use audio::AudioBuffer;
pub use gesture::{gesture_channel, GestureReceiver, GestureSender, UserGesture};
pub use manager::{global, AudioPlaybackManager, PlaybackSettings};

/// Install the process-wide tracing subscriber. Call once from the host
/// binary before touching the manager.
pub fn init_logging() {
    tracing_subscriber::fmt::init();
}
