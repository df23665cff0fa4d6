use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::Result;
use cpal::traits::HostTrait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::audio::capture::RecognitionControl;
use crate::audio::output::{AudioContext, CpalContext, GainStage, PREFERRED_SAMPLE_RATE, VOLUME_BOOST};
use crate::audio::playback::{
    BasicStrategy, GraphStrategy, ManagedStrategy, PlaybackStrategy, SharedContext,
    MAX_START_ATTEMPTS, START_RETRY_DELAY,
};
use crate::audio::session::PlaybackSession;
use crate::gesture::GestureReceiver;

/// Tunables for the playback chain. The defaults are the values mobile
/// devices were observed to need; nothing here is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackSettings {
    pub volume_boost: f32,
    pub sample_rate: u32,
    pub start_attempts: u32,
    pub start_retry_delay_ms: u64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            volume_boost: VOLUME_BOOST,
            sample_rate: PREFERRED_SAMPLE_RATE,
            start_attempts: MAX_START_ATTEMPTS,
            start_retry_delay_ms: START_RETRY_DELAY.as_millis() as u64,
        }
    }
}

type ContextFactory = Box<dyn Fn(&PlaybackSettings) -> Result<Arc<dyn AudioContext>> + Send + Sync>;
type IndicatorFn = Box<dyn Fn(bool) + Send + Sync>;

/// Owner of the audio output context and the playback fallback chain.
///
/// At most one clip plays at a time; every play request first halts any
/// live recognition capture, warms the output context, and stops whatever
/// was still playing.
pub struct AudioPlaybackManager {
    settings: PlaybackSettings,
    context: SharedContext,
    context_factory: ContextFactory,
    initialized: Arc<AtomicBool>,
    strategies: Vec<Box<dyn PlaybackStrategy>>,
    current: Mutex<Option<PlaybackSession>>,
    request_lock: AsyncMutex<()>,
    recognition: Mutex<Option<Arc<dyn RecognitionControl>>>,
    listening_indicator: Mutex<Option<IndicatorFn>>,
}

impl AudioPlaybackManager {
    pub fn new(settings: PlaybackSettings) -> Self {
        let factory: ContextFactory = Box::new(|settings: &PlaybackSettings| {
            let gain = GainStage::new(settings.volume_boost);
            let context = CpalContext::open(gain, settings.sample_rate)?;
            Ok(Arc::new(context) as Arc<dyn AudioContext>)
        });
        Self::assemble(settings, factory, None)
    }

    fn assemble(
        settings: PlaybackSettings,
        context_factory: ContextFactory,
        strategies: Option<Vec<Box<dyn PlaybackStrategy>>>,
    ) -> Self {
        let context: SharedContext = Arc::new(Mutex::new(None));
        let initialized = Arc::new(AtomicBool::new(false));

        let strategies = strategies.unwrap_or_else(|| {
            vec![
                Box::new(GraphStrategy::new(
                    Arc::clone(&context),
                    Arc::clone(&initialized),
                )) as Box<dyn PlaybackStrategy>,
                Box::new(ManagedStrategy::new(
                    settings.start_attempts,
                    Duration::from_millis(settings.start_retry_delay_ms),
                )),
                Box::new(BasicStrategy),
            ]
        });

        Self {
            settings,
            context,
            context_factory,
            initialized,
            strategies,
            current: Mutex::new(None),
            request_lock: AsyncMutex::new(()),
            recognition: Mutex::new(None),
            listening_indicator: Mutex::new(None),
        }
    }

    /// Attach the external recognition session the manager must interlock
    /// against.
    pub fn set_recognition(&self, recognition: Arc<dyn RecognitionControl>) {
        *self.recognition.lock().unwrap() = Some(recognition);
    }

    /// Attach the UI affordance that reflects listening state (a pulsing
    /// microphone button or similar).
    pub fn set_listening_indicator(&self, indicator: impl Fn(bool) + Send + Sync + 'static) {
        *self.listening_indicator.lock().unwrap() = Some(Box::new(indicator));
    }

    /// Play one synthesized speech payload to completion, degrading through
    /// the strategy chain as needed.
    ///
    /// Never fails: the worst case is silence, which the caller's visual
    /// fallback covers. An empty payload is a no-op. Concurrent calls are
    /// queued so two clips can never race for the session slot.
    pub async fn play_audio_response(&self, payload: &str) {
        if payload.is_empty() {
            return;
        }

        let _serial = self.request_lock.lock().await;

        self.halt_recognition();
        self.ensure_ready().await;
        self.stop_current_audio();

        for strategy in &self.strategies {
            match strategy.play(payload).await {
                Ok(session) => {
                    self.register(session.clone());
                    if strategy.is_terminal() {
                        tracing::info!("playback started via {} (last resort)", strategy.name());
                    } else {
                        tracing::debug!("playback started via {}", strategy.name());
                        session.wait().await;
                        self.clear_if_current(&session);
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!("{} failed, falling back: {:#}", strategy.name(), e);
                }
            }
        }

        // Audio failure must not break the caller's flow.
        tracing::error!("all playback strategies failed; response will be silent");
    }

    /// Idempotent warm-up of the output context and its gain stage. Fails
    /// soft: a setup error only marks the graph unusable so playback falls
    /// through to the sink strategies.
    pub async fn ensure_ready(&self) {
        let context = {
            let mut slot = self.context.lock().unwrap();
            if slot.is_none() {
                match (self.context_factory)(&self.settings) {
                    Ok(context) => {
                        *slot = Some(context);
                    }
                    Err(e) => {
                        tracing::warn!("audio context setup failed: {:#}", e);
                        self.initialized.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
            slot.clone()
        };

        let Some(context) = context else { return };

        if context.is_suspended() {
            if let Err(e) = context.resume() {
                tracing::warn!("failed to resume suspended audio context: {:#}", e);
                self.initialized.store(false, Ordering::SeqCst);
                return;
            }
        }

        if let Err(e) = context.prime_silence() {
            tracing::warn!("failed to prime audio context: {:#}", e);
            self.initialized.store(false, Ordering::SeqCst);
            return;
        }

        self.initialized.store(true, Ordering::SeqCst);
    }

    /// True once `ensure_ready` has fully succeeded at least once.
    pub fn is_ready(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Consume the first gesture from the UI layer, warm up audio inside
    /// that interaction, then unregister. One-shot by construction: the
    /// task exits and drops the receiver after the first event.
    pub fn bind_unlock_on_first_gesture(
        self: &Arc<Self>,
        mut gestures: GestureReceiver,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(gesture) = gestures.recv().await {
                tracing::debug!("unlocking audio output on first {:?}", gesture);
                manager.ensure_ready().await;
            }
        })
    }

    /// Stop any live recognition capture before playback. Best-effort all
    /// the way down: teardown errors are logged, never propagated.
    pub fn halt_recognition(&self) {
        let recognition = self.recognition.lock().unwrap().clone();
        let Some(recognition) = recognition else {
            return;
        };
        if !recognition.is_listening() {
            return;
        }

        if let Err(e) = recognition.abort() {
            tracing::warn!("error aborting recognition: {:#}", e);
        }
        if let Err(e) = recognition.stop() {
            tracing::warn!("error stopping recognition: {:#}", e);
        }

        self.set_indicator(false);
        advisory_release_inputs();
    }

    /// Terminate the registered session, if any. The registration is
    /// cleared no matter what the stop capability does.
    pub fn stop_current_audio(&self) {
        let taken = self.current.lock().unwrap().take();
        if let Some(session) = taken {
            session.stop();
        }
    }

    /// Whether a registered session is still audible.
    pub fn is_playing(&self) -> bool {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| !s.is_finished())
            .unwrap_or(false)
    }

    fn register(&self, session: PlaybackSession) {
        *self.current.lock().unwrap() = Some(session);
    }

    fn clear_if_current(&self, session: &PlaybackSession) {
        let mut current = self.current.lock().unwrap();
        if current.as_ref().is_some_and(|c| c.same_session(session)) {
            *current = None;
        }
    }

    fn set_indicator(&self, listening: bool) {
        if let Some(indicator) = self.listening_indicator.lock().unwrap().as_ref() {
            indicator(listening);
        }
    }
}

/// Enumerating capture devices nudges some platforms into releasing a
/// microphone that was just torn down. Purely advisory.
fn advisory_release_inputs() {
    match cpal::default_host().input_devices() {
        Ok(devices) => {
            tracing::debug!("input devices after recognition halt: {}", devices.count());
        }
        Err(e) => {
            tracing::debug!("could not enumerate input devices: {}", e);
        }
    }
}

static MANAGER: OnceLock<Arc<AudioPlaybackManager>> = OnceLock::new();

/// Process-wide manager instance, for UI code without a handle of its own.
pub fn global() -> Arc<AudioPlaybackManager> {
    MANAGER
        .get_or_init(|| Arc::new(AudioPlaybackManager::new(PlaybackSettings::default())))
        .clone()
}
