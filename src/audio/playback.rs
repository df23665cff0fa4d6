// The playback fallback chain. Strategies are tried in order of capability:
// the shared audio graph first, a managed sink with start retries second,
// and a bare single-shot sink as the last resort.

use std::future::Future;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::oneshot;

use super::decode;
use super::output::AudioContext;
use super::session::PlaybackSession;

/// Start attempts the managed strategy gets before falling through.
pub const MAX_START_ATTEMPTS: u32 = 3;
pub const START_RETRY_DELAY: Duration = Duration::from_millis(200);

const SINK_POLL: Duration = Duration::from_millis(25);

/// Slot holding the lazily created output context, shared between the
/// manager (which fills it) and the graph strategy (which plays through it).
pub type SharedContext = Arc<Mutex<Option<Arc<dyn AudioContext>>>>;

/// One self-contained playback technique. The chain driver walks an ordered
/// list of these, stopping at the first that accepts the payload.
#[async_trait]
pub trait PlaybackStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Terminal strategies swallow their own failures and the driver does
    /// not wait for their clip to finish.
    fn is_terminal(&self) -> bool {
        false
    }

    /// Start playing the base64 payload. Every strategy does its own
    /// decoding so a failure in one cannot poison the next.
    async fn play(&self, payload: &str) -> Result<PlaybackSession>;
}

/// Decoded-buffer playback through the shared context's gain stage.
pub struct GraphStrategy {
    context: SharedContext,
    initialized: Arc<AtomicBool>,
}

impl GraphStrategy {
    pub fn new(context: SharedContext, initialized: Arc<AtomicBool>) -> Self {
        Self {
            context,
            initialized,
        }
    }
}

#[async_trait]
impl PlaybackStrategy for GraphStrategy {
    fn name(&self) -> &'static str {
        "audio-graph"
    }

    async fn play(&self, payload: &str) -> Result<PlaybackSession> {
        if !self.initialized.load(Ordering::SeqCst) {
            anyhow::bail!("output context is not initialized");
        }
        let context = self
            .context
            .lock()
            .unwrap()
            .clone()
            .context("output context is not available")?;

        let clip = decode::decode_payload(payload)?;
        context.play(clip)
    }
}

/// Managed sink playback: maximum volume enforced for the life of the
/// session, start retried a bounded number of times.
pub struct ManagedStrategy {
    attempts: u32,
    retry_delay: Duration,
}

impl ManagedStrategy {
    pub fn new(attempts: u32, retry_delay: Duration) -> Self {
        Self {
            attempts,
            retry_delay,
        }
    }
}

#[async_trait]
impl PlaybackStrategy for ManagedStrategy {
    fn name(&self) -> &'static str {
        "managed-sink"
    }

    async fn play(&self, payload: &str) -> Result<PlaybackSession> {
        let bytes = decode::decode_base64(payload)?;
        start_with_retry(self.attempts, self.retry_delay, move || {
            spawn_sink_session(bytes.clone(), true)
        })
        .await
    }
}

/// Bare single-shot sink. Never fails outward: if the clip cannot even be
/// started the error is logged and an already finished session is returned.
pub struct BasicStrategy;

#[async_trait]
impl PlaybackStrategy for BasicStrategy {
    fn name(&self) -> &'static str {
        "basic-sink"
    }

    fn is_terminal(&self) -> bool {
        true
    }

    async fn play(&self, payload: &str) -> Result<PlaybackSession> {
        let bytes = match decode::decode_base64(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("basic playback failed: {:#}", e);
                return Ok(PlaybackSession::finished());
            }
        };
        match spawn_sink_session(bytes, false).await {
            Ok(session) => Ok(session),
            Err(e) => {
                tracing::error!("basic playback failed: {:#}", e);
                Ok(PlaybackSession::finished())
            }
        }
    }
}

/// Run `start` up to `attempts` times, sleeping `delay` between failures.
pub(crate) async fn start_with_retry<T, F, Fut>(
    attempts: u32,
    delay: Duration,
    mut start: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match start().await {
            Ok(started) => return Ok(started),
            Err(e) if attempt < attempts => {
                tracing::warn!(
                    "playback start attempt {}/{} failed: {:#}",
                    attempt,
                    attempts,
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(e.context(format!("gave up after {} start attempts", attempts)))
            }
        }
    }
}

/// Start a sink on its own thread and hand back the session once the device
/// accepted the clip. Startup failures are reported to the caller so it can
/// retry; after startup the thread owns the sink until drain or stop.
async fn spawn_sink_session(bytes: Vec<u8>, restore_volume: bool) -> Result<PlaybackSession> {
    let (ready_tx, ready_rx) = oneshot::channel();

    let stop_flag = Arc::new(AtomicBool::new(false));
    let (session, completion) = PlaybackSession::new({
        let stop_flag = Arc::clone(&stop_flag);
        move || stop_flag.store(true, Ordering::SeqCst)
    });

    std::thread::Builder::new()
        .name("sink-playback".into())
        .spawn(move || {
            run_sink(bytes, &stop_flag, ready_tx, restore_volume);
            drop(completion);
        })
        .context("failed to spawn playback thread")?;

    match ready_rx.await {
        Ok(Ok(())) => Ok(session),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow::anyhow!("playback thread exited before starting")),
    }
}

/// Body of the sink thread. The stream handle must stay on this thread, so
/// everything from open to drain happens here.
fn run_sink(
    bytes: Vec<u8>,
    stop: &AtomicBool,
    ready: oneshot::Sender<Result<()>>,
    restore_volume: bool,
) {
    let (_stream, sink) = match open_sink(&bytes) {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while !sink.empty() {
        if stop.load(Ordering::SeqCst) {
            sink.stop();
            break;
        }
        if restore_volume {
            // Some platforms quietly duck or pause a sink right after it
            // starts; force it back every tick.
            if sink.volume() < 1.0 {
                sink.set_volume(1.0);
            }
            if sink.is_paused() {
                sink.play();
            }
        }
        std::thread::sleep(SINK_POLL);
    }
}

fn open_sink(bytes: &[u8]) -> Result<(rodio::OutputStream, rodio::Sink)> {
    let (stream, handle) =
        rodio::OutputStream::try_default().context("failed to open audio output")?;
    let sink = rodio::Sink::try_new(&handle).context("failed to create audio sink")?;
    let source = rodio::Decoder::new(Cursor::new(bytes.to_vec()))
        .context("payload is not a playable clip")?;

    sink.set_volume(1.0);
    sink.append(source);
    sink.play();

    Ok((stream, sink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn retry_returns_the_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = start_with_retry(3, Duration::from_millis(200), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_spaces_attempts_by_the_delay() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let started = tokio::time::Instant::now();

        let result = start_with_retry(3, Duration::from_millis(200), move || {
            let counter = Arc::clone(&counter);
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    anyhow::bail!("device busy");
                }
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two failures, two sleeps of 200ms each.
        assert_eq!(started.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_the_attempt_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = start_with_retry(3, Duration::from_millis(200), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("device busy")
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn graph_strategy_refuses_without_a_context() {
        let strategy = GraphStrategy::new(
            Arc::new(Mutex::new(None)),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(strategy.play("AAAA").await.is_err());
    }

    #[tokio::test]
    async fn graph_strategy_refuses_when_marked_uninitialized() {
        // Context slot filled, but the last warm-up attempt failed.
        struct DeadContext;
        impl AudioContext for DeadContext {
            fn is_suspended(&self) -> bool {
                true
            }
            fn resume(&self) -> Result<()> {
                anyhow::bail!("gone")
            }
            fn prime_silence(&self) -> Result<()> {
                anyhow::bail!("gone")
            }
            fn play(&self, _clip: crate::audio::AudioBuffer) -> Result<PlaybackSession> {
                anyhow::bail!("gone")
            }
        }

        let slot: SharedContext = Arc::new(Mutex::new(Some(Arc::new(DeadContext) as _)));
        let strategy = GraphStrategy::new(slot, Arc::new(AtomicBool::new(false)));

        let err = strategy.play("AAAA").await.unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[tokio::test]
    async fn managed_strategy_rejects_invalid_base64_before_touching_the_device() {
        let strategy = ManagedStrategy::new(3, Duration::from_millis(200));
        assert!(strategy.play("!!not base64!!").await.is_err());
    }

    #[tokio::test]
    async fn basic_strategy_swallows_invalid_payloads() {
        let session = BasicStrategy.play("!!not base64!!").await.unwrap();
        assert!(session.is_finished());
    }
}
