use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Handle to one in-progress clip.
///
/// A session is destroyed by natural completion, an explicit [`stop`], or a
/// playback error; whichever comes first fires the completion signal exactly
/// once. Clones share the same underlying clip.
///
/// [`stop`]: PlaybackSession::stop
#[derive(Clone)]
pub struct PlaybackSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    stopper: Box<dyn Fn() + Send + Sync>,
    stopped: AtomicBool,
    finished_tx: watch::Sender<bool>,
    finished_rx: watch::Receiver<bool>,
}

/// Producer half of a session's completion signal.
///
/// Held by whatever is driving the audio (a feeder thread, a sink loop) and
/// dropped when playback ends, so completion fires even if the driver
/// panics.
pub struct Completion {
    tx: watch::Sender<bool>,
}

impl Completion {
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

impl PlaybackSession {
    /// Create a session whose audible output is cut by `stopper`.
    pub fn new(stopper: impl Fn() + Send + Sync + 'static) -> (Self, Completion) {
        let (tx, rx) = watch::channel(false);
        let session = Self {
            inner: Arc::new(SessionInner {
                stopper: Box::new(stopper),
                stopped: AtomicBool::new(false),
                finished_tx: tx.clone(),
                finished_rx: rx,
            }),
        };
        (session, Completion { tx })
    }

    /// A session that has already run to completion. Used by terminal
    /// playback paths that swallow their own startup failures.
    pub fn finished() -> Self {
        let (session, completion) = Self::new(|| {});
        completion.signal();
        session
    }

    /// Cut the clip short. Idempotent, never propagates an error: the stop
    /// capability itself is best-effort and the session is considered done
    /// once stop has been requested.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            (self.inner.stopper)();
            let _ = self.inner.finished_tx.send(true);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        *self.inner.finished_rx.borrow()
    }

    /// Wait for natural completion, stop, or driver death.
    pub async fn wait(&self) {
        let mut rx = self.inner.finished_rx.clone();
        // A closed channel means every producer is gone, which only happens
        // after the driving thread exited.
        let _ = rx.wait_for(|finished| *finished).await;
    }

    /// True when both handles refer to the same clip.
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("stopped", &self.is_stopped())
            .field("finished", &self.is_finished())
            .finish()
    }
}
