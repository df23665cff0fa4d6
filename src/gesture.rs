use tokio::sync::mpsc;

/// User-interaction events forwarded by the UI layer. Mobile platforms only
/// unlock audio output from inside a gesture callstack, so the manager
/// consumes exactly one of these to warm up the output context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserGesture {
    TouchStart,
    TouchEnd,
    Click,
}

pub type GestureSender = mpsc::UnboundedSender<UserGesture>;
pub type GestureReceiver = mpsc::UnboundedReceiver<UserGesture>;

/// Channel the UI layer pushes gestures into.
pub fn gesture_channel() -> (GestureSender, GestureReceiver) {
    mpsc::unbounded_channel()
}
