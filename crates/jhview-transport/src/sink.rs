use jhview_core::{ConnectionState, ErrorKind, JpegFrame};

// MARK: - FrameSink

/// Consumer of everything the engine produces.
///
/// Callbacks run on engine tasks (the receive loop, keep-alive, or whichever
/// task drives a transition). Implementations must not block for long and are
/// responsible for hopping to a UI thread if they need one.
pub trait FrameSink: Send + Sync {
    /// Called once per valid JPEG frame, in delivery order.
    fn on_frame(&self, frame: JpegFrame);

    /// Called on every state transition.
    fn on_state_changed(&self, _state: ConnectionState) {}

    /// Called for errors the engine tolerated internally.
    fn on_error(&self, _kind: ErrorKind, _message: &str) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn on_frame(&self, _frame: JpegFrame) {}
}
