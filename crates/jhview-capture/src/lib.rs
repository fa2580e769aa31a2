//! Frame consumers for jhview: statistics, snapshots and MJPEG recording.
//!
//! ```text
//! DeviceEngine ──► CaptureSink::on_frame ──┬─► StreamStats
//!                                          ├─► latest frame ──► SnapshotWriter
//!                                          ├─► MjpegRecorder (while recording)
//!                                          ├─► LivenessWatchdog::record_frame
//!                                          └─► inner FrameSink (optional)
//! ```

pub mod error;
pub mod recorder;
pub mod snapshot;
pub mod stats;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use jhview_core::{ConnectionState, ErrorKind, JpegFrame};
use jhview_transport::{FrameSink, LivenessWatchdog};
use tracing::{debug, info, warn};

pub use error::CaptureError;
pub use recorder::{MjpegRecorder, RecordingSummary};
pub use snapshot::SnapshotWriter;
pub use stats::StreamStats;

// ── CaptureStatus ─────────────────────────────────────────────────────────────

/// Point-in-time view of a [`CaptureSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureStatus {
    pub state: ConnectionState,
    pub fps: f64,
    pub bitrate_mbps: f64,
    pub frames_total: u64,
    pub bytes_total: u64,
    pub errors_total: u64,
    pub recording: Option<PathBuf>,
}

// ── CaptureSink ───────────────────────────────────────────────────────────────

struct Inner {
    state: ConnectionState,
    stats: StreamStats,
    latest: Option<JpegFrame>,
    recorder: MjpegRecorder,
    errors_total: u64,
}

/// [`FrameSink`] that keeps the latest frame, tracks stream statistics,
/// feeds the liveness watchdog and writes recordings.
///
/// Callbacks run on the engine's frame receive task. While recording, each
/// frame is appended through a `BufWriter` under the sink's lock, so a slow
/// disk delays frame delivery (and the watchdog's view of it) until the
/// write returns. Keep the media directory on local storage.
pub struct CaptureSink {
    inner: Mutex<Inner>,
    snapshots: SnapshotWriter,
    watchdog: LivenessWatchdog,
    forward: Option<Arc<dyn FrameSink>>,
}

impl CaptureSink {
    pub fn new(media_dir: impl AsRef<Path>) -> Self {
        let media_dir = media_dir.as_ref();
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                stats: StreamStats::new(),
                latest: None,
                recorder: MjpegRecorder::new(media_dir),
                errors_total: 0,
            }),
            snapshots: SnapshotWriter::new(media_dir),
            watchdog: LivenessWatchdog::new(),
            forward: None,
        }
    }

    /// Also deliver every callback to `sink` after local handling.
    pub fn with_forward(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.forward = Some(sink);
        self
    }

    /// Watchdog fed by this sink; hand a clone to `spawn_liveness_watchdog`.
    pub fn watchdog(&self) -> LivenessWatchdog {
        self.watchdog.clone()
    }

    pub fn latest_frame(&self) -> Option<JpegFrame> {
        self.lock().latest.clone()
    }

    /// Save the most recent frame as a JPEG.
    pub fn take_snapshot(&self) -> Result<PathBuf, CaptureError> {
        let latest = self.latest_frame();
        self.snapshots.save(latest.as_ref())
    }

    /// Begin an MJPEG recording. Only allowed while streaming.
    pub fn start_recording(&self) -> Result<PathBuf, CaptureError> {
        let mut inner = self.lock();
        if !inner.state.is_active() {
            return Err(CaptureError::NotStreaming { state: inner.state });
        }
        inner.recorder.start()
    }

    pub fn stop_recording(&self) -> Result<RecordingSummary, CaptureError> {
        self.lock().recorder.stop()
    }

    pub fn is_recording(&self) -> bool {
        self.lock().recorder.is_recording()
    }

    pub fn status(&self) -> CaptureStatus {
        let inner = self.lock();
        CaptureStatus {
            state: inner.state,
            fps: inner.stats.fps(),
            bitrate_mbps: inner.stats.bitrate_mbps(),
            frames_total: inner.stats.frames_total(),
            bytes_total: inner.stats.bytes_total(),
            errors_total: inner.errors_total,
            recording: inner.recorder.current_path().map(Path::to_path_buf),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl FrameSink for CaptureSink {
    fn on_frame(&self, frame: JpegFrame) {
        self.watchdog.record_frame();
        {
            let mut inner = self.lock();
            inner.stats.tick_frame(frame.len());
            if let Err(e) = inner.recorder.write_frame(&frame) {
                warn!("Recording write failed, stopping: {}", e);
                if let Err(e) = inner.recorder.stop() {
                    debug!("Recording close after write error: {}", e);
                }
            }
            inner.latest = Some(frame.clone());
        }
        if let Some(forward) = &self.forward {
            forward.on_frame(frame);
        }
    }

    fn on_state_changed(&self, state: ConnectionState) {
        {
            let mut inner = self.lock();
            inner.state = state;
            match state {
                ConnectionState::Connecting => inner.stats.reset_window(),
                ConnectionState::Streaming => {}
                ConnectionState::Idle | ConnectionState::Disconnected => {
                    if inner.recorder.is_recording() {
                        match inner.recorder.stop() {
                            Ok(summary) => info!(
                                "Stream {}; recording finalized at {}",
                                state,
                                summary.path.display()
                            ),
                            Err(e) => warn!("Failed to finalize recording: {}", e),
                        }
                    }
                }
            }
        }
        if let Some(forward) = &self.forward {
            forward.on_state_changed(state);
        }
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        let n = {
            let mut inner = self.lock();
            inner.errors_total += 1;
            inner.errors_total
        };
        if n <= 10 || n % 100 == 0 {
            debug!("Engine error #{} [{}]: {}", n, kind, message);
        }
        if let Some(forward) = &self.forward {
            forward.on_error(kind, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn frame(tag: u8) -> JpegFrame {
        JpegFrame::from_buffer(vec![0xFF, 0xD8, tag, 0xFF, 0xD9], tag as u16, 1).unwrap()
    }

    #[derive(Default)]
    struct Counting {
        frames: Mutex<u32>,
        states: Mutex<Vec<ConnectionState>>,
    }

    impl FrameSink for Counting {
        fn on_frame(&self, _frame: JpegFrame) {
            *self.frames.lock().unwrap() += 1;
        }

        fn on_state_changed(&self, state: ConnectionState) {
            self.states.lock().unwrap().push(state);
        }
    }

    #[test]
    fn keeps_latest_frame_and_forwards() {
        let tmp = tempfile::tempdir().unwrap();
        let downstream = Arc::new(Counting::default());
        let sink = CaptureSink::new(tmp.path()).with_forward(downstream.clone());

        sink.on_state_changed(ConnectionState::Streaming);
        sink.on_frame(frame(1));
        sink.on_frame(frame(2));

        assert_eq!(sink.latest_frame().unwrap().frame_counter(), 2);
        assert_eq!(*downstream.frames.lock().unwrap(), 2);
        assert_eq!(*downstream.states.lock().unwrap(), vec![ConnectionState::Streaming]);

        let status = sink.status();
        assert_eq!(status.frames_total, 2);
        assert_eq!(status.bytes_total, 10);
        assert_eq!(status.state, ConnectionState::Streaming);
    }

    #[test]
    fn snapshot_needs_a_frame() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = CaptureSink::new(tmp.path());
        assert!(matches!(sink.take_snapshot(), Err(CaptureError::NoFrame)));

        sink.on_frame(frame(3));
        let path = sink.take_snapshot().unwrap();
        assert_eq!(fs::read(path).unwrap(), frame(3).data().to_vec());
    }

    #[test]
    fn recording_requires_streaming() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = CaptureSink::new(tmp.path());

        assert!(matches!(
            sink.start_recording(),
            Err(CaptureError::NotStreaming { state: ConnectionState::Idle })
        ));
        assert!(!sink.is_recording());
    }

    #[test]
    fn stream_loss_finalizes_recording() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = CaptureSink::new(tmp.path());
        sink.on_state_changed(ConnectionState::Streaming);

        let path = sink.start_recording().unwrap();
        sink.on_frame(frame(1));
        assert_eq!(sink.status().recording, Some(path.clone()));

        sink.on_state_changed(ConnectionState::Disconnected);
        assert!(!sink.is_recording());
        assert_eq!(fs::read(&path).unwrap().len(), 5);
        assert!(matches!(sink.stop_recording(), Err(CaptureError::NotRecording)));

        // Frames after the loss go nowhere.
        sink.on_frame(frame(2));
        assert_eq!(fs::read(&path).unwrap().len(), 5);
    }

    #[test]
    fn frames_feed_the_watchdog() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = CaptureSink::new(tmp.path());
        let watchdog = sink.watchdog();

        watchdog.arm();
        std::thread::sleep(std::time::Duration::from_millis(20));
        sink.on_frame(frame(1));
        assert!(!watchdog.is_stale(std::time::Duration::from_millis(10)));
    }

    #[test]
    fn errors_are_counted() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = CaptureSink::new(tmp.path());
        sink.on_error(ErrorKind::MalformedPacket, "short");
        sink.on_error(ErrorKind::InvalidFrame, "no SOI");
        assert_eq!(sink.status().errors_total, 2);
    }
}
