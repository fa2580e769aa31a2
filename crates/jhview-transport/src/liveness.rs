//! Frame-silence detection.
//!
//! The device never says goodbye; a dead stream simply goes quiet. The
//! watchdog remembers when the last frame arrived and, once the engine has
//! been streaming without frames for longer than the threshold, reports the
//! stream as lost so the engine can reconnect.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jhview_core::ConnectionState;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::DeviceEngine;
use crate::stop::StopSignal;

#[derive(Debug, Default)]
struct Marks {
    last_frame: Option<Instant>,
    armed_at: Option<Instant>,
}

/// Shared "last frame seen" clock. Clones observe the same marks.
#[derive(Debug, Clone, Default)]
pub struct LivenessWatchdog {
    marks: Arc<Mutex<Marks>>,
}

impl LivenessWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call from the frame path for every delivered frame.
    pub fn record_frame(&self) {
        self.with(|m| m.last_frame = Some(Instant::now()));
    }

    /// Start measuring silence from now. No-op if already armed.
    pub fn arm(&self) {
        self.with(|m| {
            if m.armed_at.is_none() {
                m.armed_at = Some(Instant::now());
            }
        });
    }

    pub fn disarm(&self) {
        self.with(|m| {
            m.armed_at = None;
            m.last_frame = None;
        });
    }

    pub fn is_armed(&self) -> bool {
        self.with(|m| m.armed_at.is_some())
    }

    /// Time since the most recent frame, or since arming if no frame has
    /// arrived yet. `None` while disarmed.
    pub fn silence(&self) -> Option<Duration> {
        self.with(|m| {
            let armed = m.armed_at?;
            let reference = match m.last_frame {
                Some(last) if last > armed => last,
                _ => armed,
            };
            Some(reference.elapsed())
        })
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.silence().map_or(false, |s| s > threshold)
    }

    fn with<R>(&self, f: impl FnOnce(&mut Marks) -> R) -> R {
        let mut marks = self.marks.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut marks)
    }
}

/// Poll the engine every `poll`; arm while it streams and report the stream
/// lost once `threshold` passes without a frame.
pub fn spawn_liveness_watchdog(
    engine: DeviceEngine,
    watchdog: LivenessWatchdog,
    threshold: Duration,
    poll: Duration,
    stop: StopSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Liveness watchdog started (threshold {:?})", threshold);
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(poll) => {}
            }

            if engine.state() != ConnectionState::Streaming {
                watchdog.disarm();
                continue;
            }
            watchdog.arm();

            if let Some(silence) = watchdog.silence().filter(|s| *s > threshold) {
                let reason = format!("no frames for {} ms", silence.as_millis());
                watchdog.disarm();
                engine.report_stream_lost(&reason).await;
            }
        }
        info!("Liveness watchdog stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disarmed_watchdog_is_never_stale() {
        let wd = LivenessWatchdog::new();
        wd.record_frame();
        assert!(!wd.is_armed());
        assert_eq!(wd.silence(), None);
        assert!(!wd.is_stale(Duration::ZERO));
    }

    #[test]
    fn silence_counts_from_arming_until_first_frame() {
        let wd = LivenessWatchdog::new();
        wd.arm();
        std::thread::sleep(Duration::from_millis(30));
        assert!(wd.is_stale(Duration::from_millis(10)));

        wd.record_frame();
        assert!(!wd.is_stale(Duration::from_millis(10)));
    }

    #[test]
    fn frame_before_arming_does_not_count() {
        let wd = LivenessWatchdog::new();
        wd.record_frame();
        std::thread::sleep(Duration::from_millis(20));
        wd.arm();
        let silence = wd.silence().unwrap();
        assert!(silence < Duration::from_millis(15), "silence {:?}", silence);
    }

    #[test]
    fn disarm_clears_marks() {
        let wd = LivenessWatchdog::new();
        wd.arm();
        wd.record_frame();
        wd.disarm();
        assert!(!wd.is_armed());

        let shared = wd.clone();
        shared.arm();
        assert!(wd.is_armed());
    }
}
