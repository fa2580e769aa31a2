use std::sync::Arc;
use std::time::Duration;

use jhview_core::ErrorKind;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::CommandTransport;
use crate::command::Command;
use crate::sink::FrameSink;
use crate::stop::StopSignal;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveStats {
    pub sent: u64,
    pub failed: u64,
}

/// Re-send `START_STREAM` every `interval` until `stop` is raised.
///
/// Send failures are logged and reported to the sink; they never end the
/// loop or touch connection state.
pub fn spawn_keepalive(
    transport: Arc<dyn CommandTransport>,
    interval: Duration,
    sink: Arc<dyn FrameSink>,
    stop: StopSignal,
) -> JoinHandle<KeepAliveStats> {
    tokio::spawn(async move {
        let mut stats = KeepAliveStats::default();
        debug!("Keep-alive started (every {:?})", interval);

        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if stop.is_stopped() {
                break;
            }

            match transport.send(Command::START_STREAM).await {
                Ok(()) => stats.sent += 1,
                Err(e) => {
                    stats.failed += 1;
                    if stats.failed <= 10 || stats.failed % 50 == 0 {
                        warn!("Keep-alive #{} failed: {}", stats.sent + stats.failed, e);
                    }
                    sink.on_error(ErrorKind::SendFailed, &format!("keep-alive: {e}"));
                }
            }
        }

        info!("Keep-alive stopped: sent={} failed={}", stats.sent, stats.failed);
        stats
    })
}
