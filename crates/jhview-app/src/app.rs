use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jhview_capture::CaptureSink;
use jhview_core::EngineConfig;
use jhview_transport::{spawn_liveness_watchdog, ConnectOutcome, DeviceEngine, StopSignal};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const MEDIA_DIR_ENV: &str = "JHVIEW_MEDIA_DIR";
const DEFAULT_MEDIA_DIR: &str = "jhview-media";

// ── Console commands ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleCommand {
    Photo,
    Record,
    StopRecord,
    Status,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "photo" | "p" => Ok(Self::Photo),
            "record" | "r" => Ok(Self::Record),
            "stop-record" | "s" => Ok(Self::StopRecord),
            "status" | "?" => Ok(Self::Status),
            "quit" | "q" | "exit" => Ok(Self::Quit),
            other => Err(format!(
                "unknown command '{other}' (photo, record, stop-record, status, quit)"
            )),
        }
    }
}

/// Main viewer loop.
///
/// # Flow
/// 1. Load `EngineConfig` (`JHVIEW_CONFIG` file, then env overrides)
/// 2. Start the engine with a `CaptureSink` and the liveness watchdog
/// 3. Serve console commands from stdin until `quit` or Ctrl-C
/// 4. Finalize any recording and stop the engine
pub async fn run() -> Result<()> {
    let config = EngineConfig::load().context("loading engine configuration")?;
    let media_dir = std::env::var(MEDIA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_MEDIA_DIR));

    info!(
        "Device {} | data port {} | media in {}",
        config.control_addr(),
        config.data_port,
        media_dir.display()
    );

    let capture = Arc::new(CaptureSink::new(&media_dir));
    let engine = DeviceEngine::new(config.clone(), capture.clone());

    let stop = StopSignal::new();
    let threshold = config.liveness_threshold();
    let poll = (threshold / 4).max(Duration::from_millis(100));
    let watchdog = spawn_liveness_watchdog(
        engine.clone(),
        capture.watchdog(),
        threshold,
        poll,
        stop.clone(),
    );

    match engine.connect().await {
        ConnectOutcome::Streaming => {
            info!("Streaming. Commands: photo, record, stop-record, status, quit")
        }
        ConnectOutcome::Failed => warn!(
            "Device not reachable yet; retrying every {:?}",
            config.reconnect_backoff()
        ),
        other => info!("connect(): {:?}", other),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match line.parse::<ConsoleCommand>() {
                        Ok(ConsoleCommand::Quit) => break,
                        Ok(cmd) => handle(cmd, &capture, &engine),
                        Err(msg) => warn!("{}", msg),
                    },
                    Ok(None) => {
                        info!("stdin closed; press Ctrl-C to stop");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        stdin_open = false;
                    }
                }
            }
        }
    }

    if capture.is_recording() {
        match capture.stop_recording() {
            Ok(summary) => info!("Saved {} ({} frames)", summary.path.display(), summary.frames),
            Err(e) => warn!("Recording not finalized: {}", e),
        }
    }
    stop.stop();
    engine.stop().await;
    if let Err(e) = watchdog.await {
        warn!("Liveness watchdog ended abnormally: {}", e);
    }

    let status = capture.status();
    info!(
        "Session totals: {} frames, {} bytes, {} reconnect attempt(s)",
        status.frames_total,
        status.bytes_total,
        engine.reconnect_attempts()
    );
    Ok(())
}

fn handle(cmd: ConsoleCommand, capture: &CaptureSink, engine: &DeviceEngine) {
    match cmd {
        ConsoleCommand::Photo => match capture.take_snapshot() {
            Ok(path) => info!("Photo: {}", path.display()),
            Err(e) => warn!("Photo failed: {}", e),
        },
        ConsoleCommand::Record => match capture.start_recording() {
            Ok(path) => info!("Recording to {}", path.display()),
            Err(e) => warn!("Record failed: {}", e),
        },
        ConsoleCommand::StopRecord => match capture.stop_recording() {
            Ok(summary) => info!(
                "Recording saved: {} ({} frames, {:.1} MB, {:.1}s)",
                summary.path.display(),
                summary.frames,
                summary.bytes as f64 / 1_000_000.0,
                summary.duration.as_secs_f64()
            ),
            Err(e) => warn!("Stop-record failed: {}", e),
        },
        ConsoleCommand::Status => {
            let s = capture.status();
            info!(
                "{} | {:.0} fps | {:.2} Mbps | {} frames | {} errors | reconnects {} | rec: {}",
                engine.state(),
                s.fps,
                s.bitrate_mbps,
                s.frames_total,
                s.errors_total,
                engine.reconnect_attempts(),
                s.recording
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "no".into())
            );
        }
        ConsoleCommand::Quit => {}
    }
}
