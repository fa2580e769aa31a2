//! MJPEG video capture.
//!
//! A recording is the raw concatenation of every JPEG frame received while it
//! is active. Most players (ffplay, VLC, mpv) open such `.mjpeg` files
//! directly.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use jhview_core::JpegFrame;
use tracing::{debug, info};

use crate::error::CaptureError;
use crate::snapshot::unique_path;

pub const VIDEOS_DIR: &str = "Videos";

/// Outcome of a finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub frames: u64,
    pub bytes: u64,
    pub duration: Duration,
}

struct ActiveRecording {
    writer: BufWriter<File>,
    path: PathBuf,
    frames: u64,
    bytes: u64,
    started: Instant,
}

pub struct MjpegRecorder {
    dir: PathBuf,
    active: Option<ActiveRecording>,
}

impl MjpegRecorder {
    pub fn new(media_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: media_dir.as_ref().join(VIDEOS_DIR),
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Path of the file being written, if recording.
    pub fn current_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    pub fn start(&mut self) -> Result<PathBuf, CaptureError> {
        self.start_at(Local::now())
    }

    /// Open `<media_dir>/Videos/VID_<yyyyMMdd_HHmmss>.mjpeg`.
    pub fn start_at(&mut self, when: DateTime<Local>) -> Result<PathBuf, CaptureError> {
        if let Some(active) = &self.active {
            return Err(CaptureError::AlreadyRecording {
                path: active.path.clone(),
            });
        }
        fs::create_dir_all(&self.dir).map_err(|e| CaptureError::io(&self.dir, e))?;

        let stem = format!("VID_{}", when.format("%Y%m%d_%H%M%S"));
        let path = unique_path(&self.dir, &stem, "mjpeg");
        let file = File::create(&path).map_err(|e| CaptureError::io(&path, e))?;

        info!("Recording started: {}", path.display());
        self.active = Some(ActiveRecording {
            writer: BufWriter::new(file),
            path: path.clone(),
            frames: 0,
            bytes: 0,
            started: Instant::now(),
        });
        Ok(path)
    }

    /// Append one frame. Does nothing when not recording.
    pub fn write_frame(&mut self, frame: &JpegFrame) -> Result<(), CaptureError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        active
            .writer
            .write_all(frame.data())
            .map_err(|e| CaptureError::io(&active.path, e))?;
        active.frames += 1;
        active.bytes += frame.len() as u64;
        if active.frames % 300 == 0 {
            debug!("Recording {}: {} frames", active.path.display(), active.frames);
        }
        Ok(())
    }

    /// Flush and close the file.
    pub fn stop(&mut self) -> Result<RecordingSummary, CaptureError> {
        let active = self.active.take().ok_or(CaptureError::NotRecording)?;
        let ActiveRecording {
            mut writer,
            path,
            frames,
            bytes,
            started,
        } = active;

        writer.flush().map_err(|e| CaptureError::io(&path, e))?;
        let summary = RecordingSummary {
            path,
            frames,
            bytes,
            duration: started.elapsed(),
        };
        info!(
            "Recording saved: {} ({} frames, {} bytes, {:.1}s)",
            summary.path.display(),
            summary.frames,
            summary.bytes,
            summary.duration.as_secs_f64()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn frame(tag: u8) -> JpegFrame {
        JpegFrame::from_buffer(vec![0xFF, 0xD8, tag, 0xFF, 0xD9], tag as u16, 1).unwrap()
    }

    #[test]
    fn records_concatenated_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = MjpegRecorder::new(tmp.path());
        let when = Local.with_ymd_and_hms(2024, 11, 2, 8, 0, 59).unwrap();

        let path = rec.start_at(when).unwrap();
        assert_eq!(path, tmp.path().join("Videos").join("VID_20241102_080059.mjpeg"));
        assert!(rec.is_recording());

        rec.write_frame(&frame(1)).unwrap();
        rec.write_frame(&frame(2)).unwrap();
        let summary = rec.stop().unwrap();

        assert_eq!(summary.path, path);
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.bytes, 10);
        assert_eq!(
            fs::read(&path).unwrap(),
            vec![0xFF, 0xD8, 1, 0xFF, 0xD9, 0xFF, 0xD8, 2, 0xFF, 0xD9]
        );
        assert!(!rec.is_recording());
    }

    #[test]
    fn start_twice_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = MjpegRecorder::new(tmp.path());
        let path = rec.start().unwrap();

        match rec.start() {
            Err(CaptureError::AlreadyRecording { path: p }) => assert_eq!(p, path),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(rec.current_path(), Some(path.as_path()));
    }

    #[test]
    fn stop_without_start_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = MjpegRecorder::new(tmp.path());
        assert!(matches!(rec.stop(), Err(CaptureError::NotRecording)));
    }

    #[test]
    fn frames_outside_a_recording_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = MjpegRecorder::new(tmp.path());
        rec.write_frame(&frame(9)).unwrap();
        assert!(!tmp.path().join("Videos").exists());
    }
}
