use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use jhview_core::JpegFrame;
use tracing::info;

use crate::error::CaptureError;

pub const IMAGES_DIR: &str = "Images";

/// Saves single frames as `<media_dir>/Images/IMG_<yyyyMMdd_HHmmss>.jpg`.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(media_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: media_dir.as_ref().join(IMAGES_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, frame: Option<&JpegFrame>) -> Result<PathBuf, CaptureError> {
        self.save_at(frame, Local::now())
    }

    /// Write `frame` with a name derived from `when`. Two snapshots within the
    /// same second get `_1`, `_2`, ... suffixes instead of overwriting.
    pub fn save_at(
        &self,
        frame: Option<&JpegFrame>,
        when: DateTime<Local>,
    ) -> Result<PathBuf, CaptureError> {
        let frame = frame.ok_or(CaptureError::NoFrame)?;
        fs::create_dir_all(&self.dir).map_err(|e| CaptureError::io(&self.dir, e))?;

        let stem = format!("IMG_{}", when.format("%Y%m%d_%H%M%S"));
        let path = unique_path(&self.dir, &stem, "jpg");
        fs::write(&path, frame.data()).map_err(|e| CaptureError::io(&path, e))?;

        info!("Snapshot saved: {} ({} bytes)", path.display(), frame.len());
        Ok(path)
    }
}

pub(crate) fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let first = dir.join(format!("{stem}.{ext}"));
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("{stem}_{n}.{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}
