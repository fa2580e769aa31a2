use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No frame received yet")]
    NoFrame,

    #[error("Already recording to {path}")]
    AlreadyRecording { path: PathBuf },

    #[error("Not recording")]
    NotRecording,

    #[error("Cannot record while the stream is {state}")]
    NotStreaming { state: jhview_core::ConnectionState },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CaptureError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
