use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// JPEG start-of-image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

// MARK: - ConnectionState

/// Lifecycle state of a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Streaming,
    Disconnected,
}

impl ConnectionState {
    /// Frames are (or should be) flowing.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Streaming)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Streaming => write!(f, "streaming"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

// MARK: - ErrorKind

/// Category of a non-fatal error reported to a frame sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A command datagram could not be sent.
    SendFailed,
    /// The data socket returned an error other than a timeout.
    ReceiveFailed,
    /// A datagram was too short or came from an unexpected host.
    MalformedPacket,
    /// An assembled buffer did not carry a JPEG start marker.
    InvalidFrame,
    /// Sockets could not be opened for a connection attempt.
    SetupFailed,
    /// The stream went silent and was torn down.
    StreamLost,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::SendFailed => "send failed",
            Self::ReceiveFailed => "receive failed",
            Self::MalformedPacket => "malformed packet",
            Self::InvalidFrame => "invalid frame",
            Self::SetupFailed => "setup failed",
            Self::StreamLost => "stream lost",
        };
        f.write_str(label)
    }
}

// MARK: - JpegFrame

/// A complete JPEG frame reassembled from device datagrams.
///
/// The payload always begins with [`JPEG_SOI`]; construction through
/// [`JpegFrame::from_buffer`] is the only way to obtain one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JpegFrame {
    data: Bytes,
    frame_counter: u16,
    packet_count: u32,
}

impl JpegFrame {
    /// Validates `data` and wraps it as a frame. Returns `None` for empty
    /// buffers and buffers not starting with the SOI marker.
    pub fn from_buffer(data: Vec<u8>, frame_counter: u16, packet_count: u32) -> Option<Self> {
        if !data.starts_with(&JPEG_SOI) {
            return None;
        }
        Some(Self {
            data: Bytes::from(data),
            frame_counter,
            packet_count,
        })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Device-assigned frame counter of the packets this frame came from.
    pub fn frame_counter(&self) -> u16 {
        self.frame_counter
    }

    /// Number of datagrams that contributed payload.
    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    /// True when the payload also carries the EOI marker at its tail.
    pub fn has_end_marker(&self) -> bool {
        self.data.ends_with(&JPEG_EOI)
    }
}
