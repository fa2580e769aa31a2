//! UDP MJPEG frame reassembly.
//!
//! # Packet layout (8-byte header)
//!
//! ```text
//! [0..2]  frame_counter  u16 BE  wraps at 65536
//! [2]     (ignored)
//! [3]     packet_seq     u8      0-based index within the frame
//! [4..8]  (ignored)
//! [8..]   payload        [u8]    JPEG slice
//! ```
//!
//! A frame is finalized when a packet's payload ends with `FF D9`, or when
//! the next frame's first packet shows up (new counter or `packet_seq == 0`).
//! Both paths are needed: an EOI split across two packets is only caught by
//! the boundary. Payload is appended in arrival order; nothing is reordered.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use jhview_core::{EngineConfig, ErrorKind, JpegFrame, JPEG_EOI};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sink::FrameSink;
use crate::stop::StopSignal;

pub const HEADER_LEN: usize = 8;

/// Frames growing past this are abandoned rather than buffered forever.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

// ── Header ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_counter: u16,
    pub packet_seq: u8,
}

impl PacketHeader {
    /// Split a datagram into header and payload. Datagrams of `HEADER_LEN`
    /// bytes or fewer carry no payload and yield `None`.
    pub fn parse(datagram: &[u8]) -> Option<(Self, &[u8])> {
        if datagram.len() <= HEADER_LEN {
            return None;
        }
        let header = Self {
            frame_counter: u16::from_be_bytes([datagram[0], datagram[1]]),
            packet_seq: datagram[3],
        };
        Some((header, &datagram[HEADER_LEN..]))
    }
}

// ── FrameAssembler ────────────────────────────────────────────────────────────

/// Something observable that happened while handling one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyEvent {
    /// A complete, SOI-validated frame.
    Frame(JpegFrame),
    /// A finalized buffer failed validation (or overflowed) and was dropped.
    Dropped { frame_counter: u16, bytes: usize },
    /// The datagram was too short to carry payload.
    ShortDatagram { len: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub datagrams: u64,
    pub short_datagrams: u64,
    pub frames_emitted: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Default)]
struct FrameBuffer {
    frame_counter: Option<u16>,
    data: Vec<u8>,
    packets: u32,
}

/// Single-threaded reassembly state machine. Owns the frame buffer; the
/// receive loop is its only caller.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: FrameBuffer,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw datagram.
    pub fn push(&mut self, datagram: &[u8]) -> Vec<AssemblyEvent> {
        self.stats.datagrams += 1;

        let Some((header, payload)) = PacketHeader::parse(datagram) else {
            self.stats.short_datagrams += 1;
            return vec![AssemblyEvent::ShortDatagram { len: datagram.len() }];
        };

        let mut events = Vec::new();

        if self.buffer.frame_counter != Some(header.frame_counter) || header.packet_seq == 0 {
            if !self.buffer.data.is_empty() {
                self.finalize(&mut events);
            }
            self.buffer = FrameBuffer {
                frame_counter: Some(header.frame_counter),
                data: Vec::with_capacity(payload.len() * 16),
                packets: 0,
            };
        }

        self.buffer.data.extend_from_slice(payload);
        self.buffer.packets += 1;

        if payload.ends_with(&JPEG_EOI) {
            self.finalize(&mut events);
        } else if self.buffer.data.len() > MAX_FRAME_BYTES {
            warn!(
                "Frame {} exceeded {} bytes without an end marker, dropping",
                header.frame_counter, MAX_FRAME_BYTES
            );
            self.finalize_as_dropped(&mut events);
        }

        events
    }

    /// Counter, byte length and packet count of the frame in progress.
    pub fn in_progress(&self) -> Option<(u16, usize, u32)> {
        self.buffer
            .frame_counter
            .map(|counter| (counter, self.buffer.data.len(), self.buffer.packets))
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    fn finalize(&mut self, events: &mut Vec<AssemblyEvent>) {
        let buffer = std::mem::take(&mut self.buffer);
        let Some(frame_counter) = buffer.frame_counter else {
            return;
        };
        if buffer.data.is_empty() {
            return;
        }
        let bytes = buffer.data.len();
        match JpegFrame::from_buffer(buffer.data, frame_counter, buffer.packets) {
            Some(frame) => {
                self.stats.frames_emitted += 1;
                events.push(AssemblyEvent::Frame(frame));
            }
            None => {
                self.stats.frames_dropped += 1;
                events.push(AssemblyEvent::Dropped { frame_counter, bytes });
            }
        }
    }

    fn finalize_as_dropped(&mut self, events: &mut Vec<AssemblyEvent>) {
        let buffer = std::mem::take(&mut self.buffer);
        if let Some(frame_counter) = buffer.frame_counter {
            self.stats.frames_dropped += 1;
            events.push(AssemblyEvent::Dropped {
                frame_counter,
                bytes: buffer.data.len(),
            });
        }
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    pub recv_timeout: Duration,
    pub max_datagram_bytes: usize,
    /// When set, datagrams from any other source IP are ignored.
    pub expected_source: Option<IpAddr>,
}

impl From<&EngineConfig> for ReassemblerConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            recv_timeout: cfg.recv_timeout(),
            max_datagram_bytes: cfg.max_datagram_bytes,
            expected_source: cfg.strict_source.then_some(cfg.device_ip),
        }
    }
}

/// Spawn the receive loop on `socket`. The task owns the socket and drops it
/// on exit; it only exits once `stop` is raised.
pub fn spawn_reassembler(
    socket: UdpSocket,
    config: ReassemblerConfig,
    sink: Arc<dyn FrameSink>,
    stop: StopSignal,
) -> JoinHandle<AssemblerStats> {
    tokio::spawn(receive_loop(socket, config, sink, stop))
}

async fn receive_loop(
    socket: UdpSocket,
    config: ReassemblerConfig,
    sink: Arc<dyn FrameSink>,
    stop: StopSignal,
) -> AssemblerStats {
    let local = socket.local_addr().ok();
    let mut buf = vec![0u8; config.max_datagram_bytes];
    let mut assembler = FrameAssembler::new();
    let mut recv_errors: u64 = 0;
    let mut foreign: u64 = 0;

    info!("Frame receive loop started on {:?}", local);

    while !stop.is_stopped() {
        let received = tokio::time::timeout(config.recv_timeout, socket.recv_from(&mut buf)).await;
        let (len, from) = match received {
            Err(_) => continue,
            Ok(Ok(received)) => received,
            Ok(Err(e)) if is_timeout(&e) => continue,
            Ok(Err(e)) => {
                recv_errors += 1;
                if recv_errors <= 10 || recv_errors % 100 == 0 {
                    warn!("Data socket receive error #{}: {}", recv_errors, e);
                }
                sink.on_error(ErrorKind::ReceiveFailed, &e.to_string());
                continue;
            }
        };

        if !source_allowed(&config, from) {
            foreign += 1;
            if foreign <= 5 || foreign % 100 == 0 {
                debug!("Ignoring datagram #{} from unexpected source {}", foreign, from);
            }
            continue;
        }

        for event in assembler.push(&buf[..len]) {
            dispatch(event, &assembler, sink.as_ref());
        }
    }

    let stats = assembler.stats();
    info!(
        "Frame receive loop stopped: datagrams={} frames={} dropped={} short={} recv_errors={}",
        stats.datagrams,
        stats.frames_emitted,
        stats.frames_dropped,
        stats.short_datagrams,
        recv_errors
    );
    stats
}

fn dispatch(event: AssemblyEvent, assembler: &FrameAssembler, sink: &dyn FrameSink) {
    match event {
        AssemblyEvent::Frame(frame) => {
            let n = assembler.stats().frames_emitted;
            if n == 1 {
                info!(
                    "First frame received ({} bytes, {} packets)",
                    frame.len(),
                    frame.packet_count()
                );
            }
            sink.on_frame(frame);
        }
        AssemblyEvent::Dropped { frame_counter, bytes } => {
            let n = assembler.stats().frames_dropped;
            if n <= 10 || n % 100 == 0 {
                debug!("Dropped invalid frame #{} (counter={} bytes={})", n, frame_counter, bytes);
            }
            sink.on_error(
                ErrorKind::InvalidFrame,
                &format!("frame {frame_counter} ({bytes} bytes) has no JPEG start marker"),
            );
        }
        AssemblyEvent::ShortDatagram { len } => {
            sink.on_error(
                ErrorKind::MalformedPacket,
                &format!("datagram of {len} bytes carries no payload"),
            );
        }
    }
}

fn source_allowed(config: &ReassemblerConfig, from: SocketAddr) -> bool {
    config.expected_source.map_or(true, |ip| ip == from.ip())
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use jhview_core::ConnectionState;

    use super::*;

    fn packet(counter: u16, seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(HEADER_LEN + payload.len());
        datagram.extend_from_slice(&counter.to_be_bytes());
        datagram.push(0x00);
        datagram.push(seq);
        datagram.extend_from_slice(&[0xAB; 4]);
        datagram.extend_from_slice(payload);
        datagram
    }

    fn frames(events: Vec<AssemblyEvent>) -> Vec<Vec<u8>> {
        events
            .into_iter()
            .filter_map(|e| match e {
                AssemblyEvent::Frame(f) => Some(f.data().to_vec()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn header_parse_extracts_counter_and_seq() {
        let datagram = packet(0x1234, 5, &[0x01]);
        let (header, payload) = PacketHeader::parse(&datagram).unwrap();
        assert_eq!(header.frame_counter, 0x1234);
        assert_eq!(header.packet_seq, 5);
        assert_eq!(payload, &[0x01]);
        assert!(PacketHeader::parse(&datagram[..HEADER_LEN]).is_none());
    }

    #[test]
    fn short_datagrams_leave_buffer_untouched() {
        let mut asm = FrameAssembler::new();
        asm.push(&packet(9, 0, &[0xFF, 0xD8, 0x11]));
        let before = asm.in_progress();

        for len in 0..=HEADER_LEN {
            let events = asm.push(&vec![0u8; len]);
            assert_eq!(events, vec![AssemblyEvent::ShortDatagram { len }]);
        }
        assert_eq!(asm.in_progress(), before);
        assert_eq!(asm.stats().frames_emitted, 0);
        assert_eq!(asm.stats().short_datagrams, (HEADER_LEN + 1) as u64);
    }

    #[test]
    fn two_packet_frame_is_emitted_once() {
        let mut asm = FrameAssembler::new();
        assert!(asm.push(&packet(1, 0, &[0xFF, 0xD8, 0xAA])).is_empty());
        let out = frames(asm.push(&packet(1, 1, &[0xBB, 0xFF, 0xD9])));

        assert_eq!(out, vec![vec![0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9]]);
        assert_eq!(asm.in_progress(), None);
        assert_eq!(asm.stats().frames_emitted, 1);
    }

    #[test]
    fn emitted_frame_carries_counter_and_packet_count() {
        let mut asm = FrameAssembler::new();
        asm.push(&packet(300, 0, &[0xFF, 0xD8]));
        asm.push(&packet(300, 1, &[0x01]));
        let events = asm.push(&packet(300, 2, &[0xFF, 0xD9]));
        let AssemblyEvent::Frame(frame) = &events[0] else {
            panic!("expected a frame, got {:?}", events);
        };
        assert_eq!(frame.frame_counter(), 300);
        assert_eq!(frame.packet_count(), 3);
    }

    #[test]
    fn restart_mid_frame_does_not_duplicate_bytes() {
        let mut asm = FrameAssembler::new();
        asm.push(&packet(7, 0, &[0xFF, 0xD8, 0x01]));
        asm.push(&packet(7, 1, &[0x02]));

        // same counter, sequence 0 again: the partial frame is finalized first
        let events = asm.push(&packet(7, 0, &[0xFF, 0xD8, 0x03]));
        assert_eq!(frames(events), vec![vec![0xFF, 0xD8, 0x01, 0x02]]);
        assert_eq!(asm.in_progress(), Some((7, 3, 1)));

        let out = frames(asm.push(&packet(7, 1, &[0xFF, 0xD9])));
        assert_eq!(out, vec![vec![0xFF, 0xD8, 0x03, 0xFF, 0xD9]]);
    }

    #[test]
    fn buffer_without_start_marker_is_never_emitted() {
        let mut asm = FrameAssembler::new();
        asm.push(&packet(2, 0, &[0x00, 0x00, 0x10]));
        let events = asm.push(&packet(2, 1, &[0x20, 0xFF, 0xD9]));

        assert!(frames(events.clone()).is_empty());
        assert_eq!(events, vec![AssemblyEvent::Dropped { frame_counter: 2, bytes: 6 }]);
        assert_eq!(asm.stats().frames_dropped, 1);
        assert_eq!(asm.in_progress(), None);
    }

    #[test]
    fn new_counter_finalizes_frame_with_split_end_marker() {
        let mut asm = FrameAssembler::new();
        // EOI split across two packets: no trailing FF D9 in either payload
        asm.push(&packet(10, 0, &[0xFF, 0xD8, 0x55, 0xFF]));
        assert!(asm.push(&packet(10, 1, &[0xD9])).is_empty());

        let events = asm.push(&packet(11, 0, &[0xFF, 0xD8]));
        assert_eq!(frames(events), vec![vec![0xFF, 0xD8, 0x55, 0xFF, 0xD9]]);
        assert_eq!(asm.in_progress(), Some((11, 2, 1)));
    }

    #[test]
    fn counter_wraparound_is_just_a_new_frame() {
        let mut asm = FrameAssembler::new();
        asm.push(&packet(u16::MAX, 0, &[0xFF, 0xD8, 0x01]));
        let events = asm.push(&packet(0, 1, &[0xFF, 0xD8, 0x02, 0xFF, 0xD9]));

        assert_eq!(
            frames(events),
            vec![vec![0xFF, 0xD8, 0x01], vec![0xFF, 0xD8, 0x02, 0xFF, 0xD9]]
        );
    }

    #[test]
    fn trailing_packet_after_end_marker_starts_fresh_buffer() {
        let mut asm = FrameAssembler::new();
        asm.push(&packet(4, 0, &[0xFF, 0xD8, 0xFF, 0xD9]));
        // stray packet with the same counter after completion
        assert!(asm.push(&packet(4, 1, &[0x99])).is_empty());
        assert_eq!(asm.in_progress(), Some((4, 1, 1)));

        let events = asm.push(&packet(5, 0, &[0xFF, 0xD8]));
        assert_eq!(events[0], AssemblyEvent::Dropped { frame_counter: 4, bytes: 1 });
    }

    #[test]
    fn oversized_frame_is_abandoned() {
        let mut asm = FrameAssembler::new();
        let chunk = packet(1, 1, &[0x11; 1400]);
        asm.push(&packet(1, 0, &[0xFF, 0xD8]));

        let mut pushed = 0usize;
        let dropped = loop {
            let events = asm.push(&chunk);
            pushed += 1;
            if let Some(event) = events.into_iter().next() {
                break event;
            }
            assert!(pushed * 1400 <= MAX_FRAME_BYTES + 1400, "cap never enforced");
        };

        assert!(matches!(dropped, AssemblyEvent::Dropped { frame_counter: 1, .. }));
        assert_eq!(asm.in_progress(), None);
        assert_eq!(asm.stats().frames_emitted, 0);
    }

    // ── Receive loop ─────────────────────────────────────────────────────────

    #[derive(Default)]
    struct CollectingSink {
        frames: Mutex<Vec<JpegFrame>>,
        errors: Mutex<Vec<ErrorKind>>,
    }

    impl FrameSink for CollectingSink {
        fn on_frame(&self, frame: JpegFrame) {
            self.frames.lock().unwrap().push(frame);
        }

        fn on_state_changed(&self, _state: ConnectionState) {}

        fn on_error(&self, kind: ErrorKind, _message: &str) {
            self.errors.lock().unwrap().push(kind);
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within 1s");
    }

    fn loop_config(expected_source: Option<IpAddr>) -> ReassemblerConfig {
        ReassemblerConfig {
            recv_timeout: Duration::from_millis(20),
            max_datagram_bytes: 2048,
            expected_source,
        }
    }

    #[tokio::test]
    async fn receive_loop_delivers_frames_and_stops_on_signal() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let sink = Arc::new(CollectingSink::default());
        let stop = StopSignal::new();
        let handle = spawn_reassembler(
            socket,
            loop_config(Some("127.0.0.1".parse().unwrap())),
            sink.clone(),
            stop.clone(),
        );

        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        device.send_to(&packet(1, 0, &[0xFF, 0xD8, 0xAA]), addr).await.unwrap();
        device.send_to(&packet(1, 1, &[0xBB, 0xFF, 0xD9]), addr).await.unwrap();
        device.send_to(&[0u8; 4], addr).await.unwrap();

        wait_for(|| {
            sink.frames.lock().unwrap().len() == 1 && !sink.errors.lock().unwrap().is_empty()
        })
        .await;
        assert_eq!(
            &sink.frames.lock().unwrap()[0].data()[..],
            &[0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9]
        );
        assert_eq!(sink.errors.lock().unwrap()[0], ErrorKind::MalformedPacket);

        stop.stop();
        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits after stop")
            .unwrap();
        assert_eq!(stats.frames_emitted, 1);
        assert_eq!(stats.datagrams, 3);
    }

    #[tokio::test]
    async fn receive_loop_ignores_foreign_sources() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let sink = Arc::new(CollectingSink::default());
        let stop = StopSignal::new();
        let handle = spawn_reassembler(
            socket,
            loop_config(Some("10.9.8.7".parse().unwrap())),
            sink.clone(),
            stop.clone(),
        );

        let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        other.send_to(&packet(1, 0, &[0xFF, 0xD8, 0xFF, 0xD9]), addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        stop.stop();
        let stats = handle.await.unwrap();
        assert!(sink.frames.lock().unwrap().is_empty());
        assert_eq!(stats.datagrams, 0);
    }
}
