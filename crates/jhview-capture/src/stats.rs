use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Frame-rate and throughput counters over a rolling one-second window.
#[derive(Debug, Default, Clone)]
pub struct StreamStats {
    frames_total: u64,
    bytes_total: u64,
    last_frame_at: Option<Instant>,
    // Rolling window: (arrival, byte count)
    window: VecDeque<(Instant, u64)>,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call once per received frame.
    pub fn tick_frame(&mut self, byte_count: usize) {
        self.tick_frame_at(Instant::now(), byte_count);
    }

    pub fn tick_frame_at(&mut self, now: Instant, byte_count: usize) {
        self.frames_total += 1;
        self.bytes_total += byte_count as u64;
        self.last_frame_at = Some(now);
        self.window.push_back((now, byte_count as u64));
        self.evict(now);
    }

    /// Frames seen during the last second.
    pub fn fps(&self) -> f64 {
        self.fps_at(Instant::now())
    }

    pub fn fps_at(&self, now: Instant) -> f64 {
        self.recent(now).count() as f64
    }

    /// Megabits received during the last second.
    pub fn bitrate_mbps(&self) -> f64 {
        self.bitrate_mbps_at(Instant::now())
    }

    pub fn bitrate_mbps_at(&self, now: Instant) -> f64 {
        let bytes: u64 = self.recent(now).map(|(_, b)| b).sum();
        (bytes as f64 * 8.0) / 1_000_000.0
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at
    }

    /// Clear the rolling window between sessions. Totals are kept.
    pub fn reset_window(&mut self) {
        self.window.clear();
        self.last_frame_at = None;
    }

    fn recent(&self, now: Instant) -> impl Iterator<Item = &(Instant, u64)> {
        self.window
            .iter()
            .filter(move |(t, _)| now.saturating_duration_since(*t) <= WINDOW)
    }

    fn evict(&mut self, now: Instant) {
        while self
            .window
            .front()
            .map_or(false, |(t, _)| now.saturating_duration_since(*t) > WINDOW)
        {
            self.window.pop_front();
        }
    }
}
