//! Read-only statistics over stream health snapshots.

use crate::source::{CameraState, StreamHealth};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default span of the FPS estimate
pub const DEFAULT_FPS_WINDOW: Duration = Duration::from_secs(5);

/// Statistics for one stream
#[derive(Debug, Clone)]
pub struct StreamReport {
    pub id: usize,
    pub name: Arc<str>,
    pub state: CameraState,
    pub reconnect_count: u64,
    pub consecutive_failures: u32,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    /// Frames per second over the reporter's window
    pub fps: f64,
    pub last_frame_age: Option<Duration>,
    pub last_error: Option<String>,
}

/// Statistics for the whole session
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub uptime: Duration,
    pub streams: Vec<StreamReport>,
}

impl HealthReport {
    pub fn total(&self) -> usize {
        self.streams.len()
    }

    pub fn connected(&self) -> usize {
        self.streams
            .iter()
            .filter(|s| s.state == CameraState::Connected)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.streams
            .iter()
            .filter(|s| s.state == CameraState::Failed)
            .count()
    }

    /// Fraction of streams currently connected
    pub fn connection_rate(&self) -> f64 {
        if self.streams.is_empty() {
            return 0.0;
        }
        self.connected() as f64 / self.total() as f64
    }
}

/// Derives uptime and frame-rate statistics from health snapshots.
///
/// The reporter keeps a short history of `(frame time, sequence)` pairs per
/// stream so it can estimate FPS from sequence deltas. It never touches the
/// streams themselves, and `report` may be called from any thread.
pub struct HealthReporter {
    started_at: Instant,
    window: Duration,
    history: Mutex<HashMap<usize, VecDeque<(Instant, u64)>>>,
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new(DEFAULT_FPS_WINDOW)
    }
}

impl HealthReporter {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(Instant::now(), window)
    }

    /// Reporter whose uptime counts from `started_at`
    pub fn starting_at(started_at: Instant, window: Duration) -> Self {
        Self {
            started_at,
            window,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn report(&self, snapshots: &[StreamHealth]) -> HealthReport {
        self.report_at(snapshots, Instant::now())
    }

    pub fn report_at(&self, snapshots: &[StreamHealth], now: Instant) -> HealthReport {
        let mut history = self.history.lock();

        let streams = snapshots
            .iter()
            .map(|health| {
                let samples = history.entry(health.id).or_default();
                let fps = self.estimate_fps(samples, health, now);
                StreamReport {
                    id: health.id,
                    name: health.name.clone(),
                    state: health.state,
                    reconnect_count: health.reconnect_count,
                    consecutive_failures: health.consecutive_failures,
                    frames_captured: health.frames_captured,
                    frames_dropped: health.frames_dropped,
                    fps,
                    last_frame_age: health.last_frame_age(now),
                    last_error: health.last_error.clone(),
                }
            })
            .collect();

        HealthReport {
            uptime: now.saturating_duration_since(self.started_at),
            streams,
        }
    }

    fn estimate_fps(
        &self,
        samples: &mut VecDeque<(Instant, u64)>,
        health: &StreamHealth,
        now: Instant,
    ) -> f64 {
        if let (Some(at), Some(sequence)) = (health.last_frame_at, health.last_sequence) {
            if samples.back().map_or(true, |&(_, last)| sequence > last) {
                samples.push_back((at, sequence));
            }
        }

        // The newest sample before the horizon stays as the left anchor, so
        // reports spaced wider than the window still see two samples.
        if let Some(horizon) = now.checked_sub(self.window) {
            while samples.get(1).is_some_and(|&(at, _)| at <= horizon) {
                samples.pop_front();
            }
            if samples.back().is_some_and(|&(at, _)| at < horizon) {
                return 0.0;
            }
        }

        match (samples.front(), samples.back()) {
            (Some(&(t0, s0)), Some(&(t1, s1))) if t1 > t0 => {
                (s1 - s0) as f64 / t1.duration_since(t0).as_secs_f64()
            }
            _ => 0.0,
        }
    }
}

/// `MM:SS`, or `HH:MM:SS` from one hour on
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}
