//! Per-camera capture task with reconnection.
//!
//! Each [`StreamSource`] runs one tokio task that connects, decodes, and
//! publishes into the stream's [`FrameBuffer`]. The task owns the connection
//! and is the only writer of the stream's [`StreamHealth`]; everyone else
//! reads snapshots through a `watch` channel.
//!
//! ```text
//!   Stopped --start--> Connecting --first frame--> Connected
//!                         ^  |                        |
//!                 backoff |  | open failed /          | read failed / stale /
//!                         |  v first frame timed out  | decode errors in a row
//!                      Reconnecting <-----------------+
//!                         |
//!                         | attempts exhausted
//!                         v
//!                       Failed
//! ```
//!
//! `stop()` moves any state to `Stopped` and interrupts whatever the task is
//! waiting on: a connect, a read, or a backoff sleep.

use crate::backoff::Backoff;
use crate::capture::StreamConnector;
use crate::config::StreamConfig;
use crate::error::{CaptureError, SupervisorError};
use crate::frame::{wall_time_ns, Frame};
use crate::frame_buffer::FrameBuffer;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Connection state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; needs `start()`
    Failed,
    /// Not running
    Stopped,
}

impl CameraState {
    /// No task is running and none will start on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CameraState::Failed | CameraState::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CameraState::Connecting => "connecting",
            CameraState::Connected => "connected",
            CameraState::Reconnecting => "reconnecting",
            CameraState::Failed => "failed",
            CameraState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a stream's health
#[derive(Debug, Clone)]
pub struct StreamHealth {
    pub id: usize,
    pub name: Arc<str>,
    pub state: CameraState,
    /// Reconnect attempts since the stream was created
    pub reconnect_count: u64,
    /// Reconnect attempts in the current outage
    pub reconnect_attempts: u32,
    /// Failed connects, reads and decodes since the last good frame
    pub consecutive_failures: u32,
    pub frames_captured: u64,
    /// Frames dropped because they could not be decoded
    pub frames_dropped: u64,
    pub last_sequence: Option<u64>,
    pub last_frame_at: Option<Instant>,
    pub last_backoff: Option<Duration>,
    pub last_error: Option<String>,
}

impl StreamHealth {
    /// Snapshot of a stream that has never been started
    pub fn new(id: usize, name: Arc<str>) -> Self {
        Self {
            id,
            name,
            state: CameraState::Stopped,
            reconnect_count: 0,
            reconnect_attempts: 0,
            consecutive_failures: 0,
            frames_captured: 0,
            frames_dropped: 0,
            last_sequence: None,
            last_frame_at: None,
            last_backoff: None,
            last_error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == CameraState::Connected
    }

    pub fn last_frame_age(&self, now: Instant) -> Option<Duration> {
        self.last_frame_at
            .map(|at| now.saturating_duration_since(at))
    }
}

struct RunningTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// One camera: configuration, latest frame, health, and the capture task.
pub struct StreamSource {
    id: usize,
    config: Arc<StreamConfig>,
    connector: Arc<dyn StreamConnector>,
    buffer: Arc<FrameBuffer>,
    health: Arc<watch::Sender<StreamHealth>>,
    sequence: Arc<AtomicU64>,
    task: Option<RunningTask>,
}

impl StreamSource {
    pub fn new(id: usize, config: StreamConfig, connector: Arc<dyn StreamConnector>) -> Self {
        let name: Arc<str> = Arc::from(config.name.as_str());
        Self {
            id,
            config: Arc::new(config),
            connector,
            buffer: Arc::new(FrameBuffer::new()),
            health: Arc::new(watch::Sender::new(StreamHealth::new(id, name))),
            sequence: Arc::new(AtomicU64::new(0)),
            task: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Spawn the capture task.
    ///
    /// Does nothing while a task is already running. After `Failed` or
    /// `Stopped` it starts over with a fresh reconnect budget; cumulative
    /// counters and the last frame are kept.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if let Some(task) = &self.task {
            if !task.handle.is_finished() {
                return Ok(());
            }
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SupervisorError::StartFailed(format!("{}: {}", self.config.name, e)))?;

        self.health.send_modify(|h| {
            h.state = CameraState::Connecting;
            h.reconnect_attempts = 0;
            h.consecutive_failures = 0;
            h.last_backoff = None;
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let capture = CaptureLoop {
            id: self.id,
            name: Arc::from(self.config.name.as_str()),
            config: self.config.clone(),
            connector: self.connector.clone(),
            buffer: self.buffer.clone(),
            health: self.health.clone(),
            sequence: self.sequence.clone(),
            backoff: Backoff::new(self.config.backoff.clone()),
            attempts: 0,
            stop_rx,
        };

        log::info!(
            "[{}] starting capture from {}",
            self.config.name,
            self.config.redacted_url()
        );
        let handle = runtime.spawn(capture.run());
        self.task = Some(RunningTask { stop_tx, handle });
        Ok(())
    }

    /// Stop the capture task and wait for it to exit.
    ///
    /// When this returns the connection has been dropped and no further
    /// frames will be published. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.stop_tx.send(true);
            if let Err(e) = task.handle.await {
                log::error!("[{}] capture task ended abnormally: {}", self.config.name, e);
            }
            log::info!("[{}] stopped", self.config.name);
        }
        self.health.send_modify(|h| h.state = CameraState::Stopped);
    }

    /// Whether a capture task is alive
    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Latest published frame, possibly stale
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.buffer.peek()
    }

    /// Drop the retained frame, e.g. after a stream has failed
    pub fn clear_frame(&self) {
        self.buffer.clear();
    }

    pub fn frame_buffer(&self) -> Arc<FrameBuffer> {
        self.buffer.clone()
    }

    pub fn health(&self) -> StreamHealth {
        self.health.borrow().clone()
    }

    pub fn state(&self) -> CameraState {
        self.health.borrow().state
    }

    /// Receiver that is notified on every health change
    pub fn subscribe(&self) -> watch::Receiver<StreamHealth> {
        self.health.subscribe()
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        // Cannot await here; aborting drops the task and its connection.
        if let Some(task) = self.task.take() {
            let _ = task.stop_tx.send(true);
            task.handle.abort();
        }
    }
}

/// State owned by the capture task
struct CaptureLoop {
    id: usize,
    name: Arc<str>,
    config: Arc<StreamConfig>,
    connector: Arc<dyn StreamConnector>,
    buffer: Arc<FrameBuffer>,
    health: Arc<watch::Sender<StreamHealth>>,
    sequence: Arc<AtomicU64>,
    backoff: Backoff,
    attempts: u32,
    stop_rx: watch::Receiver<bool>,
}

/// Resolves once stop is requested or the source is gone.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

impl CaptureLoop {
    async fn run(mut self) {
        loop {
            self.set_state(CameraState::Connecting);

            let Some(error) = self.run_session().await else {
                return;
            };

            self.health.send_modify(|h| {
                h.consecutive_failures = h.consecutive_failures.saturating_add(1);
                h.last_error = Some(error.to_string());
            });

            if self.config.max_reconnect_attempts.is_exhausted(self.attempts) {
                let exhausted = CaptureError::ReconnectExhausted(self.attempts);
                log::error!("[{}] {} (last error: {})", self.name, exhausted, error);
                self.health.send_modify(|h| {
                    h.state = CameraState::Failed;
                    h.last_error = Some(format!("{} (last error: {})", exhausted, error));
                });
                return;
            }

            let delay = self.backoff.next_delay();
            self.attempts += 1;
            log::warn!(
                "[{}] {}; reconnecting in {:?} (attempt {})",
                self.name,
                error,
                delay,
                self.attempts
            );
            let attempts = self.attempts;
            self.health.send_modify(|h| {
                h.state = CameraState::Reconnecting;
                h.reconnect_attempts = attempts;
                h.reconnect_count += 1;
                h.last_backoff = Some(delay);
            });

            tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_rx) => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Connect and read until the connection is lost.
    ///
    /// Returns the reason it was lost, or `None` when stop was requested.
    async fn run_session(&mut self) -> Option<CaptureError> {
        let mut conn = tokio::select! {
            biased;
            _ = stop_requested(&mut self.stop_rx) => return None,
            result = self.connector.connect(&self.config) => match result {
                Ok(conn) => conn,
                Err(e) => return Some(e),
            },
        };

        let stale_timeout = self.config.stale_timeout();
        let mut decode_errors: u32 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_rx) => return None,
                next = tokio::time::timeout(stale_timeout, conn.next_image()) => next,
            };

            let failure = match next {
                Err(_) => return Some(CaptureError::Stale(stale_timeout)),
                Ok(Ok(image)) => match image.normalize(self.config.width, self.config.height) {
                    Ok(pixels) => {
                        decode_errors = 0;
                        self.publish(pixels);
                        continue;
                    }
                    Err(e) => e,
                },
                Ok(Err(e)) if e.is_connection_fatal() => return Some(e),
                Ok(Err(e)) => e,
            };

            decode_errors += 1;
            log::debug!("[{}] dropped frame: {}", self.name, failure);
            self.health.send_modify(|h| {
                h.frames_dropped += 1;
                h.consecutive_failures = h.consecutive_failures.saturating_add(1);
                h.last_error = Some(failure.to_string());
            });

            if decode_errors >= self.config.max_consecutive_decode_errors {
                return Some(CaptureError::Connection(format!(
                    "{} consecutive undecodable frames",
                    decode_errors
                )));
            }
        }
    }

    fn publish(&mut self, pixels: Vec<u8>) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let captured_at = Instant::now();

        self.buffer.publish(Arc::new(Frame {
            source_id: self.id,
            stream: self.name.clone(),
            sequence,
            captured_at,
            wall_time_ns: wall_time_ns(),
            width: self.config.width,
            height: self.config.height,
            data: pixels,
        }));

        if self.attempts > 0 || self.backoff.attempt() > 0 {
            self.attempts = 0;
            self.backoff.reset();
        }

        let mut became_connected = false;
        self.health.send_modify(|h| {
            became_connected = h.state != CameraState::Connected;
            h.state = CameraState::Connected;
            h.consecutive_failures = 0;
            h.reconnect_attempts = 0;
            h.frames_captured += 1;
            h.last_sequence = Some(sequence);
            h.last_frame_at = Some(captured_at);
        });

        if became_connected {
            log::info!(
                "[{}] connected, first frame #{} ({}x{})",
                self.name,
                sequence,
                self.config.width,
                self.config.height
            );
        }
    }

    fn set_state(&self, state: CameraState) {
        self.health.send_if_modified(|h| {
            if h.state == state {
                return false;
            }
            h.state = state;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DefaultConnector;

    fn stub_config(url: &str) -> StreamConfig {
        let mut config = StreamConfig::new("stub", url);
        config.width = 16;
        config.height = 8;
        config.backoff.jitter = 0.0;
        config
    }

    fn source(url: &str) -> StreamSource {
        StreamSource::new(0, stub_config(url), Arc::new(DefaultConnector))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_publishes() {
        let mut source = source("stub://a");
        assert_eq!(source.state(), CameraState::Stopped);
        assert!(source.current_frame().is_none());

        source.start().unwrap();
        let mut rx = source.subscribe();
        rx.wait_for(|h| h.frames_captured >= 3).await.unwrap();

        let health = source.health();
        assert_eq!(health.state, CameraState::Connected);
        assert_eq!(health.consecutive_failures, 0);
        let frame = source.current_frame().unwrap();
        assert_eq!((frame.width, frame.height), (16, 8));
        assert_eq!(frame.data.len(), 16 * 8 * 3);

        source.stop().await;
        assert_eq!(source.state(), CameraState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let mut source = source("stub://a");
        source.stop().await;
        source.start().unwrap();
        source.stop().await;
        source.stop().await;
        assert!(!source.is_running());
        assert_eq!(source.state(), CameraState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_keeps_one_task() {
        let mut source = source("stub://a");
        source.start().unwrap();
        source.start().unwrap();
        assert!(source.is_running());
        source.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_continues_across_reconnects() {
        let mut source = source("stub://a?drop_after=3");
        source.start().unwrap();
        let mut rx = source.subscribe();
        rx.wait_for(|h| h.reconnect_count >= 2 && h.frames_captured >= 7)
            .await
            .unwrap();
        let frame = source.current_frame().unwrap();
        assert!(frame.sequence >= 6);
        source.stop().await;
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let mut source = source("stub://a");
        assert!(matches!(
            source.start(),
            Err(SupervisorError::StartFailed(_))
        ));
    }
}
