//! Test helpers: a connector that plays back scripted camera behavior

#![allow(dead_code)]

use multicam::capture::{StreamConnection, StreamConnector};
use multicam::config::{BackoffConfig, ReconnectLimit, StreamConfig};
use multicam::error::CaptureError;
use multicam::frame::{DecodedImage, RGB_CHANNELS};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const WIDTH: u32 = 4;
pub const HEIGHT: u32 = 2;

/// What the camera does on one read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Deliver a good frame
    Frame,
    /// Deliver garbage that fails to decode
    Garbage,
    /// Drop the connection
    Disconnect,
}

/// What the camera does on one connect
#[derive(Debug, Clone)]
pub enum Session {
    /// Refuse the connection
    Refuse,
    /// Never finish connecting
    Hang,
    /// Accept, play the steps, then go silent
    Play(Vec<Step>),
}

impl Session {
    pub fn frames(n: usize) -> Self {
        Session::Play(vec![Step::Frame; n])
    }

    pub fn frames_then_disconnect(n: usize) -> Self {
        let mut steps = vec![Step::Frame; n];
        steps.push(Step::Disconnect);
        Session::Play(steps)
    }
}

/// Connector that hands out scripted sessions in order.
///
/// Once the script runs out every further connect gets `fallback`.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Session>>,
    fallback: Session,
    pace: Duration,
    connects: Mutex<Vec<Instant>>,
    open: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(script: Vec<Session>, fallback: Session) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            pace: Duration::from_millis(10),
            connects: Mutex::new(Vec::new()),
            open: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Times at which `connect` was called
    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    /// Gaps between consecutive connect calls
    pub fn connect_gaps(&self) -> Vec<Duration> {
        self.connects
            .lock()
            .windows(2)
            .map(|w| w[1].duration_since(w[0]))
            .collect()
    }

    /// Connections handed out and not yet dropped
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(
        &self,
        config: &StreamConfig,
    ) -> Result<Box<dyn StreamConnection>, CaptureError> {
        self.connects.lock().push(Instant::now());
        let session = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match session {
            Session::Hang => std::future::pending().await,
            Session::Refuse => Err(CaptureError::Connection(format!(
                "{} refused the connection",
                config.url
            ))),
            Session::Play(steps) => {
                self.open.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ScriptedConnection {
                    steps: steps.into(),
                    width: config.width,
                    height: config.height,
                    pace: self.pace,
                    delivered: 0,
                    open: self.open.clone(),
                }))
            }
        }
    }
}

struct ScriptedConnection {
    steps: VecDeque<Step>,
    width: u32,
    height: u32,
    pace: Duration,
    delivered: u8,
    open: Arc<AtomicUsize>,
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl StreamConnection for ScriptedConnection {
    async fn next_image(&mut self) -> Result<DecodedImage, CaptureError> {
        let Some(step) = self.steps.pop_front() else {
            return std::future::pending().await;
        };
        tokio::time::sleep(self.pace).await;

        match step {
            Step::Frame => {
                self.delivered = self.delivered.wrapping_add(1);
                let len = self.width as usize * self.height as usize * RGB_CHANNELS;
                Ok(DecodedImage::new(
                    vec![self.delivered; len],
                    self.width,
                    self.height,
                ))
            }
            Step::Garbage => Ok(DecodedImage::new(vec![0; 3], self.width, self.height)),
            Step::Disconnect => Err(CaptureError::Connection("connection reset".into())),
        }
    }
}

/// Stream config with deterministic backoff: 100ms doubling, no jitter
pub fn scripted_config(limit: ReconnectLimit) -> StreamConfig {
    let mut config = StreamConfig::new("scripted", "rtsp://10.0.0.9/stream");
    config.width = WIDTH;
    config.height = HEIGHT;
    config.max_reconnect_attempts = limit;
    config.backoff = BackoffConfig {
        base_ms: 100,
        max_ms: 10_000,
        multiplier: 2.0,
        jitter: 0.0,
    };
    config
}
