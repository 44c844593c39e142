//! Synchronized composite of all streams.
//!
//! Every cycle the compositor peeks each slot's frame buffer in configured
//! order, measures the capture-time skew between the live frames and tiles
//! everything into one RGB canvas. A slot whose frame is missing or too old
//! gets a placeholder tile; a dead stream never holds up the composite.

use crate::config::CompositorConfig;
use crate::frame::{resize_rgb, Frame, RGB_CHANNELS};
use crate::frame_buffer::FrameBuffer;
use crate::source::{CameraState, StreamHealth, StreamSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

const PLACEHOLDER_FILL: [u8; 3] = [24, 24, 24];
const PLACEHOLDER_BORDER: [u8; 3] = [200, 0, 0];
const LAST_SEEN_BAR: [u8; 3] = [230, 160, 0];
const BORDER_PX: usize = 2;
/// Age at which the "last seen" bar spans the whole tile
const LAST_SEEN_FULL_SCALE: Duration = Duration::from_secs(30);

/// Read side of one stream, as seen by the compositor
#[derive(Clone)]
pub struct Slot {
    name: Arc<str>,
    buffer: Arc<FrameBuffer>,
    health: watch::Receiver<StreamHealth>,
    width: u32,
    height: u32,
    /// Nominal time between frames of the stream
    frame_interval: Duration,
}

impl Slot {
    pub fn new(
        name: impl Into<Arc<str>>,
        buffer: Arc<FrameBuffer>,
        health: watch::Receiver<StreamHealth>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            name: name.into(),
            buffer,
            health,
            width,
            height,
            frame_interval: Duration::ZERO,
        }
    }

    pub fn from_source(source: &StreamSource) -> Self {
        Self::new(
            source.name(),
            source.frame_buffer(),
            source.subscribe(),
            source.config().width,
            source.config().height,
        )
        .with_frame_interval(source.config().frame_interval())
    }

    /// A slow camera gets a proportionally longer staleness allowance.
    pub fn with_frame_interval(mut self, frame_interval: Duration) -> Self {
        self.frame_interval = frame_interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CameraState {
        self.health.borrow().state
    }
}

/// What a slot shows in one composite
#[derive(Debug, Clone)]
pub enum SlotRender {
    Live {
        frame: Arc<Frame>,
        age: Duration,
    },
    Placeholder {
        stream: Arc<str>,
        state: CameraState,
        /// Age of the last frame ever received, if any
        last_seen: Option<Duration>,
    },
}

impl SlotRender {
    pub fn is_live(&self) -> bool {
        matches!(self, SlotRender::Live { .. })
    }

    pub fn stream(&self) -> &str {
        match self {
            SlotRender::Live { frame, .. } => &frame.stream,
            SlotRender::Placeholder { stream, .. } => stream,
        }
    }
}

/// Capture-time spread among the live frames of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkewReport {
    /// Largest pairwise difference, i.e. newest minus oldest
    pub max_skew: Duration,
    pub live_streams: usize,
    /// `max_skew` exceeded the configured threshold
    pub desynchronized: bool,
}

/// Skew of a set of capture times against `threshold`.
///
/// Flagged only when the spread is strictly greater than the threshold.
pub fn measure_skew(captured: &[Instant], threshold: Duration) -> SkewReport {
    let max_skew = match (captured.iter().min(), captured.iter().max()) {
        (Some(oldest), Some(newest)) => newest.saturating_duration_since(*oldest),
        _ => Duration::ZERO,
    };
    SkewReport {
        max_skew,
        live_streams: captured.len(),
        desynchronized: max_skew > threshold,
    }
}

/// Packed RGB24 image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Canvas {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * RGB_CHANNELS],
        }
    }

    /// RGB value at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    fn blit(&mut self, x0: usize, y0: usize, w: usize, h: usize, pixels: &[u8]) {
        let stride = self.width as usize * RGB_CHANNELS;
        let row_bytes = w * RGB_CHANNELS;
        for row in 0..h {
            let dst = (y0 + row) * stride + x0 * RGB_CHANNELS;
            let src = row * row_bytes;
            self.data[dst..dst + row_bytes].copy_from_slice(&pixels[src..src + row_bytes]);
        }
    }

    fn fill(&mut self, x0: usize, y0: usize, w: usize, h: usize, color: [u8; 3]) {
        let stride = self.width as usize * RGB_CHANNELS;
        for row in y0..y0 + h {
            let start = row * stride + x0 * RGB_CHANNELS;
            for px in self.data[start..start + w * RGB_CHANNELS].chunks_exact_mut(RGB_CHANNELS) {
                px.copy_from_slice(&color);
            }
        }
    }
}

/// One synchronization cycle's output
#[derive(Debug, Clone)]
pub struct CompositeFrame {
    /// Cycle counter, starting at 0
    pub cycle: u64,
    pub composed_at: Instant,
    /// One entry per configured stream, in configuration order
    pub slots: Vec<SlotRender>,
    pub skew: SkewReport,
    pub image: Canvas,
}

impl CompositeFrame {
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_live()).count()
    }
}

/// Display layer entry point. Owned by the compositor while it runs.
pub trait CompositeSink: Send {
    fn present(&mut self, composite: &CompositeFrame);
}

/// Builds composites from a fixed set of slots
pub struct Compositor {
    config: CompositorConfig,
    slots: Vec<Slot>,
    tile_width: u32,
    tile_height: u32,
    columns: usize,
    cycle: u64,
}

impl Compositor {
    pub fn new(config: CompositorConfig, slots: Vec<Slot>) -> Self {
        let tile_width = config
            .tile_width
            .or_else(|| slots.iter().map(|s| s.width).max())
            .unwrap_or(1);
        let tile_height = config
            .tile_height
            .or_else(|| slots.iter().map(|s| s.height).max())
            .unwrap_or(1);
        let columns = config
            .columns
            .unwrap_or(slots.len())
            .clamp(1, slots.len().max(1));

        Self {
            config,
            slots,
            tile_width,
            tile_height,
            columns,
            cycle: 0,
        }
    }

    /// Canvas size as (width, height)
    pub fn canvas_size(&self) -> (u32, u32) {
        if self.slots.is_empty() {
            return (0, 0);
        }
        let rows = self.slots.len().div_ceil(self.columns);
        (
            self.tile_width * self.columns as u32,
            self.tile_height * rows as u32,
        )
    }

    pub fn compose(&mut self) -> CompositeFrame {
        self.compose_at(Instant::now())
    }

    /// Build the composite as of `now`.
    pub fn compose_at(&mut self, now: Instant) -> CompositeFrame {
        let slots: Vec<SlotRender> = self
            .slots
            .iter()
            .map(|slot| {
                let max_age = self.config.staleness_threshold_for(slot.frame_interval);
                match slot.buffer.peek() {
                    Some(frame) if frame.age(now) <= max_age => SlotRender::Live {
                        age: frame.age(now),
                        frame,
                    },
                    stale => SlotRender::Placeholder {
                        stream: slot.name.clone(),
                        state: slot.state(),
                        last_seen: stale.map(|frame| frame.age(now)),
                    },
                }
            })
            .collect();

        let captured: Vec<Instant> = slots
            .iter()
            .filter_map(|slot| match slot {
                SlotRender::Live { frame, .. } => Some(frame.captured_at),
                SlotRender::Placeholder { .. } => None,
            })
            .collect();
        let skew = measure_skew(&captured, self.config.skew_threshold());

        let image = self.render(&slots);
        let cycle = self.cycle;
        self.cycle += 1;

        CompositeFrame {
            cycle,
            composed_at: now,
            slots,
            skew,
            image,
        }
    }

    fn render(&self, slots: &[SlotRender]) -> Canvas {
        let (width, height) = self.canvas_size();
        let mut canvas = Canvas::new(width, height);
        let (tw, th) = (self.tile_width as usize, self.tile_height as usize);

        for (index, slot) in slots.iter().enumerate() {
            let x0 = (index % self.columns) * tw;
            let y0 = (index / self.columns) * th;
            match slot {
                SlotRender::Live { frame, .. } => {
                    if frame.width as usize == tw && frame.height as usize == th {
                        canvas.blit(x0, y0, tw, th, &frame.data);
                    } else {
                        let scaled = resize_rgb(
                            &frame.data,
                            frame.width,
                            frame.height,
                            self.tile_width,
                            self.tile_height,
                        );
                        canvas.blit(x0, y0, tw, th, &scaled);
                    }
                }
                SlotRender::Placeholder { last_seen, .. } => {
                    draw_placeholder(&mut canvas, x0, y0, tw, th, *last_seen);
                }
            }
        }
        canvas
    }

    /// Compose on the configured cadence until `shutdown_rx` fires.
    ///
    /// The sink is dropped when this returns; it is handed back so callers
    /// can inspect it.
    pub async fn run<S: CompositeSink>(
        mut self,
        mut sink: S,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> S {
        let mut ticker = tokio::time::interval(self.config.frame_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::info!(
            "Compositor: {} slots, {}x{} canvas at {} fps",
            self.slots.len(),
            self.canvas_size().0,
            self.canvas_size().1,
            self.config.target_fps
        );

        let mut desynchronized = false;
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break,

                _ = ticker.tick() => {
                    let composite = self.compose();
                    if composite.skew.desynchronized != desynchronized {
                        desynchronized = composite.skew.desynchronized;
                        if desynchronized {
                            log::warn!(
                                "Streams out of sync: {:?} skew across {} live streams",
                                composite.skew.max_skew,
                                composite.skew.live_streams
                            );
                        } else {
                            log::info!("Streams back in sync");
                        }
                    }
                    sink.present(&composite);
                }
            }
        }

        log::info!("Compositor stopped after {} cycles", self.cycle);
        sink
    }
}

/// Dark tile with a red border; a bottom bar grows with the time since the
/// stream was last seen.
fn draw_placeholder(
    canvas: &mut Canvas,
    x0: usize,
    y0: usize,
    w: usize,
    h: usize,
    last_seen: Option<Duration>,
) {
    canvas.fill(x0, y0, w, h, PLACEHOLDER_FILL);

    let b = BORDER_PX.min(w / 2).min(h / 2);
    canvas.fill(x0, y0, w, b, PLACEHOLDER_BORDER);
    canvas.fill(x0, y0 + h - b, w, b, PLACEHOLDER_BORDER);
    canvas.fill(x0, y0, b, h, PLACEHOLDER_BORDER);
    canvas.fill(x0 + w - b, y0, b, h, PLACEHOLDER_BORDER);

    if let Some(age) = last_seen {
        let inner_w = w.saturating_sub(2 * b);
        let bar_h = (h / 10).max(1).min(h.saturating_sub(2 * b));
        let ratio = age.min(LAST_SEEN_FULL_SCALE).as_secs_f64()
            / LAST_SEEN_FULL_SCALE.as_secs_f64();
        let bar_w = ((inner_w as f64 * ratio).ceil() as usize).clamp(1, inner_w.max(1));
        if inner_w > 0 && bar_h > 0 {
            canvas.fill(x0 + b, y0 + h - b - bar_h, bar_w, bar_h, LAST_SEEN_BAR);
        }
    }
}
