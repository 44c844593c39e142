//! Multi-camera RTSP capture.
//!
//! Every configured camera gets a [`StreamSource`] that captures on its own
//! task and reconnects with backoff when the camera goes away. The latest
//! frame of each stream sits in a [`FrameBuffer`]. The [`Compositor`] reads
//! all of them on a fixed cadence and tiles them into one image, and the
//! [`HealthReporter`] summarizes how the streams are doing.

pub mod backoff;
pub mod capture;
pub mod compositor;
pub mod config;
pub mod error;
pub mod frame;
pub mod frame_buffer;
pub mod health;
pub mod source;
pub mod supervisor;

pub use compositor::{CompositeFrame, CompositeSink, Compositor, Slot, SlotRender};
pub use config::{Config, StreamConfig};
pub use error::{CaptureError, SupervisorError};
pub use frame::Frame;
pub use frame_buffer::FrameBuffer;
pub use health::{HealthReport, HealthReporter};
pub use source::{CameraState, StreamHealth, StreamSource};
pub use supervisor::StreamSupervisor;
