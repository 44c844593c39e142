use super::StreamConnection;
use crate::config::StreamConfig;
use crate::error::CaptureError;
use crate::frame::{DecodedImage, RGB_CHANNELS};
use gstreamer::prelude::*;
use std::time::Duration;

/// How often the bus is checked while waiting for a frame
const BUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// RTSP connection decoding to RGB24 through GStreamer.
///
/// Pipeline:
/// ```text
/// rtspsrc ! decodebin ! videoconvert ! videoscale ! video/x-raw,format=RGB ! appsink
/// ```
///
/// The appsink callback runs on a GStreamer streaming thread and hands
/// images to the async side through a bounded channel. When the channel is
/// full the newest image is dropped; the capture loop only wants the latest
/// frames and must never stall the decoder.
pub struct RtspConnection {
    name: String,
    pipeline: gstreamer::Pipeline,
    image_rx: flume::Receiver<Result<DecodedImage, CaptureError>>,
}

impl RtspConnection {
    pub fn open(config: &StreamConfig) -> Result<Self, CaptureError> {
        gstreamer::init().map_err(|e| CaptureError::Connection(e.to_string()))?;

        let url = config.authenticated_url();
        let pipeline_desc = format!(
            "rtspsrc location={url} latency={latency} ! \
             decodebin ! \
             videoconvert ! \
             videoscale ! \
             video/x-raw,format=RGB,width={width},height={height} ! \
             appsink name=rawsink emit-signals=true sync=false max-buffers=1 drop=true",
            url = url,
            latency = config.latency,
            width = config.width,
            height = config.height,
        );

        log::debug!(
            "[{}] creating pipeline for {}",
            config.name,
            config.redacted_url()
        );

        let pipeline = gstreamer::parse::launch(&pipeline_desc)
            .map_err(|e| CaptureError::Connection(format!("pipeline: {}", e)))?
            .dynamic_cast::<gstreamer::Pipeline>()
            .map_err(|_| CaptureError::Connection("failed to downcast pipeline".to_string()))?;

        let sink = pipeline
            .by_name("rawsink")
            .ok_or_else(|| CaptureError::Connection("appsink element missing".to_string()))?
            .dynamic_cast::<gstreamer_app::AppSink>()
            .map_err(|_| CaptureError::Connection("appsink has unexpected type".to_string()))?;

        let (image_tx, image_rx) = flume::bounded(config.buffer_depth.max(1));

        sink.set_callbacks(
            gstreamer_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    // A full channel means the reader is behind; dropping is fine.
                    let _ = image_tx.try_send(Self::handle_sample(sink));
                    Ok(gstreamer::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| CaptureError::Connection(format!("state change: {}", e)))?;

        log::info!("[{}] opening {}", config.name, config.redacted_url());

        Ok(Self {
            name: config.name.clone(),
            pipeline,
            image_rx,
        })
    }

    fn handle_sample(sink: &gstreamer_app::AppSink) -> Result<DecodedImage, CaptureError> {
        let sample = sink
            .pull_sample()
            .map_err(|e| CaptureError::Decode(format!("pull sample: {}", e)))?;

        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::Decode("sample without caps".to_string()))?;
        let info = gstreamer_video::VideoInfo::from_caps(caps)
            .map_err(|e| CaptureError::Decode(format!("caps: {}", e)))?;

        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::Decode("sample without buffer".to_string()))?;
        let pts = buffer.pts().map(|t| t.nseconds());
        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::Decode("unreadable buffer".to_string()))?;

        let (width, height) = (info.width(), info.height());
        let row_bytes = width as usize * RGB_CHANNELS;
        let stride = info.stride()[0] as usize;
        let data = map.as_slice();

        let pixels = if stride == row_bytes {
            data.to_vec()
        } else {
            let mut pixels = Vec::with_capacity(row_bytes * height as usize);
            for row in 0..height as usize {
                let start = row * stride;
                let line = data
                    .get(start..start + row_bytes)
                    .ok_or_else(|| CaptureError::Decode("row out of bounds".to_string()))?;
                pixels.extend_from_slice(line);
            }
            pixels
        };

        Ok(DecodedImage {
            data: pixels,
            width,
            height,
            pts,
        })
    }

    /// Surface pipeline errors and end-of-stream as connection failures.
    fn poll_bus(&self) -> Result<(), CaptureError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(CaptureError::Connection(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )));
                }
                MessageView::Eos(..) => {
                    return Err(CaptureError::Connection("end of stream".to_string()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<(), gstreamer::StateChangeError> {
        let _ = self.pipeline.send_event(gstreamer::event::Eos::new());
        self.pipeline.set_state(gstreamer::State::Null)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StreamConnection for RtspConnection {
    async fn next_image(&mut self) -> Result<DecodedImage, CaptureError> {
        loop {
            self.poll_bus()?;
            match tokio::time::timeout(BUS_POLL_INTERVAL, self.image_rx.recv_async()).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => {
                    return Err(CaptureError::Connection(
                        "decoder channel disconnected".to_string(),
                    ))
                }
                Err(_) => continue,
            }
        }
    }
}

impl Drop for RtspConnection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("[{}] error closing pipeline: {}", self.name, e);
        }
    }
}
