//! Capture backends.
//!
//! A [`StreamConnector`] opens connections, a [`StreamConnection`] yields
//! decoded images until it fails. Dropping a connection releases it; the
//! capture loop relies on that to tear down on reconnect and on stop.
//!
//! - `rtsp://` / `rtsps://` go through GStreamer (feature `gstreamer`)
//! - `stub://` produces a synthetic test pattern

#[cfg(feature = "gstreamer")]
mod gst;
mod synthetic;

#[cfg(feature = "gstreamer")]
pub use gst::RtspConnection;
pub use synthetic::SyntheticConnection;

use crate::config::StreamConfig;
use crate::error::CaptureError;
use crate::frame::DecodedImage;

/// An open stream.
#[async_trait::async_trait]
pub trait StreamConnection: Send {
    /// Wait for the next decoded image.
    ///
    /// `CaptureError::Decode` means one frame was bad and the connection is
    /// still usable; any other error means it is not.
    async fn next_image(&mut self) -> Result<DecodedImage, CaptureError>;
}

/// Opens connections for a stream configuration.
#[async_trait::async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        config: &StreamConfig,
    ) -> Result<Box<dyn StreamConnection>, CaptureError>;
}

/// Picks a backend from the URL scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

#[async_trait::async_trait]
impl StreamConnector for DefaultConnector {
    async fn connect(
        &self,
        config: &StreamConfig,
    ) -> Result<Box<dyn StreamConnection>, CaptureError> {
        let scheme = config
            .url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();

        match scheme.as_str() {
            "stub" => Ok(Box::new(SyntheticConnection::open(config)?)),
            #[cfg(feature = "gstreamer")]
            "rtsp" | "rtsps" => Ok(Box::new(RtspConnection::open(config)?)),
            #[cfg(not(feature = "gstreamer"))]
            "rtsp" | "rtsps" => Err(CaptureError::Unsupported(format!(
                "{} (built without the gstreamer feature)",
                config.redacted_url()
            ))),
            _ => Err(CaptureError::Unsupported(config.redacted_url())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_scheme_connects() {
        let config = StreamConfig::new("a", "stub://a");
        let mut conn = DefaultConnector.connect(&config).await.unwrap();
        let image = conn.next_image().await.unwrap();
        assert_eq!((image.width, image.height), (config.width, config.height));
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_unsupported() {
        let config = StreamConfig::new("a", "ftp://camera/stream");
        let result = DefaultConnector.connect(&config).await;
        assert!(matches!(result, Err(CaptureError::Unsupported(_))));
    }

    #[cfg(not(feature = "gstreamer"))]
    #[tokio::test]
    async fn test_rtsp_without_backend_is_unsupported() {
        let config = StreamConfig::new("a", "rtsp://10.0.0.2/stream");
        let result = DefaultConnector.connect(&config).await;
        assert!(matches!(result, Err(CaptureError::Unsupported(_))));
    }
}
