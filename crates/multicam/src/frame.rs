use crate::error::CaptureError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Bytes per pixel of RGB24
pub const RGB_CHANNELS: usize = 3;

/// An image as delivered by a capture backend, before normalization
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// Raw RGB24 pixel data, tightly packed
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp from the stream in nanoseconds, if known
    pub pts: Option<u64>,
}

impl DecodedImage {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            pts: None,
        }
    }

    /// Check dimensions against the buffer, then scale to `width` x `height`.
    pub fn normalize(self, width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
        let expected = self.width as usize * self.height as usize * RGB_CHANNELS;
        if self.width == 0 || self.height == 0 || self.data.len() != expected {
            return Err(CaptureError::Decode(format!(
                "malformed {}x{} image with {} bytes",
                self.width,
                self.height,
                self.data.len()
            )));
        }
        if self.width == width && self.height == height {
            return Ok(self.data);
        }
        Ok(resize_rgb(
            &self.data,
            self.width,
            self.height,
            width,
            height,
        ))
    }
}

/// A decoded, normalized frame published by a stream.
///
/// Frames are immutable once published and shared as `Arc<Frame>`.
#[derive(Debug)]
pub struct Frame {
    /// Index of the stream in the configuration
    pub source_id: usize,
    /// Stream name
    pub stream: Arc<str>,
    /// Per-stream sequence number, strictly increasing across reconnects
    pub sequence: u64,
    /// Monotonic capture time, comparable across streams
    pub captured_at: Instant,
    /// Wall-clock capture time in nanoseconds since the Unix epoch
    pub wall_time_ns: u64,
    pub width: u32,
    pub height: u32,
    /// RGB24 pixel data
    pub data: Vec<u8>,
}

impl Frame {
    /// Row stride in bytes
    pub fn step(&self) -> u32 {
        self.width * RGB_CHANNELS as u32
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }
}

pub(crate) fn wall_time_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Nearest-neighbour scale of a packed RGB24 image.
pub fn resize_rgb(src: &[u8], src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Vec<u8> {
    let (src_w, src_h) = (src_w as usize, src_h as usize);
    let (dst_w, dst_h) = (dst_w as usize, dst_h as usize);
    let mut dst = vec![0u8; dst_w * dst_h * RGB_CHANNELS];

    for y in 0..dst_h {
        let sy = y * src_h / dst_h;
        let src_row = &src[sy * src_w * RGB_CHANNELS..(sy + 1) * src_w * RGB_CHANNELS];
        let dst_row = &mut dst[y * dst_w * RGB_CHANNELS..(y + 1) * dst_w * RGB_CHANNELS];
        for (x, px) in dst_row.chunks_exact_mut(RGB_CHANNELS).enumerate() {
            let sx = x * src_w / dst_w;
            px.copy_from_slice(&src_row[sx * RGB_CHANNELS..(sx + 1) * RGB_CHANNELS]);
        }
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_same_size_is_passthrough() {
        let data: Vec<u8> = (0..2 * 2 * 3).map(|i| i as u8).collect();
        let out = DecodedImage::new(data.clone(), 2, 2).normalize(2, 2).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_normalize_rejects_short_buffer() {
        let result = DecodedImage::new(vec![0; 10], 2, 2).normalize(2, 2);
        assert!(matches!(result, Err(CaptureError::Decode(_))));
    }

    #[test]
    fn test_resize_downscale_picks_nearest() {
        // 4x2 image, each pixel's red channel is its x coordinate
        let mut src = Vec::new();
        for _y in 0..2 {
            for x in 0..4u8 {
                src.extend_from_slice(&[x, 0, 0]);
            }
        }
        let out = resize_rgb(&src, 4, 2, 2, 1);
        assert_eq!(out, vec![0, 0, 0, 2, 0, 0]);
    }

    #[test]
    fn test_resize_upscale_fills_every_pixel() {
        let src = vec![10, 20, 30];
        let out = resize_rgb(&src, 1, 1, 3, 2);
        assert_eq!(out.len(), 3 * 2 * 3);
        assert!(out.chunks(3).all(|px| px == [10, 20, 30]));
    }
}
