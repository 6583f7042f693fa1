//! V4L2 webcam backend for [`FrameSource`].
//!
//! The device is asked for MJPG at the room's frame size. Whatever the driver
//! negotiates is accepted as long as it is one of the formats decoded here.

use image::{Rgb, RgbImage};
use shared::encoder::decode_rgb;
use shared::frame_source::{FrameSource, SourceError, SourceResult};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const BUFFER_COUNT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelLayout {
    Mjpeg,
    Yuyv,
    Rgb24,
    Grey,
}

impl PixelLayout {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(Self::Mjpeg),
            b"YUYV" => Some(Self::Yuyv),
            b"RGB3" => Some(Self::Rgb24),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

pub struct V4l2FrameSource {
    /// `None` after a first dequeue timed out; rebuilt on the next grab.
    stream: Option<MmapStream<'static>>,
    device: Device,
    name: String,
    width: u32,
    height: u32,
    stride: u32,
    layout: PixelLayout,
    latched: Option<Vec<u8>>,
    streaming: bool,
}

impl V4l2FrameSource {
    /// Open the device node at `path`, preferring `size` if given.
    pub fn open(path: &Path, size: Option<(u32, u32)>) -> SourceResult<Self> {
        let uri = path.display().to_string();
        let open_err = |reason: String| SourceError::Open {
            uri: uri.clone(),
            reason,
        };

        let device = Device::with_path(path).map_err(|e| open_err(e.to_string()))?;

        let mut format = device
            .format()
            .map_err(|e| open_err(format!("failed to get format: {e}")))?;
        if let Some((width, height)) = size {
            format.width = width;
            format.height = height;
        }
        format.fourcc = FourCC::new(b"MJPG");

        let format = match device.set_format(&format) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                warn!(device = %uri, "Failed to set MJPG format, keeping current: {}", e);
                device
                    .format()
                    .map_err(|e| open_err(format!("failed to get format: {e}")))?
            }
        };

        let layout = PixelLayout::from_fourcc(format.fourcc)
            .ok_or_else(|| SourceError::Format(format.fourcc.to_string()))?;

        info!(
            device = %uri,
            "Format negotiated: {}x{} {} stride {}",
            format.width,
            format.height,
            format.fourcc,
            format.stride
        );

        let stream = new_stream(&device).map_err(|e| open_err(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            device,
            name: uri,
            width: format.width,
            height: format.height,
            stride: format.stride,
            layout,
            latched: None,
            streaming: false,
        })
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.name)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl FrameSource for V4l2FrameSource {
    fn grab(&mut self, timeout: Duration) -> SourceResult<bool> {
        // The first dequeue also queues the buffers and starts streaming, so
        // there is nothing to poll for until it has happened. The stream
        // timeout bounds that first dequeue.
        if self.streaming {
            let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
            let ready = self
                .device
                .handle()
                .poll(libc::POLLIN, timeout_ms)
                .map_err(|e| SourceError::Read(format!("poll failed: {e}")))?;
            if ready == 0 {
                return Ok(false);
            }
        }

        if self.stream.is_none() {
            let stream = new_stream(&self.device).map_err(|e| SourceError::Read(e.to_string()))?;
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };
        stream.set_timeout(timeout.max(Duration::from_millis(1)));

        let dequeued = stream.next().map(|(buf, meta)| {
            let used = (meta.bytesused as usize).min(buf.len());
            buf[..used].to_vec()
        });
        match dequeued {
            Ok(raw) => self.latched = Some(raw),
            Err(e) if is_timeout(&e) => {
                // The buffer queued before the failed dequeue stays queued and
                // would be queued twice by the next call. Start over instead.
                warn!(device = %self.name, "Dequeue timed out, restarting stream");
                self.stream = None;
                self.streaming = false;
                return Ok(false);
            }
            Err(e) => return Err(SourceError::Read(format!("failed to dequeue buffer: {e}"))),
        }
        self.streaming = true;
        Ok(true)
    }

    fn retrieve(&mut self) -> SourceResult<RgbImage> {
        let raw = self.latched.take().ok_or(SourceError::NothingGrabbed)?;
        let (w, h, stride) = (self.width, self.height, self.stride);
        let image = match self.layout {
            PixelLayout::Mjpeg => {
                return decode_rgb(&raw).map_err(|e| SourceError::Corrupt(e.to_string()));
            }
            PixelLayout::Yuyv => yuyv_to_rgb(&raw, w, h, stride),
            PixelLayout::Rgb24 => rgb24_to_rgb(&raw, w, h, stride),
            PixelLayout::Grey => grey_to_rgb(&raw, w, h, stride),
        };
        image.ok_or_else(|| {
            SourceError::Corrupt(format!(
                "{:?} buffer of {} bytes too small for {}x{} (stride {})",
                self.layout,
                raw.len(),
                w,
                h,
                stride
            ))
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn new_stream(device: &Device) -> io::Result<MmapStream<'static>> {
    MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
        .map_err(|e| io::Error::new(e.kind(), format!("failed to create stream: {e}")))
}

/// A dequeue that found no frame within the stream timeout.
fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Row stride in bytes, falling back to the packed stride when the driver
/// reports none.
fn effective_stride(stride: u32, width: u32, bytes_per_pixel: u32) -> usize {
    stride.max(width * bytes_per_pixel) as usize
}

fn row<'a>(data: &'a [u8], y: u32, stride: usize, len: usize) -> Option<&'a [u8]> {
    let start = y as usize * stride;
    data.get(start..start + len)
}

/// Packed YUV 4:2:2 (Y0 U Y1 V) to RGB with BT.601 coefficients.
///
/// An odd width ends each row with a half macropixel (Y U) that borrows V
/// from its left neighbour.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32, stride: u32) -> Option<RgbImage> {
    let stride = effective_stride(stride, width, 2);
    let mut image = RgbImage::new(width, height);
    for y in 0..height {
        let line = row(data, y, stride, width as usize * 2)?;
        let pairs = line.chunks_exact(4);
        let tail = pairs.remainder();
        let mut v = 128;
        for (pair, chunk) in pairs.enumerate() {
            let u = chunk[1];
            v = chunk[3];
            let x = pair as u32 * 2;
            image.put_pixel(x, y, ycbcr_to_rgb(chunk[0], u, v));
            image.put_pixel(x + 1, y, ycbcr_to_rgb(chunk[2], u, v));
        }
        if let [luma, u] = *tail {
            image.put_pixel(width - 1, y, ycbcr_to_rgb(luma, u, v));
        }
    }
    Some(image)
}

fn rgb24_to_rgb(data: &[u8], width: u32, height: u32, stride: u32) -> Option<RgbImage> {
    let stride = effective_stride(stride, width, 3);
    let packed = width as usize * 3;
    let mut pixels = Vec::with_capacity(packed * height as usize);
    for y in 0..height {
        pixels.extend_from_slice(row(data, y, stride, packed)?);
    }
    RgbImage::from_raw(width, height, pixels)
}

fn grey_to_rgb(data: &[u8], width: u32, height: u32, stride: u32) -> Option<RgbImage> {
    let stride = effective_stride(stride, width, 1);
    let mut image = RgbImage::new(width, height);
    for y in 0..height {
        for (x, &l) in row(data, y, stride, width as usize)?.iter().enumerate() {
            image.put_pixel(x as u32, y, Rgb([l, l, l]));
        }
    }
    Some(image)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> Rgb<u8> {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    Rgb([
        clamp(1.164 * c + 1.596 * e),
        clamp(1.164 * c - 0.392 * d - 0.813 * e),
        clamp(1.164 * c + 2.017 * d),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_grey_levels() {
        // Black and white pixel pairs with neutral chroma
        let data = [16, 128, 16, 128, 235, 128, 235, 128];
        let image = yuyv_to_rgb(&data, 4, 1, 0).unwrap();
        assert_eq!(image.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(1, 0), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(2, 0), &Rgb([255, 255, 255]));
        assert_eq!(image.get_pixel(3, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_yuyv_respects_stride_padding() {
        // 2x2 image, 4 payload bytes per row plus 4 padding bytes
        let data = [
            235, 128, 235, 128, 0, 0, 0, 0, //
            16, 128, 16, 128, 0, 0, 0, 0,
        ];
        let image = yuyv_to_rgb(&data, 2, 2, 8).unwrap();
        assert_eq!(image.get_pixel(1, 0), &Rgb([255, 255, 255]));
        assert_eq!(image.get_pixel(0, 1), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_yuyv_odd_width_fills_last_column() {
        // 3 pixels: one full macropixel and a trailing Y U half
        let data = [16, 128, 16, 128, 235, 128];
        let image = yuyv_to_rgb(&data, 3, 1, 0).unwrap();
        assert_eq!(image.get_pixel(1, 0), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(2, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_dequeue_timeout_is_not_a_read_fault() {
        assert!(is_timeout(&io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF")));
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_timeout(&io::Error::from_raw_os_error(libc::EIO)));
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        assert!(yuyv_to_rgb(&[16, 128, 16], 2, 1, 0).is_none());
        assert!(rgb24_to_rgb(&[1, 2, 3], 2, 1, 0).is_none());
        assert!(grey_to_rgb(&[], 1, 1, 0).is_none());
    }

    #[test]
    fn test_rgb24_and_grey() {
        let rgb = rgb24_to_rgb(&[1, 2, 3, 4, 5, 6], 2, 1, 6).unwrap();
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([4, 5, 6]));

        let grey = grey_to_rgb(&[7, 9, 0, 11, 13, 0], 2, 2, 3).unwrap();
        assert_eq!(grey.get_pixel(1, 1), &Rgb([13, 13, 13]));
    }

    #[test]
    fn test_layouts_from_fourcc() {
        assert_eq!(PixelLayout::from_fourcc(FourCC::new(b"MJPG")), Some(PixelLayout::Mjpeg));
        assert_eq!(PixelLayout::from_fourcc(FourCC::new(b"YUYV")), Some(PixelLayout::Yuyv));
        assert_eq!(PixelLayout::from_fourcc(FourCC::new(b"Y16 ")), None);
    }
}
