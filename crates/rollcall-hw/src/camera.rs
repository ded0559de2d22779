//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use rollcall_core::collab::{CaptureError, ImageCapture, StreamHandle};
use rollcall_core::Image;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Requested resolution; drivers may negotiate something smaller.
const REQUESTED_WIDTH: u32 = 1280;
const REQUESTED_HEIGHT: u32 = 720;
/// Frames to try after warmup before giving up on finding a lit one.
const MAX_CAPTURE_ATTEMPTS: usize = 10;
const DARK_FRAME_PCT: f32 = 0.95;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

impl From<CameraError> for CaptureError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::DeviceNotFound(path) => CaptureError::NoDevice(path),
            CameraError::PermissionDenied(path) => CaptureError::PermissionDenied(path),
            other => CaptureError::CaptureFailed(other.to_string()),
        }
    }
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, Y channel extracted).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(PixelFormat::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(PixelFormat::Y16)
        } else {
            None
        }
    }
}

/// An opened V4L2 device with a negotiated format.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                CameraError::PermissionDenied(device_path.to_string())
            }
            io::ErrorKind::NotFound => CameraError::DeviceNotFound(device_path.to_string()),
            _ if e.to_string().contains("busy") => CameraError::DeviceBusy(device_path.to_string()),
            _ => CameraError::CaptureFailed(format!("{device_path}: {e}")),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, GREY, or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    /// Capture one lit grayscale frame.
    ///
    /// Discards `warmup_frames` first, then skips dark frames for up to
    /// [`MAX_CAPTURE_ATTEMPTS`] more.
    pub fn grab(&self, warmup_frames: usize) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        for _ in 0..warmup_frames {
            stream.next().map_err(|e| {
                CameraError::CaptureFailed(format!("failed to dequeue warmup buffer: {e}"))
            })?;
        }

        let mut dark_skipped = 0usize;
        for _ in 0..MAX_CAPTURE_ATTEMPTS {
            let (buf, meta) = stream.next().map_err(|e| {
                CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
            })?;

            let gray = self.to_grayscale(buf)?;
            if frame::is_dark_frame(&gray, DARK_FRAME_PCT) {
                dark_skipped += 1;
                tracing::debug!(seq = meta.sequence, "skipping dark frame");
                continue;
            }

            tracing::debug!(seq = meta.sequence, dark_skipped, "frame captured");
            return Ok(Frame {
                data: gray,
                width: self.width,
                height: self.height,
                sequence: meta.sequence,
            });
        }

        Err(CameraError::CaptureFailed(format!(
            "no usable frame: {dark_skipped} consecutive dark frames"
        )))
    }

    fn to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let converted = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height),
            PixelFormat::Grey => frame::grey_to_grayscale(buf, self.width, self.height),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height),
        };
        converted.map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }
}

/// [`ImageCapture`] over a single V4L2 device path.
///
/// `start` opens the device, `capture` grabs a frame, `stop` closes it.
/// A stream stopped mid-grab is closed once that grab returns.
pub struct V4lCapture {
    device_path: String,
    warmup_frames: usize,
    next_stream: AtomicU64,
    open: Mutex<HashMap<StreamHandle, Arc<Mutex<Camera>>>>,
}

impl V4lCapture {
    pub fn new(device_path: impl Into<String>, warmup_frames: usize) -> Self {
        Self {
            device_path: device_path.into(),
            warmup_frames,
            next_stream: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<StreamHandle, Arc<Mutex<Camera>>>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ImageCapture for V4lCapture {
    fn start(&self) -> Result<StreamHandle, CaptureError> {
        let camera = Camera::open(&self.device_path)?;
        let stream = StreamHandle(self.next_stream.fetch_add(1, Ordering::Relaxed));
        self.streams().insert(stream, Arc::new(Mutex::new(camera)));
        tracing::debug!(stream = stream.0, device = %self.device_path, "capture stream started");
        Ok(stream)
    }

    fn stop(&self, stream: StreamHandle) {
        if self.streams().remove(&stream).is_some() {
            tracing::debug!(stream = stream.0, "capture stream stopped");
        }
    }

    fn capture(&self, stream: StreamHandle) -> Result<Image, CaptureError> {
        // Clone out of the map so `stop` never waits behind a grab.
        let camera = self
            .streams()
            .get(&stream)
            .cloned()
            .ok_or(CaptureError::UnknownStream(stream))?;
        let frame = camera
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .grab(self.warmup_frames)?;
        Ok(frame.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device_is_no_device() {
        let capture = V4lCapture::new("/dev/rollcall-test-missing", 0);
        assert_eq!(
            capture.start(),
            Err(CaptureError::NoDevice("/dev/rollcall-test-missing".into()))
        );
    }

    #[test]
    fn test_capture_on_unknown_stream() {
        let capture = V4lCapture::new("/dev/rollcall-test-missing", 0);
        assert_eq!(
            capture.capture(StreamHandle(42)).unwrap_err(),
            CaptureError::UnknownStream(StreamHandle(42))
        );
        // Stopping an unknown stream is a no-op.
        capture.stop(StreamHandle(42));
    }

    #[test]
    fn test_camera_error_maps_to_capture_error() {
        assert_eq!(
            CaptureError::from(CameraError::PermissionDenied("/dev/video0".into())),
            CaptureError::PermissionDenied("/dev/video0".into())
        );
        assert!(matches!(
            CaptureError::from(CameraError::StreamingNotSupported),
            CaptureError::CaptureFailed(_)
        ));
    }

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }
}
