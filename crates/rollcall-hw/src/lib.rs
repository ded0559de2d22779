//! rollcall-hw: camera access for classroom photo capture.
//!
//! Implements the [`ImageCapture`](rollcall_core::ImageCapture) collaborator
//! over V4L2, delivering 8-bit grayscale images.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, PixelFormat, V4lCapture};
pub use frame::Frame;
