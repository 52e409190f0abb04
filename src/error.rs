use image::ImageError;
use std::io;

/// Fatal errors. Everything recoverable (VO failures, weak map matches,
/// diverged optimizer sweeps) is handled in place and only counted.
#[derive(Debug)]
pub enum SlamError {
    /// Missing or invalid configuration. Fatal at startup.
    Config(String),
    /// Unreadable intrinsics or depth scale. Fatal at startup.
    Calibration(String),
    Io(io::Error),
    Image(ImageError),
    Parse(String),
}

impl std::fmt::Display for SlamError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SlamError::Config(msg) => write!(f, "configuration error: {msg}"),
            SlamError::Calibration(msg) => write!(f, "calibration error: {msg}"),
            SlamError::Io(err) => write!(f, "IO error: {err}"),
            SlamError::Image(err) => write!(f, "image error: {err}"),
            SlamError::Parse(msg) => write!(f, "parse error: {msg}"),
        }
    }
}

impl std::error::Error for SlamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SlamError::Io(err) => Some(err),
            SlamError::Image(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for SlamError {
    fn from(err: io::Error) -> Self {
        SlamError::Io(err)
    }
}

impl From<ImageError> for SlamError {
    fn from(err: ImageError) -> Self {
        SlamError::Image(err)
    }
}

impl From<serde_json::Error> for SlamError {
    fn from(err: serde_json::Error) -> Self {
        SlamError::Config(err.to_string())
    }
}

/// A transient frame decode failure. The frame is skipped and the frame
/// counter does not advance.
#[derive(Debug)]
pub struct FrameFault(pub String);

impl std::fmt::Display for FrameFault {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "frame fault: {}", self.0)
    }
}

impl std::error::Error for FrameFault {}
