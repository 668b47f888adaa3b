//! Device seam between the pipelines and an audio backend.
//!
//! The pipelines only ever talk to an [`AudioHost`]: it enumerates devices,
//! resolves the configured name into a [`DeviceDescriptor`], and opens input
//! or output streams that drive a callback on the backend's real-time
//! thread.  [`CpalHost`](super::cpal_host::CpalHost) is the production
//! implementation.
//!
//! Callbacks exchange `f32` samples only; backends convert from and to the
//! device's native sample format.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Immutable view of one device as reported by its host API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Position in the host's device list for this direction.
    pub index: usize,
    pub name: String,
    /// Host API identifier (e.g. `ALSA`, `CoreAudio`, `WASAPI`).
    pub host: String,
    pub direction: Direction,
    pub default_sample_rate: u32,
    pub channels: u16,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>3} {:<6} {} ({}, {} Hz, {} ch)",
            self.index, self.direction, self.name, self.host, self.default_sample_rate, self.channels
        )
    }
}

/// Format requested when opening a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Returned by a stream callback to keep the stream running or stop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFlow {
    Continue,
    Stop,
}

/// Problem reported by the driver while a stream is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFault {
    /// The stream is gone (e.g. device unplugged) and will deliver nothing
    /// more.
    pub fatal: bool,
    pub message: String,
}

/// Receives interleaved input samples on the real-time thread.
pub type InputCallback = Box<dyn FnMut(&[f32]) -> CallbackFlow + Send + 'static>;
/// Fills an interleaved output buffer on the real-time thread.  Every sample
/// of the buffer must be written.
pub type OutputCallback = Box<dyn FnMut(&mut [f32]) -> CallbackFlow + Send + 'static>;
/// Receives driver faults, off the data path.
pub type FaultCallback = Box<dyn FnMut(StreamFault) + Send + 'static>;

// ---------------------------------------------------------------------------
// DeviceStream
// ---------------------------------------------------------------------------

/// RAII guard for an open stream.  Dropping it stops the stream and releases
/// the device.
pub struct DeviceStream {
    _guard: Box<dyn Any>,
    stopped: Arc<AtomicBool>,
}

impl DeviceStream {
    /// Wrap a backend stream object.  `stopped` must be set by the backend
    /// once the callback has returned [`CallbackFlow::Stop`].
    pub fn new(guard: Box<dyn Any>, stopped: Arc<AtomicBool>) -> Self {
        Self {
            _guard: guard,
            stopped,
        }
    }

    /// `true` once the callback asked to stop.
    pub fn has_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// DeviceError
// ---------------------------------------------------------------------------

/// Device unavailable or configuration rejected; fatal at pipeline start.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no {direction} device named `{name}`")]
    NotFound { direction: Direction, name: String },

    #[error("no default {0} device on the default audio host")]
    NoDefault(Direction),

    #[error("failed to enumerate audio devices: {0}")]
    Enumerate(String),

    #[error("failed to query the configuration of `{device}`: {reason}")]
    Config { device: String, reason: String },

    #[error("`{device}` uses sample format {format}, which is not supported")]
    UnsupportedFormat { device: String, format: String },

    #[error("`{device}` rejected the stream configuration: {reason}")]
    Rejected { device: String, reason: String },

    #[error("failed to start the stream on `{device}`: {reason}")]
    Start { device: String, reason: String },
}

// ---------------------------------------------------------------------------
// AudioHost
// ---------------------------------------------------------------------------

/// An audio backend the pipelines can open streams on.
pub trait AudioHost {
    /// Every input and output device the backend can see.
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError>;

    /// Find a device by name, or the host default when `name` is `None`.
    fn resolve(
        &self,
        direction: Direction,
        name: Option<&str>,
    ) -> Result<DeviceDescriptor, DeviceError>;

    /// Open and start a capture stream.
    fn open_input(
        &self,
        device: &DeviceDescriptor,
        spec: StreamSpec,
        on_data: InputCallback,
        on_fault: FaultCallback,
    ) -> Result<DeviceStream, DeviceError>;

    /// Open and start a playback stream.
    fn open_output(
        &self,
        device: &DeviceDescriptor,
        spec: StreamSpec,
        on_data: OutputCallback,
        on_fault: FaultCallback,
    ) -> Result<DeviceStream, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_display_lists_host_and_format() {
        let d = DeviceDescriptor {
            index: 2,
            name: "USB Mic".into(),
            host: "ALSA".into(),
            direction: Direction::Input,
            default_sample_rate: 48_000,
            channels: 1,
        };
        let line = d.to_string();
        assert!(line.contains("USB Mic"));
        assert!(line.contains("ALSA"));
        assert!(line.contains("48000 Hz"));
        assert!(line.starts_with("  2 input"));
    }

    #[test]
    fn stream_reports_stop_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let stream = DeviceStream::new(Box::new(()), Arc::clone(&flag));
        assert!(!stream.has_stopped());
        flag.store(true, Ordering::Release);
        assert!(stream.has_stopped());
    }
}
