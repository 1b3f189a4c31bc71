// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware-independent core of a video capture device.
//!
//! This crate implements the part of a capture driver that has actual
//! invariants: format/input/timings negotiation, the capture buffer queue, and
//! the streaming state machine. It is meant to be embedded into a
//! driver-registration shell that owns the [`device::CaptureDevice`] instance
//! and forwards ioctl-style and buffer-framework calls into it. No capture
//! engine is modeled; the [`stream::CompletionHandle`] stands in for its
//! completion interrupt.

pub mod controls;
pub mod device;
pub mod format;
pub mod queue;
pub mod stream;

use nix::errno::Errno;
use thiserror::Error;

/// A frame resolution in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

/// Four character code describing a pixel encoding.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Fourcc(pub u32);

impl Fourcc {
    /// Packed YUV 4:2:2, the only encoding this device produces.
    pub const YUYV: Fourcc = Fourcc::from_bytes(b"YUYV");

    pub const fn from_bytes(bytes: &[u8; 4]) -> Fourcc {
        Fourcc(u32::from_le_bytes(*bytes))
    }
}

impl Default for Fourcc {
    fn default() -> Self {
        Fourcc::YUYV
    }
}

impl std::fmt::Display for Fourcc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_le_bytes();
        f.write_str(&String::from_utf8_lossy(&bytes))
    }
}

impl std::fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fourcc({})", self)
    }
}

/// Errors surfaced by the capture core.
///
/// Every kind maps onto the POSIX error domain the ioctl shell speaks, see
/// [`CaptureError::errno`].
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("operation is invalid in the current state")]
    InvalidState,
    #[error("buffer of {got} bytes cannot hold a {required} byte frame")]
    BufferTooSmall { required: u32, got: u32 },
    #[error("buffers are admitted, reconfiguration refused")]
    Busy,
    #[error("{queued} buffers queued, at least {needed} needed to start")]
    InsufficientBuffers { needed: u32, queued: u32 },
    #[error("no buffer queued to receive the completed frame")]
    NoBufferAvailable,
    #[error("streaming has already been started")]
    AlreadyStreaming,
    #[error("operation does not apply to the selected input")]
    NotApplicable,
    #[error("timings are outside the supported range")]
    InvalidTimings,
    #[error("pixel encoding is not supported")]
    UnsupportedEncoding,
    #[error("unknown control or value out of range")]
    UnknownControl,
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(#[from] anyhow::Error),
}

pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

impl CaptureError {
    /// Errno the ioctl-style shell reports for this error.
    pub fn errno(&self) -> Errno {
        match self {
            CaptureError::InvalidState
            | CaptureError::BufferTooSmall { .. }
            | CaptureError::InvalidTimings
            | CaptureError::UnsupportedEncoding
            | CaptureError::UnknownControl => Errno::EINVAL,
            CaptureError::Busy | CaptureError::AlreadyStreaming => Errno::EBUSY,
            CaptureError::InsufficientBuffers { .. } => Errno::ENOBUFS,
            CaptureError::NoBufferAvailable => Errno::EAGAIN,
            CaptureError::NotApplicable => Errno::ENODATA,
            CaptureError::AllocationFailed(_) => Errno::ENOMEM,
        }
    }
}
