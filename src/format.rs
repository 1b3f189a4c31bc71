// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Format negotiation.
//!
//! The capture format is never client-determined: it is a pure function of the
//! selected input and, depending on that input, either the analog broadcast
//! standard or the digital video timings. [`negotiate`] computes it; everything
//! a client requests through `S_FMT` beyond the pixel encoding is advisory.

use crate::Fourcc;
use crate::Resolution;

/// Physical connector the device captures from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VideoInput {
    /// Analog composite input. A broadcast standard selects the geometry.
    Composite,
    /// Digital HDMI input. DV timings select the geometry.
    Hdmi,
}

/// Bitmask of analog broadcast standards, one bit per variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct VideoStandard(pub u64);

impl VideoStandard {
    pub const PAL: VideoStandard = VideoStandard(0x0000_00ff);
    pub const PAL_M: VideoStandard = VideoStandard(0x0000_0100);
    pub const PAL_N: VideoStandard = VideoStandard(0x0000_0200);
    pub const PAL_60: VideoStandard = VideoStandard(0x0000_0800);
    pub const NTSC: VideoStandard = VideoStandard(0x0000_b000);
    pub const SECAM: VideoStandard = VideoStandard(0x00ff_0000);

    /// The 525-line/60Hz family.
    pub const STD_525_60: VideoStandard =
        VideoStandard(Self::PAL_M.0 | Self::PAL_60.0 | Self::NTSC.0);
    /// The 625-line/50Hz family.
    pub const STD_625_50: VideoStandard =
        VideoStandard(Self::PAL.0 | Self::PAL_N.0 | Self::SECAM.0);

    pub const ALL: VideoStandard = VideoStandard(Self::STD_525_60.0 | Self::STD_625_50.0);

    /// Whether any of the standards in `self` belongs to the 60Hz family.
    pub fn is_60hz(self) -> bool {
        self.0 & Self::STD_525_60.0 != 0
    }

    pub fn intersects(self, other: VideoStandard) -> bool {
        self.0 & other.0 != 0
    }
}

impl Default for VideoStandard {
    fn default() -> Self {
        Self::STD_625_50
    }
}

/// Digital video timings for the HDMI input.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DvTimings {
    pub width: u32,
    pub height: u32,
    pub interlaced: bool,
}

/// Resolution range the HDMI receiver can lock onto.
const TIMINGS_MIN: Resolution = Resolution::new(640, 480);
const TIMINGS_MAX: Resolution = Resolution::new(1920, 1080);

impl DvTimings {
    /// Whether the receiver is capable of these timings.
    pub fn supported(&self) -> bool {
        (TIMINGS_MIN.width..=TIMINGS_MAX.width).contains(&self.width)
            && (TIMINGS_MIN.height..=TIMINGS_MAX.height).contains(&self.height)
    }
}

impl Default for DvTimings {
    fn default() -> Self {
        Self { width: 1280, height: 720, interlaced: false }
    }
}

/// How the lines of a queued buffer relate to the scanned fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldOrder {
    /// One buffer holds one full progressive frame.
    Progressive,
    /// One buffer holds both fields, woven.
    Interlaced,
    /// One buffer holds a single field, starting with the top one.
    AlternateTop,
    /// One buffer holds a single field, starting with the bottom one.
    AlternateBottom,
}

impl FieldOrder {
    /// Single-field capture. Incompatible with the byte-stream read path.
    pub fn is_alternate(self) -> bool {
        matches!(self, FieldOrder::AlternateTop | FieldOrder::AlternateBottom)
    }
}

/// Negotiated capture format. Constructed by [`negotiate`] only, so the stride
/// and size invariants always hold.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PixelFormat {
    pub fourcc: Fourcc,
    pub size: Resolution,
    pub field: FieldOrder,
    /// Line stride in bytes. Always `width * 2` for packed YUV 4:2:2.
    pub bytes_per_line: u32,
    /// Total size of one queued buffer payload, `bytes_per_line * height`.
    pub image_size: u32,
}

impl Default for FieldOrder {
    fn default() -> Self {
        FieldOrder::Progressive
    }
}

/// Computes the capture format for the given input selection.
///
/// Composite capture is always standard definition: 720 pixels wide, 480 or
/// 576 lines depending on the standard family, interlaced. HDMI capture takes
/// its geometry from the timings; interlaced timings are captured one field
/// per buffer, so the per-buffer height is half the frame height.
pub fn negotiate(input: VideoInput, standard: VideoStandard, timings: DvTimings) -> PixelFormat {
    let (size, field) = match input {
        VideoInput::Composite => {
            let height = if standard.is_60hz() { 480 } else { 576 };
            (Resolution::new(720, height), FieldOrder::Interlaced)
        }
        VideoInput::Hdmi if timings.interlaced => (
            Resolution::new(timings.width, timings.height / 2),
            FieldOrder::AlternateTop,
        ),
        VideoInput::Hdmi => {
            (Resolution::new(timings.width, timings.height), FieldOrder::Progressive)
        }
    };

    let bytes_per_line = size.width * 2;
    PixelFormat {
        fourcc: Fourcc::YUYV,
        size,
        field,
        bytes_per_line,
        image_size: bytes_per_line * size.height,
    }
}
