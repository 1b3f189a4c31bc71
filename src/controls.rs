// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! User controls.
//!
//! The device recognizes the four classic picture controls. Values are only
//! validated and stored; no processing effect is modeled here.

use enumn::N;

use crate::CaptureError;
use crate::CaptureResult;

/// Recognized control identifiers, numbered like the classic user-class ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ControlId {
    Brightness = 0x0098_0900,
    Contrast = 0x0098_0901,
    Saturation = 0x0098_0902,
    Hue = 0x0098_0903,
}

/// Declared range and default of one control.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlRange {
    pub min: i32,
    pub max: i32,
    pub step: u32,
    pub default: i32,
}

impl ControlId {
    pub fn from_raw(id: u32) -> Option<ControlId> {
        ControlId::n(id)
    }

    pub fn range(self) -> ControlRange {
        match self {
            ControlId::Brightness => ControlRange { min: 0, max: 255, step: 1, default: 127 },
            ControlId::Contrast => ControlRange { min: 0, max: 255, step: 1, default: 16 },
            ControlId::Saturation => ControlRange { min: 0, max: 255, step: 1, default: 127 },
            ControlId::Hue => ControlRange { min: -128, max: 127, step: 1, default: 0 },
        }
    }
}

/// Current control values, initialized to the declared defaults.
#[derive(Clone, Debug)]
pub struct Controls {
    brightness: i32,
    contrast: i32,
    saturation: i32,
    hue: i32,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            brightness: ControlId::Brightness.range().default,
            contrast: ControlId::Contrast.range().default,
            saturation: ControlId::Saturation.range().default,
            hue: ControlId::Hue.range().default,
        }
    }
}

impl Controls {
    /// Validates `value` against the control's declared range and stores it.
    pub fn apply(&mut self, id: ControlId, value: i32) -> CaptureResult<()> {
        let range = id.range();
        if value < range.min || value > range.max {
            return Err(CaptureError::UnknownControl);
        }
        match id {
            ControlId::Brightness => self.brightness = value,
            ControlId::Contrast => self.contrast = value,
            ControlId::Saturation => self.saturation = value,
            ControlId::Hue => self.hue = value,
        }
        log::debug!("control {:?} set to {}", id, value);
        Ok(())
    }

    pub fn get(&self, id: ControlId) -> i32 {
        match id {
            ControlId::Brightness => self.brightness,
            ControlId::Contrast => self.contrast,
            ControlId::Saturation => self.saturation,
            ControlId::Hue => self.hue,
        }
    }
}
