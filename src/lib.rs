// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Orchestration of a fixed-function VP9 decoder core.
//!
//! The crate is split along the data path:
//!
//! * [`feed`] turns client packets into decode units and writes them into the per-instance ring,
//! * [`codec::vp9`] holds the pure bitstream helpers (superframe splitting, header scratch
//!   decoding),
//! * [`decoder`] contains the per-stream state machine driven by hardware interrupts,
//! * [`scheduler`] arbitrates the hardware between streams,
//! * [`device`] owns the hardware and binds the scheduler's decisions to decoder instances.
//!
//! The hardware itself is reached through the traits in [`backend`].

pub mod backend;
pub mod codec;
pub mod decoder;
pub mod device;
pub mod feed;
pub mod scheduler;
pub mod utils;

/// Width and height of a picture, in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Returns a resolution clipped so that it fits into `bounds`.
    pub fn clip_to(&self, bounds: Self) -> Self {
        Self {
            width: self.width.min(bounds.width),
            height: self.height.min(bounds.height),
        }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

#[cfg(test)]
mod tests {
    use super::Resolution;

    #[test]
    fn clip_never_grows() {
        let coded = Resolution::from((320, 240));
        let render = Resolution::from((640, 200));

        assert_eq!(render.clip_to(coded), Resolution::from((320, 200)));
        assert!(coded.can_contain(render.clip_to(coded)));
    }
}
