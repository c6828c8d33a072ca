// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding of the uncompressed header the firmware leaves in its scratch area after parsing a
//! frame header.
//!
//! The scratch area is an array of [`HEADER_WORDS`] 16-bit words, written in groups of 4 with the
//! order of the words reversed inside each group ("middle-endian"). [`unscramble_words`] restores
//! the natural order, after which [`RenderParams::from_words`] reads the fields.

use anyhow::ensure;
use bitreader::BitReader;
use enumn::N;
use thiserror::Error;

use crate::codec::vp9::NUM_REF_FRAMES;
use crate::codec::vp9::REFS_PER_FRAME;
use crate::Resolution;

/// Number of 16-bit words in the header scratch area.
pub const HEADER_WORDS: usize = 0x80;

pub const MAX_SEGMENTS: usize = 8;
pub const MAX_REF_LF_DELTAS: usize = 4;
pub const MAX_MODE_LF_DELTAS: usize = 2;

const FRAME_MARKER: u32 = 0x02;
const SYNC_CODE: u32 = 0x498342;
const CS_SRGB: u32 = 7;

/// Word offsets of the fields in the (unscrambled) scratch area.
mod offsets {
    pub const PROFILE: usize = 0;
    pub const SHOW_EXISTING_FRAME: usize = 1;
    pub const FRAME_TO_SHOW: usize = 2;
    pub const FRAME_TYPE: usize = 3;
    pub const SHOW_FRAME: usize = 4;
    pub const ERROR_RESILIENT_MODE: usize = 5;
    pub const INTRA_ONLY: usize = 6;
    pub const RENDER_SIZE_PRESENT: usize = 7;
    pub const RESET_FRAME_CONTEXT: usize = 8;
    pub const REFRESH_FRAME_FLAGS: usize = 9;
    pub const WIDTH: usize = 10;
    pub const HEIGHT: usize = 11;
    pub const RENDER_WIDTH: usize = 12;
    pub const RENDER_HEIGHT: usize = 13;
    pub const REF_INFO: usize = 14;
    pub const SAME_FRAME_SIZE: usize = 15;
    pub const MODE_REF_DELTA_ENABLED: usize = 16;
    pub const REF_DELTAS: usize = 17;
    pub const MODE_DELTAS: usize = 21;
    pub const FILTER_LEVEL: usize = 23;
    pub const SHARPNESS_LEVEL: usize = 24;
    pub const BIT_DEPTH: usize = 25;
    pub const SEGMENTATION_QUANT_INFO: usize = 26;
    pub const SEGMENTATION_ENABLED: usize = 34;
    pub const SEGMENTATION_ABS_DELTA: usize = 35;
    pub const SEGMENTATION_LOOP_FILTER_INFO: usize = 36;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum FrameType {
    #[default]
    KeyFrame = 0,
    InterFrame = 1,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum BitDepth {
    #[default]
    Depth8 = 8,
    Depth10 = 10,
    Depth12 = 12,
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("invalid profile {0}")]
    InvalidProfile(u16),
    #[error("invalid frame type {0}")]
    InvalidFrameType(u16),
    #[error("invalid bit depth {0}")]
    InvalidBitDepth(u16),
    #[error("frame to show index {0} is out of range")]
    InvalidFrameToShow(u16),
}

/// Loop filter parameters reported by the firmware.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopFilterParams {
    pub level: u8,
    pub sharpness: u8,
    pub mode_ref_delta_enabled: bool,
    pub ref_deltas: [i8; MAX_REF_LF_DELTAS],
    pub mode_deltas: [i8; MAX_MODE_LF_DELTAS],
}

/// Segmentation parameters reported by the firmware.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentationParams {
    pub enabled: bool,
    pub abs_delta: bool,
    pub quant_info: [u16; MAX_SEGMENTS],
    pub loop_filter_info: [u16; MAX_SEGMENTS],
}

/// The frame parameters parsed by the firmware from the uncompressed header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderParams {
    pub profile: u8,
    pub show_existing_frame: bool,
    /// Reference map slot holding the frame to show, if `show_existing_frame` is set.
    pub frame_to_show: u8,
    pub frame_type: FrameType,
    pub show_frame: bool,
    pub error_resilient_mode: bool,
    pub intra_only: bool,
    pub render_size_present: bool,
    pub reset_frame_context: u8,
    /// Bitmask of the reference map slots this frame replaces once decoded.
    pub refresh_frame_flags: u8,
    pub width: u32,
    pub height: u32,
    pub render_width: u32,
    pub render_height: u32,
    /// Reference map slot used by each of LAST, GOLDEN and ALTREF.
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    pub ref_frame_sign_bias: [bool; REFS_PER_FRAME],
    pub same_frame_size: bool,
    pub loop_filter: LoopFilterParams,
    pub bit_depth: BitDepth,
    pub segmentation: SegmentationParams,
}

/// Restores the natural order of `words` as written by the firmware, reversing each group of 4.
pub fn unscramble_words(words: &mut [u16; HEADER_WORDS]) {
    for group in words.chunks_exact_mut(4) {
        group.reverse();
    }
}

fn signed(word: u16) -> i8 {
    word as i16 as i8
}

impl RenderParams {
    /// Reads the parameters out of the unscrambled scratch `words`.
    pub fn from_words(words: &[u16; HEADER_WORDS]) -> Result<Self, HeaderError> {
        use offsets::*;

        let profile = words[PROFILE];
        if profile > 3 {
            return Err(HeaderError::InvalidProfile(profile));
        }

        let frame_type = FrameType::n(words[FRAME_TYPE])
            .ok_or(HeaderError::InvalidFrameType(words[FRAME_TYPE]))?;
        let bit_depth = BitDepth::n(words[BIT_DEPTH])
            .ok_or(HeaderError::InvalidBitDepth(words[BIT_DEPTH]))?;

        let show_existing_frame = words[SHOW_EXISTING_FRAME] != 0;
        let frame_to_show = words[FRAME_TO_SHOW];
        if show_existing_frame && frame_to_show as usize >= NUM_REF_FRAMES {
            return Err(HeaderError::InvalidFrameToShow(frame_to_show));
        }

        // Each reference takes 4 bits, LAST in the most significant nibble: bit 0 is the sign
        // bias and bits 1..=3 the reference map slot.
        let ref_info = words[REF_INFO];
        let mut ref_frame_idx = [0u8; REFS_PER_FRAME];
        let mut ref_frame_sign_bias = [false; REFS_PER_FRAME];
        for i in 0..REFS_PER_FRAME {
            let nibble = ref_info >> ((REFS_PER_FRAME - 1 - i) * 4);
            ref_frame_sign_bias[i] = nibble & 0x1 != 0;
            ref_frame_idx[i] = ((nibble >> 1) & 0x7) as u8;
        }

        let mut loop_filter = LoopFilterParams {
            level: words[FILTER_LEVEL] as u8,
            sharpness: words[SHARPNESS_LEVEL] as u8,
            mode_ref_delta_enabled: words[MODE_REF_DELTA_ENABLED] != 0,
            ..Default::default()
        };
        for (i, delta) in loop_filter.ref_deltas.iter_mut().enumerate() {
            *delta = signed(words[REF_DELTAS + i]);
        }
        for (i, delta) in loop_filter.mode_deltas.iter_mut().enumerate() {
            *delta = signed(words[MODE_DELTAS + i]);
        }

        let mut segmentation = SegmentationParams {
            enabled: words[SEGMENTATION_ENABLED] != 0,
            abs_delta: words[SEGMENTATION_ABS_DELTA] != 0,
            ..Default::default()
        };
        segmentation
            .quant_info
            .copy_from_slice(
                &words[SEGMENTATION_QUANT_INFO..SEGMENTATION_QUANT_INFO + MAX_SEGMENTS],
            );
        segmentation.loop_filter_info.copy_from_slice(
            &words[SEGMENTATION_LOOP_FILTER_INFO..SEGMENTATION_LOOP_FILTER_INFO + MAX_SEGMENTS],
        );

        Ok(Self {
            profile: profile as u8,
            show_existing_frame,
            frame_to_show: frame_to_show as u8,
            frame_type,
            show_frame: words[SHOW_FRAME] != 0,
            error_resilient_mode: words[ERROR_RESILIENT_MODE] != 0,
            intra_only: words[INTRA_ONLY] != 0,
            render_size_present: words[RENDER_SIZE_PRESENT] != 0,
            reset_frame_context: words[RESET_FRAME_CONTEXT] as u8,
            refresh_frame_flags: words[REFRESH_FRAME_FLAGS] as u8,
            width: words[WIDTH] as u32,
            height: words[HEIGHT] as u32,
            render_width: words[RENDER_WIDTH] as u32,
            render_height: words[RENDER_HEIGHT] as u32,
            ref_frame_idx,
            ref_frame_sign_bias,
            same_frame_size: words[SAME_FRAME_SIZE] != 0,
            loop_filter,
            bit_depth,
            segmentation,
        })
    }

    /// Unscrambles the raw scratch `words` and reads the parameters out of them.
    pub fn from_scratch(mut words: [u16; HEADER_WORDS]) -> Result<Self, HeaderError> {
        unscramble_words(&mut words);
        Self::from_words(&words)
    }

    /// Writes the parameters back in the natural word order. Used to build scratch contents.
    pub fn to_words(&self) -> [u16; HEADER_WORDS] {
        use offsets::*;

        let mut words = [0u16; HEADER_WORDS];
        words[PROFILE] = self.profile as u16;
        words[SHOW_EXISTING_FRAME] = self.show_existing_frame as u16;
        words[FRAME_TO_SHOW] = self.frame_to_show as u16;
        words[FRAME_TYPE] = self.frame_type as u16;
        words[SHOW_FRAME] = self.show_frame as u16;
        words[ERROR_RESILIENT_MODE] = self.error_resilient_mode as u16;
        words[INTRA_ONLY] = self.intra_only as u16;
        words[RENDER_SIZE_PRESENT] = self.render_size_present as u16;
        words[RESET_FRAME_CONTEXT] = self.reset_frame_context as u16;
        words[REFRESH_FRAME_FLAGS] = self.refresh_frame_flags as u16;
        words[WIDTH] = self.width as u16;
        words[HEIGHT] = self.height as u16;
        words[RENDER_WIDTH] = self.render_width as u16;
        words[RENDER_HEIGHT] = self.render_height as u16;

        let mut ref_info = 0u16;
        for i in 0..REFS_PER_FRAME {
            let nibble =
                ((self.ref_frame_idx[i] as u16 & 0x7) << 1) | self.ref_frame_sign_bias[i] as u16;
            ref_info |= nibble << ((REFS_PER_FRAME - 1 - i) * 4);
        }
        words[REF_INFO] = ref_info;

        words[SAME_FRAME_SIZE] = self.same_frame_size as u16;
        words[MODE_REF_DELTA_ENABLED] = self.loop_filter.mode_ref_delta_enabled as u16;
        for (i, delta) in self.loop_filter.ref_deltas.iter().enumerate() {
            words[REF_DELTAS + i] = *delta as i16 as u16;
        }
        for (i, delta) in self.loop_filter.mode_deltas.iter().enumerate() {
            words[MODE_DELTAS + i] = *delta as i16 as u16;
        }
        words[FILTER_LEVEL] = self.loop_filter.level as u16;
        words[SHARPNESS_LEVEL] = self.loop_filter.sharpness as u16;
        words[BIT_DEPTH] = self.bit_depth as u16;
        words[SEGMENTATION_QUANT_INFO..SEGMENTATION_QUANT_INFO + MAX_SEGMENTS]
            .copy_from_slice(&self.segmentation.quant_info);
        words[SEGMENTATION_ENABLED] = self.segmentation.enabled as u16;
        words[SEGMENTATION_ABS_DELTA] = self.segmentation.abs_delta as u16;
        words[SEGMENTATION_LOOP_FILTER_INFO..SEGMENTATION_LOOP_FILTER_INFO + MAX_SEGMENTS]
            .copy_from_slice(&self.segmentation.loop_filter_info);

        words
    }

    pub fn is_keyframe(&self) -> bool {
        self.frame_type == FrameType::KeyFrame
    }

    /// Whether the frame can only be predicted from itself.
    pub fn is_intra(&self) -> bool {
        self.is_keyframe() || self.intra_only
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.width, self.height))
    }

    /// The size the frame should be displayed at, as declared by the stream.
    pub fn render_resolution(&self) -> Resolution {
        if self.render_size_present {
            Resolution::from((self.render_width, self.render_height))
        } else {
            self.resolution()
        }
    }
}

/// Returns the frame size declared by `data` if it starts with a keyframe, `None` otherwise.
///
/// Only the first frame of a superframe is looked at.
pub fn peek_keyframe_size(data: &[u8]) -> Option<Resolution> {
    parse_keyframe_size(data).ok().flatten()
}

fn parse_keyframe_size(data: &[u8]) -> anyhow::Result<Option<Resolution>> {
    let mut r = BitReader::new(data);

    ensure!(r.read_u32(2)? == FRAME_MARKER, "not a VP9 frame");

    // Profile, low bit first. Profile 3 carries one more zero bit.
    let profile = r.read_u8(1)? | (r.read_u8(1)? << 1);
    r.skip(u64::from(profile == 3))?;

    // show_existing_frame, then a frame type of 0 for keyframes.
    if r.read_bool()? || r.read_bool()? {
        return Ok(None);
    }

    // show_frame and error_resilient_mode.
    r.skip(2)?;
    let sync_code = r.read_u32(24)?;
    ensure!(sync_code == SYNC_CODE, "bad sync code {:#x}", sync_code);

    // Color config: bit depth from profile 2 on, then the color space and, depending on it and on
    // the profile, range and subsampling bits.
    r.skip(u64::from(profile >= 2))?;
    let srgb = r.read_u32(3)? == CS_SRGB;
    let odd_profile = profile & 1 == 1;
    let color_bits = match (srgb, odd_profile) {
        (false, false) => 1,
        (false, true) => 4,
        (true, false) => 0,
        (true, true) => 1,
    };
    r.skip(color_bits)?;

    let width = r.read_u32(16)? + 1;
    let height = r.read_u32(16)? + 1;

    Ok(Some(Resolution::from((width, height))))
}
