// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod header;
pub mod superframe;

use bytes::Buf;

use crate::Resolution;

/// Size of the IVF file header preceding the first packet.
const IVF_FILE_HEADER_SIZE: usize = 32;

/// The number of slots in the reference frame map.
pub const NUM_REF_FRAMES: usize = 8;

/// The number of references an inter frame can predict from.
pub const REFS_PER_FRAME: usize = 3;

/// Fixed-point shift used to express reference scaling factors.
pub const REF_SCALE_SHIFT: u32 = 14;

/// The decode resolution declared by [`END_OF_STREAM_IVF`].
pub const END_OF_STREAM_RESOLUTION: Resolution = Resolution {
    width: 42,
    height: 52,
};

/// A single-frame IVF file carrying a VP9 keyframe at an implausible resolution.
///
/// It is appended to the stream after the client's last packet so that the hardware parses one
/// more header. Seeing a 42x52 keyframe at the offset where end-of-stream was queued is what
/// signals that all previous frames have drained. It never reaches the client as a frame.
pub static END_OF_STREAM_IVF: [u8; 74] = [
    0x44, 0x4b, 0x49, 0x46, 0x00, 0x00, 0x20, 0x00, 0x56, 0x50, 0x39, 0x30, 0x2a, 0x00, 0x34, 0x00,
    0x1e, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x1e, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x82, 0x49, 0x83, 0x42,
    0x00, 0x02, 0x90, 0x03, 0x36, 0x14, 0x07, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Returns the raw VP9 frame carried by [`END_OF_STREAM_IVF`].
pub fn end_of_stream_frame() -> &'static [u8] {
    let mut packet: &'static [u8] = &END_OF_STREAM_IVF[IVF_FILE_HEADER_SIZE..];
    let len = packet.get_u32_le() as usize;
    // Timestamp.
    packet.advance(8);

    &packet[..len]
}
