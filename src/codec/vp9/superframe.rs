// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Splitting of VP9 superframes into the transport framing consumed by the decoder firmware.
//!
//! A superframe packs several coded frames back to back and appends an index (Annex B of the
//! VP9 specification). The firmware wants to see each frame on its own, prefixed by a 16-byte
//! header:
//!
//! ```text
//! +----------------+-----------------+-------------+---------+
//! | BE32(size + 4) | ~BE32(size + 4) | 00 00 00 01 | "AMLV"  |
//! +----------------+-----------------+-------------+---------+
//! ```

use bitreader::BitReader;
use bitreader::BitReaderError;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;
use log::warn;
use thiserror::Error;

/// The value of the 3 most significant bits of the superframe marker byte.
pub const SUPERFRAME_MARKER: u8 = 0b110;

/// Maximum number of frames a superframe index can describe.
pub const MAX_FRAMES_IN_SUPERFRAME: usize = 8;

/// Size of the transport header prepended to each sub-frame.
pub const SUBFRAME_HEADER_SIZE: usize = 16;

/// Start code and tag closing every transport header.
const SUBFRAME_TAG: [u8; 8] = [0x00, 0x00, 0x00, 0x01, b'A', b'M', b'L', b'V'];

#[derive(Debug, Error, PartialEq)]
pub enum SplitError {
    #[error("cannot split an empty frame")]
    EmptyFrame,
    #[error("superframe index describes {total} bytes but the frame only has {frame_size}")]
    SizesExceedFrame { total: usize, frame_size: usize },
    #[error("unsupported superframe frame size width of {0} bytes")]
    UnsupportedSizeWidth(usize),
    #[error("sub-frame of {0} bytes does not fit the transport header")]
    SubframeTooLarge(usize),
    #[error("failed to read superframe marker: {0}")]
    Marker(#[from] BitReaderError),
}

/// Layout of a superframe index, as described by its marker byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SuperframeIndex {
    bytes_per_framesize: usize,
    frames_in_superframe: usize,
}

impl SuperframeIndex {
    /// Parses the marker byte. Returns `None` if the byte is not a superframe marker.
    fn from_marker(marker: u8) -> Result<Option<Self>, SplitError> {
        let data = [marker];
        let mut reader = BitReader::new(&data);

        if reader.read_u8(3)? != SUPERFRAME_MARKER {
            return Ok(None);
        }

        let bytes_per_framesize = reader.read_u8(2)? as usize + 1;
        let frames_in_superframe = reader.read_u8(3)? as usize + 1;

        Ok(Some(Self {
            bytes_per_framesize,
            frames_in_superframe,
        }))
    }

    /// Total size of the index, including the marker bytes at both of its ends.
    fn size(&self) -> usize {
        2 + self.bytes_per_framesize * self.frames_in_superframe
    }
}

/// Returns the size of each frame packed in `data`.
///
/// Data that does not end with a well-formed superframe index is a single frame.
pub fn superframe_frame_sizes(data: &[u8]) -> Result<Vec<usize>, SplitError> {
    let frame_size = data.len();
    let marker = *data.last().ok_or(SplitError::EmptyFrame)?;

    let index = match SuperframeIndex::from_marker(marker)? {
        Some(index) => index,
        None => return Ok(vec![frame_size]),
    };

    let index_size = index.size();
    if index_size > frame_size || data[frame_size - index_size] != marker {
        // Both markers must match for this to be an index, otherwise this is frame data that
        // happens to end like one.
        return Ok(vec![frame_size]);
    }

    let mut sizes = Vec::with_capacity(index.frames_in_superframe);
    let mut entries = &data[frame_size - index_size + 1..frame_size - 1];
    let mut total = 0usize;

    for _ in 0..index.frames_in_superframe {
        let size = match index.bytes_per_framesize {
            width @ 1..=4 => LittleEndian::read_uint(entries, width) as usize,
            width => return Err(SplitError::UnsupportedSizeWidth(width)),
        };
        entries = &entries[index.bytes_per_framesize..];

        total += size;
        if total > frame_size {
            warn!(
                "superframe sizes add up to {} bytes, more than the {} available",
                total, frame_size
            );
            return Err(SplitError::SizesExceedFrame { total, frame_size });
        }

        sizes.push(size);
    }

    debug!("superframe with {} frames: {:?}", sizes.len(), sizes);

    Ok(sizes)
}

/// Writes the 16-byte transport header for a sub-frame of `size` bytes.
fn write_subframe_header(output: &mut Vec<u8>, size: usize) -> Result<(), SplitError> {
    let size_field = u32::try_from(size + 4).map_err(|_| SplitError::SubframeTooLarge(size))?;

    let mut header = [0u8; SUBFRAME_HEADER_SIZE];
    BigEndian::write_u32(&mut header[0..4], size_field);
    BigEndian::write_u32(&mut header[4..8], !size_field);
    header[8..].copy_from_slice(&SUBFRAME_TAG);

    output.extend_from_slice(&header);

    Ok(())
}

/// Splits `data` into its sub-frames and appends each of them to `output`, prefixed by its
/// transport header.
///
/// If `subframe_sizes` is provided, the number of bytes appended for each sub-frame (header
/// included) is pushed to it. Returns the number of sub-frames.
///
/// On error nothing is appended to either vector, and the caller must treat the input as a
/// malformed bitstream.
pub fn split_superframe(
    data: &[u8],
    output: &mut Vec<u8>,
    subframe_sizes: Option<&mut Vec<u32>>,
) -> Result<usize, SplitError> {
    let frame_sizes = superframe_frame_sizes(data)?;

    let payload: usize = frame_sizes.iter().sum();
    output.reserve(payload + frame_sizes.len() * SUBFRAME_HEADER_SIZE);

    let start = output.len();
    let mut reported = Vec::with_capacity(frame_sizes.len());
    let mut offset = 0;
    for &size in &frame_sizes {
        if let Err(e) = write_subframe_header(output, size) {
            output.truncate(start);
            return Err(e);
        }
        output.extend_from_slice(&data[offset..offset + size]);
        offset += size;

        reported.push((size + SUBFRAME_HEADER_SIZE) as u32);
    }

    if let Some(subframe_sizes) = subframe_sizes {
        subframe_sizes.extend(reported);
    }

    Ok(frame_sizes.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a superframe out of `frames`, using `width` bytes per size entry.
    fn build_superframe(frames: &[Vec<u8>], width: usize) -> Vec<u8> {
        let mut data: Vec<u8> = frames.iter().flatten().copied().collect();
        let marker = 0xc0 | (((width - 1) as u8) << 3) | (frames.len() - 1) as u8;

        data.push(marker);
        for frame in frames {
            let mut entry = [0u8; 8];
            LittleEndian::write_uint(&mut entry, frame.len() as u64, width);
            data.extend_from_slice(&entry[..width]);
        }
        data.push(marker);

        data
    }

    fn check_headers(output: &[u8], sizes: &[u32]) {
        let mut offset = 0;
        for &size in sizes {
            let header = &output[offset..offset + SUBFRAME_HEADER_SIZE];
            let len = BigEndian::read_u32(&header[0..4]);
            let inverted = BigEndian::read_u32(&header[4..8]);

            assert_eq!(inverted, !len);
            assert_eq!(len as usize, size as usize - SUBFRAME_HEADER_SIZE + 4);
            assert_eq!(&header[8..], &[0, 0, 0, 1, b'A', b'M', b'L', b'V']);

            offset += size as usize;
        }
        assert_eq!(offset, output.len());
    }

    #[test]
    fn single_frame_is_one_subframe() {
        let frame = vec![0x82u8, 0x49, 0x83, 0x42, 0x00, 0x11, 0x22];
        let mut output = vec![];
        let mut sizes = vec![];

        let count = split_superframe(&frame, &mut output, Some(&mut sizes)).unwrap();

        assert_eq!(count, 1);
        assert_eq!(sizes, vec![frame.len() as u32 + 16]);
        assert_eq!(&output[16..], &frame[..]);
        check_headers(&output, &sizes);
    }

    #[test]
    fn superframe_is_split() {
        let frames = vec![vec![0xaa; 300], vec![0xbb; 17], vec![0xcc; 2]];

        for width in 1..=4 {
            if width == 1 && frames.iter().any(|f| f.len() > 0xff) {
                continue;
            }

            let data = build_superframe(&frames, width);
            let mut output = vec![];
            let mut sizes = vec![];

            let count = split_superframe(&data, &mut output, Some(&mut sizes)).unwrap();
            assert_eq!(count, 3);

            let payload: u32 = sizes.iter().map(|s| s - SUBFRAME_HEADER_SIZE as u32).sum();
            let index_size = 2 + width * frames.len();
            assert_eq!(payload as usize, data.len() - index_size);
            check_headers(&output, &sizes);

            let mut offset = 0;
            for (frame, size) in frames.iter().zip(&sizes) {
                let start = offset + SUBFRAME_HEADER_SIZE;
                assert_eq!(&output[start..start + frame.len()], &frame[..]);
                offset += *size as usize;
            }
        }
    }

    #[test]
    fn output_is_appended() {
        let mut output = vec![1, 2, 3];
        split_superframe(&[0x10, 0x20], &mut output, None).unwrap();

        assert_eq!(&output[..3], &[1, 2, 3]);
        assert_eq!(output.len(), 3 + 16 + 2);
    }

    #[test]
    fn mismatched_index_marker_is_not_a_superframe() {
        let mut data = build_superframe(&[vec![1; 4], vec![2; 4]], 1);
        // Corrupt the leading marker.
        let index_start = data.len() - 4;
        data[index_start] ^= 0x01;

        let sizes = superframe_frame_sizes(&data).unwrap();
        assert_eq!(sizes, vec![data.len()]);
    }

    #[test]
    fn oversized_index_is_not_a_superframe() {
        // Marker claims 8 frames of 4-byte sizes, but there are only 3 bytes.
        let data = [0x00, 0x00, 0xdf];

        assert_eq!(superframe_frame_sizes(&data).unwrap(), vec![3]);
    }

    #[test]
    fn sizes_exceeding_frame_fail() {
        let mut data = build_superframe(&[vec![1; 4], vec![2; 4]], 1);
        // Second entry now says 200 bytes.
        let len = data.len();
        data[len - 2] = 200;

        let mut output = vec![9];
        let mut sizes = vec![];
        let err = split_superframe(&data, &mut output, Some(&mut sizes)).unwrap_err();

        assert!(matches!(err, SplitError::SizesExceedFrame { .. }));
        assert_eq!(output, vec![9]);
        assert!(sizes.is_empty());
    }

    #[test]
    fn empty_input_fails() {
        let mut output = vec![];
        assert_eq!(
            split_superframe(&[], &mut output, None),
            Err(SplitError::EmptyFrame)
        );
    }

    #[test]
    fn splitting_is_idempotent_on_plain_frames() {
        let frame = vec![0x42u8; 33];
        let mut first = vec![];
        split_superframe(&frame, &mut first, None).unwrap();

        let mut second = vec![];
        let mut sizes = vec![];
        split_superframe(&frame, &mut second, Some(&mut sizes)).unwrap();

        assert_eq!(first, second);
        assert_eq!(sizes, vec![49]);
    }
}
