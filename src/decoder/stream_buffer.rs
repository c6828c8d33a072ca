// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The ring the parser reads compressed data from.
//!
//! Offsets are counted from the creation of the ring and never wrap; only their position in the
//! underlying buffer does.

use log::trace;
use thiserror::Error;

use crate::backend::BufferAllocator;
use crate::backend::DmaBuffer;

/// Size of the ring of every decoder instance.
pub const STREAM_BUFFER_SIZE: usize = 0x10_0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamBufferError {
    #[error("{requested} bytes do not fit, only {available} available in the stream ring")]
    Full { requested: usize, available: usize },
    #[error("the stream ring is not CPU-accessible")]
    NotMapped,
}

pub struct StreamBuffer {
    buffer: DmaBuffer,
    write_offset: u64,
    read_offset: u64,
}

impl StreamBuffer {
    pub fn new(allocator: &mut dyn BufferAllocator, secure: bool) -> anyhow::Result<Self> {
        let buffer = allocator.allocate("stream_buffer", STREAM_BUFFER_SIZE, secure)?;

        Ok(Self {
            buffer,
            write_offset: 0,
            read_offset: 0,
        })
    }

    pub fn phys_addr(&self) -> u64 {
        self.buffer.phys_addr()
    }

    pub fn size(&self) -> usize {
        self.buffer.size()
    }

    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// Records how far the parser got. Offsets going backwards are ignored.
    pub fn set_read_offset(&mut self, offset: u64) {
        self.read_offset = self.read_offset.max(offset.min(self.write_offset));
    }

    pub fn available(&self) -> usize {
        self.buffer.size() - (self.write_offset - self.read_offset) as usize
    }

    /// Appends `data` to the ring, returning the offset it starts at.
    pub fn write(&mut self, data: &[u8]) -> Result<u64, StreamBufferError> {
        let available = self.available();
        if data.len() > available {
            return Err(StreamBufferError::Full {
                requested: data.len(),
                available,
            });
        }

        let size = self.buffer.size();
        let start = self.write_offset;
        let position = (start % size as u64) as usize;
        let ring = self.buffer.data_mut().ok_or(StreamBufferError::NotMapped)?;

        let first = data.len().min(size - position);
        ring[position..position + first].copy_from_slice(&data[..first]);
        ring[..data.len() - first].copy_from_slice(&data[first..]);

        self.write_offset += data.len() as u64;
        trace!("wrote {} bytes at stream offset {}", data.len(), start);

        Ok(start)
    }
}
