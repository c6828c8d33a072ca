// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Output frames and their reference counting.
//!
//! Every slot of the pool counts the holders of its frame: the reference map, the frame being
//! decoded or last decoded, and the client. `client_refcount` is the share of `refcount` owned by
//! the client. A slot can be reused for decoding only once its `refcount` drops to zero.

use log::debug;
use log::warn;
use thiserror::Error;

use crate::codec::vp9::NUM_REF_FRAMES;
use crate::decoder::OutputFrame;
use crate::Resolution;

/// Fewest output frames a stream can be decoded with.
pub const MIN_FRAMES: usize = NUM_REF_FRAMES + 1;
/// Most output frames the pool can track.
pub const MAX_FRAMES: usize = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramePoolError {
    #[error("{0} output frames requested, must be between {} and {}", MIN_FRAMES, MAX_FRAMES)]
    InvalidFrameCount(usize),
    #[error("frame index {0} is out of range")]
    UnknownFrame(usize),
    #[error("frame {0} belongs to an abandoned buffer set")]
    StaleFrame(usize),
    #[error("frame {0} is not held by the client")]
    NotOwnedByClient(usize),
}

/// Storage provided by the client for one output frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub id: u64,
    pub phys_addr: u64,
    pub size: usize,
}

#[derive(Debug, Default)]
pub struct Frame {
    index: usize,
    generation: u64,
    refcount: u32,
    client_refcount: u32,
    buffer: Option<FrameBuffer>,
    /// Storage waiting for the current holders of the slot to let go.
    on_deck: Option<FrameBuffer>,
    /// Size of the picture last decoded into the frame.
    decoded: Resolution,
    display: Resolution,
}

impl Frame {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn client_refcount(&self) -> u32 {
        self.client_refcount
    }

    pub fn buffer(&self) -> Option<&FrameBuffer> {
        self.buffer.as_ref()
    }

    pub fn has_on_deck(&self) -> bool {
        self.on_deck.is_some()
    }

    pub fn decoded_resolution(&self) -> Resolution {
        self.decoded
    }
}

pub struct FramePool {
    frames: Vec<Frame>,
    valid_count: usize,
    coded: Resolution,
    stride: u32,
    waiting_for_new_frames: bool,
    next_generation: u64,
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePool {
    pub fn new() -> Self {
        let frames = (0..MAX_FRAMES)
            .map(|index| Frame {
                index,
                ..Default::default()
            })
            .collect();

        Self {
            frames,
            valid_count: 0,
            coded: Default::default(),
            stride: 0,
            waiting_for_new_frames: false,
            next_generation: 1,
        }
    }

    fn new_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Installs a new set of client buffers.
    ///
    /// Slots still in use keep their current storage and receive the new one once released.
    pub fn allocate(
        &mut self,
        buffers: Vec<FrameBuffer>,
        coded: Resolution,
        stride: u32,
    ) -> Result<(), FramePoolError> {
        let count = buffers.len();
        if !(MIN_FRAMES..=MAX_FRAMES).contains(&count) {
            return Err(FramePoolError::InvalidFrameCount(count));
        }

        for (index, buffer) in buffers.into_iter().enumerate() {
            if self.frames[index].refcount > 0 {
                debug!("frame {} still in use, putting its new buffer on deck", index);
                self.frames[index].on_deck = Some(buffer);
            } else {
                let generation = self.new_generation();
                let frame = &mut self.frames[index];
                frame.buffer = Some(buffer);
                frame.on_deck = None;
                frame.generation = generation;
            }
        }

        for frame in &mut self.frames[count..] {
            frame.on_deck = None;
            if frame.refcount == 0 {
                frame.buffer = None;
            }
        }

        self.valid_count = count;
        self.coded = coded;
        self.stride = stride;
        self.waiting_for_new_frames = false;

        Ok(())
    }

    /// Drops the current buffer set ahead of a renegotiation.
    ///
    /// The decoder must have released all of its own references first. Frames the client still
    /// holds are abandoned: their eventual return is recognized as stale and ignored.
    pub fn begin_reallocation(&mut self) {
        for index in 0..MAX_FRAMES {
            let generation = self.new_generation();
            let frame = &mut self.frames[index];

            if frame.refcount != frame.client_refcount {
                warn!(
                    "frame {} still has {} decoder references at reallocation",
                    index,
                    frame.refcount - frame.client_refcount
                );
            }

            if frame.client_refcount > 0 {
                debug!("abandoning frame {} held by the client", index);
                frame.generation = generation;
            }
            frame.refcount = 0;
            frame.client_refcount = 0;
            frame.buffer = None;
        }

        self.valid_count = 0;
        self.waiting_for_new_frames = true;
    }

    pub fn is_waiting_for_new_frames(&self) -> bool {
        self.waiting_for_new_frames
    }

    pub fn valid_count(&self) -> usize {
        self.valid_count
    }

    pub fn coded_resolution(&self) -> Resolution {
        self.coded
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn frame(&self, index: usize) -> &Frame {
        &self.frames[index]
    }

    /// Returns the first frame nobody holds, if any.
    pub fn find_free(&self) -> Option<usize> {
        self.frames[..self.valid_count]
            .iter()
            .find(|f| f.refcount == 0 && f.buffer.is_some())
            .map(|f| f.index)
    }

    /// Records the size of the picture about to be decoded into `index`.
    pub fn set_content(&mut self, index: usize, decoded: Resolution, display: Resolution) {
        let frame = &mut self.frames[index];
        frame.decoded = decoded;
        frame.display = display;
    }

    pub fn mark_referenced(&mut self, index: usize) {
        self.frames[index].refcount += 1;
    }

    /// Drops a reference held by the decoder.
    pub fn release_reference(&mut self, index: usize) {
        let frame = &mut self.frames[index];
        if frame.refcount <= frame.client_refcount {
            warn!("releasing frame {} which has no decoder reference", index);
            return;
        }

        frame.refcount -= 1;
        if frame.refcount == 0 {
            self.settle(index);
        }
    }

    /// Called when nobody holds `index` anymore.
    fn settle(&mut self, index: usize) {
        if let Some(buffer) = self.frames[index].on_deck.take() {
            debug!("swapping in on-deck buffer for frame {}", index);
            let generation = self.new_generation();
            let frame = &mut self.frames[index];
            frame.buffer = Some(buffer);
            frame.generation = generation;
        } else if index >= self.valid_count {
            self.frames[index].buffer = None;
        }
    }

    /// Hands frame `index` to the client.
    pub fn emit_to_client(&mut self, index: usize, timestamp: Option<u64>) -> OutputFrame {
        let stride = self.stride;
        let frame = &mut self.frames[index];
        frame.refcount += 1;
        frame.client_refcount += 1;

        OutputFrame {
            index,
            generation: frame.generation,
            buffer_id: frame.buffer.as_ref().map(|b| b.id).unwrap_or_default(),
            coded: frame.decoded,
            display: frame.display,
            stride,
            timestamp,
        }
    }

    /// Takes back a frame from the client. Returns whether the frame can now be decoded into.
    pub fn return_frame(&mut self, output: &OutputFrame) -> Result<bool, FramePoolError> {
        let frame = self
            .frames
            .get_mut(output.index)
            .ok_or(FramePoolError::UnknownFrame(output.index))?;

        if frame.generation != output.generation {
            return Err(FramePoolError::StaleFrame(output.index));
        }
        if frame.client_refcount == 0 {
            return Err(FramePoolError::NotOwnedByClient(output.index));
        }

        frame.client_refcount -= 1;
        frame.refcount -= 1;
        if frame.refcount == 0 {
            self.settle(output.index);
        }

        let frame = &self.frames[output.index];
        Ok(frame.refcount == 0 && frame.index < self.valid_count && frame.buffer.is_some())
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for frame in &self.frames {
            assert!(frame.client_refcount <= frame.refcount);
            if frame.index >= self.valid_count && frame.refcount == 0 {
                assert!(frame.buffer.is_none(), "frame {} kept storage", frame.index);
            }
        }
    }
}

/// Mapping from the stream's reference slots to pool frames.
#[derive(Debug, Default)]
pub struct ReferenceMap {
    slots: [Option<usize>; NUM_REF_FRAMES],
}

impl ReferenceMap {
    pub fn get(&self, slot: usize) -> Option<usize> {
        self.slots.get(slot).copied().flatten()
    }

    /// Points every slot set in `mask` at `index`, releasing the frames they pointed to.
    pub fn refresh(&mut self, pool: &mut FramePool, index: usize, mask: u8) {
        for slot in 0..NUM_REF_FRAMES {
            if mask & (1 << slot) == 0 {
                continue;
            }

            pool.mark_referenced(index);
            if let Some(old) = self.slots[slot].replace(index) {
                pool.release_reference(old);
            }
        }
    }

    pub fn clear(&mut self, pool: &mut FramePool) {
        for slot in self.slots.iter_mut() {
            if let Some(old) = slot.take() {
                pool.release_reference(old);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().flatten().copied()
    }
}
