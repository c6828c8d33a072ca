// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces to the hardware collaborators of the decoder.
//!
//! The decoder core, its register file and the memory it reads and writes are reached only
//! through the traits of this module. The decoding state machine in [`crate::decoder`] drives a
//! [`Vp9Hardware`], and allocates its working memory from a [`BufferAllocator`]. Neither trait
//! makes any assumption about how the register accesses or allocations are carried out, which
//! allows the whole orchestration layer to be exercised against the scriptable implementation in
//! `dummy` during tests.

#[cfg(test)]
pub(crate) mod dummy;

use enumn::N;

use crate::codec::vp9::header::HEADER_WORDS;
use crate::codec::vp9::REFS_PER_FRAME;
use crate::Resolution;

/// Values of the decode status register, written by the firmware when it raises an interrupt and
/// by the driver when it hands control back.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum Vp9Status {
    DecodeSlice = 0x05,
    DecodingDataDone = 0x0a,
    NalDecodeDone = 0x0e,
    InputBufferEmpty = 0x20,
    ProcessedHeader = 0xf0,
    ActionDone = 0xff,
}

/// Low byte of the adaptation status register when the firmware wants the driver to run
/// backward probability adaptation.
pub const ADAPT_PROB_REQUEST: u32 = 0xfd;

/// Snapshot of the two status registers read when servicing an interrupt.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HwStatus {
    pub decode_status: u32,
    pub adapt_prob_status: u32,
}

impl HwStatus {
    /// Whether the firmware is asking for probability adaptation.
    pub fn wants_probability_adaptation(&self) -> bool {
        self.adapt_prob_status & 0xff == ADAPT_PROB_REQUEST
    }

    /// Mode bits passed along with an adaptation request.
    pub fn adaptation_mode(&self) -> u32 {
        self.adapt_prob_status >> 8
    }
}

/// CPU view of a device buffer.
pub trait BufferMapping: Send {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// A buffer usable by the decoder core, identified by its device address.
pub struct DmaBuffer {
    name: &'static str,
    phys_addr: u64,
    size: usize,
    secure: bool,
    /// Secure buffers cannot be mapped.
    mapping: Option<Box<dyn BufferMapping>>,
}

impl DmaBuffer {
    pub fn new(
        name: &'static str,
        phys_addr: u64,
        size: usize,
        secure: bool,
        mapping: Option<Box<dyn BufferMapping>>,
    ) -> Self {
        Self {
            name,
            phys_addr,
            size,
            secure,
            mapping,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.mapping.as_ref().map(|m| m.as_slice())
    }

    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.mapping.as_mut().map(|m| m.as_mut_slice())
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("name", &self.name)
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr))
            .field("size", &self.size)
            .field("secure", &self.secure)
            .finish()
    }
}

/// Provider of device memory.
pub trait BufferAllocator: Send {
    /// Allocates a buffer of `size` bytes. Secure buffers are not CPU-accessible.
    fn allocate(&mut self, name: &'static str, size: usize, secure: bool)
        -> anyhow::Result<DmaBuffer>;
}

/// Opaque register state of the core, saved when an instance is swapped out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HwContext {
    pub registers: Vec<u32>,
}

/// A reference picture as programmed into the core.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReferenceSetup {
    /// Address of the reference picture.
    pub buffer_addr: u64,
    pub resolution: Resolution,
    /// Horizontal scale from the reference to the current frame, in `REF_SCALE_SHIFT` fixed
    /// point.
    pub x_scale: u32,
    pub y_scale: u32,
    pub sign_bias: bool,
}

/// Everything the core needs to decode the frame whose header was just parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameSetup {
    /// Index of the output frame in the frame pool.
    pub frame_index: usize,
    /// Address of the output picture.
    pub output_addr: u64,
    pub coded: Resolution,
    pub stride: u32,
    pub references: [Option<ReferenceSetup>; REFS_PER_FRAME],
    /// Motion vectors written for the current frame.
    pub mpred_current: u64,
    /// Motion vectors of the previous frame.
    pub mpred_previous: u64,
    pub use_prev_frame_mvs: bool,
    pub is_intra: bool,
}

/// Register-level interface to a VP9 decoder core.
///
/// Every method is only called while the caller holds the hardware lock and owns the core.
pub trait Vp9Hardware: Send {
    /// Loads the decoding firmware. `secure` selects the variant that can decode into protected
    /// memory.
    fn load_firmware(&mut self, secure: bool) -> anyhow::Result<()>;
    /// Powers the core and points it at its working buffers.
    fn init_core(&mut self, working_buffers: &[&DmaBuffer]) -> anyhow::Result<()>;
    fn power_off(&mut self);
    fn set_protected_mode(&mut self, protected: bool) -> anyhow::Result<()>;

    /// Points the parser at the stream ring. `read_offset` is where parsing resumes.
    fn set_stream_buffer(&mut self, phys_addr: u64, size: usize, read_offset: u64);
    /// Tells the parser how much data has been written into the ring so far.
    fn set_stream_write_offset(&mut self, offset: u64);
    /// Number of stream bytes the parser has consumed.
    fn stream_offset(&self) -> u64;

    fn read_status(&self) -> HwStatus;
    fn clear_adapt_prob_status(&mut self);
    fn write_command(&mut self, command: Vp9Status);

    /// Adds `size` bytes to the amount the parser may consume before raising
    /// [`Vp9Status::NalDecodeDone`].
    fn add_decode_size(&mut self, size: u32);
    fn reset_decode_size(&mut self);
    fn start_decoding(&mut self);
    fn stop_decoding(&mut self);

    /// Reads the raw (still scrambled) header scratch area.
    fn read_header_scratch(&self) -> [u16; HEADER_WORDS];
    fn program_frame(&mut self, setup: &FrameSetup) -> anyhow::Result<()>;
    /// Runs backward probability adaptation, updating `probabilities` from `counts`.
    fn adapt_probabilities(
        &mut self,
        probabilities: &mut DmaBuffer,
        counts: &DmaBuffer,
        mode: u32,
    ) -> anyhow::Result<()>;

    fn save_context(&mut self) -> HwContext;
    fn restore_context(&mut self, context: &HwContext) -> anyhow::Result<()>;
}
