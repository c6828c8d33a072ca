// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-stream decoding state and the interfaces it reports through.
//!
//! A decoder instance never calls into its client directly through a concrete type. Decoded
//! frames, format changes and errors are delivered through a [`DecoderClient`], more input is
//! requested from a [`FrameDataProvider`], and hangs are detected by a [`Watchdog`]. These three
//! travel together as [`DecoderCallbacks`] so they can be handed from one instance to its
//! replacement when a stream is reset.

pub mod frame_pool;
pub mod pts;
pub mod stream_buffer;
pub mod vp9;

use thiserror::Error;

use crate::codec::vp9::header::HeaderError;
use crate::codec::vp9::superframe::SplitError;
use crate::decoder::frame_pool::FramePoolError;
use crate::decoder::stream_buffer::StreamBufferError;
use crate::Resolution;

pub type Result<T> = std::result::Result<T, DecoderError>;

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("failed to load firmware: {0:#}")]
    FirmwareLoad(anyhow::Error),
    #[error("failed to allocate {name}: {source:#}")]
    Allocation {
        name: &'static str,
        source: anyhow::Error,
    },
    #[error("operation not valid in state {0:?}")]
    InvalidState(vp9::DecoderState),
    #[error("unexpected decode status {0:#x}")]
    InvalidDecodeStatus(u32),
    #[error("invalid frame dimensions {0:?}")]
    InvalidDimensions(Resolution),
    #[error("working buffer {0} was overrun")]
    BufferOverrun(&'static str),
    #[error("output buffer negotiation failed")]
    NegotiationFailed,
    #[error("malformed bitstream: {0}")]
    MalformedBitstream(#[from] SplitError),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    FramePool(#[from] FramePoolError),
    #[error(transparent)]
    StreamBuffer(#[from] StreamBufferError),
    #[error("decoder hung")]
    Hang,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A decoded frame handed to the client.
///
/// The client must hand it back through the device once it is done with it. `generation` lets the
/// decoder recognize frames that belong to a buffer set it has already abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub index: usize,
    pub generation: u64,
    /// Identifier of the client buffer backing the frame.
    pub buffer_id: u64,
    pub coded: Resolution,
    pub display: Resolution,
    pub stride: u32,
    pub timestamp: Option<u64>,
}

/// Output requirements of the stream, sent when the current buffers cannot hold the next frame.
///
/// The client answers by providing `count` buffers through `initialized_frames`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatChange {
    pub count: usize,
    pub coded: Resolution,
    pub display: Resolution,
    pub stride: u32,
}

/// Receiver of the decoder's output.
pub trait DecoderClient: Send {
    fn on_frame_ready(&mut self, frame: OutputFrame);
    fn on_eos(&mut self);
    fn on_fatal_error(&mut self, error: &DecoderError);
    fn on_format_change(&mut self, change: FormatChange);
}

/// Source of the compressed data the decoder consumes.
pub trait FrameDataProvider: Send {
    /// Asks for the next decode unit to be queued. Must not block.
    fn read_more_input_data(&mut self);
    /// Asks for the instance to be torn down and recreated once the current frame is done. The
    /// reset happens later, from another context.
    fn async_reset_stream_after_current_frame(&mut self);
}

/// Timer detecting decode hangs.
pub trait Watchdog: Send {
    fn start(&mut self);
    fn cancel(&mut self);
    fn is_running(&self) -> bool;
    /// Returns whether the timer expired since it was last started, and clears that state.
    fn check_and_reset_timeout(&mut self) -> bool;
}

/// The collaborators of a decoder instance.
pub struct DecoderCallbacks {
    pub client: Box<dyn DecoderClient>,
    pub provider: Box<dyn FrameDataProvider>,
    pub watchdog: Box<dyn Watchdog>,
}
