// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interrupt-driven VP9 decoding.
//!
//! The firmware parses the stream by itself and stops at each interesting point, raising an
//! interrupt with a status code. A [`Vp9Decoder`] is one stream's state machine: it reacts to these
//! interrupts, keeps track of which output frames are referenced, and programs the next frame into
//! the core.
//!
//! The decoder may have to stop in the middle of preparing a frame, when no output frame is free or
//! when the client has to provide new output buffers. The reason is kept as a [`Suspension`], and
//! preparation picks up where it left off once the device hands back the core together with the
//! event that resolved it.

pub mod buffers;

use anyhow::anyhow;
use log::debug;
use log::error;
use log::info;
use log::trace;
use log::warn;

use crate::backend::BufferAllocator;
use crate::backend::FrameSetup;
use crate::backend::HwContext;
use crate::backend::ReferenceSetup;
use crate::backend::Vp9Hardware;
use crate::backend::Vp9Status;
use crate::codec::vp9::header::RenderParams;
use crate::codec::vp9::END_OF_STREAM_RESOLUTION;
use crate::codec::vp9::NUM_REF_FRAMES;
use crate::codec::vp9::REFS_PER_FRAME;
use crate::codec::vp9::REF_SCALE_SHIFT;
use crate::decoder::frame_pool::FrameBuffer;
use crate::decoder::frame_pool::FramePool;
use crate::decoder::frame_pool::FramePoolError;
use crate::decoder::frame_pool::ReferenceMap;
use crate::decoder::frame_pool::MAX_FRAMES;
use crate::decoder::frame_pool::MIN_FRAMES;
use crate::decoder::pts::PtsManager;
use crate::decoder::pts::PtsMark;
use crate::decoder::stream_buffer::StreamBuffer;
use crate::decoder::vp9::buffers::InternalBuffers;
use crate::decoder::DecoderCallbacks;
use crate::decoder::DecoderError;
use crate::decoder::FormatChange;
use crate::decoder::OutputFrame;
use crate::decoder::Result;
use crate::utils::align_up;
use crate::Resolution;

/// Largest frame the core can decode.
pub const MAX_RESOLUTION: Resolution = Resolution {
    width: 4096,
    height: 2304,
};

#[derive(Debug, Clone)]
pub struct Vp9DecoderConfig {
    /// Lower bound on the number of output frames requested from the client.
    pub min_frames: usize,
    /// Upper bound on the number of output frames requested from the client.
    pub max_frames: usize,
    /// Frames requested on top of what decoding strictly needs, e.g. for display pipelining.
    pub extra_frames: usize,
    /// Motion-vector buffers kept around for reuse.
    pub mpred_cache_size: usize,
    /// Guard working buffers with canaries and check them after each frame.
    pub check_buffer_overrun: bool,
    /// Decode into protected memory.
    pub is_secure: bool,
}

impl Default for Vp9DecoderConfig {
    fn default() -> Self {
        Self {
            min_frames: MIN_FRAMES,
            max_frames: MAX_FRAMES,
            extra_frames: 0,
            mpred_cache_size: 4,
            check_buffer_overrun: false,
            is_secure: false,
        }
    }
}

impl Vp9DecoderConfig {
    /// Number of output frames to ask the client for.
    pub fn frame_count(&self) -> usize {
        let min = self.min_frames.clamp(MIN_FRAMES, MAX_FRAMES);
        let max = self.max_frames.clamp(min, MAX_FRAMES);

        (NUM_REF_FRAMES + 1 + self.extra_frames).clamp(min, max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Never started; the first decode unit has not been given to the core yet.
    InitialWaitingForInput,
    /// The core consumed every byte it was allowed to and is stopped.
    StoppedWaitingForInput,
    Running,
    /// The core stopped after parsing a frame header.
    PausedAtHeader,
    /// A frame was just decoded; the core waits to be told to continue.
    FrameJustProduced,
    PausedAtEndOfStream,
    /// Another instance owns the core.
    SwappedOut,
    Failed,
}

/// Why preparation of a parsed frame is on hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    /// Every output frame is in use. Resumed when the client returns one.
    FreeFrame,
    /// The client was asked for a new set of output buffers. Resumed by `initialized_frames`.
    NewFrames,
    /// The frame cannot be decoded; the instance waits to be replaced.
    StreamReset,
}

/// What the owner of the core has to do after the decoder handled an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// The event did not concern the decoder.
    Ignored,
    /// The core was re-armed and keeps going.
    Continue,
    /// The parser ran out of data before reaching the end of the decode unit.
    Starved,
    /// The decode unit was fully consumed.
    InputConsumed,
    /// A frame was decoded; the core waits for `continue_decoding` or a swap-out.
    FrameProduced,
    /// Preparation is suspended, see [`Vp9Decoder::suspension`].
    PausedAtHeader,
    EndOfStream,
    Failed,
}

/// The core and memory given to an instance while it is bound.
pub struct Core<'a> {
    pub hw: &'a mut dyn Vp9Hardware,
    pub allocator: &'a mut dyn BufferAllocator,
}

#[derive(Debug, Clone)]
struct ParsedHeader {
    params: RenderParams,
    timestamp: Option<u64>,
}

/// A frame programmed into the core, completed on the next interrupt.
#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    index: usize,
    show: bool,
    refresh_flags: u8,
    timestamp: Option<u64>,
    resolution: Resolution,
    intra_only: bool,
}

#[derive(Debug, Clone, Copy)]
struct LastFrame {
    index: usize,
    resolution: Resolution,
    shown: bool,
    intra_only: bool,
}

pub struct Vp9Decoder {
    config: Vp9DecoderConfig,
    state: DecoderState,
    /// State to go back to when swapped in.
    swapped_state: DecoderState,
    suspension: Option<Suspension>,
    hw_context: Option<HwContext>,
    hw_initialized: bool,
    yield_requested: bool,

    buffers: Option<InternalBuffers>,
    stream: StreamBuffer,
    pts: PtsManager,
    /// Stream offsets bounding the decode unit being consumed.
    unit_start: u64,
    unit_end: u64,

    frames: FramePool,
    references: ReferenceMap,
    current_frame: Option<usize>,
    last_frame: Option<LastFrame>,
    pending: Option<PendingFrame>,
    header: Option<ParsedHeader>,
    has_keyframe: bool,
    frames_decoded: u64,

    callbacks: DecoderCallbacks,
}

fn is_valid_reference_scale(reference: Resolution, frame: Resolution) -> bool {
    2 * frame.width >= reference.width
        && 2 * frame.height >= reference.height
        && frame.width <= 16 * reference.width
        && frame.height <= 16 * reference.height
}

impl Vp9Decoder {
    /// Creates a decoder, reusing `buffers` from a previous instance when they fit.
    pub fn new(
        config: Vp9DecoderConfig,
        allocator: &mut dyn BufferAllocator,
        callbacks: DecoderCallbacks,
        buffers: Option<InternalBuffers>,
    ) -> Result<Self> {
        let buffers = match buffers {
            Some(buffers) if buffers.is_secure() == config.is_secure => {
                debug!("reusing internal buffers");
                buffers
            }
            _ => InternalBuffers::allocate(
                allocator,
                config.is_secure,
                config.check_buffer_overrun,
                config.mpred_cache_size,
            )?,
        };

        // Compressed data reaches the ring in the clear.
        let stream = StreamBuffer::new(allocator, false).map_err(|source| {
            DecoderError::Allocation {
                name: "stream_buffer",
                source,
            }
        })?;

        Ok(Self {
            config,
            state: DecoderState::InitialWaitingForInput,
            swapped_state: DecoderState::InitialWaitingForInput,
            suspension: None,
            hw_context: None,
            hw_initialized: false,
            yield_requested: false,
            buffers: Some(buffers),
            stream,
            pts: PtsManager::new(),
            unit_start: 0,
            unit_end: 0,
            frames: FramePool::new(),
            references: Default::default(),
            current_frame: None,
            last_frame: None,
            pending: None,
            header: None,
            has_keyframe: false,
            frames_decoded: 0,
            callbacks,
        })
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn suspension(&self) -> Option<Suspension> {
        self.suspension
    }

    pub fn is_secure(&self) -> bool {
        self.config.is_secure
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    pub fn references(&self) -> &ReferenceMap {
        &self.references
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn stream_write_offset(&self) -> u64 {
        self.stream.write_offset()
    }

    /// Stream offset the core reached in the current decode unit.
    pub fn stream_read_offset(&self) -> u64 {
        self.stream.read_offset()
    }

    /// Tears the decoder down, returning what its replacement can reuse. Motion vectors of the
    /// old stream are dropped, their buffers are kept.
    pub fn into_parts(mut self) -> (DecoderCallbacks, Option<InternalBuffers>) {
        self.callbacks.watchdog.cancel();
        if let Some(buffers) = self.buffers.as_mut() {
            buffers.mpred.reclaim();
        }
        (self.callbacks, self.buffers)
    }

    pub fn request_yield(&mut self) {
        self.yield_requested = true;
    }

    pub fn take_yield_request(&mut self) -> bool {
        std::mem::take(&mut self.yield_requested)
    }

    fn init_hardware(&mut self, hw: &mut dyn Vp9Hardware) -> Result<()> {
        let buffers = self
            .buffers
            .as_ref()
            .ok_or_else(|| anyhow!("internal buffers were handed off"))?;

        hw.load_firmware(self.config.is_secure)
            .map_err(DecoderError::FirmwareLoad)?;
        hw.init_core(&buffers.working.buffers())?;
        hw.set_stream_buffer(self.stream.phys_addr(), self.stream.size(), self.unit_end);
        hw.set_stream_write_offset(self.stream.write_offset());
        hw.reset_decode_size();

        self.hw_initialized = true;
        info!(
            "core initialized, resuming at stream offset {}",
            self.unit_end
        );

        Ok(())
    }

    /// Gives the core to this instance, restoring its saved context if it has one.
    pub fn swap_in(&mut self, hw: &mut dyn Vp9Hardware) -> Result<()> {
        match self.hw_context.take() {
            Some(context) if self.hw_initialized => {
                hw.load_firmware(self.config.is_secure)
                    .map_err(DecoderError::FirmwareLoad)?;
                hw.restore_context(&context)?;
                hw.set_stream_write_offset(self.stream.write_offset());
            }
            _ => self.init_hardware(hw)?,
        }

        if self.state == DecoderState::SwappedOut {
            self.state = self.swapped_state;
        }
        debug!("swapped in, state {:?}", self.state);

        Ok(())
    }

    /// Saves the core's context so another instance can use it.
    pub fn swap_out(&mut self, hw: &mut dyn Vp9Hardware) {
        if self.state == DecoderState::SwappedOut {
            return;
        }
        if self.state == DecoderState::Running {
            warn!("swapping out a running instance");
        }

        self.callbacks.watchdog.cancel();
        hw.stop_decoding();
        if self.hw_initialized {
            self.hw_context = Some(hw.save_context());
        }

        self.swapped_state = self.state;
        self.state = DecoderState::SwappedOut;
        debug!("swapped out from state {:?}", self.swapped_state);
    }

    /// Writes a decode unit into the stream ring. Returns the offset it starts at.
    ///
    /// `hw` is the core if this instance currently owns it.
    pub fn queue_input(
        &mut self,
        hw: Option<&mut dyn Vp9Hardware>,
        data: &[u8],
        mark: Option<PtsMark>,
    ) -> Result<u64> {
        let offset = self.stream.write(data)?;
        if let Some(mark) = mark {
            self.pts.insert(offset, mark);
        }

        if let Some(hw) = hw {
            if self.hw_initialized && self.state != DecoderState::SwappedOut {
                hw.set_stream_write_offset(self.stream.write_offset());
            }
        }

        Ok(offset)
    }

    /// Lets the core consume `size` more bytes of stream and starts it.
    pub fn update_decode_size(&mut self, hw: &mut dyn Vp9Hardware, size: u32) -> Result<()> {
        match self.state {
            DecoderState::InitialWaitingForInput | DecoderState::StoppedWaitingForInput => (),
            state => return Err(DecoderError::InvalidState(state)),
        }

        self.unit_start = self.unit_end;
        self.unit_end += size as u64;
        trace!(
            "decoding stream range {}..{}",
            self.unit_start,
            self.unit_end
        );

        hw.add_decode_size(size);
        self.rearm(hw, Vp9Status::ActionDone);

        Ok(())
    }

    /// Resumes decoding after [`InterruptOutcome::FrameProduced`].
    pub fn continue_decoding(&mut self, hw: &mut dyn Vp9Hardware) -> Result<()> {
        if self.state != DecoderState::FrameJustProduced {
            return Err(DecoderError::InvalidState(self.state));
        }

        self.rearm(hw, Vp9Status::ActionDone);
        Ok(())
    }

    fn rearm(&mut self, hw: &mut dyn Vp9Hardware, command: Vp9Status) {
        hw.write_command(command);
        hw.start_decoding();
        self.state = DecoderState::Running;
        self.callbacks.watchdog.start();
    }

    fn fail(&mut self, error: DecoderError) -> InterruptOutcome {
        error!("decoder failed: {}", error);
        self.callbacks.watchdog.cancel();
        self.state = DecoderState::Failed;
        self.suspension = None;
        self.callbacks.client.on_fatal_error(&error);

        InterruptOutcome::Failed
    }

    /// Reports a fatal error that happened outside of the decoder, e.g. a malformed bitstream.
    pub fn report_error(&mut self, error: DecoderError) {
        self.fail(error);
    }

    /// Services an interrupt raised by the core.
    pub fn handle_interrupt(&mut self, core: &mut Core<'_>) -> InterruptOutcome {
        if self.state != DecoderState::Running {
            warn!("interrupt in state {:?}, ignoring", self.state);
            return InterruptOutcome::Ignored;
        }

        let status = core.hw.read_status();
        if status.wants_probability_adaptation() {
            if let Err(e) = self.adapt_probabilities(core.hw, status.adaptation_mode()) {
                return self.fail(e);
            }
        }

        match Vp9Status::n(status.decode_status) {
            Some(Vp9Status::InputBufferEmpty) => {
                warn!("core ran out of input");
                InterruptOutcome::Starved
            }
            Some(Vp9Status::NalDecodeDone) => {
                self.callbacks.watchdog.cancel();
                core.hw.stop_decoding();
                self.stream.set_read_offset(self.unit_end);
                self.state = DecoderState::StoppedWaitingForInput;
                self.callbacks.provider.read_more_input_data();

                InterruptOutcome::InputConsumed
            }
            Some(Vp9Status::DecodingDataDone) => {
                self.callbacks.watchdog.cancel();
                if let Err(e) = self.process_completed_frames() {
                    return self.fail(e);
                }
                self.state = DecoderState::FrameJustProduced;

                InterruptOutcome::FrameProduced
            }
            Some(Vp9Status::ProcessedHeader) => {
                self.callbacks.watchdog.cancel();
                if let Err(e) = self.process_completed_frames() {
                    return self.fail(e);
                }
                self.state = DecoderState::PausedAtHeader;

                self.prepare_new_frame(core)
            }
            _ => self.fail(DecoderError::InvalidDecodeStatus(status.decode_status)),
        }
    }

    fn adapt_probabilities(&mut self, hw: &mut dyn Vp9Hardware, mode: u32) -> Result<()> {
        let buffers = self
            .buffers
            .as_mut()
            .ok_or_else(|| anyhow!("internal buffers were handed off"))?;

        trace!("adapting probabilities, mode {:#x}", mode);
        let (probabilities, counts) = buffers.working.adaptation_buffers();
        hw.adapt_probabilities(probabilities, counts, mode)?;
        hw.clear_adapt_prob_status();

        Ok(())
    }

    /// Finishes the bookkeeping of the frame the core just decoded.
    fn process_completed_frames(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };

        self.frames_decoded += 1;
        if pending.show {
            let output = self.frames.emit_to_client(pending.index, pending.timestamp);
            self.callbacks.client.on_frame_ready(output);
        }

        self.references
            .refresh(&mut self.frames, pending.index, pending.refresh_flags);

        // The reference held as the current frame moves over to the last frame.
        self.current_frame = None;
        let last = LastFrame {
            index: pending.index,
            resolution: pending.resolution,
            shown: pending.show,
            intra_only: pending.intra_only,
        };
        if let Some(previous) = self.last_frame.replace(last) {
            self.frames.release_reference(previous.index);
        }

        if let Some(buffers) = self.buffers.as_mut() {
            buffers.mpred.rotate();
            buffers.working.check_canaries()?;
        }

        Ok(())
    }

    fn prepare_new_frame(&mut self, core: &mut Core<'_>) -> InterruptOutcome {
        let params = match RenderParams::from_scratch(core.hw.read_header_scratch()) {
            Ok(params) => params,
            Err(e) => {
                warn!("undecodable frame header: {}", e);
                return self.skip_frame();
            }
        };

        let offset = core.hw.stream_offset();
        self.stream.set_read_offset(offset);
        let mark = self.pts.lookup(offset);

        if mark == Some(PtsMark::EndOfStream)
            && params.is_keyframe()
            && params.resolution() == END_OF_STREAM_RESOLUTION
        {
            info!("reached end of stream after {} frames", self.frames_decoded);
            self.state = DecoderState::PausedAtEndOfStream;
            self.callbacks.client.on_eos();
            return InterruptOutcome::EndOfStream;
        }

        let timestamp = match mark {
            Some(PtsMark::Timestamp(timestamp)) => Some(timestamp),
            _ => None,
        };

        if params.width == 0 || params.height == 0 {
            warn!("frame with empty size {}x{}", params.width, params.height);
            return self.skip_frame();
        }

        if !self.has_keyframe && !params.is_keyframe() {
            debug!("skipping frame preceding the first keyframe");
            return self.skip_frame();
        }

        if params.show_existing_frame {
            return self.show_existing_frame(core.hw, params.frame_to_show as usize, timestamp);
        }

        self.header = Some(ParsedHeader { params, timestamp });
        self.continue_prepare(core)
    }

    fn show_existing_frame(
        &mut self,
        hw: &mut dyn Vp9Hardware,
        slot: usize,
        timestamp: Option<u64>,
    ) -> InterruptOutcome {
        let Some(index) = self.references.get(slot) else {
            warn!("no frame to show in reference slot {}", slot);
            return self.skip_frame();
        };

        let output = self.frames.emit_to_client(index, timestamp);
        self.callbacks.client.on_frame_ready(output);
        self.rearm(hw, Vp9Status::ActionDone);

        InterruptOutcome::Continue
    }

    /// Gives up on the frame just parsed. The instance gets rebuilt after it, which is slow but
    /// leaves no half-updated reference state behind.
    fn skip_frame(&mut self) -> InterruptOutcome {
        self.callbacks.watchdog.cancel();
        self.header = None;
        self.suspension = Some(Suspension::StreamReset);
        self.callbacks
            .provider
            .async_reset_stream_after_current_frame();

        InterruptOutcome::PausedAtHeader
    }

    fn release_all_references(&mut self) {
        self.references.clear(&mut self.frames);
        if let Some(last) = self.last_frame.take() {
            self.frames.release_reference(last.index);
        }
        if let Some(current) = self.current_frame.take() {
            self.frames.release_reference(current);
        }
        self.pending = None;
    }

    /// Second half of frame preparation, also run when a suspension is resolved.
    fn continue_prepare(&mut self, core: &mut Core<'_>) -> InterruptOutcome {
        let Some(header) = self.header.clone() else {
            warn!("no parsed header to prepare");
            return InterruptOutcome::Ignored;
        };
        let params = &header.params;

        let resolution = params.resolution();
        if !MAX_RESOLUTION.can_contain(resolution) {
            return self.fail(DecoderError::InvalidDimensions(resolution));
        }

        let coded = Resolution::from((
            align_up(resolution.width, 8),
            align_up(resolution.height, 8),
        ));
        let stride = align_up(coded.width, 32);
        let display = params.render_resolution().clip_to(resolution);
        let count = self.config.frame_count();

        if self.frames.is_waiting_for_new_frames() {
            self.suspension = Some(Suspension::NewFrames);
            return InterruptOutcome::PausedAtHeader;
        }

        let current_coded = self.frames.coded_resolution();
        let needs_reallocation = if self.frames.valid_count() == 0 {
            true
        } else if params.is_keyframe() {
            self.frames.valid_count() != count || current_coded != coded
        } else {
            // Inter frames may change size while still predicting from the current references.
            !current_coded.can_contain(coded)
        };

        if needs_reallocation {
            info!(
                "requesting {} output frames of {}x{}",
                count, coded.width, coded.height
            );
            self.release_all_references();
            self.frames.begin_reallocation();
            self.suspension = Some(Suspension::NewFrames);
            self.callbacks.client.on_format_change(FormatChange {
                count,
                coded,
                display,
                stride,
            });

            return InterruptOutcome::PausedAtHeader;
        }

        let Some(index) = self.frames.find_free() else {
            debug!("no free output frame, waiting for the client");
            self.suspension = Some(Suspension::FreeFrame);
            return InterruptOutcome::PausedAtHeader;
        };

        let mut references: [Option<ReferenceSetup>; REFS_PER_FRAME] = [None; REFS_PER_FRAME];
        if !params.is_intra() {
            for (i, reference) in references.iter_mut().enumerate() {
                let slot = params.ref_frame_idx[i] as usize;
                let Some(ref_index) = self.references.get(slot) else {
                    warn!("reference slot {} is empty", slot);
                    return self.skip_frame();
                };

                let frame = self.frames.frame(ref_index);
                let ref_resolution = frame.decoded_resolution();
                if !is_valid_reference_scale(ref_resolution, resolution) {
                    if self.frames_decoded == 0 {
                        return self.fail(DecoderError::InvalidDimensions(ref_resolution));
                    }
                    warn!(
                        "reference of {:?} cannot predict a frame of {:?}",
                        ref_resolution, resolution
                    );
                    return self.skip_frame();
                }

                *reference = Some(ReferenceSetup {
                    buffer_addr: frame.buffer().map(|b| b.phys_addr).unwrap_or_default(),
                    resolution: ref_resolution,
                    x_scale: (ref_resolution.width << REF_SCALE_SHIFT) / resolution.width,
                    y_scale: (ref_resolution.height << REF_SCALE_SHIFT) / resolution.height,
                    sign_bias: params.ref_frame_sign_bias[i],
                });
            }
        }

        let use_prev_frame_mvs = !params.error_resilient_mode
            && self.last_frame.is_some_and(|last| {
                last.resolution == resolution && last.shown && !last.intra_only
            });

        let allocator = &mut *core.allocator;
        let mpred = self
            .buffers
            .as_mut()
            .ok_or_else(|| DecoderError::from(anyhow!("internal buffers were handed off")))
            .and_then(|buffers| {
                let current = buffers.mpred.ensure_current(allocator)?.phys_addr();
                let previous = buffers.mpred.previous().map(|b| b.phys_addr());
                Ok((current, previous.unwrap_or(current)))
            });
        let (mpred_current, mpred_previous) = match mpred {
            Ok(addresses) => addresses,
            Err(e) => return self.fail(e),
        };

        self.frames.set_content(index, resolution, display);
        let setup = FrameSetup {
            frame_index: index,
            output_addr: self
                .frames
                .frame(index)
                .buffer()
                .map(|b| b.phys_addr)
                .unwrap_or_default(),
            coded,
            stride,
            references,
            mpred_current,
            mpred_previous,
            use_prev_frame_mvs,
            is_intra: params.is_intra(),
        };
        if let Err(e) = core.hw.program_frame(&setup) {
            return self.fail(e.into());
        }

        self.frames.mark_referenced(index);
        self.current_frame = Some(index);
        self.pending = Some(PendingFrame {
            index,
            show: params.show_frame,
            refresh_flags: params.refresh_frame_flags,
            timestamp: header.timestamp,
            resolution,
            intra_only: params.intra_only,
        });
        if params.is_keyframe() {
            self.has_keyframe = true;
        }

        self.header = None;
        self.suspension = None;
        self.rearm(core.hw, Vp9Status::DecodeSlice);

        InterruptOutcome::Continue
    }

    /// Takes a frame back from the client, resuming a suspended preparation if it was waiting for
    /// one. `core` is only given if this instance owns the core.
    pub fn return_frame(
        &mut self,
        core: Option<Core<'_>>,
        frame: &OutputFrame,
    ) -> Result<InterruptOutcome> {
        let free = match self.frames.return_frame(frame) {
            Ok(free) => free,
            Err(FramePoolError::StaleFrame(index)) => {
                debug!("ignoring return of abandoned frame {}", index);
                return Ok(InterruptOutcome::Ignored);
            }
            Err(e) => return Err(e.into()),
        };

        if free
            && self.state == DecoderState::PausedAtHeader
            && self.suspension == Some(Suspension::FreeFrame)
        {
            if let Some(mut core) = core {
                return Ok(self.continue_prepare(&mut core));
            }
        }

        Ok(InterruptOutcome::Ignored)
    }

    /// Installs the output buffers the client allocated after a format change.
    pub fn initialized_frames(
        &mut self,
        core: Option<Core<'_>>,
        buffers: Vec<FrameBuffer>,
        coded: Resolution,
        stride: u32,
    ) -> Result<InterruptOutcome> {
        if let Some(header) = &self.header {
            let resolution = header.params.resolution();
            if !coded.can_contain(resolution) {
                error!("client buffers of {:?} cannot hold {:?}", coded, resolution);
                self.fail(DecoderError::NegotiationFailed);
                return Err(DecoderError::NegotiationFailed);
            }
        }

        if let Err(e) = self.frames.allocate(buffers, coded, stride) {
            let error = DecoderError::from(e);
            error!("failed to install output buffers: {}", error);
            self.fail(DecoderError::NegotiationFailed);
            return Err(error);
        }

        if self.state == DecoderState::PausedAtHeader
            && self.suspension == Some(Suspension::NewFrames)
        {
            if let Some(mut core) = core {
                return Ok(self.continue_prepare(&mut core));
            }
        }

        Ok(InterruptOutcome::Ignored)
    }

    /// Retries a preparation suspended while another instance had the core.
    pub fn resume(&mut self, core: &mut Core<'_>) -> InterruptOutcome {
        match (self.state, self.suspension) {
            (DecoderState::PausedAtHeader, Some(Suspension::FreeFrame | Suspension::NewFrames)) => {
                self.continue_prepare(core)
            }
            _ => InterruptOutcome::Ignored,
        }
    }

    /// Whether the decoder is waiting on the client rather than on the core.
    pub fn is_waiting_for_client(&self) -> bool {
        self.state == DecoderState::PausedAtHeader
            && matches!(
                self.suspension,
                Some(Suspension::FreeFrame | Suspension::NewFrames)
            )
    }

    /// The client could not provide output buffers.
    pub fn negotiation_failed(&mut self) {
        self.fail(DecoderError::NegotiationFailed);
    }

    /// Called when the watchdog fired. Returns whether the decoder actually hung.
    pub fn on_signaled_watchdog(&mut self, hw: &mut dyn Vp9Hardware) -> bool {
        if !self.callbacks.watchdog.check_and_reset_timeout() {
            debug!("watchdog fired but was rearmed since");
            return false;
        }
        if self.state != DecoderState::Running {
            return false;
        }

        error!("decoder hung at stream offset {}", hw.stream_offset());
        hw.stop_decoding();
        self.mark_hung();

        true
    }

    /// The decoder stopped making progress. The instance waits to be rebuilt.
    pub fn mark_hung(&mut self) {
        self.callbacks.watchdog.cancel();
        self.state = DecoderState::Failed;
        self.suspension = None;
        self.callbacks
            .provider
            .async_reset_stream_after_current_frame();
    }

    /// Forcibly takes the core away. The decode unit in progress starts over when the instance
    /// runs next, and the core is reinitialized from scratch.
    pub fn hard_stop(&mut self, hw: &mut dyn Vp9Hardware) {
        warn!(
            "hard stop, restarting stream range {}..{}",
            self.unit_start, self.unit_end
        );
        self.callbacks.watchdog.cancel();
        hw.stop_decoding();
        hw.power_off();

        self.hw_initialized = false;
        self.hw_context = None;
        self.yield_requested = false;

        if let Some(current) = self.current_frame.take() {
            self.frames.release_reference(current);
        }
        if let Some(buffers) = self.buffers.as_mut() {
            buffers.mpred.discard_current();
        }
        self.pending = None;
        self.header = None;
        self.suspension = None;

        self.unit_end = self.unit_start;
        if self.state != DecoderState::Failed {
            self.state = DecoderState::InitialWaitingForInput;
        }
    }
}
