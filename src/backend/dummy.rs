// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scriptable hardware used to exercise the orchestration layer in tests.
//!
//! [`DummyHardware`] records every register-level operation it receives and returns whatever
//! status and header the test placed in its shared state. Clones share that state, so a test can
//! keep one handle while the device owns another.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::anyhow;

use crate::backend::BufferAllocator;
use crate::backend::BufferMapping;
use crate::backend::DmaBuffer;
use crate::backend::FrameSetup;
use crate::backend::HwContext;
use crate::backend::HwStatus;
use crate::backend::Vp9Hardware;
use crate::backend::Vp9Status;
use crate::codec::vp9::header::unscramble_words;
use crate::codec::vp9::header::RenderParams;
use crate::codec::vp9::header::HEADER_WORDS;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HwOp {
    LoadFirmware { secure: bool },
    InitCore { buffers: usize },
    PowerOff,
    SetProtected(bool),
    SetStreamBuffer { read_offset: u64 },
    WriteOffset(u64),
    Command(Vp9Status),
    AddDecodeSize(u32),
    ResetDecodeSize,
    Start,
    Stop,
    ClearAdaptStatus,
    ProgramFrame(FrameSetup),
    AdaptProbabilities(u32),
    SaveContext,
    RestoreContext,
}

pub(crate) struct DummyState {
    pub status: HwStatus,
    /// Header scratch, as the firmware would leave it (scrambled).
    pub scratch: [u16; HEADER_WORDS],
    pub stream_offset: u64,
    pub ops: Vec<HwOp>,
    /// Addresses of the working buffers handed to the last core initialization.
    pub working_addrs: Vec<u64>,
    pub fail_firmware: bool,
    pub fail_program: bool,
    pub fail_protected: bool,
    pub protected: bool,
    pub running: bool,
    pub decode_size: u32,
}

impl Default for DummyState {
    fn default() -> Self {
        Self {
            status: Default::default(),
            scratch: [0; HEADER_WORDS],
            stream_offset: 0,
            ops: Vec::new(),
            working_addrs: Vec::new(),
            fail_firmware: false,
            fail_program: false,
            fail_protected: false,
            protected: false,
            running: false,
            decode_size: 0,
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct DummyHardware(Arc<Mutex<DummyState>>);

impl DummyHardware {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn state(&self) -> MutexGuard<'_, DummyState> {
        self.0.lock().unwrap()
    }

    /// Places `params` in the header scratch the way the firmware lays it out.
    pub fn set_header(&self, params: &RenderParams) {
        let mut words = params.to_words();
        // The word shuffle is its own inverse.
        unscramble_words(&mut words);
        self.state().scratch = words;
    }

    /// Prepares the status registers for the next interrupt.
    pub fn raise(&self, status: Vp9Status) {
        let mut state = self.state();
        state.status.decode_status = status as u32;
    }

    pub fn set_stream_offset(&self, offset: u64) {
        self.state().stream_offset = offset;
    }

    pub fn take_ops(&self) -> Vec<HwOp> {
        std::mem::take(&mut self.state().ops)
    }

    pub fn programmed_frames(&self) -> Vec<FrameSetup> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match op {
                HwOp::ProgramFrame(setup) => Some(setup.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, op: &HwOp) -> usize {
        self.state().ops.iter().filter(|o| *o == op).count()
    }

    fn record(&self, op: HwOp) {
        self.state().ops.push(op);
    }
}

impl Vp9Hardware for DummyHardware {
    fn load_firmware(&mut self, secure: bool) -> anyhow::Result<()> {
        self.record(HwOp::LoadFirmware { secure });
        if self.state().fail_firmware {
            return Err(anyhow!("firmware rejected"));
        }
        Ok(())
    }

    fn init_core(&mut self, working_buffers: &[&DmaBuffer]) -> anyhow::Result<()> {
        self.record(HwOp::InitCore {
            buffers: working_buffers.len(),
        });
        self.state().working_addrs = working_buffers.iter().map(|b| b.phys_addr()).collect();
        Ok(())
    }

    fn power_off(&mut self) {
        self.record(HwOp::PowerOff);
        self.state().running = false;
    }

    fn set_protected_mode(&mut self, protected: bool) -> anyhow::Result<()> {
        self.record(HwOp::SetProtected(protected));
        let mut state = self.state();
        if state.fail_protected {
            return Err(anyhow!("protected mode switch failed"));
        }
        state.protected = protected;
        Ok(())
    }

    fn set_stream_buffer(&mut self, _phys_addr: u64, _size: usize, read_offset: u64) {
        self.record(HwOp::SetStreamBuffer { read_offset });
        self.state().stream_offset = read_offset;
    }

    fn set_stream_write_offset(&mut self, offset: u64) {
        self.record(HwOp::WriteOffset(offset));
    }

    fn stream_offset(&self) -> u64 {
        self.state().stream_offset
    }

    fn read_status(&self) -> HwStatus {
        self.state().status
    }

    fn clear_adapt_prob_status(&mut self) {
        self.record(HwOp::ClearAdaptStatus);
        self.state().status.adapt_prob_status = 0;
    }

    fn write_command(&mut self, command: Vp9Status) {
        self.record(HwOp::Command(command));
    }

    fn add_decode_size(&mut self, size: u32) {
        self.record(HwOp::AddDecodeSize(size));
        self.state().decode_size += size;
    }

    fn reset_decode_size(&mut self) {
        self.record(HwOp::ResetDecodeSize);
        self.state().decode_size = 0;
    }

    fn start_decoding(&mut self) {
        self.record(HwOp::Start);
        self.state().running = true;
    }

    fn stop_decoding(&mut self) {
        self.record(HwOp::Stop);
        self.state().running = false;
    }

    fn read_header_scratch(&self) -> [u16; HEADER_WORDS] {
        self.state().scratch
    }

    fn program_frame(&mut self, setup: &FrameSetup) -> anyhow::Result<()> {
        self.record(HwOp::ProgramFrame(setup.clone()));
        if self.state().fail_program {
            return Err(anyhow!("frame setup rejected"));
        }
        Ok(())
    }

    fn adapt_probabilities(
        &mut self,
        _probabilities: &mut DmaBuffer,
        _counts: &DmaBuffer,
        mode: u32,
    ) -> anyhow::Result<()> {
        self.record(HwOp::AdaptProbabilities(mode));
        Ok(())
    }

    fn save_context(&mut self) -> HwContext {
        self.record(HwOp::SaveContext);
        let state = self.state();
        HwContext {
            registers: vec![state.stream_offset as u32, state.decode_size],
        }
    }

    fn restore_context(&mut self, context: &HwContext) -> anyhow::Result<()> {
        self.record(HwOp::RestoreContext);
        if let [offset, size] = context.registers[..] {
            let mut state = self.state();
            state.stream_offset = offset as u64;
            state.decode_size = size;
        }
        Ok(())
    }
}

struct VecMapping(Vec<u8>);

impl BufferMapping for VecMapping {
    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Allocator handing out system memory at made-up device addresses.
pub(crate) struct DummyAllocator {
    next_addr: u64,
    pub allocations: usize,
    /// Fail once this many allocations have succeeded.
    pub fail_after: Option<usize>,
}

impl Default for DummyAllocator {
    fn default() -> Self {
        Self {
            next_addr: 0x1000_0000,
            allocations: 0,
            fail_after: None,
        }
    }
}

impl DummyAllocator {
    /// An allocator that runs out of memory after `count` allocations.
    pub fn failing_after(count: usize) -> Self {
        Self {
            fail_after: Some(count),
            ..Default::default()
        }
    }
}

impl BufferAllocator for DummyAllocator {
    fn allocate(
        &mut self,
        name: &'static str,
        size: usize,
        secure: bool,
    ) -> anyhow::Result<DmaBuffer> {
        if self.fail_after.is_some_and(|n| self.allocations >= n) {
            return Err(anyhow!("out of memory allocating {}", name));
        }
        self.allocations += 1;

        let phys_addr = self.next_addr;
        self.next_addr += (size as u64 + 0xfff) & !0xfff;

        let mapping: Option<Box<dyn BufferMapping>> = if secure {
            None
        } else {
            Some(Box::new(VecMapping(vec![0; size])))
        };

        Ok(DmaBuffer::new(name, phys_addr, size, secure, mapping))
    }
}
